//! Box-overlap matching used to carry face identity and landmarks across frames
//! and across models.

use crate::types::FaceBox;

/// Minimum overlap for reusing the previous frame's landmarks on a new box.
pub const CARRY_FORWARD_IOU: f32 = 0.5;
/// Minimum overlap for attaching face-mesh output to a detector box.
pub const LANDMARK_ATTACH_IOU: f32 = 0.3;

pub fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x_min = a.x_min.max(b.x_min);
    let y_min = a.y_min.max(b.y_min);
    let x_max = a.x_max.min(b.x_max);
    let y_max = a.y_max.min(b.y_max);

    if x_max <= x_min || y_max <= y_min {
        return 0.0;
    }

    let intersection = (x_max - x_min) * (y_max - y_min);
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 || !union.is_finite() {
        return 0.0;
    }

    (intersection / union).clamp(0.0, 1.0)
}

/// Pick the candidate overlapping `target` the most, provided the overlap is
/// strictly above `threshold`. Returns the candidate with its IoU.
pub fn best_match<T, I>(target: &FaceBox, candidates: I, threshold: f32) -> Option<(T, f32)>
where
    I: IntoIterator<Item = (FaceBox, T)>,
{
    candidates
        .into_iter()
        .map(|(bbox, item)| (item, iou(target, &bbox)))
        .fold(None, |best: Option<(T, f32)>, (item, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((item, score)),
        })
        .filter(|(_, score)| *score > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> FaceBox {
        FaceBox::from_corners(x, y, x + w, y + h)
    }

    #[test]
    fn test_identical_boxes() {
        let a = bbox(10.0, 20.0, 100.0, 120.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_disjoint_boxes() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(50.0, 50.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_touching_edges_do_not_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(10.0, 0.0, 10.0, 10.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_half_overlap() {
        // Intersection 50, union 150.
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0);
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_box_never_matches() {
        let a = bbox(5.0, 5.0, 0.0, 0.0);
        assert_eq!(iou(&a, &a), 0.0);
    }

    #[test]
    fn test_best_match_prefers_highest_overlap() {
        let target = bbox(0.0, 0.0, 100.0, 100.0);
        let candidates = vec![
            (bbox(40.0, 0.0, 100.0, 100.0), "far"),
            (bbox(5.0, 5.0, 100.0, 100.0), "near"),
            (bbox(500.0, 500.0, 10.0, 10.0), "none"),
        ];
        let (item, score) = best_match(&target, candidates, CARRY_FORWARD_IOU).unwrap();
        assert_eq!(item, "near");
        assert!(score > 0.8);
    }

    #[test]
    fn test_best_match_respects_threshold() {
        let target = bbox(0.0, 0.0, 10.0, 10.0);
        // IoU = 1/3: enough to attach landmarks, not enough to carry them forward.
        let candidates = vec![(bbox(5.0, 0.0, 10.0, 10.0), ())];
        assert!(best_match(&target, candidates.clone(), CARRY_FORWARD_IOU).is_none());
        assert!(best_match(&target, candidates, LANDMARK_ATTACH_IOU).is_some());
    }

    #[test]
    fn test_best_match_with_no_candidates() {
        let target = bbox(0.0, 0.0, 10.0, 10.0);
        assert!(best_match::<(), _>(&target, Vec::new(), 0.0).is_none());
    }

    fn any_box() -> impl Strategy<Value = FaceBox> {
        (0.0f32..500.0, 0.0f32..500.0, 1.0f32..300.0, 1.0f32..300.0)
            .prop_map(|(x, y, w, h)| bbox(x, y, w, h))
    }

    proptest! {
        #[test]
        fn test_iou_is_symmetric_and_bounded(a in any_box(), b in any_box()) {
            let ab = iou(&a, &b);
            let ba = iou(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-6);
            prop_assert!((0.0..=1.0).contains(&ab));
        }

        #[test]
        fn test_iou_self_is_one(a in any_box()) {
            prop_assert!((iou(&a, &a) - 1.0).abs() < 1e-5);
        }
    }
}
