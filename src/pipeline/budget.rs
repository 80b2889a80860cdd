use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// A detection started on an earlier tick has not finished.
    InFlight,
    /// Deliberately dropped to let slow detections catch up.
    Skipping,
}

/// Decides which ticks get a detection: at most one in flight, and after a slow
/// detection, as many ticks skipped as the detection overran the frame interval.
#[derive(Debug)]
pub struct FrameBudget {
    target_interval: Duration,
    max_skip_frames: u32,
    in_flight: bool,
    skip_remaining: u32,
    last_tick: Option<Instant>,
}

impl FrameBudget {
    pub fn new(target_interval: Duration, max_skip_frames: u32) -> Self {
        Self {
            target_interval,
            max_skip_frames,
            in_flight: false,
            skip_remaining: 0,
            last_tick: None,
        }
    }

    /// Note a tick and return the instantaneous rate; 0 on the first tick.
    pub fn record_tick(&mut self, now: Instant) -> f32 {
        let fps = self
            .last_tick
            .map(|last| now.saturating_duration_since(last).as_secs_f32())
            .filter(|secs| *secs > 0.0)
            .map_or(0.0, |secs| 1.0 / secs);
        self.last_tick = Some(now);
        fps
    }

    pub fn try_begin(&mut self) -> Result<(), SkipReason> {
        if self.in_flight {
            return Err(SkipReason::InFlight);
        }
        if self.skip_remaining > 0 {
            self.skip_remaining -= 1;
            return Err(SkipReason::Skipping);
        }

        self.in_flight = true;
        Ok(())
    }

    /// End the in-flight detection and schedule skips. Returns the skip count.
    pub fn finish(&mut self, detect_time: Duration) -> u32 {
        self.skip_remaining = next_skip_count(detect_time, self.target_interval, self.max_skip_frames);
        self.in_flight = false;
        self.skip_remaining
    }

    /// End the in-flight detection without scheduling skips.
    pub fn abort(&mut self) {
        self.in_flight = false;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn skip_remaining(&self) -> u32 {
        self.skip_remaining
    }
}

pub fn next_skip_count(detect_time: Duration, target_interval: Duration, max_skip_frames: u32) -> u32 {
    if target_interval.is_zero() {
        return max_skip_frames;
    }

    let overrun = (detect_time.as_secs_f64() / target_interval.as_secs_f64()).floor();
    (overrun as u32).min(max_skip_frames)
}
