use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: usize = 1000;

/// Monotonic clock a frame driver paces against.
pub trait FrameClock {
    /// Nanoseconds since the clock was created.
    fn now_ns(&self) -> u64;
    fn sleep(&self, duration: Duration);
}

/// Summary of the frame intervals currently held by a [`FrameWindow`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationStats {
    pub average_frame_time_ns: f64,
    pub jitter_ns: f64,
    pub min_frame_time_ns: f64,
    pub max_frame_time_ns: f64,
    pub effective_fps: f64,
}

/// Wall clock backed by `Instant`, sleeping with `clock_nanosleep` on Linux.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    #[cfg(target_os = "linux")]
    fn nanosleep(duration: Duration) {
        use libc::{CLOCK_MONOTONIC, clock_nanosleep, timespec};

        let request = timespec {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_nsec: duration.subsec_nanos() as libc::c_long,
        };
        // Relative sleep; an early wake-up only shortens one frame.
        unsafe {
            clock_nanosleep(CLOCK_MONOTONIC, 0, &request, std::ptr::null_mut());
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        #[cfg(target_os = "linux")]
        Self::nanosleep(duration);
        #[cfg(not(target_os = "linux"))]
        std::thread::sleep(duration);
    }
}

/// Sliding window over the most recent frame intervals.
#[derive(Debug, Clone)]
pub struct FrameWindow {
    intervals: VecDeque<Duration>,
    capacity: usize,
    recorded: usize,
}

impl FrameWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            intervals: VecDeque::with_capacity(capacity),
            capacity,
            recorded: 0,
        }
    }

    pub fn record(&mut self, interval: Duration) {
        if self.intervals.len() == self.capacity {
            self.intervals.pop_front();
        }
        self.intervals.push_back(interval);
        self.recorded += 1;
    }

    /// Intervals recorded since creation, including those that left the window.
    pub fn recorded(&self) -> usize {
        self.recorded
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn intervals(&self) -> impl Iterator<Item = Duration> + '_ {
        self.intervals.iter().copied()
    }

    pub fn stats(&self) -> CalibrationStats {
        if self.intervals.is_empty() {
            return CalibrationStats::default();
        }
        let n = self.intervals.len() as f64;
        let nanos = || self.intervals.iter().map(|d| d.as_nanos() as f64);
        let avg = nanos().sum::<f64>() / n;
        let var = nanos().map(|x| (x - avg).powi(2)).sum::<f64>() / n;
        CalibrationStats {
            average_frame_time_ns: avg,
            jitter_ns: var.sqrt(),
            min_frame_time_ns: nanos().fold(f64::INFINITY, f64::min),
            max_frame_time_ns: nanos().fold(f64::NEG_INFINITY, f64::max),
            effective_fps: if avg > 0.0 { 1e9 / avg } else { 0.0 },
        }
    }
}

impl Default for FrameWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
