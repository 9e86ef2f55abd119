use crate::timer::{CalibrationStats, FrameClock, FrameWindow, MonotonicClock};
use log::{debug, trace};
use std::time::Duration;

/// Render collaborator of the scheduler: one callback slot per display refresh.
pub trait FrameDriver {
    /// Blocks until the next refresh and returns its timestamp in nanoseconds.
    fn wait_for_frame(&mut self) -> u64;

    /// Presents whatever the tasks drew since the previous flip.
    fn flip(&mut self) -> anyhow::Result<()>;
}

/// Emulates vsync with a fixed refresh rate, sleeping up to each frame deadline.
#[derive(Debug, Clone)]
pub struct PacedFrameDriver<C: FrameClock = MonotonicClock> {
    clock: C,
    window: FrameWindow,
    frame_period: Duration,
    next_deadline: u64,
    last_frame: Option<u64>,
    flips: usize,
    dropped_frames: usize,
}

impl PacedFrameDriver<MonotonicClock> {
    pub fn new(refresh_rate_hz: f64) -> Self {
        Self::with_clock(MonotonicClock::new(), refresh_rate_hz)
    }
}

impl<C: FrameClock> PacedFrameDriver<C> {
    pub fn with_clock(clock: C, refresh_rate_hz: f64) -> Self {
        let hz = if refresh_rate_hz > 0.0 { refresh_rate_hz } else { 60.0 };
        let frame_period = Duration::from_secs_f64(1.0 / hz);
        let next_deadline = clock.now_ns() + frame_period.as_nanos() as u64;
        Self {
            clock,
            window: FrameWindow::default(),
            frame_period,
            next_deadline,
            last_frame: None,
            flips: 0,
            dropped_frames: 0,
        }
    }

    pub fn frame_period(&self) -> Duration {
        self.frame_period
    }

    pub fn flips(&self) -> usize {
        self.flips
    }

    pub fn dropped_frames(&self) -> usize {
        self.dropped_frames
    }

    /// Frame intervals measured so far.
    pub fn frame_count(&self) -> usize {
        self.window.recorded()
    }

    pub fn calibration_stats(&self) -> CalibrationStats {
        self.window.stats()
    }
}

impl<C: FrameClock> FrameDriver for PacedFrameDriver<C> {
    fn wait_for_frame(&mut self) -> u64 {
        let period_ns = self.frame_period.as_nanos() as u64;
        let now = self.clock.now_ns();
        if now < self.next_deadline {
            self.clock.sleep(Duration::from_nanos(self.next_deadline - now));
        } else if now - self.next_deadline > period_ns {
            // Missed at least one refresh: resync instead of bursting to catch up.
            let missed = ((now - self.next_deadline) / period_ns) as usize;
            self.dropped_frames += missed;
            self.next_deadline = now;
            debug!("frame driver fell behind by {missed} frame(s)");
        }

        let frame_time = self.clock.now_ns();
        if let Some(last) = self.last_frame {
            self.window
                .record(Duration::from_nanos(frame_time.saturating_sub(last)));
        }
        self.last_frame = Some(frame_time);
        self.next_deadline += period_ns;
        frame_time
    }

    fn flip(&mut self) -> anyhow::Result<()> {
        self.flips += 1;
        trace!("flip #{}", self.flips);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Clock that only moves when told to; sleeping jumps straight to the deadline.
    #[derive(Clone, Default)]
    struct ManualClock {
        now: Rc<Cell<u64>>,
    }

    impl ManualClock {
        fn advance(&self, ns: u64) {
            self.now.set(self.now.get() + ns);
        }
    }

    impl FrameClock for ManualClock {
        fn now_ns(&self) -> u64 {
            self.now.get()
        }

        fn sleep(&self, duration: Duration) {
            self.advance(duration.as_nanos() as u64);
        }
    }

    #[test]
    fn frames_are_paced_to_the_refresh_rate() {
        let mut driver = PacedFrameDriver::new(500.0);
        let first = driver.wait_for_frame();
        let second = driver.wait_for_frame();
        let third = driver.wait_for_frame();
        assert!(second > first && third > second);
        // Two intervals recorded once three frames have been waited for.
        assert_eq!(driver.frame_count(), 2);
        assert!(driver.calibration_stats().average_frame_time_ns > 0.0);
    }

    #[test]
    fn slow_frames_are_counted_as_dropped() {
        let clock = ManualClock::default();
        let mut driver = PacedFrameDriver::with_clock(clock.clone(), 100.0);
        assert_eq!(driver.wait_for_frame(), 10_000_000);

        clock.advance(45_000_000);
        assert_eq!(driver.wait_for_frame(), 55_000_000);
        assert_eq!(driver.dropped_frames(), 3);
        assert_eq!(driver.wait_for_frame(), 65_000_000);
        assert_eq!(driver.calibration_stats().min_frame_time_ns, 10_000_000.0);
    }

    #[test]
    fn flips_are_counted() {
        let mut driver = PacedFrameDriver::new(60.0);
        driver.flip().unwrap();
        driver.flip().unwrap();
        assert_eq!(driver.flips(), 2);
    }

    #[test]
    fn non_positive_rate_falls_back_to_sixty_hertz() {
        let driver = PacedFrameDriver::new(0.0);
        assert_eq!(driver.frame_period(), Duration::from_secs_f64(1.0 / 60.0));
    }
}
