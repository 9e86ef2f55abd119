pub mod frame;
pub mod timer;

pub use frame::{FrameDriver, PacedFrameDriver};
pub use timer::{CalibrationStats, FrameClock, FrameWindow, MonotonicClock};
