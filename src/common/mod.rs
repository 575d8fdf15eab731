pub mod clock;
pub mod jitter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use jitter::{FixedJitter, JitterSource, RandomJitter};
