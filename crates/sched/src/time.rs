use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::Tick;

/// External, monotonically increasing tick counter. The scheduler reads it
/// but never advances it.
pub trait TickSource {
    fn ticks(&self) -> Tick;
}

impl TickSource for Rc<Cell<Tick>> {
    fn ticks(&self) -> Tick {
        self.get()
    }
}

impl<T: TickSource + ?Sized> TickSource for Box<T> {
    fn ticks(&self) -> Tick {
        (**self).ticks()
    }
}

/// Wall-clock pacing of frame invocations, independent of tick readiness.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Option<Duration>,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Option<Duration>) -> Self {
        RateLimiter {
            min_interval,
            last: None,
        }
    }

    /// Returns whether an invocation at `now` may proceed, and if so records
    /// it as the latest admitted one.
    pub fn admit(&mut self, now: Instant) -> bool {
        if let (Some(min), Some(last)) = (self.min_interval, self.last) {
            if now.saturating_duration_since(last) < min {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}
