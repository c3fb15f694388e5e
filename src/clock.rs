//! Time source used for every settle, dwell and poll delay.
//!
//! Hardware protocols in this crate are paced by fixed waits. Routing them
//! through [`Clock`] lets a virtual clock replace wall time.

use std::{
	fmt::Debug,
	sync::Arc,
	thread,
	time::{Duration, Instant},
};

pub trait Clock: Debug + Send + Sync {
	/// Monotonic time since an arbitrary origin.
	fn now(&self) -> Duration;
	fn sleep(&self, dur: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
	origin: Instant,
}

impl SystemClock {
	pub fn new() -> Self {
		Self {
			origin: Instant::now(),
		}
	}
}

impl Default for SystemClock {
	fn default() -> Self {
		Self::new()
	}
}

impl Clock for SystemClock {
	fn now(&self) -> Duration {
		self.origin.elapsed()
	}

	fn sleep(&self, dur: Duration) {
		thread::sleep(dur);
	}
}

pub fn system() -> Arc<dyn Clock> {
	Arc::new(SystemClock::new())
}

pub(crate) fn millis_since(clock: &dyn Clock, start: Duration) -> f64 {
	clock.now().saturating_sub(start).as_secs_f64() * 1000.0
}
