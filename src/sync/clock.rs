use std::sync::atomic::{AtomicI64, Ordering};

/// Source of change and queue timestamps (Unix epoch milliseconds).
pub trait Clock: Send + Sync + 'static {
	fn now_millis(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_millis(&self) -> i64 {
		chrono::Utc::now().timestamp_millis()
	}
}

/// Clock that only moves when told to. Each reading advances it by `step`
/// so consecutive changes get distinct, increasing timestamps.
#[derive(Debug)]
pub struct ManualClock {
	now: AtomicI64,
	step: i64,
}

impl ManualClock {
	pub fn new(start: i64, step: i64) -> Self {
		Self {
			now: AtomicI64::new(start),
			step,
		}
	}

	/// Set the next reading.
	pub fn set(&self, millis: i64) {
		self.now.store(millis, Ordering::SeqCst);
	}
}

impl Clock for ManualClock {
	fn now_millis(&self) -> i64 {
		self.now.fetch_add(self.step, Ordering::SeqCst)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn manual_clock_steps() {
		let clock = ManualClock::new(10, 10);
		assert_eq!(clock.now_millis(), 10);
		assert_eq!(clock.now_millis(), 20);
		clock.set(5);
		assert_eq!(clock.now_millis(), 5);
	}

	#[test]
	fn system_clock_is_after_2020() {
		assert!(SystemClock.now_millis() > 1_577_836_800_000);
	}
}
