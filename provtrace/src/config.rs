use std::time::Duration;

/// Startup configuration for one tracer instance. Rings are sized here once;
/// they never grow or shrink during the tracer's lifetime.
#[derive(Clone, Debug)]
pub struct TracerConfig {
	/// Records per unit ring.
	pub ring_capacity_per_unit: usize,
	/// Longest the dispatcher sleeps before re-checking cancellation. Also
	/// bounds how long [`crate::tracer::Tracer::stop`] waits for `Stopped`.
	pub poll_idle_timeout: Duration,
}

impl Default for TracerConfig {
	fn default() -> Self {
		Self {
			ring_capacity_per_unit: 1024,
			poll_idle_timeout: Duration::from_millis(250),
		}
	}
}
