//! Simulated capture source: synthetic entry-point invocations pushed
//! through the same encode-and-enqueue path as the kernel probes. Lets the
//! pipeline run unprivileged (tests, demos, development on machines without
//! the eBPF object).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use provtrace_common::{Event, EventKind, MAX_RECORD_LEN};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::buffer::{CaptureBuffer, RingProducer};
use crate::config::TracerConfig;
use crate::sink::EventSink;
use crate::tracer::Tracer;
use crate::Result;

/// Stands in for the probe layer: every simulated probe starts attached and
/// can be detached per kind, after which its entry point fires no events.
pub struct SimSource {
	producers: Vec<RingProducer>,
	attached: [AtomicBool; 6],
	origin: Instant,
}

impl SimSource {
	pub fn new(producers: Vec<RingProducer>) -> Self {
		Self {
			producers,
			attached: core::array::from_fn(|_| AtomicBool::new(true)),
			origin: Instant::now(),
		}
	}

	pub fn unit_count(&self) -> usize {
		self.producers.len()
	}

	/// Microseconds since the simulated session started; monotonic per unit
	/// because it is monotonic globally.
	pub fn now_us(&self) -> u64 {
		self.origin.elapsed().as_micros() as u64
	}

	pub fn detach(&self, kind: EventKind) {
		self.attached[kind.tag() as usize].store(false, Ordering::Relaxed);
	}

	pub fn is_attached(&self, kind: EventKind) -> bool {
		self.attached[kind.tag() as usize].load(Ordering::Relaxed)
	}

	/// One simulated entry-point invocation on `unit`. Returns whether a
	/// record entered the transport (detached probes and full rings both
	/// produce nothing downstream, only the latter is counted).
	pub fn fire(&self, unit: usize, event: Event) -> bool {
		if !self.is_attached(event.kind()) {
			return false;
		}
		let mut buf = [0u8; MAX_RECORD_LEN];
		let len = event.encode_into(&mut buf);
		self.producers[unit].push(&buf[..len])
	}
}

/// Builds a running tracer over a simulated source with `units` fake
/// execution units.
pub fn start(config: &TracerConfig, units: usize, sink: Box<dyn EventSink>) -> Result<(Tracer, Arc<SimSource>)> {
	let (_buffer, consumer, producers) = CaptureBuffer::new(units, config.ring_capacity_per_unit);
	let source = Arc::new(SimSource::new(producers));

	let mut tracer = Tracer::start(config, consumer, None, sink);
	let pump = spawn_workload(source.clone(), tracer.cancel_signal());
	tracer.add_pump(pump);

	Ok((tracer, source))
}

/// Scripted workload: a parent shell cloning children that exec, wire up a
/// pipe, dup an fd, send a message, and fsync, round-robin across units.
fn spawn_workload(source: Arc<SimSource>, cancel_rx: flume::Receiver<()>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut pid = 1000u32;
		let mut cycle = 0usize;
		loop {
			if cancel_rx.try_recv().is_ok() || cancel_rx.is_disconnected() {
				break;
			}

			let unit = cycle % source.unit_count();
			let ppid = 1 + (cycle % 3) as u32;
			source.fire(unit, Event::ProcessCreated { ts_us: source.now_us(), pid, ppid });
			source.fire(unit, Event::ProgramExecuted { ts_us: source.now_us(), pid, ppid });
			source.fire(unit, Event::PipeCreated { ts_us: source.now_us(), pid });
			source.fire(
				unit,
				Event::DescriptorDuplicated {
					ts_us: source.now_us(),
					pid,
					ppid,
					fd: 3 + (cycle % 5) as u32,
				},
			);
			source.fire(
				unit,
				Event::MessageSent {
					ts_us: source.now_us(),
					pid,
					ppid,
					fd: 4,
				},
			);
			source.fire(
				unit,
				Event::FileSynced {
					ts_us: source.now_us(),
					fsync_fn: 0xffff_ffff_c010_2030,
					error: cycle % 7 == 0,
				},
			);

			pid = pid.wrapping_add(1);
			cycle += 1;
			tokio::time::sleep(Duration::from_millis(200)).await;
		}
		debug!("simulated workload stopped");
	})
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use std::sync::Mutex;

	use super::*;
	use crate::dispatch::DispatchState;

	type TestResult = core::result::Result<(), Box<dyn std::error::Error>>;

	#[derive(Clone, Default)]
	struct VecSink(Arc<Mutex<Vec<Event>>>);

	impl EventSink for VecSink {
		fn deliver(&mut self, event: &Event) -> Result<()> {
			self.0.lock().unwrap().push(*event);
			Ok(())
		}
	}

	fn fx_config() -> TracerConfig {
		TracerConfig {
			ring_capacity_per_unit: 64,
			poll_idle_timeout: Duration::from_millis(50),
		}
	}

	#[tokio::test]
	async fn sim_detached_probe_fires_no_events() -> TestResult {
		let (buffer, mut consumer, producers) = CaptureBuffer::new(1, 8);
		let source = SimSource::new(producers);

		assert!(source.fire(0, Event::PipeCreated { ts_us: 1, pid: 1 }));
		source.detach(EventKind::PipeCreated);
		assert!(!source.fire(0, Event::PipeCreated { ts_us: 2, pid: 1 }));

		// Only the pre-detach record is in the transport, and the miss was
		// not a drop.
		let mut batch = Vec::new();
		assert_eq!(consumer.drain_into(&mut batch), 1);
		assert_eq!(buffer.overflow_total(), 0);
		Ok(())
	}

	#[tokio::test]
	async fn sim_detach_leaves_other_probes_attached() -> TestResult {
		let (_buffer, _consumer, producers) = CaptureBuffer::new(1, 8);
		let source = SimSource::new(producers);

		source.detach(EventKind::MessageSent);
		assert!(!source.is_attached(EventKind::MessageSent));
		assert!(source.is_attached(EventKind::ProcessCreated));
		assert!(source.fire(0, Event::PipeCreated { ts_us: 1, pid: 1 }));
		Ok(())
	}

	#[tokio::test]
	async fn sim_session_runs_and_stops_cleanly() -> TestResult {
		let sink = VecSink::default();
		let (tracer, source) = start(&fx_config(), 2, Box::new(sink.clone()))?;

		tokio::time::sleep(Duration::from_millis(80)).await;
		assert_eq!(tracer.state(), DispatchState::Running);
		tracer.stop().await?;

		let events = sink.0.lock().unwrap().clone();
		assert!(!events.is_empty());
		// The workload emits whole cycles, so the first six events cover
		// every variant once, and delivery is in timestamp order.
		let first_kinds: Vec<u32> = events.iter().take(6).map(|e| e.kind().tag()).collect();
		assert_eq!(first_kinds, vec![0, 1, 2, 3, 4, 5]);
		let timestamps: Vec<u64> = events.iter().map(Event::ts_us).collect();
		let mut sorted = timestamps.clone();
		sorted.sort_unstable();
		assert_eq!(timestamps, sorted);
		assert!(source.is_attached(EventKind::FileSynced));
		Ok(())
	}
}

// endregion: --- Tests
