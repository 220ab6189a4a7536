//! The single consumer loop: drain, decode, merge, deliver.
//!
//! Records originate from independent per-unit rings, so each drained batch
//! is merged by embedded timestamp. That is a best-effort global order:
//! events on different units inside one polling interval may still deliver
//! out of true order. Within one unit the order is exact FIFO.

use std::time::Duration;

use derive_more::Display;
use provtrace_common::decode;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::buffer::{BufferConsumer, RawRecord};
use crate::sink::EventSink;

/// `Idle -> Running -> Draining -> Stopped`; no transition skips `Draining`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
	Idle,
	Running,
	Draining,
	Stopped,
}

/// The transport itself became unusable. Surfaced to the tracer owner; the
/// owner detaches all probes before releasing the buffer.
#[derive(Debug, Display)]
#[display("{self:?}")]
pub enum FatalTransportError {
	BufferPoisoned { reason: String },
	SinkFailed { cause: String },
}

impl std::error::Error for FatalTransportError {}

pub struct Dispatcher {
	consumer: BufferConsumer,
	sink: Box<dyn EventSink>,
	cancel_rx: flume::Receiver<()>,
	poll_idle_timeout: Duration,
	state_tx: watch::Sender<DispatchState>,
	reported_overflow: u64,
}

impl Dispatcher {
	pub fn new(
		consumer: BufferConsumer,
		sink: Box<dyn EventSink>,
		cancel_rx: flume::Receiver<()>,
		poll_idle_timeout: Duration,
	) -> (Self, watch::Receiver<DispatchState>) {
		let (state_tx, state_rx) = watch::channel(DispatchState::Idle);
		let dispatcher = Self {
			consumer,
			sink,
			cancel_rx,
			poll_idle_timeout,
			state_tx,
			reported_overflow: 0,
		};
		(dispatcher, state_rx)
	}

	fn set_state(&self, state: DispatchState) {
		self.state_tx.send_replace(state);
	}

	/// Runs until cancelled or until the transport fails. Either way the
	/// loop passes through `Draining` (one final drain of every ring) and
	/// ends in `Stopped`.
	pub async fn run(mut self) -> core::result::Result<(), FatalTransportError> {
		self.set_state(DispatchState::Running);
		let mut batch: Vec<(u32, RawRecord)> = Vec::new();
		let mut cancelled = false;

		let result = loop {
			let drained = self.consumer.drain_into(&mut batch);
			if drained > 0 {
				if let Err(err) = self.deliver_batch(&mut batch) {
					break Err(err);
				}
			}
			self.report_overflow();

			if let Some(reason) = self.consumer.poison_reason() {
				break Err(FatalTransportError::BufferPoisoned { reason });
			}
			if cancelled {
				break Ok(());
			}

			if drained == 0 {
				// Non-busy wait; the timeout bounds how long a cancellation
				// can go unnoticed.
				tokio::select! {
					_ = self.consumer.wait_for_records() => {}
					// A message or a dropped sender both mean cancel;
					// the signal is settable once and not retractable.
					_ = self.cancel_rx.recv_async() => cancelled = true,
					_ = tokio::time::sleep(self.poll_idle_timeout) => {}
				}
			} else if self.cancel_rx.try_recv().is_ok() || self.cancel_rx.is_disconnected() {
				cancelled = true;
			}
		};

		self.set_state(DispatchState::Draining);
		if self.consumer.drain_into(&mut batch) > 0 {
			// Best effort on the fatal path; the primary error wins.
			let final_result = self.deliver_batch(&mut batch);
			if result.is_ok() {
				if let Err(err) = final_result {
					self.report_overflow();
					self.set_state(DispatchState::Stopped);
					return Err(err);
				}
			}
		}
		self.report_overflow();
		self.set_state(DispatchState::Stopped);
		result
	}

	/// Decodes the batch, merges by timestamp, and forwards to the sink.
	/// Malformed records are logged and skipped; they never end the loop.
	fn deliver_batch(&mut self, batch: &mut Vec<(u32, RawRecord)>) -> core::result::Result<(), FatalTransportError> {
		let mut decoded = Vec::with_capacity(batch.len());
		for (unit, record) in batch.drain(..) {
			match decode(record.as_bytes()) {
				Ok(event) => decoded.push(event),
				Err(err) => warn!(unit, %err, "skipping malformed record"),
			}
		}
		// Stable sort: per-unit FIFO survives among equal timestamps.
		decoded.sort_by_key(|event| event.ts_us());

		for event in &decoded {
			self.sink
				.deliver(event)
				.map_err(|err| FatalTransportError::SinkFailed { cause: err.to_string() })?;
		}
		Ok(())
	}

	fn report_overflow(&mut self) {
		let total = self.consumer.overflow_total();
		if total > self.reported_overflow {
			debug!(
				dropped = total - self.reported_overflow,
				total, "ring overflow: records dropped at the producer side"
			);
			self.reported_overflow = total;
		}
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use std::sync::{Arc, Mutex};
	use std::time::Instant;

	use provtrace_common::{Event, MAX_RECORD_LEN};

	use super::*;
	use crate::buffer::{CaptureBuffer, RingProducer};
	use crate::Result;

	type TestResult = core::result::Result<(), Box<dyn std::error::Error>>;

	/// Collects delivered events for assertions.
	#[derive(Clone, Default)]
	struct VecSink(Arc<Mutex<Vec<Event>>>);

	impl VecSink {
		fn events(&self) -> Vec<Event> {
			self.0.lock().unwrap().clone()
		}
	}

	impl EventSink for VecSink {
		fn deliver(&mut self, event: &Event) -> Result<()> {
			self.0.lock().unwrap().push(*event);
			Ok(())
		}
	}

	struct FailingSink;

	impl EventSink for FailingSink {
		fn deliver(&mut self, _event: &Event) -> Result<()> {
			Err(crate::Error::custom("sink closed"))
		}
	}

	fn push_event(producer: &RingProducer, event: Event) {
		let mut buf = [0u8; MAX_RECORD_LEN];
		let len = event.encode_into(&mut buf);
		assert!(producer.push(&buf[..len]));
	}

	struct Fx {
		dispatcher: Dispatcher,
		state_rx: watch::Receiver<DispatchState>,
		buffer: Arc<CaptureBuffer>,
		producers: Vec<RingProducer>,
		cancel_tx: flume::Sender<()>,
	}

	fn fx_dispatcher(units: usize, sink: Box<dyn EventSink>) -> Fx {
		let (buffer, consumer, producers) = CaptureBuffer::new(units, 16);
		let (cancel_tx, cancel_rx) = flume::bounded(1);
		let (dispatcher, state_rx) = Dispatcher::new(consumer, sink, cancel_rx, Duration::from_millis(50));
		Fx {
			dispatcher,
			state_rx,
			buffer,
			producers,
			cancel_tx,
		}
	}

	#[tokio::test]
	async fn dispatch_delivers_single_event_to_sink() -> TestResult {
		let sink = VecSink::default();
		let fx = fx_dispatcher(1, Box::new(sink.clone()));

		push_event(
			&fx.producers[0],
			Event::ProcessCreated {
				ts_us: 10,
				pid: 100,
				ppid: 1,
			},
		);

		let handle = tokio::spawn(fx.dispatcher.run());
		tokio::time::sleep(Duration::from_millis(20)).await;
		drop(fx.cancel_tx);
		handle.await??;

		let events = sink.events();
		assert_eq!(
			events,
			vec![Event::ProcessCreated {
				ts_us: 10,
				pid: 100,
				ppid: 1
			}]
		);
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_merges_units_by_timestamp() -> TestResult {
		let sink = VecSink::default();
		let fx = fx_dispatcher(2, Box::new(sink.clone()));

		push_event(&fx.producers[1], Event::PipeCreated { ts_us: 30, pid: 3 });
		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 10, pid: 1 });
		push_event(&fx.producers[1], Event::PipeCreated { ts_us: 40, pid: 4 });
		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 20, pid: 2 });

		let handle = tokio::spawn(fx.dispatcher.run());
		tokio::time::sleep(Duration::from_millis(20)).await;
		drop(fx.cancel_tx);
		handle.await??;

		let order: Vec<u64> = sink.events().iter().map(Event::ts_us).collect();
		assert_eq!(order, vec![10, 20, 30, 40]);
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_skips_malformed_records_and_continues() -> TestResult {
		let sink = VecSink::default();
		let fx = fx_dispatcher(1, Box::new(sink.clone()));

		// Unknown discriminant, then a valid record.
		let mut bad = [0u8; 16];
		bad[..4].copy_from_slice(&77u32.to_ne_bytes());
		assert!(fx.producers[0].push(&bad));
		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 5, pid: 9 });

		let handle = tokio::spawn(fx.dispatcher.run());
		tokio::time::sleep(Duration::from_millis(20)).await;
		drop(fx.cancel_tx);
		handle.await??;

		assert_eq!(sink.events(), vec![Event::PipeCreated { ts_us: 5, pid: 9 }]);
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_cancel_while_idle_stops_within_timeout() -> TestResult {
		let sink = VecSink::default();
		let mut fx = fx_dispatcher(1, Box::new(sink));

		let handle = tokio::spawn(fx.dispatcher.run());
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(*fx.state_rx.borrow(), DispatchState::Running);

		let started = Instant::now();
		drop(fx.cancel_tx);
		while *fx.state_rx.borrow() != DispatchState::Stopped {
			fx.state_rx.changed().await?;
		}
		// Bounded by poll_idle_timeout (50ms here) plus scheduling slack.
		assert!(started.elapsed() < Duration::from_millis(200));
		handle.await??;
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_drains_pending_records_after_cancel() -> TestResult {
		let sink = VecSink::default();
		let fx = fx_dispatcher(1, Box::new(sink.clone()));

		drop(fx.cancel_tx);
		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 1, pid: 1 });
		fx.dispatcher.run().await?;

		assert_eq!(sink.events().len(), 1);
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_poisoned_buffer_is_fatal_after_final_drain() -> TestResult {
		let sink = VecSink::default();
		let mut fx = fx_dispatcher(1, Box::new(sink.clone()));

		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 1, pid: 1 });
		let handle = tokio::spawn(fx.dispatcher.run());
		tokio::time::sleep(Duration::from_millis(20)).await;

		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 2, pid: 2 });
		fx.buffer.poison("perf reader gone");

		let result = handle.await?;
		assert!(matches!(result, Err(FatalTransportError::BufferPoisoned { .. })));
		while *fx.state_rx.borrow() != DispatchState::Stopped {
			fx.state_rx.changed().await?;
		}
		// The record pushed before the failure was still delivered.
		assert_eq!(sink.events().len(), 2);
		Ok(())
	}

	#[tokio::test]
	async fn dispatch_sink_failure_is_fatal() -> TestResult {
		let mut fx = fx_dispatcher(1, Box::new(FailingSink));

		push_event(&fx.producers[0], Event::PipeCreated { ts_us: 1, pid: 1 });
		let result = fx.dispatcher.run().await;

		assert!(matches!(result, Err(FatalTransportError::SinkFailed { .. })));
		while *fx.state_rx.borrow() != DispatchState::Stopped {
			fx.state_rx.changed().await?;
		}
		Ok(())
	}
}

// endregion: --- Tests
