//! One tracer instance = one Capture Buffer + one Probe Registry pair with
//! explicit init and teardown. Shutdown order is fixed: dispatcher reaches
//! `Stopped`, probes detach, transport pumps wind down, buffer is released.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::buffer::{BufferConsumer, CaptureBuffer};
use crate::config::TracerConfig;
use crate::dispatch::{DispatchState, Dispatcher, FatalTransportError};
use crate::registry::ProbeRegistry;
use crate::sink::EventSink;
use crate::{Error, Result};

pub struct Tracer {
	// Dropping the sender is the cancellation signal: settable once, not
	// retractable, observed by the dispatcher and every pump.
	cancel_tx: Option<flume::Sender<()>>,
	cancel_rx: flume::Receiver<()>,
	dispatcher: JoinHandle<core::result::Result<(), FatalTransportError>>,
	state_rx: watch::Receiver<DispatchState>,
	registry: Option<ProbeRegistry>,
	pumps: Vec<JoinHandle<()>>,
	buffer: Arc<CaptureBuffer>,
	poll_idle_timeout: Duration,
}

impl Tracer {
	/// Spawns the dispatcher over an already-populated transport. Capture
	/// sources register their pump tasks afterwards via [`Tracer::add_pump`].
	pub fn start(
		config: &TracerConfig,
		consumer: BufferConsumer,
		registry: Option<ProbeRegistry>,
		sink: Box<dyn EventSink>,
	) -> Self {
		let buffer = consumer.shared();
		let (cancel_tx, cancel_rx) = flume::bounded::<()>(1);
		let (dispatcher, state_rx) = Dispatcher::new(consumer, sink, cancel_rx.clone(), config.poll_idle_timeout);
		let dispatcher = tokio::spawn(dispatcher.run());

		Self {
			cancel_tx: Some(cancel_tx),
			cancel_rx,
			dispatcher,
			state_rx,
			registry,
			pumps: Vec::new(),
			buffer,
			poll_idle_timeout: config.poll_idle_timeout,
		}
	}

	/// A clone of the cancellation signal for a pump task.
	pub fn cancel_signal(&self) -> flume::Receiver<()> {
		self.cancel_rx.clone()
	}

	pub fn add_pump(&mut self, pump: JoinHandle<()>) {
		self.pumps.push(pump);
	}

	pub fn state(&self) -> DispatchState {
		*self.state_rx.borrow()
	}

	pub fn overflow_total(&self) -> u64 {
		self.buffer.overflow_total()
	}

	pub fn registry_mut(&mut self) -> Option<&mut ProbeRegistry> {
		self.registry.as_mut()
	}

	/// Signals cancellation and waits, bounded by `poll_idle_timeout` plus
	/// slack, for the dispatcher to reach `Stopped`. Probes are detached
	/// before the buffer can be released.
	pub async fn stop(mut self) -> Result<()> {
		self.cancel_tx.take();

		let bound = self.poll_idle_timeout.saturating_add(Duration::from_millis(200));
		// No early returns from here on: probes must detach even when the
		// dispatcher ended badly.
		let dispatch_result: Result<()> = match tokio::time::timeout(bound, &mut self.dispatcher).await {
			Ok(Ok(Ok(()))) => Ok(()),
			Ok(Ok(Err(fatal))) => Err(Error::from(fatal)),
			Ok(Err(join_err)) => Err(Error::from(join_err)),
			Err(_elapsed) => {
				self.dispatcher.abort();
				Err(Error::ShutdownTimeout)
			}
		};

		if let Some(mut registry) = self.registry.take() {
			registry.detach_all();
		}

		for mut pump in self.pumps.drain(..) {
			if tokio::time::timeout(bound, &mut pump).await.is_err() {
				warn!("transport pump ignored cancellation; aborting it");
				pump.abort();
			}
		}

		let dropped = self.buffer.overflow_total();
		if dropped > 0 {
			info!(dropped, "capture ended with dropped records");
		}

		dispatch_result
	}
}

// region:    --- Tests


// endregion: --- Tests
