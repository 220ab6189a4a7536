//! Kernel capture source: loads the eBPF object, attaches the probe table,
//! and pumps the kernel's per-CPU perf rings into the user-space capture
//! buffer, one pump task per online CPU. Kernel-side lost-sample counts fold
//! into the same overflow metric as user-side ring drops.

use std::path::Path;
use std::sync::Arc;

use aya::maps::AsyncPerfEventArray;
use aya::util::online_cpus;
use aya::Ebpf;
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer::{CaptureBuffer, RingProducer};
use crate::config::TracerConfig;
use crate::registry::ProbeRegistry;
use crate::sink::EventSink;
use crate::tracer::Tracer;
use crate::{Error, Result};

/// Name of the perf map in the eBPF object.
pub const EVENT_MAP: &str = "EVENTS";

// Each perf read can return a batch; per-record buffers need room for the
// record plus the perf sample header.
const PERF_READ_CHUNK: usize = 16;
const PERF_READ_BUF: usize = 256;

/// Builds a running tracer over the real kernel: rlimit bump, object load,
/// all-or-nothing probe attach, one pump per online CPU. Any failure here
/// aborts construction entirely; nothing is left half-attached.
pub async fn start(config: &TracerConfig, object_path: &Path, sink: Box<dyn EventSink>) -> Result<Tracer> {
	bump_memlock_rlimit();

	let mut ebpf = Ebpf::load_file(object_path)?;
	if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
		// This can happen if you remove all log statements from your eBPF program.
		warn!("failed to initialize eBPF logger: {e}");
	}

	let mut registry = ProbeRegistry::attach_all(ebpf)?;
	info!(probes = registry.attached_count(), "probes attached");

	let cpus = online_cpus().map_err(|(_, error)| Error::from(error))?;
	let (buffer, consumer, producers) = CaptureBuffer::new(cpus.len(), config.ring_capacity_per_unit);

	let map = registry
		.take_map(EVENT_MAP)
		.ok_or_else(|| Error::custom(format!("map `{EVENT_MAP}` missing from eBPF object")))?;
	let mut perf_array = AsyncPerfEventArray::try_from(map)?;

	let mut tracer = Tracer::start(config, consumer, Some(registry), sink);
	for (cpu, producer) in cpus.into_iter().zip(producers) {
		let perf_buf = perf_array.open(cpu, None)?;
		let pump = spawn_pump(cpu, perf_buf, producer, buffer.clone(), tracer.cancel_signal());
		tracer.add_pump(pump);
	}

	Ok(tracer)
}

fn spawn_pump(
	cpu: u32,
	mut perf_buf: aya::maps::perf::AsyncPerfEventArrayBuffer<aya::maps::MapData>,
	producer: RingProducer,
	buffer: Arc<CaptureBuffer>,
	cancel_rx: flume::Receiver<()>,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut read_bufs: Vec<BytesMut> = (0..PERF_READ_CHUNK).map(|_| BytesMut::with_capacity(PERF_READ_BUF)).collect();
		loop {
			tokio::select! {
				_ = cancel_rx.recv_async() => break,
				read = perf_buf.read_events(&mut read_bufs) => match read {
					Ok(events) => {
						if events.lost > 0 {
							producer.add_lost(events.lost as u64);
						}
						for read_buf in read_bufs.iter().take(events.read) {
							producer.push(read_buf.as_ref());
						}
					}
					Err(err) => {
						// The per-CPU ring is gone; the whole transport is
						// considered unusable.
						buffer.poison(format!("perf read on cpu {cpu} failed: {err}"));
						break;
					}
				},
			}
		}
		debug!(cpu, "perf pump stopped");
	})
}

fn bump_memlock_rlimit() {
	// Bump the memlock rlimit. This is needed for older kernels that don't use the
	// new memcg based accounting, see https://lwn.net/Articles/837122/
	let rlim = libc::rlimit {
		rlim_cur: libc::RLIM_INFINITY,
		rlim_max: libc::RLIM_INFINITY,
	};
	let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
	if ret != 0 {
		debug!("remove limit on locked memory failed, ret is: {ret}");
	}
}
