//! Kernel-event provenance tracer.
//!
//! Six kernel entry points (clone, execve, pipe, dup, sendmsg, vfs fsync)
//! are monitored by eBPF kprobes that encode fixed-layout records and submit
//! them into per-CPU rings. A single user-space dispatcher drains the rings,
//! decodes, merges by timestamp, and prints one line per event. Drops are
//! counted, never silent.

mod buffer;
mod config;
mod dispatch;
mod error;
mod kernel;
mod registry;
mod sim;
mod sink;
mod tracer;

pub use self::error::{Error, Result};

pub use buffer::{BufferConsumer, CaptureBuffer, RawRecord, RingProducer};
pub use config::TracerConfig;
pub use dispatch::{DispatchState, Dispatcher, FatalTransportError};
pub use kernel::EVENT_MAP;
pub use registry::{AttachError, ProbeHandle, ProbeRegistry, ProbeSpec, PROBES};
pub use sim::SimSource;
pub use sink::{format_event, EventSink, TextSink};
pub use tracer::Tracer;

pub mod sources {
	pub use crate::kernel::start as kernel;
	pub use crate::sim::start as sim;
}
