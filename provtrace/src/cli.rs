use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use humantime::Duration;

#[derive(Parser, Debug)]
#[command(name = "provtrace")]
pub struct Cli {
	#[arg(long, value_enum, default_value = "trace")]
	pub mode: RunMode,

	/// Compiled eBPF object with the probe programs.
	#[arg(long, default_value = "target/bpfel-unknown-none/release/provtrace")]
	pub ebpf_object: PathBuf,

	/// Records per unit ring.
	#[arg(long, default_value_t = 1024)]
	pub ring_capacity: usize,

	/// Longest idle wait before the dispatcher re-checks cancellation.
	#[arg(long, default_value = "250ms")]
	pub poll_idle_timeout: Duration,

	/// Fake execution units in sim mode.
	#[arg(long, default_value_t = 2)]
	pub sim_units: usize,

	/// Stop after this long (e.g. 20s, 5m); default is to run until Ctrl-C.
	#[arg(long)]
	pub time: Option<Duration>,

	/// Suppress the TIME(s)/CALL header line.
	#[arg(long)]
	pub no_header: bool,
}

#[derive(Copy, Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum RunMode {
	/// Attach the eBPF probes to the running kernel (needs root).
	Trace,
	/// Drive the pipeline from a synthetic workload, no privileges needed.
	Sim,
}
