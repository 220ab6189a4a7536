mod cli;

use clap::Parser;
use provtrace::{sources, Result, TextSink, TracerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, RunMode};

fn init_tracing() {
	// Diagnostics go to stderr; stdout carries only the event lines.
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_target(false)
		.with_env_filter(EnvFilter::from_default_env())
		.init();
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Cli::parse();
	init_tracing();

	let config = TracerConfig {
		ring_capacity_per_unit: args.ring_capacity,
		poll_idle_timeout: args.poll_idle_timeout.into(),
	};

	let mut sink = TextSink::stdout();
	if !args.no_header {
		sink.write_header()?;
	}

	let tracer = match args.mode {
		RunMode::Trace => sources::kernel(&config, &args.ebpf_object, Box::new(sink)).await?,
		RunMode::Sim => {
			let (tracer, _source) = sources::sim(&config, args.sim_units, Box::new(sink))?;
			tracer
		}
	};

	wait_for_exit(args.time.map(Into::into)).await?;

	info!("stopping tracer");
	tracer.stop().await?;
	Ok(())
}

async fn wait_for_exit(run_time: Option<std::time::Duration>) -> Result<()> {
	match run_time {
		Some(run_time) => {
			tokio::select! {
				_ = tokio::time::sleep(run_time) => {}
				res = tokio::signal::ctrl_c() => res?,
			}
		}
		None => tokio::signal::ctrl_c().await?,
	}
	Ok(())
}
