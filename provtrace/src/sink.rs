//! Presentation side: one line per event, in the fixed snoop-style text
//! format downstream consumers parse.

use std::io::Write;

use provtrace_common::Event;

use crate::Result;

/// Consumes decoded events, one at a time, in the order the dispatcher
/// delivers them. Implementations must not block indefinitely; a slow sink
/// backs up drains, never producer rings.
pub trait EventSink: Send {
	fn deliver(&mut self, event: &Event) -> Result<()>;
}

/// Renders one event. Timestamps print as seconds with nine decimals,
/// left-justified to 18 columns. FileSynced
/// carries its extra bare `error` line inside the returned string.
pub fn format_event(event: &Event) -> String {
	let secs = event.ts_us() as f64 / 1_000_000.0;
	let name = event.kind().name();
	match *event {
		Event::ProcessCreated { pid, ppid, .. } | Event::ProgramExecuted { pid, ppid, .. } => {
			format!("{secs:<18.9} {name}(), pid={pid}, ppid={ppid}")
		}
		Event::PipeCreated { pid, .. } => {
			format!("{secs:<18.9} {name}(), pid={pid}")
		}
		Event::DescriptorDuplicated { pid, fd, .. } => {
			format!("{secs:<18.9} {name}(), pid={pid}, fd={fd}")
		}
		Event::MessageSent { pid, fd, .. } => {
			format!("{secs:<18.9} {name}(), pid={pid}, fd={fd}")
		}
		Event::FileSynced { fsync_fn, error, .. } => {
			let line = format!("{secs:<18.9} fsync(), fn_ptr={fsync_fn:x}");
			if error {
				format!("{line}\nerror")
			} else {
				line
			}
		}
	}
}

/// Line-oriented sink over any writer, stdout in the CLI.
pub struct TextSink<W: Write + Send> {
	out: W,
}

impl TextSink<std::io::Stdout> {
	pub fn stdout() -> Self {
		Self { out: std::io::stdout() }
	}
}

impl<W: Write + Send> TextSink<W> {
	pub fn new(out: W) -> Self {
		Self { out }
	}

	pub fn write_header(&mut self) -> Result<()> {
		writeln!(self.out, "{:<18} {}", "TIME(s)", "CALL")?;
		Ok(())
	}

	pub fn into_inner(self) -> W {
		self.out
	}
}

impl<W: Write + Send> EventSink for TextSink<W> {
	fn deliver(&mut self, event: &Event) -> Result<()> {
		writeln!(self.out, "{}", format_event(event))?;
		Ok(())
	}
}

// region:    --- Tests


// endregion: --- Tests
