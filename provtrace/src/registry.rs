//! Probe side of the tracer: a fixed table binding each monitored kernel
//! entry point to the eBPF program that handles it and the event variant it
//! emits. Attachment is all-or-nothing; a failure detaches whatever was
//! already installed so no partial tracer is left running.

use aya::programs::kprobe::KProbeLinkId;
use aya::programs::{KProbe, ProgramError};
use aya::Ebpf;
use derive_more::Display;
use provtrace_common::EventKind;
use tracing::{debug, warn};

/// One entry-point binding. Syscall symbol names differ per architecture and
/// kernel version, so each binding lists candidates tried in order.
pub struct ProbeSpec {
	/// Program name inside the eBPF object.
	pub program: &'static str,
	pub kind: EventKind,
	pub entry_points: &'static [&'static str],
}

/// The six monitored operations. This table is the single source of the
/// entry-point-to-variant mapping; the eBPF object carries one program per
/// row, named after the row.
pub const PROBES: &[ProbeSpec] = &[
	ProbeSpec {
		program: "sys_clone",
		kind: EventKind::ProcessCreated,
		entry_points: &["__x64_sys_clone", "__arm64_sys_clone", "sys_clone"],
	},
	ProbeSpec {
		program: "sys_execve",
		kind: EventKind::ProgramExecuted,
		entry_points: &["__x64_sys_execve", "__arm64_sys_execve", "sys_execve"],
	},
	ProbeSpec {
		program: "sys_pipe",
		kind: EventKind::PipeCreated,
		entry_points: &["__x64_sys_pipe", "__arm64_sys_pipe", "sys_pipe"],
	},
	ProbeSpec {
		program: "sys_dup",
		kind: EventKind::DescriptorDuplicated,
		entry_points: &["__x64_sys_dup", "__arm64_sys_dup", "sys_dup"],
	},
	ProbeSpec {
		program: "sys_sendmsg",
		kind: EventKind::MessageSent,
		entry_points: &["__x64_sys_sendmsg", "__arm64_sys_sendmsg", "sys_sendmsg"],
	},
	ProbeSpec {
		program: "vfs_fsync_range",
		kind: EventKind::FileSynced,
		entry_points: &["vfs_fsync_range"],
	},
];

#[derive(Debug, Display)]
#[display("{self:?}")]
pub enum AttachError {
	/// The eBPF object does not carry the expected program.
	ProgramNotFound { program: &'static str },
	/// No candidate kernel symbol resolved on this kernel.
	EntryPointNotFound { program: &'static str },
	PrivilegeDenied,
	AlreadyAttached { program: &'static str },
	Program {
		program: &'static str,
		source: ProgramError,
	},
}

impl std::error::Error for AttachError {}

/// Identifies one attached probe; detaching through a stale handle is a
/// no-op.
#[derive(Clone, Copy, Debug)]
pub struct ProbeHandle(usize);

struct Attached {
	program: &'static str,
	link_id: KProbeLinkId,
}

/// Owns the loaded eBPF object and every live attachment. Dropping the
/// registry detaches everything (the kernel tears probes down with the
/// object), but orderly shutdown goes through [`ProbeRegistry::detach_all`]
/// before the capture buffer is released.
pub struct ProbeRegistry {
	ebpf: Ebpf,
	attached: Vec<Option<Attached>>,
}

impl ProbeRegistry {
	/// Attaches every probe in [`PROBES`]. On any failure the probes already
	/// installed are detached before the error is returned.
	pub fn attach_all(mut ebpf: Ebpf) -> Result<Self, AttachError> {
		// Attaching kprobes needs CAP_BPF/CAP_PERFMON; checking up front
		// gives a precise error instead of a raw EPERM from the first attach.
		if unsafe { libc::geteuid() } != 0 {
			return Err(AttachError::PrivilegeDenied);
		}

		let mut attached: Vec<Option<Attached>> = Vec::with_capacity(PROBES.len());
		for spec in PROBES {
			match attach_one(&mut ebpf, spec) {
				Ok(link) => attached.push(Some(link)),
				Err(err) => {
					for link in attached.into_iter().flatten() {
						detach_link(&mut ebpf, link);
					}
					return Err(err);
				}
			}
		}

		Ok(Self { ebpf, attached })
	}

	pub fn handles(&self) -> impl Iterator<Item = ProbeHandle> + '_ {
		(0..self.attached.len()).map(ProbeHandle)
	}

	pub fn attached_count(&self) -> usize {
		self.attached.iter().flatten().count()
	}

	/// Detaches one probe; the entry point produces no events afterwards.
	/// Idempotent.
	pub fn detach(&mut self, handle: ProbeHandle) {
		if let Some(link) = self.attached.get_mut(handle.0).and_then(Option::take) {
			detach_link(&mut self.ebpf, link);
		}
	}

	pub fn detach_all(&mut self) {
		for slot in &mut self.attached {
			if let Some(link) = slot.take() {
				detach_link(&mut self.ebpf, link);
			}
		}
	}

	/// Hands a map out of the object, for the transport pumps.
	pub fn take_map(&mut self, name: &str) -> Option<aya::maps::Map> {
		self.ebpf.take_map(name)
	}
}

fn attach_one(ebpf: &mut Ebpf, spec: &ProbeSpec) -> Result<Attached, AttachError> {
	let program: &mut KProbe = ebpf
		.program_mut(spec.program)
		.ok_or(AttachError::ProgramNotFound { program: spec.program })?
		.try_into()
		.map_err(|source| AttachError::Program {
			program: spec.program,
			source,
		})?;

	match program.load() {
		Ok(()) => {}
		Err(ProgramError::AlreadyLoaded) => {
			return Err(AttachError::AlreadyAttached { program: spec.program });
		}
		Err(source) => {
			return Err(AttachError::Program {
				program: spec.program,
				source,
			});
		}
	}

	for entry_point in spec.entry_points {
		match program.attach(entry_point, 0) {
			Ok(link_id) => {
				debug!(program = spec.program, entry_point, "probe attached");
				return Ok(Attached {
					program: spec.program,
					link_id,
				});
			}
			Err(err) => {
				debug!(program = spec.program, entry_point, %err, "candidate symbol rejected");
			}
		}
	}

	Err(AttachError::EntryPointNotFound { program: spec.program })
}

fn detach_link(ebpf: &mut Ebpf, link: Attached) {
	let Some(program) = ebpf.program_mut(link.program) else {
		return;
	};
	let Ok(program) = <&mut KProbe>::try_from(program) else {
		return;
	};
	if let Err(err) = program.detach(link.link_id) {
		warn!(program = link.program, %err, "probe detach failed");
	}
}

// region:    --- Tests

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_table_covers_the_six_operations() {
		assert_eq!(PROBES.len(), 6);

		let mut kinds: Vec<u32> = PROBES.iter().map(|spec| spec.kind.tag()).collect();
		kinds.sort_unstable();
		assert_eq!(kinds, vec![0, 1, 2, 3, 4, 5]);
	}

	#[test]
	fn registry_table_has_distinct_programs_and_candidates() {
		let mut programs: Vec<&str> = PROBES.iter().map(|spec| spec.program).collect();
		programs.sort_unstable();
		programs.dedup();
		assert_eq!(programs.len(), PROBES.len());

		for spec in PROBES {
			assert!(!spec.entry_points.is_empty(), "{} has no entry point", spec.program);
		}
	}
}

// endregion: --- Tests
