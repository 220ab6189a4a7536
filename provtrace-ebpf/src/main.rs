#![no_std]
#![no_main]

use aya_ebpf::{
	helpers::{bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_kernel, r#gen::bpf_get_current_task},
	macros::{kprobe, map},
	maps::PerfEventArray,
	programs::ProbeContext,
};
use aya_log_ebpf::error;
use provtrace_common::{
	fsync_failed, DupRecord, EventKind, FsyncRecord, PipeRecord, ProcessRecord, RecordHeader, SendmsgRecord,
	WireRecord,
};
mod vmlinux;
use vmlinux::{file, task_struct};

#[map]
static mut EVENTS: PerfEventArray<WireRecord> = PerfEventArray::new(0);

#[kprobe]
pub fn sys_clone(ctx: ProbeContext) -> u32 {
	match try_process_event(ctx, EventKind::ProcessCreated) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn sys_execve(ctx: ProbeContext) -> u32 {
	match try_process_event(ctx, EventKind::ProgramExecuted) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn sys_pipe(ctx: ProbeContext) -> u32 {
	match try_sys_pipe(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn sys_dup(ctx: ProbeContext) -> u32 {
	match try_sys_dup(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn sys_sendmsg(ctx: ProbeContext) -> u32 {
	match try_sys_sendmsg(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

#[kprobe]
pub fn vfs_fsync_range(ctx: ProbeContext) -> u32 {
	match try_vfs_fsync_range(ctx) {
		Ok(ret) => ret,
		Err(ret) => ret,
	}
}

fn try_process_event(ctx: ProbeContext, kind: EventKind) -> Result<u32, u32> {
	let record = ProcessRecord {
		header: RecordHeader::new(kind),
		ts_us: now_us(),
		pid: current_pid(),
		ppid: current_ppid()?,
	};

	submit(&ctx, &WireRecord::of(&record));
	Ok(0)
}

fn try_sys_pipe(ctx: ProbeContext) -> Result<u32, u32> {
	let record = PipeRecord {
		header: RecordHeader::new(EventKind::PipeCreated),
		ts_us: now_us(),
		pid: current_pid(),
		_pad: 0,
	};

	submit(&ctx, &WireRecord::of(&record));
	Ok(0)
}

fn try_sys_dup(ctx: ProbeContext) -> Result<u32, u32> {
	let fd: u64 = ctx.arg(0).ok_or(1u32)?;

	let record = DupRecord {
		header: RecordHeader::new(EventKind::DescriptorDuplicated),
		ts_us: now_us(),
		pid: current_pid(),
		ppid: current_ppid()?,
		fd: fd as u32,
		_pad: 0,
	};

	submit(&ctx, &WireRecord::of(&record));
	Ok(0)
}

fn try_sys_sendmsg(ctx: ProbeContext) -> Result<u32, u32> {
	let fd: u64 = ctx.arg(0).ok_or(1u32)?;

	let record = SendmsgRecord {
		header: RecordHeader::new(EventKind::MessageSent),
		ts_us: now_us(),
		pid: current_pid(),
		ppid: current_ppid()?,
		fd: fd as i32,
		_pad: 0,
	};

	submit(&ctx, &WireRecord::of(&record));
	Ok(0)
}

fn try_vfs_fsync_range(ctx: ProbeContext) -> Result<u32, u32> {
	let file: *const file = ctx.arg(0).ok_or(1u32)?;
	let datasync: u64 = ctx.arg(3).unwrap_or(0);

	let f_op = match unsafe { bpf_probe_read_kernel(&(*file).f_op) } {
		Ok(f_op) => f_op,
		Err(_) => {
			error!(&ctx, "failed to read file->f_op");
			return Err(2);
		}
	};
	let fsync_fn = match unsafe { bpf_probe_read_kernel(&(*f_op).fsync) } {
		Ok(fsync_fn) => fsync_fn,
		Err(_) => {
			error!(&ctx, "failed to read f_op->fsync");
			return Err(2);
		}
	};

	// Only a full sync flushes dirty timestamps; fdatasync never looks at
	// them, so the inode read is skipped on that path.
	let mut i_state = 0;
	if !fsync_fn.is_null() && datasync == 0 {
		i_state = read_inode_state(file).unwrap_or(0);
	}
	let error = fsync_failed(!fsync_fn.is_null(), datasync != 0, i_state);

	let record = FsyncRecord {
		header: RecordHeader::new(EventKind::FileSynced),
		ts_us: now_us(),
		fsync_fn: fsync_fn as u64,
		error: error as u32,
		_pad: 0,
	};

	submit(&ctx, &WireRecord::of(&record));
	Ok(0)
}

fn read_inode_state(file: *const file) -> Result<u64, u32> {
	let mapping = unsafe { bpf_probe_read_kernel(&(*file).f_mapping).map_err(|_| 2u32)? };
	let host = unsafe { bpf_probe_read_kernel(&(*mapping).host).map_err(|_| 2u32)? };
	unsafe { bpf_probe_read_kernel(&(*host).i_state).map_err(|_| 2u32) }
}

fn now_us() -> u64 {
	unsafe { bpf_ktime_get_ns() / 1000 }
}

fn current_pid() -> u32 {
	bpf_get_current_pid_tgid() as u32
}

fn current_ppid() -> Result<u32, u32> {
	unsafe {
		let task = bpf_get_current_task() as *const task_struct;
		if task.is_null() {
			return Err(1);
		}
		let parent = bpf_probe_read_kernel(&(*task).real_parent).map_err(|_| 1u32)?;
		let ppid = bpf_probe_read_kernel(&(*parent).pid).map_err(|_| 1u32)?;
		Ok(ppid as u32)
	}
}

fn submit(ctx: &ProbeContext, record: &WireRecord) {
	let events = &raw mut EVENTS;
	unsafe { (*events).output(ctx, record, 0) };
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
	loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
