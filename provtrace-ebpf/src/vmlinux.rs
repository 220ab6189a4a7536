// Generated with `aya-tool generate task_struct file inode`, then trimmed to
// the fields the probes actually read. The padding encodes the field offsets
// for the kernel this was generated against (6.8, x86_64); regenerate when
// targeting a different kernel.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use core::ffi::c_void;

#[repr(C)]
pub struct task_struct {
	pub _pad0: [u8; 2464],
	pub pid: i32,
	pub tgid: i32,
	pub _pad1: [u8; 8],
	pub real_parent: *const task_struct,
}

#[repr(C)]
pub struct file {
	pub _pad0: [u8; 40],
	pub f_op: *const file_operations,
	pub _pad1: [u8; 176],
	pub f_mapping: *const address_space,
}

#[repr(C)]
pub struct file_operations {
	pub _pad0: [u8; 128],
	pub fsync: *const c_void,
}

#[repr(C)]
pub struct address_space {
	pub host: *const inode,
}

#[repr(C)]
pub struct inode {
	pub _pad0: [u8; 136],
	pub i_state: u64,
}
