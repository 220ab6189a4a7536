use zerocopy::{FromBytes, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Largest encoded record. Capture slots are sized to this.
pub const MAX_RECORD_LEN: usize = core::mem::size_of::<DupRecord>();

/// Wire discriminants. The values are part of the record format shared with
/// the kernel side and are never reordered.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
	ProcessCreated = 0,
	ProgramExecuted = 1,
	PipeCreated = 2,
	DescriptorDuplicated = 3,
	MessageSent = 4,
	FileSynced = 5,
}

impl EventKind {
	pub const fn tag(self) -> u32 {
		self as u32
	}

	pub const fn from_tag(tag: u32) -> Option<Self> {
		match tag {
			0 => Some(Self::ProcessCreated),
			1 => Some(Self::ProgramExecuted),
			2 => Some(Self::PipeCreated),
			3 => Some(Self::DescriptorDuplicated),
			4 => Some(Self::MessageSent),
			5 => Some(Self::FileSynced),
			_ => None,
		}
	}

	pub const fn name(self) -> &'static str {
		match self {
			Self::ProcessCreated => "CLONE",
			Self::ProgramExecuted => "EXEC",
			Self::PipeCreated => "PIPE",
			Self::DescriptorDuplicated => "DUP",
			Self::MessageSent => "SENDMSG",
			Self::FileSynced => "FSYNC",
		}
	}
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RecordHeader {
	pub tag: u32,
	// Keeps the u64 timestamp that follows naturally aligned.
	pub _pad: u32,
}

impl RecordHeader {
	pub const fn new(kind: EventKind) -> Self {
		Self { tag: kind.tag(), _pad: 0 }
	}
}

/// Shared by CLONE and EXEC, which carry the same fields.
#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ProcessRecord {
	pub header: RecordHeader,
	pub ts_us: u64,
	pub pid: u32,
	pub ppid: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PipeRecord {
	pub header: RecordHeader,
	pub ts_us: u64,
	pub pid: u32,
	pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct DupRecord {
	pub header: RecordHeader,
	pub ts_us: u64,
	pub pid: u32,
	pub ppid: u32,
	pub fd: u32,
	pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SendmsgRecord {
	pub header: RecordHeader,
	pub ts_us: u64,
	pub pid: u32,
	pub ppid: u32,
	pub fd: i32,
	pub _pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FsyncRecord {
	pub header: RecordHeader,
	pub ts_us: u64,
	/// Address of the filesystem's fsync handler, 0 when the file has none.
	pub fsync_fn: u64,
	pub error: u32,
	pub _pad: u32,
}

/// `inode->i_state` bit for timestamp-only dirtiness (linux/fs.h).
pub const I_DIRTY_TIME: u64 = 1 << 11;

/// Sync-failure rule for one `vfs_fsync_range` invocation: a file with no
/// fsync operation can never persist its data, and a full (non-datasync)
/// sync of an inode whose timestamps are still dirty will not flush them.
pub const fn fsync_failed(has_fsync_op: bool, datasync: bool, i_state: u64) -> bool {
	!has_fsync_op || (!datasync && i_state & I_DIRTY_TIME != 0)
}

/// One fixed-size transport cell. The kernel side submits every record
/// padded to this size so all six layouts share a single perf map; the
/// decoder never looks at the padding, only at the discriminant.
#[repr(C)]
#[derive(Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct WireRecord(pub [u8; MAX_RECORD_LEN]);

impl WireRecord {
	pub fn of<R: IntoBytes + zerocopy::Immutable>(record: &R) -> Self {
		let mut cell = [0u8; MAX_RECORD_LEN];
		let bytes = record.as_bytes();
		cell[..bytes.len()].copy_from_slice(bytes);
		Self(cell)
	}
}

/// A decoded event, the user-space view of one raw record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
	ProcessCreated { ts_us: u64, pid: u32, ppid: u32 },
	ProgramExecuted { ts_us: u64, pid: u32, ppid: u32 },
	PipeCreated { ts_us: u64, pid: u32 },
	DescriptorDuplicated { ts_us: u64, pid: u32, ppid: u32, fd: u32 },
	MessageSent { ts_us: u64, pid: u32, ppid: u32, fd: i32 },
	FileSynced { ts_us: u64, fsync_fn: u64, error: bool },
}

impl Event {
	pub const fn kind(&self) -> EventKind {
		match self {
			Self::ProcessCreated { .. } => EventKind::ProcessCreated,
			Self::ProgramExecuted { .. } => EventKind::ProgramExecuted,
			Self::PipeCreated { .. } => EventKind::PipeCreated,
			Self::DescriptorDuplicated { .. } => EventKind::DescriptorDuplicated,
			Self::MessageSent { .. } => EventKind::MessageSent,
			Self::FileSynced { .. } => EventKind::FileSynced,
		}
	}

	pub const fn ts_us(&self) -> u64 {
		match *self {
			Self::ProcessCreated { ts_us, .. }
			| Self::ProgramExecuted { ts_us, .. }
			| Self::PipeCreated { ts_us, .. }
			| Self::DescriptorDuplicated { ts_us, .. }
			| Self::MessageSent { ts_us, .. }
			| Self::FileSynced { ts_us, .. } => ts_us,
		}
	}

	/// Writes the fixed-layout encoding into `buf` and returns its length.
	/// `buf` must hold at least [`MAX_RECORD_LEN`] bytes.
	pub fn encode_into(&self, buf: &mut [u8]) -> usize {
		match *self {
			Self::ProcessCreated { ts_us, pid, ppid } => copy_record(
				&ProcessRecord {
					header: RecordHeader::new(EventKind::ProcessCreated),
					ts_us,
					pid,
					ppid,
				},
				buf,
			),
			Self::ProgramExecuted { ts_us, pid, ppid } => copy_record(
				&ProcessRecord {
					header: RecordHeader::new(EventKind::ProgramExecuted),
					ts_us,
					pid,
					ppid,
				},
				buf,
			),
			Self::PipeCreated { ts_us, pid } => copy_record(
				&PipeRecord {
					header: RecordHeader::new(EventKind::PipeCreated),
					ts_us,
					pid,
					_pad: 0,
				},
				buf,
			),
			Self::DescriptorDuplicated { ts_us, pid, ppid, fd } => copy_record(
				&DupRecord {
					header: RecordHeader::new(EventKind::DescriptorDuplicated),
					ts_us,
					pid,
					ppid,
					fd,
					_pad: 0,
				},
				buf,
			),
			Self::MessageSent { ts_us, pid, ppid, fd } => copy_record(
				&SendmsgRecord {
					header: RecordHeader::new(EventKind::MessageSent),
					ts_us,
					pid,
					ppid,
					fd,
					_pad: 0,
				},
				buf,
			),
			Self::FileSynced { ts_us, fsync_fn, error } => copy_record(
				&FsyncRecord {
					header: RecordHeader::new(EventKind::FileSynced),
					ts_us,
					fsync_fn,
					error: error as u32,
					_pad: 0,
				},
				buf,
			),
		}
	}
}

fn copy_record<R: IntoBytes + zerocopy::Immutable>(record: &R, buf: &mut [u8]) -> usize {
	let bytes = record.as_bytes();
	buf[..bytes.len()].copy_from_slice(bytes);
	bytes.len()
}

/// Why a raw record could not be decoded. Always recovered per-record,
/// never fatal to the consumer loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MalformedRecord {
	/// Fewer bytes than the variant's fixed layout requires.
	Truncated { len: usize },
	UnknownDiscriminant(u32),
}

impl core::fmt::Display for MalformedRecord {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		match self {
			Self::Truncated { len } => write!(f, "record truncated at {len} bytes"),
			Self::UnknownDiscriminant(tag) => write!(f, "unknown event discriminant {tag}"),
		}
	}
}

#[cfg(feature = "user")]
impl std::error::Error for MalformedRecord {}

/// Decodes one raw record. The layout is selected from the discriminant in
/// the header alone, never inferred from the byte count; a short buffer or an
/// unrecognized discriminant fails without partially decoding.
pub fn decode(bytes: &[u8]) -> Result<Event, MalformedRecord> {
	let truncated = MalformedRecord::Truncated { len: bytes.len() };
	let (header, _) = RecordHeader::read_from_prefix(bytes).map_err(|_| truncated)?;
	let kind = EventKind::from_tag(header.tag).ok_or(MalformedRecord::UnknownDiscriminant(header.tag))?;

	let event = match kind {
		EventKind::ProcessCreated => {
			let (r, _) = ProcessRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::ProcessCreated {
				ts_us: r.ts_us,
				pid: r.pid,
				ppid: r.ppid,
			}
		}
		EventKind::ProgramExecuted => {
			let (r, _) = ProcessRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::ProgramExecuted {
				ts_us: r.ts_us,
				pid: r.pid,
				ppid: r.ppid,
			}
		}
		EventKind::PipeCreated => {
			let (r, _) = PipeRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::PipeCreated { ts_us: r.ts_us, pid: r.pid }
		}
		EventKind::DescriptorDuplicated => {
			let (r, _) = DupRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::DescriptorDuplicated {
				ts_us: r.ts_us,
				pid: r.pid,
				ppid: r.ppid,
				fd: r.fd,
			}
		}
		EventKind::MessageSent => {
			let (r, _) = SendmsgRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::MessageSent {
				ts_us: r.ts_us,
				pid: r.pid,
				ppid: r.ppid,
				fd: r.fd,
			}
		}
		EventKind::FileSynced => {
			let (r, _) = FsyncRecord::read_from_prefix(bytes).map_err(|_| truncated)?;
			Event::FileSynced {
				ts_us: r.ts_us,
				fsync_fn: r.fsync_fn,
				error: r.error != 0,
			}
		}
	};

	Ok(event)
}

// region:    --- Tests


// endregion: --- Tests
