use derive_more::{Display, From};
use tokio::task::JoinError;

use crate::dispatch::FatalTransportError;
use crate::registry::AttachError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Display, From)]
#[display("{self:?}")]
pub enum Error {
	#[from(String, &String, &str)]
	Custom(String),
	#[display("dispatcher did not reach Stopped within the shutdown deadline")]
	ShutdownTimeout,

	#[from]
	Attach(AttachError),
	#[from]
	FatalTransport(FatalTransportError),

	// -- Externals
	#[from]
	Join(JoinError),
	#[from]
	AyaEbpf(aya::EbpfError),
	#[from]
	AyaMaps(aya::maps::MapError),
	#[from]
	AyaPerfBuffer(aya::maps::perf::PerfBufferError),
	#[from]
	AyaProgram(aya::programs::ProgramError),
	#[from]
	Io(std::io::Error),
}

// region:    --- Custom

impl Error {
	pub fn custom_from_err(err: impl std::error::Error) -> Self {
		Self::Custom(err.to_string())
	}

	pub fn custom(val: impl Into<String>) -> Self {
		Self::Custom(val.into())
	}
}

// endregion: --- Custom

// region:    --- Error Boilerplate

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate
