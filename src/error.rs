use std::fmt;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// A register read or write that the device driver could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("register access failed at offset {offset:#x}")]
pub struct AccessError {
	pub offset: u32,
}

impl AccessError {
	pub const fn new(offset: u32) -> Self {
		Self { offset }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	NotFound,
	InvalidState,
	InvalidArgument,
	Conflict,
	Timeout,
	Io,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
	#[error("{0}")]
	NotFound(String),
	#[error("{0}")]
	InvalidState(String),
	#[error("{0}")]
	InvalidArgument(String),
	#[error("{0}")]
	Conflict(String),
	#[error("{message} ({diagnostics})")]
	Timeout {
		message: String,
		diagnostics: Box<TimeoutDiagnostics>,
	},
	#[error(transparent)]
	Io(#[from] AccessError),
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::NotFound(_) => ErrorKind::NotFound,
			Self::InvalidState(_) => ErrorKind::InvalidState,
			Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
			Self::Conflict(_) => ErrorKind::Conflict,
			Self::Timeout { .. } => ErrorKind::Timeout,
			Self::Io(_) => ErrorKind::Io,
		}
	}

	pub(crate) fn not_found(msg: impl Into<String>) -> Self {
		Self::NotFound(msg.into())
	}

	pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
		Self::InvalidState(msg.into())
	}

	pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
		Self::InvalidArgument(msg.into())
	}

	pub(crate) fn conflict(msg: impl Into<String>) -> Self {
		Self::Conflict(msg.into())
	}
}

/// Register snapshot captured when a margining report times out. Every field
/// is read best-effort; `None` means the read itself failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TimeoutDiagnostics {
	pub link_control_status: Option<u32>,
	pub capability_header: Option<u32>,
	pub port_status: Option<u32>,
	pub lane0_control_status: Option<u32>,
}

impl fmt::Display for TimeoutDiagnostics {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fn field(f: &mut fmt::Formatter<'_>, name: &str, val: Option<u32>) -> fmt::Result {
			match val {
				Some(val) => write!(f, "{name}={val:#010x}"),
				None => write!(f, "{name}=unreadable"),
			}
		}
		field(f, "link", self.link_control_status)?;
		f.write_str(" ")?;
		field(f, "cap_header", self.capability_header)?;
		f.write_str(" ")?;
		field(f, "port_status", self.port_status)?;
		f.write_str(" ")?;
		field(f, "lane0", self.lane0_control_status)
	}
}
