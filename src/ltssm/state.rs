//! LTSSM state codes.

use core::fmt;

use num_enum::TryFromPrimitive;
use serde::Serialize;

/// Top-level LTSSM state, bits 8..12 of a state code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum LtssmTopState {
	Detect,
	Polling,
	Configuration,
	L0,
	Recovery,
	Loopback,
	HotReset,
	Disabled,
}

impl LtssmTopState {
	pub fn name(self) -> &'static str {
		match self {
			Self::Detect => "DETECT",
			Self::Polling => "POLLING",
			Self::Configuration => "CONFIGURATION",
			Self::L0 => "L0",
			Self::Recovery => "RECOVERY",
			Self::Loopback => "LOOPBACK",
			Self::HotReset => "HOT_RESET",
			Self::Disabled => "DISABLED",
		}
	}
}

/// 12-bit LTSSM state code as reported by the Recovery Diagnostic register:
/// top-level state in bits 8..12, sub-state in bits 0..8.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LtssmCode(u16);

impl LtssmCode {
	pub const L0: Self = Self::new(LtssmTopState::L0, 0);

	pub const fn new(top: LtssmTopState, sub: u8) -> Self {
		Self(((top as u16) << 8) | sub as u16)
	}

	/// Bits above the 12-bit code are dropped.
	pub const fn from_raw(raw: u16) -> Self {
		Self(raw & 0x0FFF)
	}

	pub const fn raw(self) -> u16 {
		self.0
	}

	pub fn top_state(self) -> Option<LtssmTopState> {
		LtssmTopState::try_from((self.0 >> 8) as u8).ok()
	}

	pub fn sub_state(self) -> u8 {
		self.0 as u8
	}

	/// In L0, whatever the sub-state.
	pub fn is_l0(self) -> bool {
		self.top_state() == Some(LtssmTopState::L0)
	}
}

impl From<LtssmTopState> for LtssmCode {
	fn from(top: LtssmTopState) -> Self {
		Self::new(top, 0)
	}
}

/// `L0`, `DETECT (sub=0x01)` or `UNKNOWN_0x9A0`.
impl fmt::Display for LtssmCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let Some(top) = self.top_state() else {
			return write!(f, "UNKNOWN_0x{:03X}", self.0);
		};
		match self.sub_state() {
			0 => f.write_str(top.name()),
			sub => write!(f, "{} (sub=0x{sub:02X})", top.name()),
		}
	}
}

/// Name of a PHY status link speed code (0 is 2.5 GT/s).
pub fn link_speed_name(code: u8) -> String {
	const NAMES: [&str; 6] = [
		"Gen1 (2.5 GT/s)",
		"Gen2 (5.0 GT/s)",
		"Gen3 (8.0 GT/s)",
		"Gen4 (16.0 GT/s)",
		"Gen5 (32.0 GT/s)",
		"Gen6 (64.0 GT/s)",
	];
	match NAMES.get(code as usize) {
		Some(name) => (*name).to_owned(),
		None => format!("Unknown ({code})"),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn names() {
		assert_eq!(LtssmCode::L0.to_string(), "L0");
		assert_eq!(LtssmCode::from_raw(0x001).to_string(), "DETECT (sub=0x01)");
		assert_eq!(LtssmCode::from_raw(0x6A5).to_string(), "HOT_RESET (sub=0xA5)");
		assert_eq!(LtssmCode::from_raw(0x9A0).to_string(), "UNKNOWN_0x9A0");
		assert_eq!(LtssmCode::from(LtssmTopState::Configuration).to_string(), "CONFIGURATION");
	}

	#[test]
	fn decoding() {
		let code = LtssmCode::from_raw(0xF402);
		assert_eq!(code.raw(), 0x402);
		assert_eq!(code.top_state(), Some(LtssmTopState::Recovery));
		assert_eq!(code.sub_state(), 2);
		assert!(LtssmCode::from_raw(0x307).is_l0());
		assert!(!LtssmCode::from_raw(0x200).is_l0());
	}

	#[test]
	fn speed_names() {
		assert_eq!(link_speed_name(0), "Gen1 (2.5 GT/s)");
		assert_eq!(link_speed_name(5), "Gen6 (64.0 GT/s)");
		assert_eq!(link_speed_name(7), "Unknown (7)");
	}
}
