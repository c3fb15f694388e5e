//! Lane margining control and status words.
//!
//! Each lane has one DWORD: the control word in bits 0..16 and the status
//! word, which mirrors the control layout, in bits 16..32.

use num_enum::TryFromPrimitive;
use serde::Serialize;

use crate::{bit_accessors, register, ReprPrimitive};

/// Margin Type field of the lane control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum MarginCommand {
	NoCommand = 0,
	AccessReceiverMarginControl = 1,
	MarginTiming = 3,
	MarginVoltage = 4,
	VendorDefined1 = 5,
	VendorDefined2 = 6,
	GoToNormalSettings = 7,
}

/// Receiver Number field of the lane control word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum MarginingReceiver {
	/// Default receiver at NRZ rates. Reserved at 64 GT/s.
	#[default]
	Broadcast = 0,
	/// Upper PAM4 eye.
	ReceiverA = 1,
	/// Middle PAM4 eye.
	ReceiverB = 2,
	/// Lower PAM4 eye.
	ReceiverC = 3,
	/// All PAM4 receivers. Only valid at 64 GT/s.
	Pam4Broadcast = 7,
}

impl MarginingReceiver {
	pub const PAM4_EYES: [Self; 3] = [Self::ReceiverA, Self::ReceiverB, Self::ReceiverC];
}

/// Payloads of [`MarginCommand::AccessReceiverMarginControl`] that report a
/// receiver capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum ReportPayload {
	Capabilities = 0x88,
	NumVoltageSteps = 0x89,
	NumTimingSteps = 0x8A,
	MaxTimingOffset = 0x8B,
	MaxVoltageOffset = 0x8C,
	SamplingRateVoltage = 0x8D,
	SamplingRateTiming = 0x8E,
	SampleCount = 0x8F,
	MaxLanes = 0x90,
}

/// `status_code` of a margin response.
pub mod status_code {
	pub const ERROR: u8 = 0;
	/// Receiver is still moving to the requested offset.
	pub const SETUP: u8 = 1;
	pub const PASSED: u8 = 2;
	/// Receiver response for commands that take no margin measurement.
	pub const NAK: u8 = 3;
}

/// Lane control word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct LaneControl(u16);

impl LaneControl {
	bit_accessors! {
		receiver_code: u8, 0..3 { get; set with_receiver_code; }
		command_code: u8, 3..6 { get; set with_command_code; }
		usage_model: 6 { get; set with_usage_model; }
		payload: u8, 8..0x10 { get; set with_payload; }
	}

	pub fn new(receiver: MarginingReceiver, command: MarginCommand, payload: u8) -> Self {
		Self::default()
			.with_receiver_code(receiver as u8)
			.with_command_code(command as u8)
			.with_payload(payload)
	}

	pub fn receiver(self) -> Option<MarginingReceiver> {
		MarginingReceiver::try_from(self.receiver_code()).ok()
	}

	pub fn command(self) -> Option<MarginCommand> {
		MarginCommand::try_from(self.command_code()).ok()
	}
}

/// Lane status word, as found in the upper half of the lane DWORD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct LaneStatus(u16);

impl LaneStatus {
	bit_accessors! {
		receiver_code: u8, 0..3 { get; }
		command_code: u8, 3..6 { get; }
		usage_model: 6 { get; }
		payload: u8, 8..0x10 { get; }
		/// Top two payload bits of a margin response.
		status_code: u8, 0x0E..0x10 { get; }
		/// Bottom six payload bits of a margin response.
		margin_value: u8, 8..0x0E { get; }
	}

	pub fn from_lane_dword(dword: u32) -> Self {
		Self((dword >> 16) as u16)
	}

	pub fn receiver(self) -> Option<MarginingReceiver> {
		MarginingReceiver::try_from(self.receiver_code()).ok()
	}

	pub fn command(self) -> Option<MarginCommand> {
		MarginCommand::try_from(self.command_code()).ok()
	}
}

register!(LaneControl(u16), LaneStatus(u16));

/// Payload of a timing or voltage margin command: step magnitude in bits
/// 0..6, direction in bit 6 (set for left/down).
pub fn margin_payload(step: u8, negative: bool) -> u8 {
	(step & 0x3F) | ((negative as u8) << 6)
}
