//! PCI Express capability structure (residing in conventional PCI configuration
//! space).

use std::fmt;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use serde::Serialize;

use crate::{bit_accessors, register, ReprPrimitive};

pub const ID: u8 = 0x10;

/// DWORD offsets relative to the start of the capability structure.
pub mod offsets {
	pub const DEVICE_CPBS: u16 = 0x04;
	/// Device Control in bits 0..16, Device Status in bits 16..32.
	pub const DEVICE_CONTROL: u16 = 0x08;
	pub const LINK_CPBS: u16 = 0x0C;
	/// Link Control in bits 0..16, Link Status in bits 16..32.
	pub const LINK_CONTROL: u16 = 0x10;
	pub const LINK_CPBS2: u16 = 0x2C;
	/// Link Control 2 in bits 0..16, Link Status 2 in bits 16..32.
	pub const LINK_CONTROL2: u16 = 0x30;
}

/// Device capabilities value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct DeviceCpbs(u32);

impl DeviceCpbs {
	bit_accessors! {
		max_payload_size_code: u8, 0..3 { get; }
		phantom_func_bits: u8, 3..5 { get; }
		tag_field_8bit: 5 { get; }
		role_based_error_reporting: 0x0F { get; }
		func_level_resetting: 0x1C { get; }
	}

	pub fn max_payload_size(self) -> Option<MaxSize> {
		MaxSize::try_from(self.max_payload_size_code()).ok()
	}
}

/// Device control value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct DeviceControl(u16);

impl DeviceControl {
	bit_accessors! {
		correctable_error_reporting: 0 { get; set with_correctable_error_reporting; }
		nonfatal_error_reporting: 1 { get; set with_nonfatal_error_reporting; }
		fatal_error_reporting: 2 { get; set with_fatal_error_reporting; }
		unsupported_request_reporting: 3 { get; set with_unsupported_request_reporting; }
		relaxed_ordering: 4 { get; set with_relaxed_ordering; }
		max_payload_size_code: u8, 5..8 { get; set with_max_payload_size_code; }
		extended_tag_field: 8 { get; set with_extended_tag_field; }
		no_snoop: 0x0B { get; set with_no_snoop; }
		max_read_request_size_code: u8, 0x0C..0x0F { get; set with_max_read_request_size_code; }
	}

	pub fn max_payload_size(self) -> Option<MaxSize> {
		MaxSize::try_from(self.max_payload_size_code()).ok()
	}

	pub fn max_read_request_size(self) -> Option<MaxSize> {
		MaxSize::try_from(self.max_read_request_size_code()).ok()
	}

	#[must_use]
	pub fn with_max_payload_size(self, size: MaxSize) -> Self {
		self.with_max_payload_size_code(size as u8)
	}

	#[must_use]
	pub fn with_max_read_request_size(self, size: MaxSize) -> Self {
		self.with_max_read_request_size_code(size as u8)
	}
}

/// Value of [`DeviceCpbs::max_payload_size`],
/// [`DeviceControl::max_payload_size`] and
/// [`DeviceControl::max_read_request_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum MaxSize {
	S128B,
	S256B,
	S512B,
	S1Kib,
	S2Kib,
	S4Kib,
}

impl MaxSize {
	pub fn from_size(val: u16) -> Option<Self> {
		if val.count_ones() != 1 {
			return None;
		}
		let exponent = val.ilog2() as u8;
		Self::try_from(u8::checked_sub(exponent, 7)?).ok()
	}

	pub fn size(self) -> u16 {
		0x80 << (self as u8)
	}
}

/// Link capabilities value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkCpbs(u32);

impl LinkCpbs {
	bit_accessors! {
		max_link_speed_code: u8, 0..4 { get; }
		max_link_width: u8, 4..0x0A { get; }
		aspm_support: Aspm, 0x0A..0x0C { get => |val| Aspm::from_bits(val as u8); }
		clock_pm: 0x12 { get; }
		surprise_down_error_reporting: 0x13 { get; }
		dll_link_active_reporting: 0x14 { get; }
		link_bandwidth_notification: 0x15 { get; }
		aspm_optionality: 0x16 { get; }
		/// Hardware port number of the switch port.
		port_num: u8, 0x18..0x20 { get; }
	}

	pub fn max_link_speed(self) -> Option<LinkSpeed> {
		LinkSpeed::from_code(self.max_link_speed_code())
	}
}

/// Link control value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkControl(u16);

impl LinkControl {
	bit_accessors! {
		aspm_control: Aspm, 0..2 { get => |val| Aspm::from_bits(val as u8); }
		rcb_128bytes: 3 { get; }
		link_disabled: 4 { get; set disable_link; }
		common_clock_config: 6 { get; }
		extended_synching: 7 { get; }
		clock_pm: 8 { get; }
		hw_autonomous_width_disabled: 9 { get; }
	}

	#[inline]
	#[must_use]
	pub fn retrain_link(self) -> Self {
		Self(self.0 | 0x20)
	}
}

/// Link status value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkStatus(u16);

impl LinkStatus {
	bit_accessors! {
		current_link_speed_code: u8, 0..4 { get; }
		negotiated_link_width: u8, 4..0x0A { get; }
		link_training: 0x0B { get; }
		slot_clock_config: 0x0C { get; }
		dll_link_active: 0x0D { get; }
		link_bandwidth_management_status: 0x0E { get; }
		link_autonomous_bandwidth_status: 0x0F { get; }
	}

	pub fn current_link_speed(self) -> Option<LinkSpeed> {
		LinkSpeed::from_code(self.current_link_speed_code())
	}
}

/// Link capabilities 2 value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkCpbs2(u32);

impl LinkCpbs2 {
	bit_accessors! {
		supported_link_speeds: SupportedSpeeds, 1..8 {
			get => |val| SupportedSpeeds::from_bits_truncate(val as u8);
		}
		crosslink: 8 { get; }
		retimer_detection: 0x17 { get; }
		two_retimers_detection: 0x18 { get; }
	}
}

/// Link control 2 value of a PCI Express capability structure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct LinkControl2(u16);

impl LinkControl2 {
	bit_accessors! {
		target_link_speed_code: u8, 0..4 { get; set with_target_link_speed_code; }
		compliance_mode: 4 { get; }
		hw_autonomous_speed_disabled: 5 { get; }
	}

	pub fn target_link_speed(self) -> Option<LinkSpeed> {
		LinkSpeed::from_code(self.target_link_speed_code())
	}
}

register!(
	DeviceCpbs(u32),
	DeviceControl(u16),
	LinkCpbs(u32),
	LinkControl(u16),
	LinkStatus(u16),
	LinkCpbs2(u32),
	LinkControl2(u16),
);

/// Link speed as encoded in the Link Capabilities, Link Status and Link
/// Control 2 speed fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, TryFromPrimitive, Serialize)]
#[repr(u8)]
pub enum LinkSpeed {
	Gen1 = 1,
	Gen2,
	Gen3,
	Gen4,
	Gen5,
	Gen6,
}

impl LinkSpeed {
	pub const ALL: [Self; 6] = [
		Self::Gen1,
		Self::Gen2,
		Self::Gen3,
		Self::Gen4,
		Self::Gen5,
		Self::Gen6,
	];

	pub fn from_code(code: u8) -> Option<Self> {
		Self::try_from(code).ok()
	}

	pub fn code(self) -> u8 {
		self as u8
	}

	pub fn generation(self) -> u8 {
		self as u8
	}

	pub fn gt_per_s(self) -> f64 {
		match self {
			Self::Gen1 => 2.5,
			Self::Gen2 => 5.0,
			Self::Gen3 => 8.0,
			Self::Gen4 => 16.0,
			Self::Gen5 => 32.0,
			Self::Gen6 => 64.0,
		}
	}

	/// PAM4 signaling, with three stacked eyes per lane.
	pub fn is_pam4(self) -> bool {
		self == Self::Gen6
	}
}

impl fmt::Display for LinkSpeed {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Gen{} ({:.1} GT/s)", self.generation(), self.gt_per_s())
	}
}

bitflags! {
	/// Supported Link Speeds vector of Link Capabilities 2, shifted down so
	/// that bit 0 is 2.5 GT/s.
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
	pub struct SupportedSpeeds: u8 {
		const GEN1 = 1;
		const GEN2 = 1 << 1;
		const GEN3 = 1 << 2;
		const GEN4 = 1 << 3;
		const GEN5 = 1 << 4;
		const GEN6 = 1 << 5;
	}
}

impl SupportedSpeeds {
	/// Supported speeds in ascending order.
	pub fn speeds(self) -> Vec<LinkSpeed> {
		LinkSpeed::ALL
			.into_iter()
			.filter(|speed| self.bits() & (1 << (speed.code() - 1)) != 0)
			.collect()
	}

	pub fn max_speed(self) -> Option<LinkSpeed> {
		self.speeds().last().copied()
	}
}

/// ASPM support or control field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Aspm {
	Disabled,
	L0s,
	L1,
	L0sAndL1,
}

impl Aspm {
	fn from_bits(val: u8) -> Self {
		match val & 3 {
			0 => Self::Disabled,
			1 => Self::L0s,
			2 => Self::L1,
			_ => Self::L0sAndL1,
		}
	}
}

/// Decoded link state, combining Link Control/Status and Link Control 2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LinkState {
	pub current_speed: Option<LinkSpeed>,
	pub current_width: u8,
	pub target_speed: Option<LinkSpeed>,
	pub aspm_control: Aspm,
	pub link_training: bool,
	pub dll_link_active: bool,
}

impl LinkState {
	pub fn decode(control_status: u32, control2: u32) -> Self {
		let control = LinkControl(control_status as u16);
		let status = LinkStatus((control_status >> 16) as u16);
		let control2 = LinkControl2(control2 as u16);
		Self {
			current_speed: status.current_link_speed(),
			current_width: status.negotiated_link_width(),
			target_speed: control2.target_link_speed(),
			aspm_control: control.aspm_control(),
			link_training: status.link_training(),
			dll_link_active: status.dll_link_active(),
		}
	}

	/// Raw current speed code, 0 when the field holds no known speed.
	pub fn speed_code(&self) -> u8 {
		self.current_speed.map_or(0, LinkSpeed::code)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn link_state_decodes_status_half() {
		// Gen4 x16, DLL active, ASPM L1, target Gen5
		let state = LinkState::decode(0x2104_0002, 0x0000_0005);
		assert_eq!(state.current_speed, Some(LinkSpeed::Gen4));
		assert_eq!(state.current_width, 16);
		assert!(state.dll_link_active);
		assert!(!state.link_training);
		assert_eq!(state.aspm_control, Aspm::L1);
		assert_eq!(state.target_speed, Some(LinkSpeed::Gen5));
		assert_eq!(state.speed_code(), 4);
	}

	#[test]
	fn unknown_speed_codes_decode_as_none() {
		let state = LinkState::decode(0x0007_0000, 0x0000_0000);
		assert_eq!(state.current_speed, None);
		assert_eq!(state.target_speed, None);
		assert_eq!(state.speed_code(), 0);
	}

	#[test]
	fn link_cpbs_fields() {
		let cpbs = LinkCpbs::from_raw(0x2418_0C84);
		assert_eq!(cpbs.max_link_speed(), Some(LinkSpeed::Gen4));
		assert_eq!(cpbs.max_link_width(), 8);
		assert_eq!(cpbs.aspm_support(), Aspm::L0sAndL1);
		assert!(cpbs.surprise_down_error_reporting());
		assert!(cpbs.dll_link_active_reporting());
		assert_eq!(cpbs.port_num(), 0x24);
	}

	#[test]
	fn supported_speeds_from_vector() {
		// bits 1..=5: 2.5 through 32 GT/s
		let speeds = LinkCpbs2::from_raw(0x0000_003E).supported_link_speeds();
		assert_eq!(
			speeds.speeds(),
			vec![
				LinkSpeed::Gen1,
				LinkSpeed::Gen2,
				LinkSpeed::Gen3,
				LinkSpeed::Gen4,
				LinkSpeed::Gen5
			]
		);
		assert_eq!(speeds.max_speed(), Some(LinkSpeed::Gen5));
	}

	#[test]
	fn device_control_size_fields_round_trip_through_setters() {
		let control = DeviceControl::from_raw(0x2810)
			.with_max_payload_size(MaxSize::S512B)
			.with_max_read_request_size(MaxSize::S4Kib);
		assert_eq!(control.max_payload_size(), Some(MaxSize::S512B));
		assert_eq!(control.max_read_request_size(), Some(MaxSize::S4Kib));
		assert!(control.relaxed_ordering());
		assert!(control.no_snoop());
		assert_eq!(MaxSize::from_size(1024), Some(MaxSize::S1Kib));
		assert_eq!(MaxSize::from_size(8192), None);
		assert_eq!(MaxSize::from_size(100), None);
	}

	#[test]
	fn speed_names() {
		assert_eq!(LinkSpeed::Gen1.to_string(), "Gen1 (2.5 GT/s)");
		assert_eq!(LinkSpeed::Gen6.to_string(), "Gen6 (64.0 GT/s)");
	}
}
