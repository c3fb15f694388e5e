//! Vendor PHY registers of a switch station.
//!
//! PHY registers are shared by the 16 ports of a station and live in the
//! register block of the station's first port. A port select field in each
//! written word picks the port the access applies to.

use crate::{bit_accessors, register, ReprPrimitive};

pub const PORTS_PER_STATION: u8 = 16;
/// Highest valid global port number.
pub const MAX_PORT: u8 = 143;

const PORT_REGISTER_BASE: u32 = 0x0080_0000;
const PORT_REGISTER_STRIDE: u32 = 0x8000;

/// First port of the station owning `port_number`.
pub const fn station_base(port_number: u8) -> u8 {
	port_number / PORTS_PER_STATION * PORTS_PER_STATION
}

/// Index of `port_number` within its station.
pub const fn port_select(port_number: u8) -> u8 {
	port_number % PORTS_PER_STATION
}

/// Start of the vendor register block of `port_number`.
pub const fn register_base(port_number: u8) -> u32 {
	PORT_REGISTER_BASE + port_number as u32 * PORT_REGISTER_STRIDE
}

/// Offsets relative to the station's register block.
pub mod offsets {
	pub const PORT_CONTROL: u32 = 0x3208;
	pub const RECOVERY_DIAGNOSTIC: u32 = 0x3BC4;
	pub const PHY_ADDITIONAL_STATUS: u32 = 0x3BC8;

	pub const PTRACE_CONTROL: u32 = 0x4000;
	pub const PTRACE_STATUS: u32 = 0x4004;
	pub const PTRACE_CONFIG: u32 = 0x4008;
	pub const PTRACE_TRIGGER: u32 = 0x4010;
	pub const PTRACE_RAM_ADDRESS: u32 = 0x4020;
	pub const PTRACE_RAM_DATA: u32 = 0x4024;
}

/// Recovery Diagnostic register.
///
/// Reading it returns whatever the last write selected: the LTSSM state
/// when `ltssm_status_select` was set, the recovery entry count otherwise.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct RecoveryDiagnostic(u32);

impl RecoveryDiagnostic {
	bit_accessors! {
		data: u16, 0..0x10 { get; }
		rx_eval_count: u8, 0x10..0x16 { get; }
		port_select: u8, 0x18..0x1C { get; set with_port_select; }
		speed_select: u8, 0x1C..0x1E { get; set with_speed_select; }
		ltssm_status_select: 0x1E { get; set with_ltssm_status_select; }
		/// Write one to clear the recovery entry count.
		clear_recovery_count: 0x1F { get; set with_clear_recovery_count; }
	}
}

/// Port Control register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PortControl(u32);

impl PortControl {
	bit_accessors! {
		/// Forces the LTSSM to Detect.Quiet.
		disable_port: 0 { get; set with_disable_port; }
		port_quiet: 1 { get; set with_port_quiet; }
		port_select: u8, 0x18..0x1C { get; set with_port_select; }
		/// Control bits are ignored unless this is set in the same write.
		write_enable: 0x1F { get; set with_write_enable; }
	}
}

/// PHY Additional Status register.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PhyAdditionalStatus(u32);

impl PhyAdditionalStatus {
	bit_accessors! {
		lane_reversal: 1 { get; }
		link_down_count: u8, 3..8 { get; }
		/// 0 is 2.5 GT/s, 5 is 64 GT/s.
		link_speed: u8, 8..0x0B { get; }
		port_select: u8, 0x0C..0x10 { get; set with_port_select; }
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtraceControl(u32);

impl PtraceControl {
	bit_accessors! {
		start: 0 { get; set with_start; }
		stop: 1 { get; set with_stop; }
		clear: 2 { get; set with_clear; }
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtraceStatus(u32);

impl PtraceStatus {
	bit_accessors! {
		active: 0 { get; }
		trigger_hit: 1 { get; }
		entries_captured: u16, 0x10..0x20 { get; }
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtraceCaptureConfig(u32);

impl PtraceCaptureConfig {
	bit_accessors! {
		port_select: u8, 0..4 { get; set with_port_select; }
		trace_point: u8, 4..8 { get; set with_trace_point; }
		lane_select: u8, 8..0x0C { get; set with_lane_select; }
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PtraceTrigger(u32);

impl PtraceTrigger {
	bit_accessors! {
		ltssm_enable: 0 { get; set with_ltssm_enable; }
		/// 12-bit LTSSM code that fires the trigger.
		ltssm_state_match: u16, 4..0x10 { get; set with_ltssm_state_match; }
	}
}

register!(
	RecoveryDiagnostic(u32),
	PortControl(u32),
	PhyAdditionalStatus(u32),
	PtraceControl(u32),
	PtraceStatus(u32),
	PtraceCaptureConfig(u32),
	PtraceTrigger(u32),
);
