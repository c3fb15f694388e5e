//! PCI Express extended capability structures.

use std::{collections::HashSet, iter::FusedIterator};

use num_enum::TryFromPrimitive;

use crate::{config::cpb::Capability, RegisterAccess, Result};

/// Config offset of the first extended capability header.
pub const EXT_CPB_LIST_HEAD: u16 = 0x100;

/// Iterates over PCI Express extended capabilities. Skips null capabilities.
///
/// The walk ends on a zero next offset, an offset below 0x100, a sentinel
/// header (0x0 or 0xFFFF_FFFF) or an offset that was already visited.
pub struct ExtCpbIter<'a, A: ?Sized> {
	access: &'a A,
	current_offset: u16,
	visited: HashSet<u16>,
	looped_at: Option<u16>,
}

impl<'a, A: RegisterAccess + ?Sized> ExtCpbIter<'a, A> {
	pub fn new(access: &'a A) -> Self {
		Self {
			access,
			current_offset: EXT_CPB_LIST_HEAD,
			visited: HashSet::new(),
			looped_at: None,
		}
	}

	fn next_ext_cpb(&mut self) -> Result<Option<Capability>> {
		loop {
			let offset = self.current_offset;
			if offset < EXT_CPB_LIST_HEAD {
				return Ok(None);
			}
			if !self.visited.insert(offset) {
				self.looped_at = Some(offset);
				return Ok(None);
			}
			let header = self.access.read_config_dword(offset)?;
			if header == 0 || header == 0xFFFF_FFFF {
				self.current_offset = 0;
				return Ok(None);
			}
			self.current_offset = (header >> 0x14) as u16 & 0x0FFC;
			let id = header as u16;
			if id != 0 {
				return Ok(Some(Capability {
					cap_id: id,
					name: ext_cpb_name(id),
					offset,
					version: (header >> 0x10) as u8 & 0x0F,
				}));
			}
		}
	}

	/// Offset the walk came back to, if it ended on a loop.
	pub fn looped_at(&self) -> Option<u16> {
		self.looped_at
	}
}

impl<A: RegisterAccess + ?Sized> Iterator for ExtCpbIter<'_, A> {
	type Item = Result<Capability>;

	fn next(&mut self) -> Option<Self::Item> {
		match self.next_ext_cpb() {
			Ok(cpb) => cpb.map(Ok),
			Err(err) => {
				self.current_offset = 0;
				Some(Err(err))
			}
		}
	}
}

impl<A: RegisterAccess + ?Sized> FusedIterator for ExtCpbIter<'_, A> {}

/// Known extended capability IDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u16)]
#[non_exhaustive]
pub enum ExtCpbId {
	Aer = 0x0001,
	VirtualChannel,
	SerialNumber,
	PowerBudgeting,
	RootComplexLinkDeclaration,
	RootComplexInternalLinkControl,
	RootComplexEventCollector,
	Mfvc,
	VirtualChannel9,
	Rcrb,
	VendorSpecific,
	ConfigAccessCorrelation,
	Acs,
	Ari,
	Ats,
	SrIov,
	MrIov,
	Multicast,
	PageRequest,
	AmdReserved,
	ResizableBar,
	DynamicPowerAllocation,
	Tph,
	LatencyTolerance,
	SecondaryPcie,
	Pmux,
	Pasid,
	Lnr,
	Dpc,
	L1PmSubstates,
	PrecisionTimeMeasurement,
	MPcie,
	FrsQueueing,
	ReadinessTimeReporting,
	DesignatedVendorSpecific,
	VfResizableBar,
	DataLinkFeature,
	Phy16GT,
	LaneMargining,
	HierarchyId,
	NativePcieEnclosure,
	Phy32GT,
	AlternateProtocol,
	SystemFirmwareIntermediary,
	ShadowFunctions,
	DataObjectExchange,
	Device3,
	IdeKeyManagement,
	Phy64GT,
	FlitLogging,
	FlitPerformanceMeasurement,
	FlitErrorInjection,
}

impl ExtCpbId {
	pub fn name(self) -> &'static str {
		match self {
			Self::Aer => "Advanced Error Reporting",
			Self::VirtualChannel | Self::VirtualChannel9 => "Virtual Channel",
			Self::SerialNumber => "Device Serial Number",
			Self::PowerBudgeting => "Power Budgeting",
			Self::RootComplexLinkDeclaration => "Root Complex Link Declaration",
			Self::RootComplexInternalLinkControl => "Root Complex Internal Link Control",
			Self::RootComplexEventCollector => "Root Complex Event Collector Endpoint Association",
			Self::Mfvc => "Multi-Function Virtual Channel",
			Self::Rcrb => "RCRB Header",
			Self::VendorSpecific => "Vendor-Specific Extended",
			Self::ConfigAccessCorrelation => "Configuration Access Correlation",
			Self::Acs => "Access Control Services",
			Self::Ari => "Alternative Routing-ID Interpretation",
			Self::Ats => "Address Translation Services",
			Self::SrIov => "SR-IOV",
			Self::MrIov => "MR-IOV",
			Self::Multicast => "Multicast",
			Self::PageRequest => "Page Request Interface",
			Self::AmdReserved => "Reserved for AMD",
			Self::ResizableBar => "Resizable BAR",
			Self::DynamicPowerAllocation => "Dynamic Power Allocation",
			Self::Tph => "TPH Requester",
			Self::LatencyTolerance => "Latency Tolerance Reporting",
			Self::SecondaryPcie => "Secondary PCI Express",
			Self::Pmux => "Protocol Multiplexing",
			Self::Pasid => "Process Address Space ID",
			Self::Lnr => "LN Requester",
			Self::Dpc => "Downstream Port Containment",
			Self::L1PmSubstates => "L1 PM Substates",
			Self::PrecisionTimeMeasurement => "Precision Time Measurement",
			Self::MPcie => "M-PCIe",
			Self::FrsQueueing => "FRS Queueing",
			Self::ReadinessTimeReporting => "Readiness Time Reporting",
			Self::DesignatedVendorSpecific => "Designated Vendor-Specific",
			Self::VfResizableBar => "VF Resizable BAR",
			Self::DataLinkFeature => "Data Link Feature",
			Self::Phy16GT => "Physical Layer 16.0 GT/s",
			Self::LaneMargining => "Lane Margining at the Receiver",
			Self::HierarchyId => "Hierarchy ID",
			Self::NativePcieEnclosure => "Native PCIe Enclosure Management",
			Self::Phy32GT => "Physical Layer 32.0 GT/s",
			Self::AlternateProtocol => "Alternate Protocol",
			Self::SystemFirmwareIntermediary => "System Firmware Intermediary",
			Self::ShadowFunctions => "Shadow Functions",
			Self::DataObjectExchange => "Data Object Exchange",
			Self::Device3 => "Device 3",
			Self::IdeKeyManagement => "Integrity and Data Encryption",
			Self::Phy64GT => "Physical Layer 64.0 GT/s",
			Self::FlitLogging => "Flit Logging",
			Self::FlitPerformanceMeasurement => "Flit Performance Measurement",
			Self::FlitErrorInjection => "Flit Error Injection",
		}
	}
}

pub fn ext_cpb_name(id: u16) -> String {
	match ExtCpbId::try_from(id) {
		Ok(id) => id.name().to_owned(),
		Err(_) => format!("ExtUnknown(0x{id:04X})"),
	}
}

/// Advanced error reporting capability structure.
pub mod aer {
	use bitflags::bitflags;
	use serde::Serialize;

	pub const ID: u16 = 0x0001;

	pub const UNCORRECTABLE_STATUS: u16 = 0x04;
	pub const CORRECTABLE_STATUS: u16 = 0x10;
	pub const CPBS_CONTROL: u16 = 0x18;
	pub const HEADER_LOG: u16 = 0x1C;

	bitflags! {
		/// Uncorrectable error status bits.
		#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
		pub struct UncorrectableErrors: u32 {
			const DATA_LINK_PROTOCOL = 1 << 4;
			const SURPRISE_DOWN = 1 << 5;
			const POISONED_TLP = 1 << 12;
			const FLOW_CONTROL_PROTOCOL = 1 << 13;
			const COMPLETION_TIMEOUT = 1 << 14;
			const COMPLETER_ABORT = 1 << 15;
			const UNEXPECTED_COMPLETION = 1 << 16;
			const RECEIVER_OVERFLOW = 1 << 17;
			const MALFORMED_TLP = 1 << 18;
			const ECRC = 1 << 19;
			const UNSUPPORTED_REQUEST = 1 << 20;
			const ACS_VIOLATION = 1 << 21;
		}
	}

	bitflags! {
		/// Correctable error status bits.
		#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
		pub struct CorrectableErrors: u32 {
			const RECEIVER = 1;
			const BAD_TLP = 1 << 6;
			const BAD_DLLP = 1 << 7;
			const REPLAY_NUM_ROLLOVER = 1 << 8;
			const REPLAY_TIMER_TIMEOUT = 1 << 12;
			const ADVISORY_NON_FATAL = 1 << 13;
		}
	}

	/// Snapshot of the AER status registers.
	#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
	pub struct AerStatus {
		pub offset: u16,
		pub uncorrectable_raw: u32,
		pub correctable_raw: u32,
		pub first_error_pointer: u8,
		pub header_log: [u32; 4],
	}

	impl AerStatus {
		pub fn uncorrectable(&self) -> UncorrectableErrors {
			UncorrectableErrors::from_bits_retain(self.uncorrectable_raw)
		}

		pub fn correctable(&self) -> CorrectableErrors {
			CorrectableErrors::from_bits_retain(self.correctable_raw)
		}

		/// Names of the known status bits that are set.
		pub fn uncorrectable_names(&self) -> Vec<&'static str> {
			self.uncorrectable()
				.iter_names()
				.map(|(name, _)| name)
				.collect()
		}

		pub fn correctable_names(&self) -> Vec<&'static str> {
			self.correctable()
				.iter_names()
				.map(|(name, _)| name)
				.collect()
		}
	}
}

/// Physical layer 16.0 GT/s capability structure.
pub mod phy16 {
	use crate::{bit_accessors, register, ReprPrimitive};

	pub const ID: u16 = 0x0026;

	pub const STATUS: u16 = 0x0C;

	/// 16.0 GT/s status register.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	#[repr(transparent)]
	pub struct EqStatus16Gt(u32);

	impl EqStatus16Gt {
		bit_accessors! {
			complete: 0 { get; }
			phase1_success: 1 { get; }
			phase2_success: 2 { get; }
			phase3_success: 3 { get; }
			link_eq_request: 4 { get; }
		}

		pub fn all_phases_success(self) -> bool {
			self.phase1_success() && self.phase2_success() && self.phase3_success()
		}
	}

	register!(EqStatus16Gt(u32));
}

/// Physical layer 32.0 GT/s capability structure.
pub mod phy32 {
	use crate::{bit_accessors, register, ReprPrimitive};

	pub const ID: u16 = 0x002A;

	pub const CPBS: u16 = 0x04;
	pub const STATUS: u16 = 0x0C;

	/// 32.0 GT/s capabilities register.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	#[repr(transparent)]
	pub struct Phy32Cpbs(u32);

	impl Phy32Cpbs {
		bit_accessors! {
			eq_bypass_to_highest_rate: 0 { get; }
			no_eq_needed: 1 { get; }
		}
	}

	/// 32.0 GT/s status register.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	#[repr(transparent)]
	pub struct Phy32Status(u32);

	impl Phy32Status {
		bit_accessors! {
			complete: 0 { get; }
			phase1_success: 1 { get; }
			phase2_success: 2 { get; }
			phase3_success: 3 { get; }
			link_eq_request: 4 { get; }
			modified_ts_received: 5 { get; }
			rx_lane_margin_capable: 6 { get; }
			rx_lane_margin_status: 7 { get; }
		}
	}

	register!(Phy32Cpbs(u32), Phy32Status(u32));

	/// Decoded 32.0 GT/s equalization state.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct EqStatus32Gt {
		pub cpbs: Phy32Cpbs,
		pub status: Phy32Status,
	}

	impl EqStatus32Gt {
		pub fn all_phases_success(&self) -> bool {
			self.status.phase1_success() && self.status.phase2_success() && self.status.phase3_success()
		}
	}
}

/// Physical layer 64.0 GT/s capability structure.
pub mod phy64 {
	pub const ID: u16 = 0x0031;
}

/// Lane margining at the receiver extended capability structure.
pub mod margining {
	use crate::{bit_accessors, register, ReprPrimitive};

	pub const ID: u16 = 0x0027;

	/// Port capabilities in bits 0..16, port status in bits 16..32.
	pub const PORT_CPBS_STATUS: u16 = 0x04;
	pub const LANE_CONTROL_STATUS: u16 = 0x08;
	pub const MAX_LANES: u8 = 32;

	/// Offset of the control/status DWORD of `lane`, relative to the
	/// capability.
	pub const fn lane_offset(lane: u8) -> u16 {
		LANE_CONTROL_STATUS + lane as u16 * 4
	}

	/// Margining port capabilities and status DWORD.
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	#[repr(transparent)]
	pub struct PortCpbsStatus(u32);

	impl PortCpbsStatus {
		bit_accessors! {
			uses_driver_software: 0 { get; }
			margining_ready: 0x10 { get; }
			margining_software_ready: 0x11 { get; }
		}
	}

	register!(PortCpbsStatus(u32));
}
