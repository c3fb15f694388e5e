//! PCI capability list.

pub mod pcie;

use std::{collections::HashSet, iter::FusedIterator};

use num_enum::TryFromPrimitive;
use serde::Serialize;

use crate::{RegisterAccess, Result};

/// Config offset holding the pointer to the first capability.
pub const CPB_LIST_HEAD: u16 = 0x34;

/// Standard or extended capability found while walking a list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capability {
	pub cap_id: u16,
	pub name: String,
	pub offset: u16,
	/// Capability version; always 0 for standard capabilities.
	pub version: u8,
}

/// Iterates over PCI capabilities.
///
/// The walk ends on a null pointer, a pointer to 0xFF, a sentinel header
/// (0x0 or 0xFFFF_FFFF) or an offset that was already visited.
pub struct CpbIter<'a, A: ?Sized> {
	access: &'a A,
	current_offset: Option<u8>,
	visited: HashSet<u8>,
	looped_at: Option<u16>,
	started: bool,
}

impl<'a, A: RegisterAccess + ?Sized> CpbIter<'a, A> {
	pub fn new(access: &'a A) -> Self {
		Self {
			access,
			current_offset: None,
			visited: HashSet::new(),
			looped_at: None,
			started: false,
		}
	}

	fn next_cpb(&mut self) -> Result<Option<Capability>> {
		if !self.started {
			self.started = true;
			let head = self.access.read_config_dword(CPB_LIST_HEAD)? as u8;
			if head != 0xFF {
				self.current_offset = Some(head & 0xFC);
			}
		}
		let Some(offset) = self.current_offset.take() else {
			return Ok(None);
		};
		if offset == 0 {
			return Ok(None);
		}
		if !self.visited.insert(offset) {
			self.looped_at = Some(offset as u16);
			return Ok(None);
		}
		let header = self.access.read_config_dword(offset as u16)?;
		if header == 0 || header == 0xFFFF_FFFF {
			return Ok(None);
		}
		let id = header as u8;
		let next = (header >> 8) as u8;
		if next != 0xFF {
			self.current_offset = Some(next & 0xFC);
		}
		Ok(Some(Capability {
			cap_id: id as u16,
			name: cpb_name(id),
			offset: offset as u16,
			version: 0,
		}))
	}

	/// Offset the walk came back to, if it ended on a loop.
	pub fn looped_at(&self) -> Option<u16> {
		self.looped_at
	}
}

impl<A: RegisterAccess + ?Sized> Iterator for CpbIter<'_, A> {
	type Item = Result<Capability>;

	fn next(&mut self) -> Option<Self::Item> {
		match self.next_cpb() {
			Ok(cpb) => cpb.map(Ok),
			Err(err) => {
				self.current_offset = None;
				Some(Err(err))
			}
		}
	}
}

impl<A: RegisterAccess + ?Sized> FusedIterator for CpbIter<'_, A> {}

/// Known standard capability IDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum CpbId {
	PowerManagement = 0x01,
	Agp,
	Vpd,
	SlotId,
	Msi,
	CompactPciHotSwap,
	PciX,
	HyperTransport,
	VendorSpecific,
	DebugPort,
	CompactPciCrc,
	PciHotPlug,
	BridgeSubsysId,
	Agp8x,
	SecureDevice,
	PciExpress,
	MsiX,
	SataConfig,
	AdvancedFeatures,
	EnhancedAlloc,
	FlatteningPortalBridge,
}

impl CpbId {
	pub fn name(self) -> &'static str {
		match self {
			Self::PowerManagement => "Power Management",
			Self::Agp => "AGP",
			Self::Vpd => "VPD",
			Self::SlotId => "Slot Identification",
			Self::Msi => "MSI",
			Self::CompactPciHotSwap => "CompactPCI Hot Swap",
			Self::PciX => "PCI-X",
			Self::HyperTransport => "HyperTransport",
			Self::VendorSpecific => "Vendor Specific",
			Self::DebugPort => "Debug Port",
			Self::CompactPciCrc => "CompactPCI Central Resource Control",
			Self::PciHotPlug => "PCI Hot-Plug",
			Self::BridgeSubsysId => "Bridge Subsystem Vendor ID",
			Self::Agp8x => "AGP 8x",
			Self::SecureDevice => "Secure Device",
			Self::PciExpress => "PCI Express",
			Self::MsiX => "MSI-X",
			Self::SataConfig => "SATA Configuration",
			Self::AdvancedFeatures => "Advanced Features",
			Self::EnhancedAlloc => "Enhanced Allocation",
			Self::FlatteningPortalBridge => "Flattening Portal Bridge",
		}
	}
}

pub fn cpb_name(id: u8) -> String {
	match CpbId::try_from(id) {
		Ok(id) => id.name().to_owned(),
		Err(_) => format!("Unknown(0x{id:02X})"),
	}
}
