//! PCI configuration space.

pub mod cpb;

use serde::Serialize;

use crate::{
	ext_cpb::{
		aer::{self, AerStatus},
		phy16::{self, EqStatus16Gt},
		phy32::{self, EqStatus32Gt, Phy32Cpbs, Phy32Status},
		ExtCpbIter,
	},
	Error, RegisterAccess, Result,
};
use cpb::{
	pcie::{
		self, offsets, DeviceControl, DeviceCpbs, LinkControl, LinkControl2, LinkCpbs, LinkCpbs2,
		LinkState, MaxSize, SupportedSpeeds,
	},
	Capability, CpbIter,
};

/// Size of PCI Express configuration space in bytes.
pub const CONFIG_SPACE_SIZE: u16 = 0x1000;

/// One DWORD of a configuration space dump.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConfigRegister {
	pub offset: u16,
	pub value: u32,
}

/// Configuration space of one device, read through its register access
/// channel.
///
/// Capability offsets are looked up again on every call; nothing is cached,
/// since a retrain or reset may change what the device exposes.
#[derive(Debug)]
pub struct ConfigSpace<A> {
	access: A,
}

impl<A: RegisterAccess> ConfigSpace<A> {
	pub fn new(access: A) -> Self {
		Self { access }
	}

	pub fn access(&self) -> &A {
		&self.access
	}

	pub fn into_inner(self) -> A {
		self.access
	}

	pub fn read_register(&self, offset: u16) -> Result<u32> {
		Ok(self.access.read_config_dword(offset)?)
	}

	pub fn write_register(&self, offset: u16, val: u32) -> Result<()> {
		Ok(self.access.write_config_dword(offset, val)?)
	}

	/// Reads `count` DWORDs starting at `offset` (rounded down to a DWORD
	/// boundary). Unreadable DWORDs show up as 0xFFFF_FFFF.
	pub fn dump(&self, offset: u16, count: u16) -> Vec<ConfigRegister> {
		(offset & !3..CONFIG_SPACE_SIZE)
			.step_by(4)
			.take(count as usize)
			.map(|offset| {
				let value = self.access.read_config_dword(offset).unwrap_or_else(|err| {
					tracing::warn!(offset, "config dump read failed: {err}");
					0xFFFF_FFFF
				});
				ConfigRegister { offset, value }
			})
			.collect()
	}

	pub fn capabilities(&self) -> CpbIter<'_, A> {
		CpbIter::new(&self.access)
	}

	pub fn ext_capabilities(&self) -> ExtCpbIter<'_, A> {
		ExtCpbIter::new(&self.access)
	}

	pub fn walk_capabilities(&self) -> Result<Vec<Capability>> {
		self.capabilities().collect()
	}

	pub fn walk_extended_capabilities(&self) -> Result<Vec<Capability>> {
		self.ext_capabilities().collect()
	}

	pub fn find_capability(&self, id: u8) -> Result<Option<u16>> {
		for cpb in self.capabilities() {
			let cpb = cpb?;
			if cpb.cap_id == id as u16 {
				return Ok(Some(cpb.offset));
			}
		}
		Ok(None)
	}

	pub fn find_extended_capability(&self, id: u16) -> Result<Option<u16>> {
		for cpb in self.ext_capabilities() {
			let cpb = cpb?;
			if cpb.cap_id == id {
				return Ok(Some(cpb.offset));
			}
		}
		Ok(None)
	}

	fn pcie_offset(&self) -> Result<u16> {
		self.find_capability(pcie::ID)?
			.ok_or_else(|| Error::not_found("PCI Express capability not found"))
	}

	pub fn get_device_capabilities(&self) -> Result<DeviceCpbs> {
		let base = self.pcie_offset()?;
		Ok(DeviceCpbs::from_raw(self.read_register(base + offsets::DEVICE_CPBS)?))
	}

	pub fn get_device_control(&self) -> Result<DeviceControl> {
		let base = self.pcie_offset()?;
		Ok(DeviceControl::from_raw(
			self.read_register(base + offsets::DEVICE_CONTROL)? as u16,
		))
	}

	/// Updates max payload size and/or max read request size (in bytes) and
	/// returns the control value read back from the device.
	pub fn set_device_control(&self, mps: Option<u16>, mrrs: Option<u16>) -> Result<DeviceControl> {
		fn size(name: &str, bytes: u16) -> Result<MaxSize> {
			MaxSize::from_size(bytes).ok_or_else(|| {
				Error::invalid_argument(format!(
					"{name} must be a power of two between 128 and 4096 bytes, got {bytes}"
				))
			})
		}
		let mps = mps.map(|bytes| size("max payload size", bytes)).transpose()?;
		let mrrs = mrrs.map(|bytes| size("max read request size", bytes)).transpose()?;

		let offset = self.pcie_offset()? + offsets::DEVICE_CONTROL;
		let mut control = DeviceControl::from_raw(self.read_register(offset)? as u16);
		if let Some(mps) = mps {
			control = control.with_max_payload_size(mps);
		}
		if let Some(mrrs) = mrrs {
			control = control.with_max_read_request_size(mrrs);
		}
		// the status half is write-one-to-clear
		self.write_register(offset, control.raw() as u32)?;
		tracing::debug!(?mps, ?mrrs, "device control updated");
		Ok(DeviceControl::from_raw(self.read_register(offset)? as u16))
	}

	pub fn get_link_capabilities(&self) -> Result<LinkCpbs> {
		let base = self.pcie_offset()?;
		Ok(LinkCpbs::from_raw(self.read_register(base + offsets::LINK_CPBS)?))
	}

	pub fn get_link_status(&self) -> Result<LinkState> {
		let base = self.pcie_offset()?;
		let control_status = self.read_register(base + offsets::LINK_CONTROL)?;
		let control2 = self.read_register(base + offsets::LINK_CONTROL2)?;
		Ok(LinkState::decode(control_status, control2))
	}

	pub fn get_supported_speeds(&self) -> Result<SupportedSpeeds> {
		let base = self.pcie_offset()?;
		Ok(LinkCpbs2::from_raw(self.read_register(base + offsets::LINK_CPBS2)?).supported_link_speeds())
	}

	pub fn retrain_link(&self) -> Result<()> {
		let offset = self.pcie_offset()? + offsets::LINK_CONTROL;
		let control = LinkControl::from_raw(self.read_register(offset)? as u16).retrain_link();
		self.write_register(offset, control.raw() as u32)?;
		tracing::debug!("link retrain requested");
		Ok(())
	}

	/// Sets the Target Link Speed field to `speed` (1 = 2.5 GT/s through
	/// 6 = 64 GT/s). Takes effect on the next retrain.
	pub fn set_target_link_speed(&self, speed: u8) -> Result<()> {
		if !(1..=6).contains(&speed) {
			return Err(Error::invalid_argument(format!(
				"target link speed must be 1-6, got {speed}"
			)));
		}
		let offset = self.pcie_offset()? + offsets::LINK_CONTROL2;
		let control = LinkControl2::from_raw(self.read_register(offset)? as u16)
			.with_target_link_speed_code(speed);
		self.write_register(offset, control.raw() as u32)?;
		tracing::debug!(speed, "target link speed set");
		Ok(())
	}

	/// `None` when the device has no AER capability.
	pub fn get_aer_status(&self) -> Result<Option<AerStatus>> {
		let Some(base) = self.find_extended_capability(aer::ID)? else {
			return Ok(None);
		};
		let mut header_log = [0; 4];
		for (i, dword) in header_log.iter_mut().enumerate() {
			*dword = self.read_register(base + aer::HEADER_LOG + i as u16 * 4)?;
		}
		Ok(Some(AerStatus {
			offset: base,
			uncorrectable_raw: self.read_register(base + aer::UNCORRECTABLE_STATUS)?,
			correctable_raw: self.read_register(base + aer::CORRECTABLE_STATUS)?,
			first_error_pointer: self.read_register(base + aer::CPBS_CONTROL)? as u8 & 0x1F,
			header_log,
		}))
	}

	/// Clears all AER status bits. Does nothing without an AER capability.
	pub fn clear_aer_errors(&self) -> Result<()> {
		let Some(base) = self.find_extended_capability(aer::ID)? else {
			return Ok(());
		};
		self.write_register(base + aer::UNCORRECTABLE_STATUS, 0xFFFF_FFFF)?;
		self.write_register(base + aer::CORRECTABLE_STATUS, 0xFFFF_FFFF)?;
		tracing::debug!(offset = base, "AER status cleared");
		Ok(())
	}

	pub fn get_eq_status_16gt(&self) -> Result<Option<EqStatus16Gt>> {
		let Some(base) = self.find_extended_capability(phy16::ID)? else {
			return Ok(None);
		};
		Ok(Some(EqStatus16Gt::from_raw(self.read_register(base + phy16::STATUS)?)))
	}

	pub fn get_eq_status_32gt(&self) -> Result<Option<EqStatus32Gt>> {
		let Some(base) = self.find_extended_capability(phy32::ID)? else {
			return Ok(None);
		};
		Ok(Some(EqStatus32Gt {
			cpbs: Phy32Cpbs::from_raw(self.read_register(base + phy32::CPBS)?),
			status: Phy32Status::from_raw(self.read_register(base + phy32::STATUS)?),
		}))
	}
}

#[cfg(test)]
mod tests {
	use std::{cell::RefCell, collections::HashMap};

	use super::*;
	use crate::{AccessError, ErrorKind};

	#[derive(Default)]
	struct Regs {
		config: RefCell<HashMap<u16, u32>>,
		broken: Vec<u16>,
	}

	impl Regs {
		fn with(values: &[(u16, u32)]) -> Self {
			Self {
				config: RefCell::new(values.iter().copied().collect()),
				broken: Vec::new(),
			}
		}
	}

	impl RegisterAccess for Regs {
		fn read_config_dword(&self, offset: u16) -> Result<u32, AccessError> {
			if self.broken.contains(&offset) {
				return Err(AccessError::new(offset as u32));
			}
			Ok(self.config.borrow().get(&offset).copied().unwrap_or(0))
		}
		fn write_config_dword(&self, offset: u16, val: u32) -> Result<(), AccessError> {
			self.config.borrow_mut().insert(offset, val);
			Ok(())
		}
		fn read_vendor_reg(&self, offset: u32) -> Result<u32, AccessError> {
			Err(AccessError::new(offset))
		}
		fn write_vendor_reg(&self, offset: u32, _val: u32) -> Result<(), AccessError> {
			Err(AccessError::new(offset))
		}
	}

	#[test]
	fn walk_single_capability() {
		let cfg = ConfigSpace::new(Regs::with(&[(0x34, 0x40), (0x40, 0x05)]));
		let cpbs = cfg.walk_capabilities().unwrap();
		assert_eq!(cpbs.len(), 1);
		assert_eq!(cpbs[0].cap_id, 0x05);
		assert_eq!(cpbs[0].offset, 0x40);
	}

	#[test]
	fn walk_stops_on_cycle() {
		let cfg = ConfigSpace::new(Regs::with(&[
			(0x34, 0x40),
			(0x40, 0x5001),
			(0x50, 0x4010),
		]));
		let ids: Vec<_> = cfg.walk_capabilities().unwrap().iter().map(|c| c.cap_id).collect();
		assert_eq!(ids, vec![0x01, 0x10]);
	}

	#[test]
	fn walk_stops_on_sentinel() {
		let cfg = ConfigSpace::new(Regs::with(&[
			(0x34, 0x40),
			(0x40, 0x6001),
			(0x60, 0xFFFF_FFFF),
		]));
		assert_eq!(cfg.walk_capabilities().unwrap().len(), 1);
	}

	#[test]
	fn ext_walk_stops_on_cycle_and_skips_null() {
		let cfg = ConfigSpace::new(Regs::with(&[
			(0x100, 0x1401_0001),
			(0x140, 0x1801_0000),
			(0x180, 0x1002_0027),
		]));
		let cpbs = cfg.walk_extended_capabilities().unwrap();
		let ids: Vec<_> = cpbs.iter().map(|c| (c.cap_id, c.offset, c.version)).collect();
		assert_eq!(ids, vec![(0x0001, 0x100, 1), (0x0027, 0x180, 2)]);
		assert_eq!(cfg.find_extended_capability(0x0027).unwrap(), Some(0x180));
		assert_eq!(cfg.find_extended_capability(0x0026).unwrap(), None);
	}

	#[test]
	fn ext_walk_ignores_offsets_below_ext_space() {
		let cfg = ConfigSpace::new(Regs::with(&[(0x100, 0x0401_0001)]));
		assert_eq!(cfg.walk_extended_capabilities().unwrap().len(), 1);
	}

	#[test]
	fn walk_propagates_read_failure() {
		let mut regs = Regs::with(&[(0x34, 0x40), (0x40, 0x5001)]);
		regs.broken.push(0x50);
		let cfg = ConfigSpace::new(regs);
		let err = cfg.walk_capabilities().unwrap_err();
		assert_eq!(err.kind(), ErrorKind::Io);
	}

	#[test]
	fn link_status_requires_pcie_capability() {
		let cfg = ConfigSpace::new(Regs::default());
		assert_eq!(cfg.get_link_status().unwrap_err().kind(), ErrorKind::NotFound);
	}

	#[test]
	fn target_speed_validation_and_update() {
		let cfg = ConfigSpace::new(Regs::with(&[(0x34, 0x40), (0x40, 0x0010), (0x70, 0x0001_0043)]));
		assert_eq!(cfg.set_target_link_speed(7).unwrap_err().kind(), ErrorKind::InvalidArgument);
		cfg.set_target_link_speed(4).unwrap();
		// status half is written as zero, other control bits are kept
		assert_eq!(cfg.read_register(0x70).unwrap(), 0x0000_0044);
	}

	#[test]
	fn retrain_sets_bit_without_touching_status() {
		let cfg = ConfigSpace::new(Regs::with(&[(0x34, 0x40), (0x40, 0x0010), (0x50, 0xC000_0002)]));
		cfg.retrain_link().unwrap();
		assert_eq!(cfg.read_register(0x50).unwrap(), 0x0000_0022);
	}

	#[test]
	fn device_control_sizes() {
		let cfg = ConfigSpace::new(Regs::with(&[(0x34, 0x40), (0x40, 0x0010), (0x48, 0x0000_2010)]));
		assert_eq!(
			cfg.set_device_control(Some(100), None).unwrap_err().kind(),
			ErrorKind::InvalidArgument
		);
		let control = cfg.set_device_control(Some(256), Some(1024)).unwrap();
		assert_eq!(control.max_payload_size().map(MaxSize::size), Some(256));
		assert_eq!(control.max_read_request_size().map(MaxSize::size), Some(1024));
		assert!(control.relaxed_ordering());
	}

	#[test]
	fn aer_absent_and_present() {
		let cfg = ConfigSpace::new(Regs::default());
		assert_eq!(cfg.get_aer_status().unwrap(), None);
		cfg.clear_aer_errors().unwrap();

		let cfg = ConfigSpace::new(Regs::with(&[
			(0x100, 0x0001_0001),
			(0x104, 1 << 14),
			(0x110, 1 << 6),
			(0x118, 0x0000_00AE),
			(0x11C, 0x4000_0001),
		]));
		let status = cfg.get_aer_status().unwrap().unwrap();
		assert_eq!(status.offset, 0x100);
		assert_eq!(status.first_error_pointer, 0x0E);
		assert_eq!(status.header_log, [0x4000_0001, 0, 0, 0]);
		assert!(status.uncorrectable().contains(aer::UncorrectableErrors::COMPLETION_TIMEOUT));
		cfg.clear_aer_errors().unwrap();
		assert_eq!(cfg.read_register(0x104).unwrap(), 0xFFFF_FFFF);
	}

	#[test]
	fn dump_marks_unreadable_dwords() {
		let mut regs = Regs::with(&[(0x00, 0x1234_10B5), (0x04, 0x0010_0007)]);
		regs.broken.push(0x08);
		let dump = ConfigSpace::new(regs).dump(0x01, 3);
		assert_eq!(
			dump,
			vec![
				ConfigRegister { offset: 0x00, value: 0x1234_10B5 },
				ConfigRegister { offset: 0x04, value: 0x0010_0007 },
				ConfigRegister { offset: 0x08, value: 0xFFFF_FFFF },
			]
		);
	}

	#[test]
	fn eq_status() {
		let cfg = ConfigSpace::new(Regs::with(&[
			(0x100, 0x2001_0026),
			(0x10C, 0x0000_000F),
			(0x200, 0x0001_002A),
			(0x204, 0x0000_0002),
			(0x20C, 0x0000_000F),
		]));
		let eq16 = cfg.get_eq_status_16gt().unwrap().unwrap();
		assert!(eq16.complete() && eq16.all_phases_success());
		let eq32 = cfg.get_eq_status_32gt().unwrap().unwrap();
		assert!(eq32.cpbs.no_eq_needed());
		assert!(eq32.status.complete());
	}
}
