//! Device enumeration and opening.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, RegisterAccess, Result};

/// Identifies one PCI function behind the switch, plus the switch port it
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
	pub bus: u8,
	pub slot: u8,
	pub function: u8,
	pub port_number: u8,
	/// Index the switch driver uses for this port.
	pub sdk_port_index: u16,
}

impl fmt::Display for DeviceKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:02x}:{:02x}.{} (port {})",
			self.bus, self.slot, self.function, self.port_number
		)
	}
}

/// A switch driver session able to enumerate and open devices.
///
/// Dropping an opened device releases its handle.
pub trait DeviceBus {
	type Device: RegisterAccess;

	/// Key of the switch management port, which exposes the vendor register
	/// window for every station.
	fn management_key(&self) -> DeviceKey;
	fn device_keys(&self) -> Result<Vec<DeviceKey>>;
	fn open(&self, key: &DeviceKey) -> Result<Self::Device>;

	/// Opens the device whose key carries the hardware `port_number`. The
	/// driver's own port index is never used for matching.
	fn open_port(&self, port_number: u8) -> Result<Self::Device> {
		let management = self.management_key();
		if management.port_number == port_number {
			return self.open(&management);
		}
		let key = self
			.device_keys()?
			.into_iter()
			.find(|key| key.port_number == port_number)
			.ok_or_else(|| Error::not_found(format!("no device found for port {port_number}")))?;
		tracing::trace!(%key, "opening port device");
		self.open(&key)
	}
}
