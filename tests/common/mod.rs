//! In-memory PCIe switch used by the integration tests.
//!
//! Each port has a small configuration space with a PCI Express capability,
//! optional AER / 16 GT/s / lane margining extended capabilities and a lane
//! margining receiver that answers commands immediately. Vendor registers
//! model the recovery diagnostic, PHY status, port control and Ptrace
//! blocks of every station. Time only moves when someone sleeps.
#![allow(dead_code)]

use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Condvar, Mutex, MutexGuard},
	time::Duration,
};

use pcie_margin::{clock::Clock, device::DeviceBus, device::DeviceKey, AccessError, Error, RegisterAccess, Result};

pub const PCIE_CAP: u16 = 0x40;
const AER_CAP: u16 = 0x100;
const PHY16_CAP: u16 = 0x140;
const MARGINING_CAP: u16 = 0x180;

const STATION_STRIDE: u32 = 0x8000;
const VENDOR_BASE: u32 = 0x0080_0000;
const PORT_CONTROL: u32 = 0x3208;
const RECOVERY_DIAGNOSTIC: u32 = 0x3BC4;
const PHY_ADDITIONAL_STATUS: u32 = 0x3BC8;
const PTRACE_CONTROL: u32 = 0x4000;
const PTRACE_STATUS: u32 = 0x4004;
const PTRACE_RAM_ADDRESS: u32 = 0x4020;
const PTRACE_RAM_DATA: u32 = 0x4024;

/// Virtual clock that advances only on `sleep`.
#[derive(Debug, Default)]
pub struct SimClock {
	now: Mutex<Duration>,
}

impl SimClock {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}
}

impl Clock for SimClock {
	fn now(&self) -> Duration {
		*self.now.lock().unwrap()
	}

	fn sleep(&self, dur: Duration) {
		*self.now.lock().unwrap() += dur;
	}
}

/// Register accesses block while the gate is closed.
#[derive(Debug, Default)]
pub struct Gate {
	closed: Mutex<bool>,
	cv: Condvar,
}

impl Gate {
	pub fn close(&self) {
		*self.closed.lock().unwrap() = true;
	}

	pub fn open(&self) {
		*self.closed.lock().unwrap() = false;
		self.cv.notify_all();
	}

	fn wait(&self) {
		let mut closed = self.closed.lock().unwrap();
		while *closed {
			closed = self.cv.wait(closed).unwrap();
		}
	}
}

/// Passing offsets of one lane, in steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Eye {
	pub right: u8,
	pub left: u8,
	pub up: u8,
	pub down: u8,
}

impl Eye {
	pub const fn symmetric(timing: u8, voltage: u8) -> Self {
		Self {
			right: timing,
			left: timing,
			up: voltage,
			down: voltage,
		}
	}
}

#[derive(Clone, Debug)]
pub struct MarginModel {
	pub ready: bool,
	pub timing_steps: u8,
	pub voltage_steps: u8,
	pub max_timing_offset: u8,
	pub max_voltage_offset: u8,
	pub sample_count: u8,
	/// Eye of every lane not listed in `lane_eyes`.
	pub eye: Eye,
	pub lane_eyes: HashMap<u8, Eye>,
	/// Per PAM4 receiver (1-3) eye, overriding the lane eye.
	pub receiver_eyes: HashMap<u8, Eye>,
	/// Receiver never echoes report commands.
	pub mute_reports: bool,
}

impl Default for MarginModel {
	fn default() -> Self {
		Self {
			ready: true,
			timing_steps: 4,
			voltage_steps: 4,
			max_timing_offset: 50,
			max_voltage_offset: 50,
			sample_count: 39,
			eye: Eye::symmetric(4, 4),
			lane_eyes: HashMap::new(),
			receiver_eyes: HashMap::new(),
			mute_reports: false,
		}
	}
}

impl MarginModel {
	fn eye(&self, lane: u8, receiver: u8) -> Eye {
		self.receiver_eyes
			.get(&receiver)
			.or_else(|| self.lane_eyes.get(&lane))
			.copied()
			.unwrap_or(self.eye)
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AerModel {
	pub uncorrectable: u32,
	pub correctable: u32,
	/// Status present right after a clear, for errors that keep firing.
	pub after_clear: (u32, u32),
}

#[derive(Clone, Debug)]
pub struct PortModel {
	pub speed: u8,
	pub target_speed: u8,
	pub max_speed: u8,
	pub width: u8,
	pub dll_active: bool,
	/// Speed the link falls back to no matter the target, if any.
	pub speed_cap: Option<u8>,
	pub device_control: u16,
	pub aer: Option<AerModel>,
	pub eq16_status: Option<u32>,
	pub margining: Option<MarginModel>,
	pub lanes: BTreeMap<u8, u32>,
	/// Config dwords returned in place of the modeled values.
	pub config_overrides: BTreeMap<u16, u32>,
	pub retrains: u32,
	/// Lane control words written, oldest first.
	pub lane_writes: Vec<(u8, u16)>,
}

impl PortModel {
	/// A healthy 16 GT/s x2 port with every capability present.
	pub fn gen4() -> Self {
		Self {
			speed: 4,
			target_speed: 4,
			max_speed: 4,
			width: 2,
			dll_active: true,
			speed_cap: None,
			device_control: 0x0007,
			aer: Some(AerModel::default()),
			eq16_status: Some(0x0F),
			margining: Some(MarginModel::default()),
			lanes: BTreeMap::new(),
			config_overrides: BTreeMap::new(),
			retrains: 0,
			lane_writes: Vec::new(),
		}
	}

	pub fn at_speed(mut self, speed: u8) -> Self {
		self.speed = speed;
		self.target_speed = speed;
		self.max_speed = self.max_speed.max(speed);
		self
	}

	fn ext_caps(&self) -> Vec<(u16, u16)> {
		let mut caps = Vec::new();
		if self.aer.is_some() {
			caps.push((AER_CAP, 0x0001));
		}
		if self.eq16_status.is_some() {
			caps.push((PHY16_CAP, 0x0026));
		}
		if self.margining.is_some() {
			caps.push((MARGINING_CAP, 0x0027));
		}
		caps
	}

	fn ext_header(&self, offset: u16) -> Option<u32> {
		let caps = self.ext_caps();
		let next_after = |offset: u16| {
			caps.iter()
				.map(|&(o, _)| o)
				.find(|&o| o > offset)
				.unwrap_or(0) as u32
		};
		if let Some(&(_, id)) = caps.iter().find(|&&(o, _)| o == offset) {
			return Some(id as u32 | 1 << 16 | next_after(offset) << 20);
		}
		// null capability heading the list when AER is absent
		if offset == AER_CAP && !caps.is_empty() {
			return Some(next_after(offset) << 20);
		}
		None
	}

	fn read(&self, port_number: u8, offset: u16) -> u32 {
		if let Some(&val) = self.config_overrides.get(&offset) {
			return val;
		}
		if let Some(header) = self.ext_header(offset) {
			return header;
		}
		let link_status =
			self.speed as u32 | (self.width as u32) << 4 | (self.dll_active as u32) << 13;
		match offset {
			0x00 => 0xC040_10B5,
			0x04 => 0x0010_0000,
			0x34 => PCIE_CAP as u32,
			o if o == PCIE_CAP => 0x0062_0010,
			o if o == PCIE_CAP + 0x04 => 0x0000_8022,
			o if o == PCIE_CAP + 0x08 => self.device_control as u32,
			o if o == PCIE_CAP + 0x0C => {
				self.max_speed as u32 | 16 << 4 | 1 << 20 | (port_number as u32) << 24
			}
			o if o == PCIE_CAP + 0x10 => link_status << 16,
			o if o == PCIE_CAP + 0x2C => ((1_u32 << self.max_speed) - 1) << 1,
			o if o == PCIE_CAP + 0x30 => self.target_speed as u32,
			o if o == AER_CAP + 0x04 => self.aer.map_or(0, |aer| aer.uncorrectable),
			o if o == AER_CAP + 0x10 => self.aer.map_or(0, |aer| aer.correctable),
			o if o == PHY16_CAP + 0x0C => self.eq16_status.unwrap_or(0),
			o if o == MARGINING_CAP + 0x04 => self
				.margining
				.as_ref()
				.map_or(0, |m| (m.ready as u32) << 16),
			o if (MARGINING_CAP + 0x08..MARGINING_CAP + 0x88).contains(&o) && self.margining.is_some() => {
				let lane = ((o - MARGINING_CAP - 0x08) / 4) as u8;
				self.lanes.get(&lane).copied().unwrap_or(0)
			}
			_ => 0,
		}
	}

	fn write(&mut self, offset: u16, val: u32) {
		match offset {
			o if o == PCIE_CAP + 0x08 => self.device_control = val as u16,
			o if o == PCIE_CAP + 0x10 => {
				if val & 1 << 5 != 0 {
					self.retrains += 1;
					let speed = self.target_speed.min(self.max_speed);
					self.speed = self.speed_cap.map_or(speed, |cap| speed.min(cap));
				}
			}
			o if o == PCIE_CAP + 0x30 => self.target_speed = val as u8 & 0x0F,
			o if o == AER_CAP + 0x04 => {
				if let Some(aer) = &mut self.aer {
					aer.uncorrectable = aer.after_clear.0;
				}
			}
			o if o == AER_CAP + 0x10 => {
				if let Some(aer) = &mut self.aer {
					aer.correctable = aer.after_clear.1;
				}
			}
			o if (MARGINING_CAP + 0x08..MARGINING_CAP + 0x88).contains(&o) => {
				let lane = ((o - MARGINING_CAP - 0x08) / 4) as u8;
				self.margin_command(lane, val as u16);
			}
			_ => {}
		}
	}

	fn margin_command(&mut self, lane: u8, control: u16) {
		let Some(model) = &self.margining else {
			return;
		};
		self.lane_writes.push((lane, control));
		let receiver = control & 0x07;
		let command = (control >> 3) & 0x07;
		let payload = (control >> 8) as u8;
		let response = match command {
			// report commands
			1 => {
				if model.mute_reports {
					None
				} else {
					let val = match payload {
						0x88 => 0x00,
						0x89 => model.voltage_steps,
						0x8A => model.timing_steps,
						0x8B => model.max_timing_offset,
						0x8C => model.max_voltage_offset,
						0x8F => model.sample_count,
						_ => 0,
					};
					Some(val)
				}
			}
			// timing and voltage margin
			3 | 4 => {
				let eye = model.eye(lane, receiver as u8);
				let step = payload & 0x3F;
				let negative = payload & 0x40 != 0;
				let limit = match (command, negative) {
					(3, false) => eye.right,
					(3, true) => eye.left,
					(_, false) => eye.up,
					(_, true) => eye.down,
				};
				let code = if step <= limit { 2 } else { 0 };
				Some(code << 6 | step)
			}
			_ => Some(0),
		};
		let status = match response {
			Some(payload) => control & 0x00FF | (payload as u16) << 8,
			None => 0,
		};
		self.lanes.insert(lane, (status as u32) << 16 | control as u32);
	}
}

/// LTSSM and diagnostic state of one port, reached through the vendor
/// registers of its station.
#[derive(Clone, Debug, Default)]
pub struct LtssmModel {
	/// States returned by successive LTSSM reads. The last one sticks.
	pub script: Vec<u16>,
	pub cursor: usize,
	pub recovery_count: u16,
	pub recovery_after_clear: u16,
	pub rx_eval_count: u8,
	pub phy_speed: u8,
	pub link_down_count: u8,
	pub disable_writes: Vec<bool>,
	pub ptrace_ram: Vec<u32>,
	pub ptrace_running: bool,
	pub ptrace_config: u32,
	pub ptrace_trigger: u32,
}

impl LtssmModel {
	pub fn scripted(script: &[u16]) -> Self {
		Self {
			script: script.to_vec(),
			phy_speed: 3,
			..Self::default()
		}
	}

	fn next_state(&mut self) -> u16 {
		let state = self
			.script
			.get(self.cursor)
			.or_else(|| self.script.last())
			.copied()
			.unwrap_or(0x300);
		self.cursor += 1;
		state
	}
}

#[derive(Debug, Default)]
struct StationSelect {
	recovery: u32,
	phy: u32,
	ram_address: u32,
}

#[derive(Debug, Default)]
pub struct SimState {
	pub ports: BTreeMap<u8, PortModel>,
	pub ltssm: BTreeMap<u8, LtssmModel>,
	selects: HashMap<u8, StationSelect>,
	pub vendor_writes: Vec<(u32, u32)>,
}

impl SimState {
	fn station(offset: u32) -> Option<(u8, u32)> {
		let rel = offset.checked_sub(VENDOR_BASE)?;
		Some(((rel / STATION_STRIDE) as u8, rel % STATION_STRIDE))
	}

	fn ltssm_of(&mut self, station: u8, select: u32) -> &mut LtssmModel {
		self.ltssm.entry(station + select as u8).or_default()
	}

	fn read_vendor(&mut self, offset: u32) -> u32 {
		let Some((station, reg)) = Self::station(offset) else {
			return 0;
		};
		let select = self.selects.entry(station).or_default();
		let (recovery, phy, address) = (select.recovery, select.phy, select.ram_address);
		match reg {
			RECOVERY_DIAGNOSTIC => {
				let port_select = (recovery >> 24) & 0x0F;
				let ltssm = self.ltssm_of(station, port_select);
				if recovery & 1 << 30 != 0 {
					ltssm.next_state() as u32 | recovery & 0xFFFF_0000
				} else {
					ltssm.recovery_count as u32
						| (ltssm.rx_eval_count as u32) << 16
						| recovery & 0xFF00_0000
				}
			}
			PHY_ADDITIONAL_STATUS => {
				let port_select = (phy >> 12) & 0x0F;
				let ltssm = self.ltssm_of(station, port_select);
				(ltssm.link_down_count as u32) << 3 | (ltssm.phy_speed as u32) << 8 | phy & 0xF000
			}
			PTRACE_STATUS => {
				let ltssm = self.ltssm_of(station, 0);
				ltssm.ptrace_running as u32 | (ltssm.ptrace_ram.len() as u32) << 16
			}
			PTRACE_RAM_DATA => {
				let ltssm = self.ltssm_of(station, 0);
				ltssm.ptrace_ram.get(address as usize).copied().unwrap_or(0)
			}
			_ => 0,
		}
	}

	fn write_vendor(&mut self, offset: u32, val: u32) {
		self.vendor_writes.push((offset, val));
		let Some((station, reg)) = Self::station(offset) else {
			return;
		};
		match reg {
			RECOVERY_DIAGNOSTIC => {
				self.selects.entry(station).or_default().recovery = val;
				if val & 1 << 31 != 0 {
					let ltssm = self.ltssm_of(station, (val >> 24) & 0x0F);
					ltssm.recovery_count = ltssm.recovery_after_clear;
				}
			}
			PHY_ADDITIONAL_STATUS => self.selects.entry(station).or_default().phy = val,
			PORT_CONTROL if val & 1 << 31 != 0 => {
				let ltssm = self.ltssm_of(station, (val >> 24) & 0x0F);
				ltssm.disable_writes.push(val & 1 != 0);
			}
			PTRACE_RAM_ADDRESS => self.selects.entry(station).or_default().ram_address = val,
			PTRACE_CONTROL => {
				let ltssm = self.ltssm_of(station, 0);
				if val & 1 != 0 {
					ltssm.ptrace_running = true;
				}
				if val & 2 != 0 {
					ltssm.ptrace_running = false;
				}
				if val & 4 != 0 {
					ltssm.ptrace_ram.clear();
				}
			}
			0x4008 => self.ltssm_of(station, 0).ptrace_config = val,
			0x4010 => self.ltssm_of(station, 0).ptrace_trigger = val,
			_ => {}
		}
	}
}

/// A simulated switch. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct SimSwitch {
	state: Arc<Mutex<SimState>>,
	pub gate: Arc<Gate>,
}

impl SimSwitch {
	/// Management port 0 plus the given downstream ports.
	pub fn new(ports: impl IntoIterator<Item = (u8, PortModel)>) -> Self {
		let switch = Self::default();
		{
			let mut state = switch.state();
			state.ports.insert(0, PortModel::gen4());
			state.ports.extend(ports);
		}
		switch
	}

	pub fn management_only() -> Self {
		Self::new(Vec::<(u8, PortModel)>::new())
	}

	pub fn state(&self) -> MutexGuard<'_, SimState> {
		self.state.lock().unwrap()
	}

	pub fn set_ltssm(&self, port: u8, model: LtssmModel) {
		self.state().ltssm.insert(port, model);
	}

	pub fn port(&self, port: u8) -> PortModel {
		self.state().ports[&port].clone()
	}

	pub fn device(&self, port_number: u8) -> SimDevice {
		SimDevice {
			switch: self.clone(),
			port_number,
		}
	}
}

impl DeviceBus for SimSwitch {
	type Device = SimDevice;

	fn management_key(&self) -> DeviceKey {
		key(0)
	}

	fn device_keys(&self) -> Result<Vec<DeviceKey>> {
		Ok(self.state().ports.keys().map(|&port| key(port)).collect())
	}

	fn open(&self, key: &DeviceKey) -> Result<SimDevice> {
		if !self.state().ports.contains_key(&key.port_number) {
			return Err(Error::NotFound(format!("no device at {key}")));
		}
		Ok(self.device(key.port_number))
	}
}

fn key(port_number: u8) -> DeviceKey {
	DeviceKey {
		bus: if port_number == 0 { 1 } else { 2 },
		slot: port_number,
		function: 0,
		port_number,
		// differs from the hardware port number
		sdk_port_index: 100 + port_number as u16,
	}
}

#[derive(Clone, Debug)]
pub struct SimDevice {
	switch: SimSwitch,
	port_number: u8,
}

impl RegisterAccess for SimDevice {
	fn read_config_dword(&self, offset: u16) -> Result<u32, AccessError> {
		self.switch.gate.wait();
		let state = self.switch.state();
		let port = state
			.ports
			.get(&self.port_number)
			.ok_or(AccessError::new(offset as u32))?;
		Ok(port.read(self.port_number, offset))
	}

	fn write_config_dword(&self, offset: u16, val: u32) -> Result<(), AccessError> {
		self.switch.gate.wait();
		let mut state = self.switch.state();
		let port = state
			.ports
			.get_mut(&self.port_number)
			.ok_or(AccessError::new(offset as u32))?;
		port.write(offset, val);
		Ok(())
	}

	fn read_vendor_reg(&self, offset: u32) -> Result<u32, AccessError> {
		self.switch.gate.wait();
		Ok(self.switch.state().read_vendor(offset))
	}

	fn write_vendor_reg(&self, offset: u32, val: u32) -> Result<(), AccessError> {
		self.switch.gate.wait();
		self.switch.state().write_vendor(offset, val);
		Ok(())
	}
}

/// LTSSM codes used by the scripts.
pub mod states {
	pub const DETECT: u16 = 0x000;
	pub const POLLING: u16 = 0x100;
	pub const CONFIGURATION: u16 = 0x200;
	pub const L0: u16 = 0x300;
	pub const RECOVERY: u16 = 0x400;
}
