//! Ptrace ingress capture.
//!
//! The capture RAM has no burst read: every entry costs an address write
//! followed by a data read.

use serde::{Deserialize, Serialize};

use super::{
	regs::{offsets, PtraceCaptureConfig, PtraceControl, PtraceStatus, PtraceTrigger},
	LtssmTracer,
};
use crate::{Error, RegisterAccess, Result};

/// Capture setup. The port select is derived from the tracer's port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtraceConfig {
	/// 0-15.
	pub trace_point: u8,
	/// 0-15.
	pub lane_select: u8,
	pub trigger_on_ltssm: bool,
	/// 12-bit LTSSM code that fires the trigger.
	pub trigger_state: Option<u16>,
}

impl PtraceConfig {
	pub fn validate(&self) -> Result<()> {
		if self.trace_point > 0x0F {
			return Err(Error::invalid_argument(format!(
				"trace point must be 0-15, got {}",
				self.trace_point
			)));
		}
		if self.lane_select > 0x0F {
			return Err(Error::invalid_argument(format!(
				"lane select must be 0-15, got {}",
				self.lane_select
			)));
		}
		if let Some(state) = self.trigger_state.filter(|&state| state > 0x0FFF) {
			return Err(Error::invalid_argument(format!(
				"trigger state {state:#x} is wider than 12 bits"
			)));
		}
		Ok(())
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PtraceState {
	pub active: bool,
	pub trigger_hit: bool,
	pub entries_captured: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PtraceEntry {
	pub index: u16,
	pub raw: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PtraceCapture {
	pub port_number: u8,
	pub entries: Vec<PtraceEntry>,
	pub trigger_hit: bool,
	/// Entries held by the capture RAM, which may exceed `entries.len()`.
	pub total_captured: u16,
}

impl<D: RegisterAccess> LtssmTracer<D> {
	pub fn configure_ptrace(&self, config: &PtraceConfig) -> Result<()> {
		config.validate()?;
		let capture = PtraceCaptureConfig::default()
			.with_port_select(self.port_select)
			.with_trace_point(config.trace_point)
			.with_lane_select(config.lane_select);
		self.write_vendor(offsets::PTRACE_CONFIG, capture.raw())?;
		let trigger = PtraceTrigger::default()
			.with_ltssm_enable(config.trigger_on_ltssm)
			.with_ltssm_state_match(config.trigger_state.unwrap_or(0));
		self.write_vendor(offsets::PTRACE_TRIGGER, trigger.raw())?;
		tracing::debug!(port = self.port_number, ?config, "Ptrace configured");
		Ok(())
	}

	fn ptrace_control(&self, control: PtraceControl) -> Result<()> {
		self.write_vendor(offsets::PTRACE_CONTROL, control.raw())
	}

	pub fn start_ptrace(&self) -> Result<()> {
		self.ptrace_control(PtraceControl::default().with_start(true))
	}

	pub fn stop_ptrace(&self) -> Result<()> {
		self.ptrace_control(PtraceControl::default().with_stop(true))
	}

	pub fn clear_ptrace(&self) -> Result<()> {
		self.ptrace_control(PtraceControl::default().with_clear(true))
	}

	pub fn read_ptrace_status(&self) -> Result<PtraceState> {
		let status = PtraceStatus::from_raw(self.read_vendor(offsets::PTRACE_STATUS)?);
		Ok(PtraceState {
			active: status.active(),
			trigger_hit: status.trigger_hit(),
			entries_captured: status.entries_captured(),
		})
	}

	/// Reads up to `max_entries` captured entries, oldest first.
	pub fn read_ptrace_buffer(&self, max_entries: usize) -> Result<PtraceCapture> {
		let status = self.read_ptrace_status()?;
		let count = (status.entries_captured as usize).min(max_entries) as u16;
		let entries = (0..count)
			.map(|index| {
				self.write_vendor(offsets::PTRACE_RAM_ADDRESS, index as u32)?;
				Ok(PtraceEntry {
					index,
					raw: self.read_vendor(offsets::PTRACE_RAM_DATA)?,
				})
			})
			.collect::<Result<Vec<_>>>()?;
		tracing::debug!(
			port = self.port_number,
			read = entries.len(),
			captured = status.entries_captured,
			"Ptrace buffer read"
		);
		Ok(PtraceCapture {
			port_number: self.port_number,
			entries,
			trigger_hit: status.trigger_hit,
			total_captured: status.entries_captured,
		})
	}
}
