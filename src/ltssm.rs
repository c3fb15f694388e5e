//! LTSSM observation through the vendor PHY registers.
//!
//! Unlike the other components, the tracer never touches configuration
//! space. It drives a port's station registers through the switch
//! management device.

pub mod ptrace;
pub mod regs;
pub mod state;

use std::{sync::Arc, thread, time::Duration};

use serde::Serialize;

use crate::{
	clock::{self, millis_since, Clock},
	device::DeviceBus,
	registry::{Progress, ProgressTable, RunStatus},
	Error, RegisterAccess, Result,
};
pub use ptrace::{PtraceCapture, PtraceConfig, PtraceEntry, PtraceState};
use regs::{offsets, PhyAdditionalStatus, PortControl, RecoveryDiagnostic};
pub use state::{link_speed_name, LtssmCode, LtssmTopState};

/// Pacing of a retrain watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetrainTimings {
	/// How long the port stays disabled to force the retrain.
	pub disable_pulse: Duration,
	pub poll_interval: Duration,
	/// Delay before L0 is read again to confirm the link stayed up.
	pub reconfirm: Duration,
}

impl Default for RetrainTimings {
	fn default() -> Self {
		Self {
			disable_pulse: Duration::from_millis(50),
			poll_interval: Duration::from_millis(20),
			reconfirm: Duration::from_millis(100),
		}
	}
}

/// Default budget of [`LtssmTracer::retrain_and_watch`].
pub const DEFAULT_RETRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LtssmSnapshot {
	pub port_number: u8,
	pub port_select: u8,
	pub ltssm_state: LtssmCode,
	pub ltssm_state_name: String,
	pub link_speed: u8,
	pub link_speed_name: String,
	pub recovery_count: u16,
	pub rx_eval_count: u8,
	pub link_down_count: u8,
	pub lane_reversal: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LtssmTransition {
	/// Time since the watch started.
	pub timestamp_ms: f64,
	pub state: LtssmCode,
	pub state_name: String,
}

impl LtssmTransition {
	fn new(timestamp_ms: f64, state: LtssmCode) -> Self {
		Self {
			timestamp_ms,
			state,
			state_name: state.to_string(),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetrainWatchResult {
	pub port_number: u8,
	pub port_select: u8,
	/// Starts with the state seen before the retrain was forced.
	pub transitions: Vec<LtssmTransition>,
	pub final_state: LtssmCode,
	pub final_state_name: String,
	pub final_speed: u8,
	pub final_speed_name: String,
	pub duration_ms: f64,
	/// L0 was reached and still held after the reconfirm delay.
	pub settled: bool,
}

impl RetrainWatchResult {
	/// Whether L0 showed up at any point of the watch.
	pub fn reached_l0(&self) -> bool {
		self.final_state.is_l0() || self.transitions.iter().any(|t| t.state.is_l0())
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RetrainWatchProgress {
	pub status: RunStatus,
	pub port_number: u8,
	pub port_select: u8,
	pub elapsed_ms: f64,
	pub transition_count: usize,
	pub error: Option<String>,
}

impl RetrainWatchProgress {
	pub fn idle(port_number: u8) -> Self {
		Self {
			port_number,
			port_select: regs::port_select(port_number),
			..Self::default()
		}
	}

	fn with_status(port_number: u8, status: RunStatus, elapsed_ms: f64, transition_count: usize) -> Self {
		Self {
			status,
			elapsed_ms,
			transition_count,
			..Self::idle(port_number)
		}
	}
}

impl Progress for RetrainWatchProgress {
	fn status(&self) -> RunStatus {
		self.status
	}
}

type WatchKey = (String, u8);

/// Progress and results of retrain watches, keyed by device and port.
#[derive(Debug)]
pub struct RetrainRegistry {
	table: ProgressTable<WatchKey, RetrainWatchProgress, RetrainWatchResult>,
}

impl RetrainRegistry {
	pub fn new() -> Self {
		Self {
			table: ProgressTable::new(),
		}
	}

	pub fn progress(&self, device_id: &str, port_number: u8) -> RetrainWatchProgress {
		self.table
			.progress(&(device_id.to_owned(), port_number))
			.unwrap_or_else(|| RetrainWatchProgress::idle(port_number))
	}

	pub fn result(&self, device_id: &str, port_number: u8) -> Option<RetrainWatchResult> {
		self.table.result(&(device_id.to_owned(), port_number))
	}
}

impl Default for RetrainRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// LTSSM state access for one global port number.
#[derive(Debug)]
pub struct LtssmTracer<D> {
	device: D,
	device_id: String,
	port_number: u8,
	port_select: u8,
	/// Register block of the station's first port.
	reg_base: u32,
	registry: Arc<RetrainRegistry>,
	clock: Arc<dyn Clock>,
	timings: RetrainTimings,
}

impl<D: RegisterAccess> LtssmTracer<D> {
	/// `device` must expose the vendor register window, which in practice is
	/// the switch management device. Ports above 143 are rejected.
	pub fn new(
		device: D,
		device_id: impl Into<String>,
		port_number: u8,
		registry: Arc<RetrainRegistry>,
	) -> Result<Self> {
		if port_number > regs::MAX_PORT {
			return Err(Error::invalid_argument(format!(
				"port number {port_number} is out of range (0-{})",
				regs::MAX_PORT
			)));
		}
		let station_base = regs::station_base(port_number);
		let tracer = Self {
			device,
			device_id: device_id.into(),
			port_number,
			port_select: regs::port_select(port_number),
			reg_base: regs::register_base(station_base),
			registry,
			clock: clock::system(),
			timings: RetrainTimings::default(),
		};
		tracing::debug!(
			port = port_number,
			station_base,
			port_select = tracer.port_select,
			reg_base = tracer.reg_base,
			"LTSSM tracer ready"
		);
		Ok(tracer)
	}

	/// Opens the management device of `bus` for `port_number`.
	pub fn open<B>(
		bus: &B,
		device_id: impl Into<String>,
		port_number: u8,
		registry: Arc<RetrainRegistry>,
	) -> Result<Self>
	where
		B: DeviceBus<Device = D> + ?Sized,
	{
		Self::new(bus.open(&bus.management_key())?, device_id, port_number, registry)
	}

	#[must_use]
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	#[must_use]
	pub fn with_timings(mut self, timings: RetrainTimings) -> Self {
		self.timings = timings;
		self
	}

	pub fn port_number(&self) -> u8 {
		self.port_number
	}

	pub fn port_select(&self) -> u8 {
		self.port_select
	}

	pub fn registry(&self) -> &Arc<RetrainRegistry> {
		&self.registry
	}

	fn read_vendor(&self, offset: u32) -> Result<u32> {
		Ok(self.device.read_vendor_reg(self.reg_base + offset)?)
	}

	fn write_vendor(&self, offset: u32, val: u32) -> Result<()> {
		Ok(self.device.write_vendor_reg(self.reg_base + offset, val)?)
	}

	fn read_recovery_diagnostic(&self, ltssm_status_select: bool) -> Result<RecoveryDiagnostic> {
		let select = RecoveryDiagnostic::default()
			.with_port_select(self.port_select)
			.with_ltssm_status_select(ltssm_status_select);
		self.write_vendor(offsets::RECOVERY_DIAGNOSTIC, select.raw())?;
		Ok(RecoveryDiagnostic::from_raw(
			self.read_vendor(offsets::RECOVERY_DIAGNOSTIC)?,
		))
	}

	/// Current LTSSM state of the port.
	///
	/// The register has to be told which port and which view to return
	/// before every read.
	pub fn read_ltssm_state(&self) -> Result<LtssmCode> {
		let state = LtssmCode::from_raw(self.read_recovery_diagnostic(true)?.data());
		tracing::trace!(port = self.port_number, state = %state, "LTSSM state read");
		Ok(state)
	}

	/// Returns the recovery entry count and the Rx evaluation count.
	pub fn read_recovery_count(&self) -> Result<(u16, u8)> {
		let diag = self.read_recovery_diagnostic(false)?;
		Ok((diag.data(), diag.rx_eval_count()))
	}

	pub fn read_phy_additional_status(&self) -> Result<PhyAdditionalStatus> {
		let select = PhyAdditionalStatus::default().with_port_select(self.port_select);
		self.write_vendor(offsets::PHY_ADDITIONAL_STATUS, select.raw())?;
		Ok(PhyAdditionalStatus::from_raw(
			self.read_vendor(offsets::PHY_ADDITIONAL_STATUS)?,
		))
	}

	pub fn get_snapshot(&self) -> Result<LtssmSnapshot> {
		let ltssm_state = self.read_ltssm_state()?;
		let (recovery_count, rx_eval_count) = self.read_recovery_count()?;
		let phy = self.read_phy_additional_status()?;
		Ok(LtssmSnapshot {
			port_number: self.port_number,
			port_select: self.port_select,
			ltssm_state,
			ltssm_state_name: ltssm_state.to_string(),
			link_speed: phy.link_speed(),
			link_speed_name: link_speed_name(phy.link_speed()),
			recovery_count,
			rx_eval_count,
			link_down_count: phy.link_down_count(),
			lane_reversal: phy.lane_reversal(),
		})
	}

	pub fn clear_recovery_count(&self) -> Result<()> {
		let clear = RecoveryDiagnostic::default()
			.with_port_select(self.port_select)
			.with_clear_recovery_count(true);
		self.write_vendor(offsets::RECOVERY_DIAGNOSTIC, clear.raw())?;
		tracing::debug!(port = self.port_number, "recovery count cleared");
		Ok(())
	}

	fn set_port_disabled(&self, disabled: bool) -> Result<()> {
		let control = PortControl::default()
			.with_disable_port(disabled)
			.with_port_select(self.port_select)
			.with_write_enable(true);
		self.write_vendor(offsets::PORT_CONTROL, control.raw())
	}

	fn key(&self) -> WatchKey {
		(self.device_id.clone(), self.port_number)
	}

	fn claim(&self) -> Result<()> {
		self.registry.table.claim(
			self.key(),
			RetrainWatchProgress::with_status(self.port_number, RunStatus::Running, 0.0, 0),
			true,
			&format!("retrain watch on {} port {}", self.device_id, self.port_number),
		)
	}

	/// Forces a retrain by pulsing the port's disable bit and records every
	/// LTSSM state change until L0 holds or `timeout` runs out.
	///
	/// Running out of time is not an error: the result comes back with
	/// `settled == false`. Fails with a conflict when a watch of the same
	/// port is running. A watch cannot be cancelled.
	pub fn retrain_and_watch(&self, timeout: Duration) -> Result<RetrainWatchResult> {
		self.claim()?;
		self.run_watch(timeout)
	}

	fn run_watch(&self, timeout: Duration) -> Result<RetrainWatchResult> {
		let key = self.key();
		let start = self.clock.now();
		let mut transitions = Vec::new();
		tracing::info!(port = self.port_number, ?timeout, "retrain watch started");

		match self.watch_body(timeout, start, &key, &mut transitions) {
			Ok(result) => {
				let progress = RetrainWatchProgress::with_status(
					self.port_number,
					RunStatus::Complete,
					result.duration_ms,
					result.transitions.len(),
				);
				self.registry.table.complete(key, progress, result.clone());
				tracing::info!(
					port = self.port_number,
					settled = result.settled,
					transitions = result.transitions.len(),
					final_state = %result.final_state,
					"retrain watch complete"
				);
				Ok(result)
			}
			Err(err) => {
				tracing::error!(port = self.port_number, "retrain watch failed: {err}");
				let mut progress = RetrainWatchProgress::with_status(
					self.port_number,
					RunStatus::Error,
					millis_since(&*self.clock, start),
					transitions.len(),
				);
				progress.error = Some(err.to_string());
				self.registry.table.update(key, progress);
				Err(err)
			}
		}
	}

	fn watch_body(
		&self,
		timeout: Duration,
		start: Duration,
		key: &WatchKey,
		transitions: &mut Vec<LtssmTransition>,
	) -> Result<RetrainWatchResult> {
		let initial = self.read_ltssm_state()?;
		transitions.push(LtssmTransition::new(0.0, initial));

		self.set_port_disabled(true)?;
		self.clock.sleep(self.timings.disable_pulse);
		self.set_port_disabled(false)?;

		let deadline = start + timeout;
		let mut last = initial;
		let mut settled = false;
		while self.clock.now() < deadline {
			self.clock.sleep(self.timings.poll_interval);
			let current = self.read_ltssm_state()?;
			if current != last {
				let elapsed = millis_since(&*self.clock, start);
				transitions.push(LtssmTransition::new(elapsed, current));
				last = current;
				tracing::debug!(port = self.port_number, state = %current, elapsed_ms = elapsed, "LTSSM transition");
				self.registry.table.update(
					key.clone(),
					RetrainWatchProgress::with_status(
						self.port_number,
						RunStatus::Running,
						elapsed,
						transitions.len(),
					),
				);
			}
			if current.is_l0() {
				self.clock.sleep(self.timings.reconfirm);
				if self.read_ltssm_state()?.is_l0() {
					settled = true;
					break;
				}
			}
		}
		let duration_ms = millis_since(&*self.clock, start);

		let final_state = self.read_ltssm_state()?;
		let final_speed = self.read_phy_additional_status()?.link_speed();
		if !settled {
			tracing::warn!(port = self.port_number, final_state = %final_state, "link did not settle in L0");
		}
		Ok(RetrainWatchResult {
			port_number: self.port_number,
			port_select: self.port_select,
			transitions: core::mem::take(transitions),
			final_state,
			final_state_name: final_state.to_string(),
			final_speed,
			final_speed_name: link_speed_name(final_speed),
			duration_ms,
			settled,
		})
	}
}

impl<D: RegisterAccess + Send + 'static> LtssmTracer<D> {
	/// Claims the port and runs [`Self::retrain_and_watch`] on a worker
	/// thread.
	pub fn spawn_retrain_and_watch(
		self,
		timeout: Duration,
	) -> Result<thread::JoinHandle<Result<RetrainWatchResult>>> {
		self.claim()?;
		let registry = Arc::clone(&self.registry);
		let key = self.key();
		thread::Builder::new()
			.name(format!("retrain-p{}", self.port_number))
			.spawn(move || self.run_watch(timeout))
			.map_err(|err| {
				let msg = format!("failed to start retrain worker: {err}");
				registry.table.modify(&key, |p| {
					p.status = RunStatus::Error;
					p.error = Some(msg.clone());
				});
				Error::invalid_state(msg)
			})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn reached_l0_looks_at_every_transition() {
		let mut result = RetrainWatchResult {
			port_number: 1,
			port_select: 1,
			transitions: vec![
				LtssmTransition::new(0.0, LtssmTopState::Detect.into()),
				LtssmTransition::new(20.0, LtssmCode::L0),
				LtssmTransition::new(40.0, LtssmTopState::Recovery.into()),
			],
			final_state: LtssmTopState::Recovery.into(),
			final_state_name: "RECOVERY".into(),
			final_speed: 3,
			final_speed_name: link_speed_name(3),
			duration_ms: 10_000.0,
			settled: false,
		};
		assert!(result.reached_l0());
		result.transitions.remove(1);
		assert!(!result.reached_l0());
	}

	#[test]
	fn idle_progress_carries_port_select() {
		let registry = RetrainRegistry::new();
		let progress = registry.progress("dev", 21);
		assert_eq!(progress.status, RunStatus::Idle);
		assert_eq!(progress.port_select, 5);
		assert!(registry.result("dev", 21).is_none());
	}
}
