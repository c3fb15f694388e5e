//! Lane margining at the receiver.
//!
//! A sweep steps one receiver through every timing and voltage offset the
//! device advertises and records which offsets still sample correctly. At
//! 64 GT/s the lane carries three PAM4 eyes, each swept with its own
//! receiver.

pub mod regs;
pub mod sweep;

use std::{sync::Arc, thread, time::Duration};

use crate::{
	clock::{self, millis_since, Clock},
	config::{
		cpb::pcie::{self, LinkSpeed, LinkState},
		ConfigSpace,
	},
	device::DeviceBus,
	error::TimeoutDiagnostics,
	ext_cpb::margining::{self, PortCpbsStatus},
	registry::ProgressTable,
	Error, RegisterAccess, Result,
};
pub use regs::{
	margin_payload, status_code, LaneControl, LaneStatus, MarginCommand, MarginingReceiver,
	ReportPayload,
};
pub use sweep::{
	check_balance, max_passed_step, steps_to_timing_ui, steps_to_voltage_mv, Direction,
	EyeSweepResult, LaneMarginCapabilities, MarginPoint, Pam4SweepResult, SweepProgress,
};

/// Pacing of the margining protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MarginTimings {
	/// Wait after NO_COMMAND before issuing a report command, covering the
	/// ordered-set round trip to the receiver.
	pub report_settle: Duration,
	/// Settle time of the single retry after a report timed out.
	pub report_retry_settle: Duration,
	pub poll_interval: Duration,
	pub poll_timeout: Duration,
	/// Minimum wait after a margin command before the status is trusted.
	pub dwell: Duration,
}

impl Default for MarginTimings {
	fn default() -> Self {
		Self {
			report_settle: Duration::from_millis(30),
			report_retry_settle: Duration::from_millis(500),
			poll_interval: Duration::from_millis(20),
			poll_timeout: Duration::from_secs(5),
			dwell: Duration::from_secs(1),
		}
	}
}

/// Receiver to address for a query at the given link speed code. Receiver 0
/// is reserved at 64 GT/s, so a broadcast request goes to receiver A.
pub fn resolve_receiver(requested: MarginingReceiver, speed_code: u8) -> MarginingReceiver {
	match requested {
		MarginingReceiver::Broadcast if speed_code == LinkSpeed::Gen6.code() => {
			MarginingReceiver::ReceiverA
		}
		other => other,
	}
}

/// Receiver to address when resetting. At 64 GT/s a broadcast reset uses
/// the PAM4 broadcast receiver.
pub fn resolve_reset_receiver(requested: MarginingReceiver, speed_code: u8) -> MarginingReceiver {
	match requested {
		MarginingReceiver::Broadcast if speed_code == LinkSpeed::Gen6.code() => {
			MarginingReceiver::Pam4Broadcast
		}
		other => other,
	}
}

type SweepKey = (String, u8);

/// Progress and results of all sweeps, keyed by device and lane.
#[derive(Debug)]
pub struct SweepRegistry {
	nrz: ProgressTable<SweepKey, SweepProgress, EyeSweepResult>,
	pam4: ProgressTable<SweepKey, SweepProgress, Pam4SweepResult>,
}

impl SweepRegistry {
	pub fn new() -> Self {
		Self {
			nrz: ProgressTable::new(),
			pam4: ProgressTable::new(),
		}
	}

	pub fn progress(&self, device_id: &str, lane: u8) -> SweepProgress {
		self.nrz
			.progress(&(device_id.to_owned(), lane))
			.unwrap_or_else(|| SweepProgress::idle(lane))
	}

	pub fn result(&self, device_id: &str, lane: u8) -> Option<EyeSweepResult> {
		self.nrz.result(&(device_id.to_owned(), lane))
	}

	pub fn pam4_progress(&self, device_id: &str, lane: u8) -> SweepProgress {
		self.pam4
			.progress(&(device_id.to_owned(), lane))
			.unwrap_or_else(|| SweepProgress::idle(lane))
	}

	pub fn pam4_result(&self, device_id: &str, lane: u8) -> Option<Pam4SweepResult> {
		self.pam4.result(&(device_id.to_owned(), lane))
	}
}

impl Default for SweepRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Runs the margining protocol on one port.
///
/// The engine owns the port's device handle; dropping the engine releases
/// it.
#[derive(Debug)]
pub struct LaneMarginingEngine<D> {
	config: ConfigSpace<D>,
	device_id: String,
	port_number: u8,
	registry: Arc<SweepRegistry>,
	clock: Arc<dyn Clock>,
	timings: MarginTimings,
}

impl<D: RegisterAccess> LaneMarginingEngine<D> {
	/// Fails when the link is down or the device has no lane margining
	/// capability. The device is released on failure.
	pub fn new(
		device: D,
		device_id: impl Into<String>,
		port_number: u8,
		registry: Arc<SweepRegistry>,
	) -> Result<Self> {
		let config = ConfigSpace::new(device);
		let link = config.get_link_status()?;
		if !link.dll_link_active {
			return Err(Error::invalid_state(format!(
				"link on port {port_number} is not active"
			)));
		}
		if config.find_extended_capability(margining::ID)?.is_none() {
			return Err(Error::not_found(format!(
				"port {port_number} has no lane margining capability"
			)));
		}
		Ok(Self {
			config,
			device_id: device_id.into(),
			port_number,
			registry,
			clock: clock::system(),
			timings: MarginTimings::default(),
		})
	}

	/// Opens the device of hardware port `port_number` on `bus`.
	pub fn open<B>(
		bus: &B,
		device_id: impl Into<String>,
		port_number: u8,
		registry: Arc<SweepRegistry>,
	) -> Result<Self>
	where
		B: DeviceBus<Device = D> + ?Sized,
	{
		Self::new(bus.open_port(port_number)?, device_id, port_number, registry)
	}

	#[must_use]
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	#[must_use]
	pub fn with_timings(mut self, timings: MarginTimings) -> Self {
		self.timings = timings;
		self
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	pub fn port_number(&self) -> u8 {
		self.port_number
	}

	pub fn config(&self) -> &ConfigSpace<D> {
		&self.config
	}

	pub fn registry(&self) -> &Arc<SweepRegistry> {
		&self.registry
	}

	/// Releases the device handle.
	pub fn close(self) {
		tracing::debug!(port = self.port_number, "closing margining engine");
	}

	pub fn link_state(&self) -> Result<LinkState> {
		self.config.get_link_status()
	}

	pub fn is_margining_ready(&self) -> Result<bool> {
		let cap = self.margining_offset()?;
		Ok(self.port_status(cap)?.margining_ready())
	}

	fn margining_offset(&self) -> Result<u16> {
		self.config
			.find_extended_capability(margining::ID)?
			.ok_or_else(|| {
				Error::not_found(format!(
					"port {} has no lane margining capability",
					self.port_number
				))
			})
	}

	fn port_status(&self, cap: u16) -> Result<PortCpbsStatus> {
		Ok(PortCpbsStatus::from_raw(
			self.config.read_register(cap + margining::PORT_CPBS_STATUS)?,
		))
	}

	/// Checks every margining precondition without touching the lane.
	fn check_ready(&self, cap: u16) -> Result<LinkState> {
		let link = self.config.get_link_status()?;
		if !link.dll_link_active {
			return Err(Error::invalid_state(format!(
				"link on port {} is not active",
				self.port_number
			)));
		}
		match link.current_speed {
			Some(speed) if speed >= LinkSpeed::Gen4 => {}
			Some(speed) => {
				return Err(Error::invalid_state(format!(
					"lane margining requires 16 GT/s or faster, port {} is at {speed}",
					self.port_number
				)));
			}
			None => {
				return Err(Error::invalid_state(format!(
					"port {} reports an unknown link speed",
					self.port_number
				)));
			}
		}
		if !self.port_status(cap)?.margining_ready() {
			return Err(Error::invalid_state(format!(
				"margining is not ready on port {}",
				self.port_number
			)));
		}
		Ok(link)
	}

	fn check_lane(&self, lane: u8) -> Result<()> {
		if lane >= margining::MAX_LANES {
			return Err(Error::invalid_argument(format!(
				"lane {lane} is out of range (0-{})",
				margining::MAX_LANES - 1
			)));
		}
		Ok(())
	}

	fn write_lane_control(&self, cap: u16, lane: u8, control: LaneControl) -> Result<()> {
		let offset = cap + margining::lane_offset(lane);
		let current = self.config.read_register(offset)?;
		self.config
			.write_register(offset, (current & 0xFFFF_0000) | control.raw() as u32)
	}

	fn read_lane_status(&self, cap: u16, lane: u8) -> Result<LaneStatus> {
		Ok(LaneStatus::from_lane_dword(
			self.config.read_register(cap + margining::lane_offset(lane))?,
		))
	}

	/// One report attempt. `None` when the command was never echoed.
	fn try_report(
		&self,
		cap: u16,
		lane: u8,
		receiver: MarginingReceiver,
		payload: ReportPayload,
		settle: Duration,
	) -> Result<Option<u8>> {
		self.write_lane_control(cap, lane, LaneControl::new(receiver, MarginCommand::NoCommand, 0))?;
		self.clock.sleep(settle);
		self.write_lane_control(
			cap,
			lane,
			LaneControl::new(receiver, MarginCommand::AccessReceiverMarginControl, payload as u8),
		)?;
		let deadline = self.clock.now() + self.timings.poll_timeout;
		loop {
			self.clock.sleep(self.timings.poll_interval);
			let status = self.read_lane_status(cap, lane)?;
			if status.command() == Some(MarginCommand::AccessReceiverMarginControl) {
				return Ok(Some(status.payload()));
			}
			if self.clock.now() >= deadline {
				return Ok(None);
			}
		}
	}

	fn send_report(
		&self,
		cap: u16,
		lane: u8,
		receiver: MarginingReceiver,
		payload: ReportPayload,
	) -> Result<u8> {
		if let Some(val) = self.try_report(cap, lane, receiver, payload, self.timings.report_settle)? {
			return Ok(val);
		}
		tracing::warn!(
			port = self.port_number,
			lane,
			?payload,
			"margining report timed out, retrying with a longer settle"
		);
		if let Some(val) =
			self.try_report(cap, lane, receiver, payload, self.timings.report_retry_settle)?
		{
			return Ok(val);
		}
		let diagnostics = self.diagnostics(cap);
		tracing::error!(port = self.port_number, lane, ?payload, %diagnostics, "margining report failed");
		self.reset_best_effort(cap, lane, &[receiver]);
		Err(Error::Timeout {
			message: format!(
				"margining report {payload:?} (0x{:02X}) on port {} lane {lane} timed out",
				payload as u8, self.port_number
			),
			diagnostics: Box::new(diagnostics),
		})
	}

	fn diagnostics(&self, cap: u16) -> TimeoutDiagnostics {
		let read = |offset: u16| self.config.read_register(offset).ok();
		TimeoutDiagnostics {
			link_control_status: self
				.config
				.find_capability(pcie::ID)
				.ok()
				.flatten()
				.and_then(|base| read(base + pcie::offsets::LINK_CONTROL)),
			capability_header: read(cap),
			port_status: read(cap + margining::PORT_CPBS_STATUS),
			lane0_control_status: read(cap + margining::lane_offset(0)),
		}
	}

	fn read_capabilities(
		&self,
		cap: u16,
		lane: u8,
		receiver: MarginingReceiver,
	) -> Result<LaneMarginCapabilities> {
		let report = |payload| self.send_report(cap, lane, receiver, payload);
		let flags = report(ReportPayload::Capabilities)?;
		let num_voltage_steps = report(ReportPayload::NumVoltageSteps)? & 0x3F;
		let num_timing_steps = report(ReportPayload::NumTimingSteps)? & 0x3F;
		let max_timing_offset = report(ReportPayload::MaxTimingOffset)? & 0x3F;
		let max_voltage_offset = report(ReportPayload::MaxVoltageOffset)? & 0x3F;
		let sample_rate_voltage = report(ReportPayload::SamplingRateVoltage)? & 1 != 0;
		let sample_rate_timing = report(ReportPayload::SamplingRateTiming)? & 1 != 0;
		let sample_count = report(ReportPayload::SampleCount)? & 0x3F;
		let caps = LaneMarginCapabilities {
			max_timing_offset,
			max_voltage_offset,
			num_timing_steps,
			num_voltage_steps,
			sample_count,
			sample_rate_voltage,
			sample_rate_timing,
			ind_up_down_voltage: flags & 0x02 != 0,
			ind_left_right_timing: flags & 0x04 != 0,
		};
		tracing::debug!(port = self.port_number, lane, ?receiver, ?caps, "margining capabilities");
		Ok(caps)
	}

	/// Queries the receiver's margining capabilities.
	pub fn get_capabilities(
		&self,
		lane: u8,
		receiver: MarginingReceiver,
	) -> Result<LaneMarginCapabilities> {
		self.check_lane(lane)?;
		let cap = self.margining_offset()?;
		let link = self.check_ready(cap)?;
		self.read_capabilities(cap, lane, resolve_receiver(receiver, link.speed_code()))
	}

	fn reset_lane_at(&self, cap: u16, lane: u8, receiver: MarginingReceiver) -> Result<()> {
		self.write_lane_control(
			cap,
			lane,
			LaneControl::new(receiver, MarginCommand::GoToNormalSettings, 0),
		)
	}

	fn reset_best_effort(&self, cap: u16, lane: u8, receivers: &[MarginingReceiver]) {
		for &receiver in receivers {
			if let Err(err) = self.reset_lane_at(cap, lane, receiver) {
				tracing::warn!(port = self.port_number, lane, ?receiver, "lane reset failed: {err}");
			}
		}
	}

	/// Returns the lane's receiver to normal settings.
	pub fn reset_lane(&self, lane: u8, receiver: MarginingReceiver) -> Result<()> {
		self.check_lane(lane)?;
		let cap = self.margining_offset()?;
		let speed_code = self.config.get_link_status()?.speed_code();
		let receiver = resolve_reset_receiver(receiver, speed_code);
		tracing::debug!(port = self.port_number, lane, ?receiver, "resetting lane");
		self.reset_lane_at(cap, lane, receiver)
	}

	fn margin_point(
		&self,
		cap: u16,
		lane: u8,
		receiver: MarginingReceiver,
		direction: Direction,
		step: u8,
	) -> Result<MarginPoint> {
		let command = direction.command();
		self.write_lane_control(cap, lane, LaneControl::new(receiver, MarginCommand::NoCommand, 0))?;
		self.write_lane_control(
			cap,
			lane,
			LaneControl::new(receiver, command, margin_payload(step, direction.is_negative())),
		)?;
		self.clock.sleep(self.timings.dwell);

		let point = |status: LaneStatus, timed_out: bool| MarginPoint {
			direction,
			step,
			margin_value: status.margin_value(),
			status_code: status.status_code(),
			passed: !timed_out && status.status_code() == status_code::PASSED,
			timed_out,
		};
		let deadline = self.clock.now() + self.timings.poll_timeout;
		let last = loop {
			let status = self.read_lane_status(cap, lane)?;
			if status.command() == Some(command)
				&& status.receiver() == Some(receiver)
				&& status.status_code() != status_code::SETUP
			{
				return Ok(point(status, false));
			}
			if self.clock.now() >= deadline {
				break status;
			}
			self.clock.sleep(self.timings.poll_interval);
		};
		tracing::debug!(
			port = self.port_number,
			lane,
			?direction,
			step,
			status = last.raw(),
			"margin point timed out"
		);
		Ok(point(last, true))
	}

	fn measure_eye(
		&self,
		cap: u16,
		lane: u8,
		receiver: MarginingReceiver,
		caps: &LaneMarginCapabilities,
		on_point: &mut dyn FnMut(u32),
	) -> Result<EyeSweepResult> {
		let started = self.clock.now();
		let mut timing_points = Vec::with_capacity(2 * caps.num_timing_steps as usize);
		let mut voltage_points = Vec::with_capacity(2 * caps.num_voltage_steps as usize);
		let mut done = 0;
		for direction in Direction::SWEEP_ORDER {
			for step in 1..=caps.steps(direction) {
				let point = self.margin_point(cap, lane, receiver, direction, step)?;
				if direction.is_timing() {
					timing_points.push(point);
				} else {
					voltage_points.push(point);
				}
				done += 1;
				on_point(done);
			}
		}
		Ok(EyeSweepResult::from_points(
			lane,
			receiver,
			*caps,
			timing_points,
			voltage_points,
			millis_since(&*self.clock, started),
		))
	}

	fn key(&self, lane: u8) -> SweepKey {
		(self.device_id.clone(), lane)
	}

	fn claim(
		&self,
		table: &ProgressTable<SweepKey, SweepProgress, impl Clone>,
		lane: u8,
	) -> Result<()> {
		self.check_lane(lane)?;
		table.claim(
			self.key(lane),
			SweepProgress::running(lane, 0, 0),
			false,
			&format!("margin sweep on {} lane {lane}", self.device_id),
		)
	}

	/// Sweeps one receiver of `lane` and stores the result in the registry.
	/// Fails with a conflict when a sweep of the same lane is running.
	pub fn sweep_lane(&self, lane: u8, receiver: MarginingReceiver) -> Result<EyeSweepResult> {
		self.claim(&self.registry.nrz, lane)?;
		self.run_sweep(lane, receiver)
	}

	fn run_sweep(&self, lane: u8, receiver: MarginingReceiver) -> Result<EyeSweepResult> {
		let key = self.key(lane);
		let started = self.clock.now();
		tracing::info!(port = self.port_number, lane, ?receiver, "lane margin sweep started");
		match self.sweep_body(lane, receiver, &key, started) {
			Ok(result) => {
				let total = result.capabilities.total_steps();
				self.registry
					.nrz
					.complete(key, SweepProgress::complete(lane, total), result.clone());
				tracing::info!(
					port = self.port_number,
					lane,
					width_ui = result.eye_width_ui,
					height_mv = result.eye_height_mv,
					"lane margin sweep complete"
				);
				Ok(result)
			}
			Err(err) => {
				tracing::error!(port = self.port_number, lane, "lane margin sweep failed: {err}");
				self.registry.nrz.modify(&key, |p| p.fail(err.to_string()));
				Err(err)
			}
		}
	}

	fn sweep_body(
		&self,
		lane: u8,
		receiver: MarginingReceiver,
		key: &SweepKey,
		started: Duration,
	) -> Result<EyeSweepResult> {
		let cap = self.margining_offset()?;
		let speed_code = self.check_ready(cap)?.speed_code();
		let reset_receiver = resolve_reset_receiver(receiver, speed_code);
		let receiver = resolve_receiver(receiver, speed_code);

		let measured = (|| -> Result<_> {
			let caps = self.read_capabilities(cap, lane, receiver)?;
			let total = caps.total_steps();
			if total == 0 {
				return Err(Error::invalid_state(format!(
					"port {} lane {lane} reports 0 margining steps",
					self.port_number
				)));
			}
			self.registry
				.nrz
				.update(key.clone(), SweepProgress::running(lane, 0, total));
			let mut on_point = |done| {
				self.registry
					.nrz
					.update(key.clone(), SweepProgress::running(lane, done, total));
			};
			let mut result = self.measure_eye(cap, lane, receiver, &caps, &mut on_point)?;
			result.sweep_time_ms = millis_since(&*self.clock, started);
			Ok(result)
		})();

		match measured {
			Ok(result) => {
				self.reset_lane_at(cap, lane, reset_receiver)?;
				Ok(result)
			}
			Err(err) => {
				self.reset_best_effort(cap, lane, &[reset_receiver]);
				Err(err)
			}
		}
	}

	/// Sweeps all three PAM4 eyes of `lane`. Requires a 64 GT/s link.
	pub fn sweep_lane_pam4(&self, lane: u8) -> Result<Pam4SweepResult> {
		self.claim(&self.registry.pam4, lane)?;
		self.run_sweep_pam4(lane)
	}

	fn run_sweep_pam4(&self, lane: u8) -> Result<Pam4SweepResult> {
		let key = self.key(lane);
		let started = self.clock.now();
		tracing::info!(port = self.port_number, lane, "PAM4 margin sweep started");
		match self.pam4_body(lane, &key, started) {
			Ok(result) => {
				let total = result.upper.capabilities.total_steps() * 3;
				self.registry
					.pam4
					.complete(key, SweepProgress::complete(lane, total), result.clone());
				tracing::info!(
					port = self.port_number,
					lane,
					worst_width_ui = result.worst_eye_width_ui,
					worst_height_mv = result.worst_eye_height_mv,
					balanced = result.is_balanced,
					"PAM4 margin sweep complete"
				);
				Ok(result)
			}
			Err(err) => {
				tracing::error!(port = self.port_number, lane, "PAM4 margin sweep failed: {err}");
				self.registry.pam4.modify(&key, |p| p.fail(err.to_string()));
				Err(err)
			}
		}
	}

	fn pam4_body(&self, lane: u8, key: &SweepKey, started: Duration) -> Result<Pam4SweepResult> {
		let cap = self.margining_offset()?;
		let link = self.check_ready(cap)?;
		if link.current_speed != Some(LinkSpeed::Gen6) {
			return Err(Error::invalid_state(format!(
				"PAM4 margining requires a 64 GT/s link, port {} is at {}",
				self.port_number,
				link.current_speed
					.map_or_else(|| "an unknown speed".to_owned(), |s| s.to_string())
			)));
		}

		let measured = (|| -> Result<_> {
			// some receivers only answer report commands on receiver A
			let caps = self.read_capabilities(cap, lane, MarginingReceiver::ReceiverA)?;
			self.reset_lane_at(cap, lane, MarginingReceiver::Pam4Broadcast)?;
			let per_eye = caps.total_steps();
			if per_eye == 0 {
				return Err(Error::invalid_state(format!(
					"port {} lane {lane} reports 0 margining steps",
					self.port_number
				)));
			}
			let total = per_eye * 3;
			self.registry
				.pam4
				.update(key.clone(), SweepProgress::running(lane, 0, total));

			let measure = |eye: u32, receiver: MarginingReceiver| {
				let mut on_point = |done| {
					self.registry.pam4.update(
						key.clone(),
						SweepProgress::running(lane, eye * per_eye + done, total),
					);
				};
				let result = self.measure_eye(cap, lane, receiver, &caps, &mut on_point)?;
				self.reset_lane_at(cap, lane, receiver)?;
				tracing::debug!(
					port = self.port_number,
					lane,
					?receiver,
					width_ui = result.eye_width_ui,
					height_mv = result.eye_height_mv,
					"PAM4 eye measured"
				);
				Ok::<_, Error>(result)
			};
			let upper = measure(0, MarginingReceiver::ReceiverA)?;
			let middle = measure(1, MarginingReceiver::ReceiverB)?;
			let lower = measure(2, MarginingReceiver::ReceiverC)?;
			Ok(Pam4SweepResult::new(
				lane,
				[upper, middle, lower],
				millis_since(&*self.clock, started),
			))
		})();

		if measured.is_err() {
			self.reset_best_effort(cap, lane, &MarginingReceiver::PAM4_EYES);
		}
		measured
	}
}

impl<D: RegisterAccess + Send + 'static> LaneMarginingEngine<D> {
	/// Claims the lane and runs [`Self::sweep_lane`] on a worker thread.
	///
	/// Conflicts are reported here; every later failure lands in the
	/// registry's progress entry as well as in the joined result. A running
	/// sweep cannot be cancelled.
	pub fn spawn_sweep(
		self,
		lane: u8,
		receiver: MarginingReceiver,
	) -> Result<thread::JoinHandle<Result<EyeSweepResult>>> {
		self.claim(&self.registry.nrz, lane)?;
		let registry = Arc::clone(&self.registry);
		let key = self.key(lane);
		thread::Builder::new()
			.name(format!("margin-p{}-l{lane}", self.port_number))
			.spawn(move || self.run_sweep(lane, receiver))
			.map_err(|err| {
				let msg = format!("failed to start sweep worker: {err}");
				registry.nrz.modify(&key, |p| p.fail(msg.clone()));
				Error::invalid_state(msg)
			})
	}

	/// PAM4 counterpart of [`Self::spawn_sweep`].
	pub fn spawn_sweep_pam4(self, lane: u8) -> Result<thread::JoinHandle<Result<Pam4SweepResult>>> {
		self.claim(&self.registry.pam4, lane)?;
		let registry = Arc::clone(&self.registry);
		let key = self.key(lane);
		thread::Builder::new()
			.name(format!("margin-pam4-p{}-l{lane}", self.port_number))
			.spawn(move || self.run_sweep_pam4(lane))
			.map_err(|err| {
				let msg = format!("failed to start sweep worker: {err}");
				registry.pam4.modify(&key, |p| p.fail(msg.clone()));
				Error::invalid_state(msg)
			})
	}
}
