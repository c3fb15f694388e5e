//! Sweep results and the eye arithmetic built on them.

use serde::Serialize;

use super::regs::{MarginCommand, MarginingReceiver};
use crate::registry::{Progress, RunStatus};

/// Heights of the three PAM4 eyes may differ from their mean by this
/// fraction of the mean.
pub const BALANCE_TOLERANCE: f64 = 0.20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
	Right,
	Left,
	Up,
	Down,
}

impl Direction {
	pub const SWEEP_ORDER: [Self; 4] = [Self::Right, Self::Left, Self::Up, Self::Down];

	pub fn is_timing(self) -> bool {
		matches!(self, Self::Right | Self::Left)
	}

	/// Left and down set the direction bit of the margin payload.
	pub fn is_negative(self) -> bool {
		matches!(self, Self::Left | Self::Down)
	}

	pub fn command(self) -> MarginCommand {
		if self.is_timing() {
			MarginCommand::MarginTiming
		} else {
			MarginCommand::MarginVoltage
		}
	}
}

/// Outcome of one timing or voltage offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct MarginPoint {
	pub direction: Direction,
	pub step: u8,
	pub margin_value: u8,
	pub status_code: u8,
	pub passed: bool,
	/// No matching response arrived before the poll timeout. Such points are
	/// never passed.
	pub timed_out: bool,
}

/// Receiver capabilities reported through the margining report commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LaneMarginCapabilities {
	pub max_timing_offset: u8,
	pub max_voltage_offset: u8,
	pub num_timing_steps: u8,
	pub num_voltage_steps: u8,
	pub sample_count: u8,
	pub sample_rate_voltage: bool,
	pub sample_rate_timing: bool,
	pub ind_up_down_voltage: bool,
	pub ind_left_right_timing: bool,
}

impl LaneMarginCapabilities {
	pub fn steps(&self, direction: Direction) -> u8 {
		if direction.is_timing() {
			self.num_timing_steps
		} else {
			self.num_voltage_steps
		}
	}

	/// Number of points in a full sweep of one receiver.
	pub fn total_steps(&self) -> u32 {
		2 * (self.num_timing_steps as u32 + self.num_voltage_steps as u32)
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EyeSweepResult {
	pub lane: u8,
	pub receiver: MarginingReceiver,
	pub timing_points: Vec<MarginPoint>,
	pub voltage_points: Vec<MarginPoint>,
	pub capabilities: LaneMarginCapabilities,
	pub eye_width_steps: u32,
	pub eye_height_steps: u32,
	pub eye_width_ui: f64,
	pub eye_height_mv: f64,
	pub sweep_time_ms: f64,
}

impl EyeSweepResult {
	pub(crate) fn from_points(
		lane: u8,
		receiver: MarginingReceiver,
		capabilities: LaneMarginCapabilities,
		timing_points: Vec<MarginPoint>,
		voltage_points: Vec<MarginPoint>,
		sweep_time_ms: f64,
	) -> Self {
		let eye_width_steps = max_passed_step(&timing_points, Direction::Right) as u32
			+ max_passed_step(&timing_points, Direction::Left) as u32;
		let eye_height_steps = max_passed_step(&voltage_points, Direction::Up) as u32
			+ max_passed_step(&voltage_points, Direction::Down) as u32;
		Self {
			lane,
			receiver,
			eye_width_ui: steps_to_timing_ui(eye_width_steps, capabilities.num_timing_steps),
			eye_height_mv: steps_to_voltage_mv(eye_height_steps, capabilities.num_voltage_steps),
			timing_points,
			voltage_points,
			capabilities,
			eye_width_steps,
			eye_height_steps,
			sweep_time_ms,
		}
	}
}

/// Largest passing step in `direction`, 0 when no point passed.
pub fn max_passed_step(points: &[MarginPoint], direction: Direction) -> u8 {
	points
		.iter()
		.filter(|p| p.direction == direction && p.passed)
		.map(|p| p.step)
		.max()
		.unwrap_or(0)
}

pub fn steps_to_timing_ui(steps: u32, num_steps: u8) -> f64 {
	if num_steps == 0 {
		return 0.0;
	}
	steps as f64 / num_steps as f64 * 0.5
}

pub fn steps_to_voltage_mv(steps: u32, num_steps: u8) -> f64 {
	if num_steps == 0 {
		return 0.0;
	}
	steps as f64 / num_steps as f64 * 500.0
}

/// Whether each eye height lies within [`BALANCE_TOLERANCE`] of the mean.
pub fn check_balance(heights: [f64; 3]) -> bool {
	let avg = heights.iter().sum::<f64>() / 3.0;
	if avg == 0.0 {
		return true;
	}
	heights
		.iter()
		.all(|h| (h - avg).abs() <= avg * BALANCE_TOLERANCE)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Pam4SweepResult {
	pub lane: u8,
	pub upper: EyeSweepResult,
	pub middle: EyeSweepResult,
	pub lower: EyeSweepResult,
	pub worst_eye_width_ui: f64,
	pub worst_eye_height_mv: f64,
	pub is_balanced: bool,
	pub total_sweep_time_ms: f64,
}

impl Pam4SweepResult {
	pub(crate) fn new(lane: u8, [upper, middle, lower]: [EyeSweepResult; 3], total_sweep_time_ms: f64) -> Self {
		let widths = [upper.eye_width_ui, middle.eye_width_ui, lower.eye_width_ui];
		let heights = [upper.eye_height_mv, middle.eye_height_mv, lower.eye_height_mv];
		Self {
			lane,
			worst_eye_width_ui: widths.into_iter().fold(f64::INFINITY, f64::min),
			worst_eye_height_mv: heights.into_iter().fold(f64::INFINITY, f64::min),
			is_balanced: check_balance(heights),
			upper,
			middle,
			lower,
			total_sweep_time_ms,
		}
	}

	pub fn eyes(&self) -> [(&'static str, &EyeSweepResult); 3] {
		[
			("upper", &self.upper),
			("middle", &self.middle),
			("lower", &self.lower),
		]
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SweepProgress {
	pub status: RunStatus,
	pub lane: u8,
	pub current_step: u32,
	pub total_steps: u32,
	pub percent: f64,
	pub error: Option<String>,
}

impl SweepProgress {
	pub fn idle(lane: u8) -> Self {
		Self {
			lane,
			..Self::default()
		}
	}

	pub(crate) fn running(lane: u8, current_step: u32, total_steps: u32) -> Self {
		Self {
			status: RunStatus::Running,
			lane,
			current_step,
			total_steps,
			percent: percent(current_step, total_steps),
			error: None,
		}
	}

	pub(crate) fn complete(lane: u8, total_steps: u32) -> Self {
		Self {
			status: RunStatus::Complete,
			lane,
			current_step: total_steps,
			total_steps,
			percent: 100.0,
			error: None,
		}
	}

	pub(crate) fn fail(&mut self, error: String) {
		self.status = RunStatus::Error;
		self.error = Some(error);
	}
}

impl Progress for SweepProgress {
	fn status(&self) -> RunStatus {
		self.status
	}
}

fn percent(current: u32, total: u32) -> f64 {
	if total == 0 {
		0.0
	} else {
		current as f64 / total as f64 * 100.0
	}
}
