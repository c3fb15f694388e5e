//! Run configuration and result records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
	ltssm::regs::MAX_PORT,
	registry::{Progress, RunStatus},
	Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
	Pass,
	Fail,
	Warn,
	Skip,
	Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteId {
	LinkTraining,
	ErrorAudit,
	ConfigAudit,
	SignalIntegrity,
}

impl SuiteId {
	pub const ALL: [Self; 4] = [
		Self::LinkTraining,
		Self::ErrorAudit,
		Self::ConfigAudit,
		Self::SignalIntegrity,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::LinkTraining => "Link Training",
			Self::ErrorAudit => "Error Audit",
			Self::ConfigAudit => "Configuration Audit",
			Self::SignalIntegrity => "Signal Integrity",
		}
	}

	/// Rough number of results one port produces, for progress reporting.
	pub(crate) fn estimated_tests(self, num_lanes: u8) -> u32 {
		match self {
			Self::LinkTraining => 8,
			Self::ErrorAudit => 3,
			Self::ConfigAudit => 4,
			Self::SignalIntegrity => 2 * num_lanes as u32 + 2,
		}
	}
}

/// Outcome of one check.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestResult {
	pub test_id: String,
	pub test_name: String,
	pub suite_id: SuiteId,
	pub verdict: Verdict,
	pub spec_reference: String,
	pub criteria: String,
	pub message: String,
	pub measured_values: Map<String, Value>,
	pub duration_ms: f64,
	pub port_number: u8,
	pub lane: Option<u8>,
}

impl TestResult {
	/// A result with no verdict yet recorded, which reads as `Error`.
	pub(crate) fn new(
		suite_id: SuiteId,
		test_id: &str,
		test_name: impl Into<String>,
		spec_reference: &str,
		port_number: u8,
	) -> Self {
		Self {
			test_id: test_id.to_owned(),
			test_name: test_name.into(),
			suite_id,
			verdict: Verdict::Error,
			spec_reference: spec_reference.to_owned(),
			criteria: String::new(),
			message: String::new(),
			measured_values: Map::new(),
			duration_ms: 0.0,
			port_number,
			lane: None,
		}
	}

	#[must_use]
	pub(crate) fn verdict(mut self, verdict: Verdict, message: impl Into<String>) -> Self {
		self.verdict = verdict;
		self.message = message.into();
		self
	}

	#[must_use]
	pub(crate) fn error(self, err: &Error) -> Self {
		self.verdict(Verdict::Error, err.to_string())
	}

	#[must_use]
	pub(crate) fn criteria(mut self, criteria: impl Into<String>) -> Self {
		self.criteria = criteria.into();
		self
	}

	/// Non-object values are ignored.
	#[must_use]
	pub(crate) fn measured(mut self, values: Value) -> Self {
		if let Value::Object(map) = values {
			self.measured_values = map;
		}
		self
	}

	#[must_use]
	pub(crate) fn lane(mut self, lane: u8) -> Self {
		self.lane = Some(lane);
		self
	}

	#[must_use]
	pub(crate) fn duration_ms(mut self, duration_ms: f64) -> Self {
		self.duration_ms = duration_ms;
		self
	}
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct VerdictCounts {
	pub pass: usize,
	pub fail: usize,
	pub warn: usize,
	pub skip: usize,
	pub error: usize,
}

impl VerdictCounts {
	pub fn tally<'a>(tests: impl IntoIterator<Item = &'a TestResult>) -> Self {
		let mut counts = Self::default();
		for test in tests {
			match test.verdict {
				Verdict::Pass => counts.pass += 1,
				Verdict::Fail => counts.fail += 1,
				Verdict::Warn => counts.warn += 1,
				Verdict::Skip => counts.skip += 1,
				Verdict::Error => counts.error += 1,
			}
		}
		counts
	}
}

/// Fail outranks Error, which outranks Warn. A cancelled run is Skip.
pub fn overall_verdict<'a>(tests: impl IntoIterator<Item = &'a TestResult>, cancelled: bool) -> Verdict {
	if cancelled {
		return Verdict::Skip;
	}
	let counts = VerdictCounts::tally(tests);
	if counts.fail > 0 {
		Verdict::Fail
	} else if counts.error > 0 {
		Verdict::Error
	} else if counts.warn > 0 {
		Verdict::Warn
	} else {
		Verdict::Pass
	}
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestSuiteResult {
	pub suite_id: SuiteId,
	pub suite_name: String,
	pub tests: Vec<TestResult>,
	pub counts: VerdictCounts,
}

impl TestSuiteResult {
	pub(crate) fn new(suite_id: SuiteId, tests: Vec<TestResult>) -> Self {
		Self {
			suite_id,
			suite_name: suite_id.name().to_owned(),
			counts: VerdictCounts::tally(&tests),
			tests,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
	/// Global port number, 0-143.
	pub port_number: u8,
	/// 1-16.
	pub num_lanes: u8,
}

impl Default for PortConfig {
	fn default() -> Self {
		Self {
			port_number: 0,
			num_lanes: 16,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRunConfig {
	pub suites: Vec<SuiteId>,
	pub ports: Vec<PortConfig>,
	/// Idle period of the recovery and error-free checks, 1-60 s.
	pub idle_wait_s: f64,
	/// Wait after each speed change before the link is read, 0.5-10 s.
	pub speed_settle_s: f64,
	pub retrain_timeout_s: f64,
	/// A lane whose eye is this many percent below the lane average is an
	/// outlier.
	pub lane_outlier_percent: f64,
}

impl Default for TestRunConfig {
	fn default() -> Self {
		Self {
			suites: SuiteId::ALL.to_vec(),
			ports: vec![PortConfig::default()],
			idle_wait_s: 5.0,
			speed_settle_s: 2.0,
			retrain_timeout_s: 10.0,
			lane_outlier_percent: super::thresholds::LANE_OUTLIER_PERCENT,
		}
	}
}

impl TestRunConfig {
	pub fn validate(&self) -> Result<()> {
		fn in_range(name: &str, val: f64, min: f64, max: f64) -> Result<()> {
			if (min..=max).contains(&val) {
				Ok(())
			} else {
				Err(Error::invalid_argument(format!(
					"{name} must be between {min} and {max}, got {val}"
				)))
			}
		}
		in_range("idle_wait_s", self.idle_wait_s, 1.0, 60.0)?;
		in_range("speed_settle_s", self.speed_settle_s, 0.5, 10.0)?;
		in_range("retrain_timeout_s", self.retrain_timeout_s, 0.1, 300.0)?;
		in_range("lane_outlier_percent", self.lane_outlier_percent, 0.0, 100.0)?;
		for port in &self.ports {
			if port.port_number > MAX_PORT {
				return Err(Error::invalid_argument(format!(
					"port number {} is out of range (0-{MAX_PORT})",
					port.port_number
				)));
			}
			if !(1..=16).contains(&port.num_lanes) {
				return Err(Error::invalid_argument(format!(
					"port {} lane count must be 1-16, got {}",
					port.port_number, port.num_lanes
				)));
			}
		}
		Ok(())
	}
}

/// Eye measured on one lane. At 64 GT/s the dimensions are those of the
/// worst of the three eyes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LaneMeasurement {
	pub lane: u8,
	pub eye_width_ui: f64,
	pub eye_height_mv: f64,
	pub eye_width_steps: u32,
	pub eye_height_steps: u32,
	/// Per-eye dimensions, upper eye first. Empty for NRZ lanes.
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub pam4_eyes: Vec<EyeDimensions>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub balanced: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EyeDimensions {
	pub eye_width_ui: f64,
	pub eye_height_mv: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestRun {
	pub run_id: String,
	pub device_id: String,
	pub config: TestRunConfig,
	pub suites: Vec<TestSuiteResult>,
	pub overall_verdict: Verdict,
	pub totals: VerdictCounts,
	pub duration_ms: f64,
	/// Lane measurements of the signal integrity suite, keyed by port
	/// number.
	pub eye_data: BTreeMap<u8, Vec<LaneMeasurement>>,
}

impl TestRun {
	pub fn tests(&self) -> impl Iterator<Item = &TestResult> {
		self.suites.iter().flat_map(|suite| &suite.tests)
	}

	pub fn to_json(&self) -> serde_json::Result<String> {
		serde_json::to_string_pretty(self)
	}
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RunProgress {
	pub status: RunStatus,
	pub current_suite: String,
	pub current_test: String,
	pub tests_completed: u32,
	pub tests_total: u32,
	pub percent: f64,
	pub elapsed_ms: f64,
	pub error: Option<String>,
	#[serde(skip)]
	pub(crate) cancel_requested: bool,
}

impl Progress for RunProgress {
	fn status(&self) -> RunStatus {
		self.status
	}
}
