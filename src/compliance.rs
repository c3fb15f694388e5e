//! Compliance test runner.
//!
//! A run executes the configured suites in order, each against every
//! configured port, and collects the verdicts into a [`TestRun`]. Individual
//! checks never abort a suite: a failing check becomes an `Error` result. A
//! suite that cannot even start on a port (the port cannot be opened, say)
//! contributes a single `Error` result for that port.

pub mod config_audit;
pub mod error_audit;
pub mod link_training;
pub mod model;
pub mod signal_integrity;
pub mod thresholds;

use std::{collections::BTreeMap, sync::Arc, thread};

use uuid::Uuid;

use crate::{
	clock::{self, millis_since, Clock},
	config::ConfigSpace,
	device::DeviceBus,
	ltssm::{LtssmTracer, RetrainRegistry},
	margin::SweepRegistry,
	registry::{ProgressTable, RunStatus},
	Error, Result,
};
pub use model::{
	overall_verdict, EyeDimensions, LaneMeasurement, PortConfig, RunProgress, SuiteId, TestResult,
	TestRun, TestRunConfig, TestSuiteResult, Verdict, VerdictCounts,
};
pub use thresholds::{eye_threshold, EyeThreshold, LANE_OUTLIER_PERCENT};

/// What a suite needs to know about the port under test.
#[derive(Clone, Copy, Debug)]
pub struct PortContext<'a> {
	pub device_id: &'a str,
	pub port: PortConfig,
	pub run: &'a TestRunConfig,
	pub clock: &'a Arc<dyn Clock>,
}

/// Progress and the latest result of compliance runs, keyed by device.
#[derive(Debug)]
pub struct RunRegistry {
	table: ProgressTable<String, RunProgress, TestRun>,
}

impl RunRegistry {
	pub fn new() -> Self {
		Self {
			table: ProgressTable::new(),
		}
	}

	pub fn progress(&self, device_id: &str) -> RunProgress {
		self.table.progress(&device_id.to_owned()).unwrap_or_default()
	}

	pub fn result(&self, device_id: &str) -> Option<TestRun> {
		self.table.result(&device_id.to_owned())
	}

	/// Asks the running run on `device_id` to stop at the next suite or port
	/// boundary. Returns `false` when nothing is running.
	pub fn cancel(&self, device_id: &str) -> bool {
		let mut requested = false;
		self.table.modify(&device_id.to_owned(), |progress| {
			if progress.status == RunStatus::Running {
				progress.cancel_requested = true;
				requested = true;
			}
		});
		if requested {
			tracing::info!(device = device_id, "compliance run cancellation requested");
		}
		requested
	}

	fn cancel_requested(&self, device_id: &str) -> bool {
		self.table
			.progress(&device_id.to_owned())
			.is_some_and(|progress| progress.cancel_requested)
	}

	/// Unique across registries and processes.
	fn next_run_id(&self, device_id: &str) -> String {
		format!("{device_id}-{}", Uuid::new_v4())
	}
}

impl Default for RunRegistry {
	fn default() -> Self {
		Self::new()
	}
}

/// Executes compliance runs against one switch.
#[derive(Debug)]
pub struct ComplianceRunner<B> {
	bus: B,
	device_id: String,
	runs: Arc<RunRegistry>,
	sweeps: Arc<SweepRegistry>,
	retrains: Arc<RetrainRegistry>,
	clock: Arc<dyn Clock>,
}

impl<B: DeviceBus> ComplianceRunner<B> {
	pub fn new(bus: B, device_id: impl Into<String>) -> Self {
		Self {
			bus,
			device_id: device_id.into(),
			runs: Arc::default(),
			sweeps: Arc::default(),
			retrains: Arc::default(),
			clock: clock::system(),
		}
	}

	/// Shares progress tables with other users of the same switch.
	#[must_use]
	pub fn with_registries(
		mut self,
		runs: Arc<RunRegistry>,
		sweeps: Arc<SweepRegistry>,
		retrains: Arc<RetrainRegistry>,
	) -> Self {
		self.runs = runs;
		self.sweeps = sweeps;
		self.retrains = retrains;
		self
	}

	#[must_use]
	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = clock;
		self
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	pub fn registry(&self) -> &Arc<RunRegistry> {
		&self.runs
	}

	/// Runs `config` to completion on the calling thread. Fails only on an
	/// invalid configuration or when a run on the same device is already in
	/// progress.
	pub fn run(&self, config: &TestRunConfig) -> Result<TestRun> {
		self.claim(config)?;
		Ok(self.execute(config))
	}

	fn claim(&self, config: &TestRunConfig) -> Result<()> {
		config.validate()?;
		let tests_total = config
			.suites
			.iter()
			.flat_map(|suite| config.ports.iter().map(|port| suite.estimated_tests(port.num_lanes)))
			.sum();
		self.runs.table.claim(
			self.device_id.clone(),
			RunProgress {
				status: RunStatus::Running,
				tests_total,
				..RunProgress::default()
			},
			false,
			&format!("compliance run on {}", self.device_id),
		)
	}

	fn execute(&self, config: &TestRunConfig) -> TestRun {
		let key = &self.device_id;
		let started = self.clock.now();
		let run_id = self.runs.next_run_id(key);
		tracing::info!(
			device = %key,
			%run_id,
			suites = config.suites.len(),
			ports = config.ports.len(),
			"compliance run started"
		);

		let mut suites = Vec::new();
		let mut eye_data = BTreeMap::new();
		let mut completed = 0_u32;
		let mut cancelled = false;
		for &suite in &config.suites {
			let mut tests = Vec::new();
			for &port in &config.ports {
				if self.runs.cancel_requested(key) {
					cancelled = true;
					break;
				}
				self.runs.table.modify(key, |progress| {
					progress.current_suite = suite.name().to_owned();
					progress.current_test = format!("port {}", port.port_number);
				});
				let ctx = PortContext {
					device_id: key,
					port,
					run: config,
					clock: &self.clock,
				};
				let results = self
					.run_suite(suite, &ctx, &mut eye_data)
					.unwrap_or_else(|err| {
						tracing::error!(device = %key, port = port.port_number, ?suite, "suite failed: {err}");
						vec![suite_error(suite, port.port_number, &err)]
					});
				completed += results.len() as u32;
				let elapsed_ms = millis_since(&*self.clock, started);
				self.runs.table.modify(key, |progress| {
					progress.tests_completed = completed;
					progress.tests_total = progress.tests_total.max(completed);
					progress.percent = f64::from(completed) / f64::from(progress.tests_total) * 100.0;
					progress.elapsed_ms = elapsed_ms;
				});
				tests.extend(results);
			}
			if !tests.is_empty() {
				suites.push(TestSuiteResult::new(suite, tests));
			}
			if cancelled {
				break;
			}
		}

		let duration_ms = millis_since(&*self.clock, started);
		let tests = || suites.iter().flat_map(|suite| &suite.tests);
		let run = TestRun {
			run_id,
			device_id: key.clone(),
			config: config.clone(),
			overall_verdict: overall_verdict(tests(), cancelled),
			totals: VerdictCounts::tally(tests()),
			duration_ms,
			eye_data,
			suites,
		};
		tracing::info!(
			device = %key,
			run_id = %run.run_id,
			verdict = ?run.overall_verdict,
			cancelled,
			duration_ms,
			"compliance run finished"
		);
		let last = self.runs.progress(key);
		let progress = if cancelled {
			RunProgress {
				status: RunStatus::Cancelled,
				current_suite: last.current_suite,
				current_test: last.current_test,
				tests_completed: completed,
				tests_total: last.tests_total,
				percent: last.percent,
				elapsed_ms: duration_ms,
				..RunProgress::default()
			}
		} else {
			RunProgress {
				status: RunStatus::Complete,
				tests_completed: completed,
				tests_total: completed,
				percent: 100.0,
				elapsed_ms: duration_ms,
				..RunProgress::default()
			}
		};
		self.runs.table.complete(key.clone(), progress, run.clone());
		run
	}

	fn run_suite(
		&self,
		suite: SuiteId,
		ctx: &PortContext<'_>,
		eye_data: &mut BTreeMap<u8, Vec<LaneMeasurement>>,
	) -> Result<Vec<TestResult>> {
		let port = ctx.port.port_number;
		match suite {
			SuiteId::LinkTraining => {
				let config = ConfigSpace::new(self.bus.open_port(port)?);
				let tracer = LtssmTracer::open(&self.bus, ctx.device_id, port, Arc::clone(&self.retrains))?
					.with_clock(Arc::clone(&self.clock));
				Ok(link_training::run(&config, &tracer, ctx))
			}
			SuiteId::ErrorAudit => {
				let config = ConfigSpace::new(self.bus.open_port(port)?);
				Ok(error_audit::run(&config, ctx))
			}
			SuiteId::ConfigAudit => {
				let config = ConfigSpace::new(self.bus.open_port(port)?);
				Ok(config_audit::run(&config, ctx))
			}
			SuiteId::SignalIntegrity => {
				let (results, measurements) = signal_integrity::run(&self.bus, &self.sweeps, ctx)?;
				if !measurements.is_empty() {
					eye_data.insert(port, measurements);
				}
				Ok(results)
			}
		}
	}
}

impl<B: DeviceBus + Send + 'static> ComplianceRunner<B> {
	/// Claims the device and runs `config` on a worker thread. Invalid
	/// configurations and conflicts are reported here.
	pub fn spawn(self, config: TestRunConfig) -> Result<thread::JoinHandle<TestRun>> {
		self.claim(&config)?;
		let runs = Arc::clone(&self.runs);
		let key = self.device_id.clone();
		thread::Builder::new()
			.name(format!("compliance-{}", self.device_id))
			.spawn(move || self.execute(&config))
			.map_err(|err| {
				let msg = format!("failed to start compliance worker: {err}");
				runs.table.modify(&key, |progress| {
					progress.status = RunStatus::Error;
					progress.error = Some(msg.clone());
				});
				Error::invalid_state(msg)
			})
	}
}

fn suite_error(suite: SuiteId, port: u8, err: &Error) -> TestResult {
	let test_id = match suite {
		SuiteId::LinkTraining => "T1",
		SuiteId::ErrorAudit => "T2",
		SuiteId::ConfigAudit => "T3",
		SuiteId::SignalIntegrity => "T4",
	};
	TestResult::new(suite, test_id, format!("{} Setup", suite.name()), "", port).error(err)
}
