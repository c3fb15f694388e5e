//! T2.x: AER status, error reporting enables and error-free idle operation.

use std::time::Duration;

use serde_json::json;

use super::{
	model::{SuiteId, TestResult, Verdict},
	PortContext,
};
use crate::{clock::millis_since, config::ConfigSpace, ext_cpb::aer::AerStatus, RegisterAccess, Result};

const SUITE: SuiteId = SuiteId::ErrorAudit;

pub fn run<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> Vec<TestResult> {
	vec![
		aer_error_audit(config, ctx),
		error_reporting_enables(config, ctx),
		error_free_operation(config, ctx),
	]
}

/// Fail on uncorrectable bits, Warn on correctable bits only.
fn classify(aer: &AerStatus) -> (Verdict, String) {
	if aer.uncorrectable_raw != 0 {
		(
			Verdict::Fail,
			format!(
				"Uncorrectable errors active: {:#010X} ({})",
				aer.uncorrectable_raw,
				aer.uncorrectable_names().join(", ")
			),
		)
	} else if aer.correctable_raw != 0 {
		(
			Verdict::Warn,
			format!(
				"Correctable errors active: {:#010X} ({})",
				aer.correctable_raw,
				aer.correctable_names().join(", ")
			),
		)
	} else {
		(Verdict::Pass, "No AER errors active".to_owned())
	}
}

/// T2.1: no AER status bits set right now.
pub fn aer_error_audit<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T2.1",
		"AER Error Audit",
		"PCIe 6.0.1 Section 7.8.4",
		ctx.port.port_number,
	);
	let result = match config.get_aer_status() {
		Ok(None) => result.verdict(Verdict::Skip, "AER capability not present"),
		Ok(Some(aer)) => {
			let (verdict, message) = classify(&aer);
			result
				.verdict(verdict, message)
				.criteria("No uncorrectable or correctable errors active")
				.measured(json!({
					"uncorrectable_raw": format!("{:#010X}", aer.uncorrectable_raw),
					"correctable_raw": format!("{:#010X}", aer.correctable_raw),
					"first_error_pointer": aer.first_error_pointer,
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

/// T2.2: correctable, non-fatal and fatal error reporting enabled in Device
/// Control.
pub fn error_reporting_enables<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T2.2",
		"Error Reporting Enables",
		"PCIe 6.0.1 Section 7.5.1.1",
		ctx.port.port_number,
	);
	let result = match config.get_device_control() {
		Ok(control) => {
			let enables = [
				("Correctable", control.correctable_error_reporting()),
				("Non-Fatal", control.nonfatal_error_reporting()),
				("Fatal", control.fatal_error_reporting()),
			];
			let disabled: Vec<_> = enables
				.iter()
				.filter(|(_, enabled)| !enabled)
				.map(|(name, _)| *name)
				.collect();
			let result = if disabled.is_empty() {
				result.verdict(Verdict::Pass, "All error reporting enables active")
			} else {
				result.verdict(Verdict::Warn, format!("Disabled: {}", disabled.join(", ")))
			};
			result
				.criteria("Correctable, Non-Fatal, and Fatal error reporting should be enabled")
				.measured(json!({
					"correctable": control.correctable_error_reporting(),
					"non_fatal": control.nonfatal_error_reporting(),
					"fatal": control.fatal_error_reporting(),
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

/// T2.3: clears AER status, idles and checks that nothing new was logged.
pub fn error_free_operation<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let idle = ctx.run.idle_wait_s;
	let result = TestResult::new(
		SUITE,
		"T2.3",
		"Error-Free Operation",
		"PCIe 6.0.1 Section 6.2",
		ctx.port.port_number,
	);
	let outcome = (|| -> Result<Option<AerStatus>> {
		if config.get_aer_status()?.is_none() {
			return Ok(None);
		}
		config.clear_aer_errors()?;
		ctx.clock.sleep(Duration::from_secs_f64(idle));
		config.get_aer_status()
	})();
	let result = match outcome {
		Ok(None) => result.verdict(Verdict::Skip, "AER capability not present"),
		Ok(Some(aer)) => {
			let result = match classify(&aer) {
				(Verdict::Pass, _) => {
					result.verdict(Verdict::Pass, format!("No new errors during {idle}s idle period"))
				}
				(verdict, message) => result.verdict(verdict, format!("New errors: {message}")),
			};
			result.criteria("No new errors during idle period").measured(json!({
				"new_uncorrectable": format!("{:#010X}", aer.uncorrectable_raw),
				"new_correctable": format!("{:#010X}", aer.correctable_raw),
				"idle_wait_s": idle,
			}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}
