//! T1.x: speed negotiation, LTSSM behaviour, equalization and recovery
//! baseline.

use std::time::Duration;

use serde_json::json;

use super::{
	model::{SuiteId, TestResult, Verdict},
	PortContext,
};
use crate::{
	clock::millis_since,
	config::{cpb::pcie::LinkSpeed, ConfigSpace},
	ltssm::{LtssmTracer, RetrainWatchResult},
	RegisterAccess, Result,
};

const SUITE: SuiteId = SuiteId::LinkTraining;

/// Runs T1.1 through T1.4 for one port.
pub fn run<D: RegisterAccess, M: RegisterAccess>(
	config: &ConfigSpace<D>,
	tracer: &LtssmTracer<M>,
	ctx: &PortContext<'_>,
) -> Vec<TestResult> {
	let mut results = speed_negotiation(config, ctx);
	results.push(ltssm_validation(tracer, ctx));
	results.extend(eq_phase_verification(config, ctx));
	results.push(recovery_baseline(tracer, ctx));
	results
}

/// T1.1: trains the link at every supported speed, then restores the
/// original target speed.
pub fn speed_negotiation<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> Vec<TestResult> {
	let start = ctx.clock.now();
	let port = ctx.port.port_number;
	let setup = config
		.get_supported_speeds()
		.and_then(|speeds| Ok((speeds, config.get_link_status()?)));
	let (speeds, original) = match setup {
		Ok(setup) => setup,
		Err(err) => {
			return vec![TestResult::new(SUITE, "T1.1", "Speed Negotiation", "PCIe 6.0.1 Section 7.5.3.6", port)
				.error(&err)
				.duration_ms(millis_since(&**ctx.clock, start))];
		}
	};

	let settle = Duration::from_secs_f64(ctx.run.speed_settle_s);
	let results = speeds
		.speeds()
		.into_iter()
		.map(|speed| {
			let start = ctx.clock.now();
			let result = TestResult::new(
				SUITE,
				"T1.1",
				format!("Speed Negotiation ({})", speed_label(speed)),
				"PCIe 6.0.1 Section 7.5.3.6",
				port,
			);
			let outcome = (|| -> Result<_> {
				config.set_target_link_speed(speed.code())?;
				config.retrain_link()?;
				ctx.clock.sleep(settle);
				config.get_link_status()
			})();
			let result = match outcome {
				Ok(status) => {
					let achieved = status
						.current_speed
						.map_or_else(|| "Unknown".to_owned(), speed_label);
					let result = if status.current_speed == Some(speed) {
						result.verdict(Verdict::Pass, format!("Link trained to {achieved} as expected"))
					} else {
						result.verdict(
							Verdict::Fail,
							format!("Expected {}, achieved {achieved}", speed_label(speed)),
						)
					};
					result.criteria(format!("Link must train to {}", speed_label(speed))).measured(json!({
						"target_speed": speed_label(speed),
						"achieved_speed": achieved,
						"width": status.current_width,
					}))
				}
				Err(err) => result.error(&err),
			};
			result.duration_ms(millis_since(&**ctx.clock, start))
		})
		.collect();

	if let Some(target) = original.target_speed {
		let restore = (|| -> Result<()> {
			config.set_target_link_speed(target.code())?;
			config.retrain_link()?;
			ctx.clock.sleep(settle);
			Ok(())
		})();
		if let Err(err) = restore {
			tracing::warn!(port, "restoring target link speed failed: {err}");
		}
	}
	results
}

fn speed_label(speed: LinkSpeed) -> String {
	format!("Gen{}", speed.generation())
}

/// T1.2 verdict for a finished retrain watch.
pub fn ltssm_verdict(watch: &RetrainWatchResult) -> (Verdict, String) {
	if watch.final_state.is_l0() && watch.settled {
		(
			Verdict::Pass,
			format!(
				"LTSSM reached L0 after {} transitions in {:.0} ms",
				watch.transitions.len(),
				watch.duration_ms
			),
		)
	} else if watch.reached_l0() {
		(
			Verdict::Warn,
			"Reached L0 but did not settle (may have left L0 briefly)".to_owned(),
		)
	} else {
		(
			Verdict::Fail,
			format!("Did not reach L0. Final state: {}", watch.final_state_name),
		)
	}
}

/// T1.2: retrains the link and checks that the LTSSM settles in L0.
pub fn ltssm_validation<M: RegisterAccess>(tracer: &LtssmTracer<M>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T1.2",
		"LTSSM State Validation",
		"PCIe 6.0.1 Section 4.2.6",
		ctx.port.port_number,
	);
	let result = match tracer.retrain_and_watch(Duration::from_secs_f64(ctx.run.retrain_timeout_s)) {
		Ok(watch) => {
			let (verdict, message) = ltssm_verdict(&watch);
			let names: Vec<_> = watch.transitions.iter().map(|t| t.state_name.as_str()).collect();
			result
				.verdict(verdict, message)
				.criteria("Link must follow legal LTSSM sequence and reach L0")
				.measured(json!({
					"transitions": watch.transitions.len(),
					"state_sequence": names,
					"final_state": watch.final_state_name,
					"duration_ms": watch.duration_ms,
					"settled": watch.settled,
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

/// T1.3: equalization phase results at 8 GT/s and above.
pub fn eq_phase_verification<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> Vec<TestResult> {
	let start = ctx.clock.now();
	let port = ctx.port.port_number;
	let results = match eq_phase_results(config, port) {
		Ok(results) => results,
		Err(err) => vec![TestResult::new(SUITE, "T1.3", "EQ Phase Verification", "PCIe 6.0.1 Section 4.2.3", port)
			.error(&err)],
	};
	let elapsed = millis_since(&**ctx.clock, start);
	results
		.into_iter()
		.map(|result| result.duration_ms(elapsed))
		.collect()
}

fn eq_phase_results<D: RegisterAccess>(config: &ConfigSpace<D>, port: u8) -> Result<Vec<TestResult>> {
	const REF: &str = "PCIe 6.0.1 Section 4.2.3";
	let status = config.get_link_status()?;
	let current = status.current_speed;
	if current.map_or(true, |speed| speed < LinkSpeed::Gen3) {
		let current = current.map_or_else(|| "unknown".to_owned(), speed_label);
		return Ok(vec![TestResult::new(SUITE, "T1.3", "EQ Phase Verification", REF, port)
			.verdict(
				Verdict::Skip,
				format!("Current speed {current} < Gen3, EQ not applicable"),
			)
			.criteria("EQ required at 8GT/s+")]);
	}

	let mut results = Vec::new();
	if let Some(eq) = config.get_eq_status_16gt()? {
		let phase = |ok: bool| if ok { "OK" } else { "FAIL" };
		let (verdict, message) = if eq.complete() && eq.all_phases_success() {
			(Verdict::Pass, "16GT EQ: all phases (1/2/3) completed successfully".to_owned())
		} else if eq.complete() {
			(
				Verdict::Warn,
				format!(
					"16GT EQ complete but phases: P1={} P2={} P3={}",
					phase(eq.phase1_success()),
					phase(eq.phase2_success()),
					phase(eq.phase3_success())
				),
			)
		} else {
			(Verdict::Fail, "16GT EQ not complete".to_owned())
		};
		results.push(
			TestResult::new(SUITE, "T1.3", "EQ Phase Verification (16GT)", REF, port)
				.verdict(verdict, message)
				.criteria("EQ phases must complete successfully")
				.measured(json!({
					"complete": eq.complete(),
					"phase1": eq.phase1_success(),
					"phase2": eq.phase2_success(),
					"phase3": eq.phase3_success(),
				})),
		);
	}

	if current >= Some(LinkSpeed::Gen5) {
		if let Some(eq) = config.get_eq_status_32gt()? {
			let status = eq.status;
			let (verdict, message) = if status.complete() && status.phase1_success() {
				(Verdict::Pass, "32GT EQ completed successfully")
			} else if eq.cpbs.no_eq_needed() {
				(Verdict::Pass, "32GT EQ: device reports no equalization needed")
			} else if status.complete() {
				(Verdict::Warn, "32GT EQ complete but not all phases succeeded")
			} else {
				(Verdict::Fail, "32GT EQ not complete")
			};
			results.push(
				TestResult::new(SUITE, "T1.3", "EQ Phase Verification (32GT)", REF, port)
					.verdict(verdict, message)
					.criteria("32GT EQ must complete")
					.measured(json!({
						"complete": status.complete(),
						"phase1": status.phase1_success(),
						"phase2": status.phase2_success(),
						"phase3": status.phase3_success(),
						"no_eq_needed": eq.cpbs.no_eq_needed(),
					})),
			);
		}
	}

	if results.is_empty() {
		results.push(
			TestResult::new(SUITE, "T1.3", "EQ Phase Verification", REF, port)
				.verdict(Verdict::Skip, "No EQ capability registers found"),
		);
	}
	Ok(results)
}

/// T1.4: no recovery entries during an idle period.
pub fn recovery_baseline<M: RegisterAccess>(tracer: &LtssmTracer<M>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let idle = ctx.run.idle_wait_s;
	let result = TestResult::new(
		SUITE,
		"T1.4",
		"Recovery Count Baseline",
		"PCIe 6.0.1 Section 4.2.6.3",
		ctx.port.port_number,
	);
	let outcome = (|| -> Result<_> {
		tracer.clear_recovery_count()?;
		ctx.clock.sleep(Duration::from_secs_f64(idle));
		tracer.read_recovery_count()
	})();
	let result = match outcome {
		Ok((recovery_count, rx_eval_count)) => {
			let result = if recovery_count == 0 {
				result.verdict(Verdict::Pass, format!("No recoveries during {idle}s idle period"))
			} else {
				result.verdict(
					Verdict::Fail,
					format!("{recovery_count} recovery entries during {idle}s idle period"),
				)
			};
			result.criteria("Zero recoveries during idle period").measured(json!({
				"recovery_count": recovery_count,
				"rx_eval_count": rx_eval_count,
				"idle_wait_s": idle,
			}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ltssm::{LtssmCode, LtssmTopState, LtssmTransition};

	fn watch(states: &[LtssmCode], final_state: LtssmCode, settled: bool) -> RetrainWatchResult {
		RetrainWatchResult {
			port_number: 0,
			port_select: 0,
			transitions: states
				.iter()
				.enumerate()
				.map(|(i, &state)| LtssmTransition {
					timestamp_ms: i as f64 * 20.0,
					state,
					state_name: state.to_string(),
				})
				.collect(),
			final_state,
			final_state_name: final_state.to_string(),
			final_speed: 3,
			final_speed_name: String::new(),
			duration_ms: 120.0,
			settled,
		}
	}

	#[test]
	fn ltssm_verdicts() {
		let detect = LtssmCode::from(LtssmTopState::Detect);
		let recovery = LtssmCode::from(LtssmTopState::Recovery);

		let (verdict, message) = ltssm_verdict(&watch(&[detect, LtssmCode::L0], LtssmCode::L0, true));
		assert_eq!(verdict, Verdict::Pass);
		assert!(message.contains("2 transitions"));

		let (verdict, _) = ltssm_verdict(&watch(&[detect, LtssmCode::L0, recovery], recovery, false));
		assert_eq!(verdict, Verdict::Warn);

		let (verdict, message) = ltssm_verdict(&watch(&[detect], detect, false));
		assert_eq!(verdict, Verdict::Fail);
		assert!(message.ends_with("DETECT"));
	}
}
