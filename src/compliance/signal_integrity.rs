//! T4.x: per-lane eye measurement, minimum eye check, cross-lane comparison
//! and PAM4 eye balance.

use std::sync::Arc;

use serde_json::json;

use super::{
	model::{EyeDimensions, LaneMeasurement, SuiteId, TestResult, Verdict},
	thresholds::eye_threshold,
	PortContext,
};
use crate::{
	clock::millis_since,
	config::{cpb::pcie::LinkSpeed, ConfigSpace},
	device::DeviceBus,
	margin::{EyeSweepResult, LaneMarginingEngine, MarginingReceiver, Pam4SweepResult, SweepRegistry},
	ErrorKind, Result,
};

const SUITE: SuiteId = SuiteId::SignalIntegrity;
const MARGINING_REF: &str = "PCIe 6.0.1 Section 7.7.8";
const CEM_REF: &str = "PCIe CEM 6.0";

/// Runs the suite for one port and returns its results together with the
/// lane measurements. Errors only when the port cannot be opened or read.
pub fn run<B: DeviceBus + ?Sized>(
	bus: &B,
	sweeps: &Arc<SweepRegistry>,
	ctx: &PortContext<'_>,
) -> Result<(Vec<TestResult>, Vec<LaneMeasurement>)> {
	let port = ctx.port.port_number;
	let config = ConfigSpace::new(bus.open_port(port)?);
	let speed = config.get_link_status()?.current_speed;
	let speed = match speed {
		Some(speed) if speed >= LinkSpeed::Gen4 => speed,
		_ => {
			let current = speed.map_or_else(|| "unknown".to_owned(), |s| format!("Gen{}", s.generation()));
			return Ok((
				vec![TestResult::new(SUITE, "T4.1", "Eye Measurement", MARGINING_REF, port).verdict(
					Verdict::Skip,
					format!("Lane margining requires Gen4+, current: {current}"),
				)],
				Vec::new(),
			));
		}
	};

	let engine = match LaneMarginingEngine::new(config.into_inner(), ctx.device_id, port, Arc::clone(sweeps)) {
		Ok(engine) => engine.with_clock(Arc::clone(ctx.clock)),
		Err(err) if matches!(err.kind(), ErrorKind::NotFound | ErrorKind::InvalidState) => {
			return Ok((
				vec![TestResult::new(SUITE, "T4.1", "Eye Measurement", MARGINING_REF, port)
					.verdict(Verdict::Skip, err.to_string())],
				Vec::new(),
			));
		}
		Err(err) => return Err(err),
	};

	let pam4 = speed == LinkSpeed::Gen6;
	let mut results = Vec::new();
	let mut measurements = Vec::new();
	for lane in 0..ctx.port.num_lanes {
		let start = ctx.clock.now();
		let result = TestResult::new(
			SUITE,
			"T4.1",
			format!("Eye Measurement (Lane {lane})"),
			MARGINING_REF,
			port,
		)
		.lane(lane);
		let measured = if pam4 {
			engine.sweep_lane_pam4(lane).map(|sweep| pam4_measurement(&sweep))
		} else {
			engine
				.sweep_lane(lane, MarginingReceiver::Broadcast)
				.map(|sweep| nrz_measurement(&sweep))
		};
		let result = match measured {
			Ok(measurement) => {
				let result = result
					.verdict(
						Verdict::Pass,
						format!(
							"Eye: {:.4} UI x {:.1} mV",
							measurement.eye_width_ui, measurement.eye_height_mv
						),
					)
					.criteria("Margining sweep completed")
					.measured(json!({
						"lane": lane,
						"eye_width_ui": measurement.eye_width_ui,
						"eye_height_mv": measurement.eye_height_mv,
						"eye_width_steps": measurement.eye_width_steps,
						"eye_height_steps": measurement.eye_height_steps,
					}));
				measurements.push(measurement);
				result
			}
			Err(err) => {
				tracing::error!(port, lane, "eye measurement failed: {err}");
				result.error(&err)
			}
		};
		results.push(result.duration_ms(millis_since(&**ctx.clock, start)));
	}
	engine.close();

	results.extend(spec_minimum_check(&measurements, speed.generation(), port));
	results.push(lane_comparison(&measurements, ctx.run.lane_outlier_percent, port));
	if pam4 {
		results.extend(measurements.iter().map(|m| pam4_balance(m, port)));
	} else {
		results.push(
			TestResult::new(SUITE, "T4.4", "PAM4 Eye Balance", MARGINING_REF, port)
				.verdict(Verdict::Skip, "Eye balance applies to PAM4 links only"),
		);
	}
	Ok((results, measurements))
}

fn nrz_measurement(sweep: &EyeSweepResult) -> LaneMeasurement {
	LaneMeasurement {
		lane: sweep.lane,
		eye_width_ui: sweep.eye_width_ui,
		eye_height_mv: sweep.eye_height_mv,
		eye_width_steps: sweep.eye_width_steps,
		eye_height_steps: sweep.eye_height_steps,
		..LaneMeasurement::default()
	}
}

/// Dimensions of the worst eye, with all three eyes kept alongside.
fn pam4_measurement(sweep: &Pam4SweepResult) -> LaneMeasurement {
	let eyes = sweep.eyes();
	LaneMeasurement {
		lane: sweep.lane,
		eye_width_ui: sweep.worst_eye_width_ui,
		eye_height_mv: sweep.worst_eye_height_mv,
		eye_width_steps: eyes.iter().map(|(_, eye)| eye.eye_width_steps).min().unwrap_or(0),
		eye_height_steps: eyes.iter().map(|(_, eye)| eye.eye_height_steps).min().unwrap_or(0),
		pam4_eyes: eyes
			.iter()
			.map(|(_, eye)| EyeDimensions {
				eye_width_ui: eye.eye_width_ui,
				eye_height_mv: eye.eye_height_mv,
			})
			.collect(),
		balanced: Some(sweep.is_balanced),
	}
}

/// T4.2: every measured lane against the minimum eye of `generation`.
pub fn spec_minimum_check(measurements: &[LaneMeasurement], generation: u8, port: u8) -> Vec<TestResult> {
	let Some(threshold) = eye_threshold(generation) else {
		return vec![TestResult::new(SUITE, "T4.2", "Spec Minimum Eye Check", CEM_REF, port)
			.verdict(Verdict::Skip, format!("No threshold defined for Gen{generation}"))];
	};
	let min_width = threshold.min_eye_width_ui;
	let min_height = threshold.min_eye_height_mv;

	measurements
		.iter()
		.map(|m| {
			let lane = m.lane;
			let width_ok = m.eye_width_ui >= min_width;
			let height_ok = m.eye_height_mv >= min_height;
			let result = TestResult::new(
				SUITE,
				"T4.2",
				format!("Spec Minimum Eye Check (Lane {lane})"),
				CEM_REF,
				port,
			);
			let result = if width_ok && height_ok {
				result.verdict(
					Verdict::Pass,
					format!(
						"Lane {lane}: {:.4} UI >= {min_width} UI, {:.1} mV >= {min_height} mV",
						m.eye_width_ui, m.eye_height_mv
					),
				)
			} else {
				let mut parts = Vec::new();
				if !width_ok {
					parts.push(format!("width {:.4} < {min_width} UI", m.eye_width_ui));
				}
				if !height_ok {
					parts.push(format!("height {:.1} < {min_height} mV", m.eye_height_mv));
				}
				result.verdict(Verdict::Fail, format!("Lane {lane}: {}", parts.join("; ")))
			};
			result
				.criteria(format!("Eye >= {min_width} UI x {min_height} mV"))
				.measured(json!({
					"lane": lane,
					"eye_width_ui": m.eye_width_ui,
					"eye_height_mv": m.eye_height_mv,
					"min_width_ui": min_width,
					"min_height_mv": min_height,
				}))
				.lane(lane)
		})
		.collect()
}

fn percent_below(val: f64, avg: f64) -> f64 {
	if avg == 0.0 {
		0.0
	} else {
		(avg - val) / avg * 100.0
	}
}

/// T4.3: flags lanes more than `outlier_percent` below the cross-lane
/// average in width or height.
pub fn lane_comparison(measurements: &[LaneMeasurement], outlier_percent: f64, port: u8) -> TestResult {
	let result = TestResult::new(SUITE, "T4.3", "Per-Lane Margin Comparison", CEM_REF, port);
	if measurements.len() < 2 {
		return result.verdict(Verdict::Skip, "Need at least 2 lanes for comparison");
	}

	let count = measurements.len() as f64;
	let avg_width = measurements.iter().map(|m| m.eye_width_ui).sum::<f64>() / count;
	let avg_height = measurements.iter().map(|m| m.eye_height_mv).sum::<f64>() / count;
	let keep = 1.0 - outlier_percent / 100.0;

	let mut outliers = Vec::new();
	for m in measurements {
		if avg_width > 0.0 && m.eye_width_ui < avg_width * keep {
			outliers.push(format!(
				"Lane {} width {:.4} UI ({:.0}% below avg)",
				m.lane,
				m.eye_width_ui,
				percent_below(m.eye_width_ui, avg_width)
			));
		}
		if avg_height > 0.0 && m.eye_height_mv < avg_height * keep {
			outliers.push(format!(
				"Lane {} height {:.1} mV ({:.0}% below avg)",
				m.lane,
				m.eye_height_mv,
				percent_below(m.eye_height_mv, avg_height)
			));
		}
	}

	let result = if outliers.is_empty() {
		result.verdict(
			Verdict::Pass,
			format!(
				"All lanes within {outlier_percent}% of average (avg: {avg_width:.4} UI, {avg_height:.1} mV)"
			),
		)
	} else {
		let shown: Vec<_> = outliers.iter().take(5).map(String::as_str).collect();
		result.verdict(
			Verdict::Warn,
			format!("{} outlier(s): {}", outliers.len(), shown.join("; ")),
		)
	};
	result
		.criteria(format!("No lane >{outlier_percent}% below average"))
		.measured(json!({
			"avg_width_ui": avg_width,
			"avg_height_mv": avg_height,
			"outliers": outliers,
			"lane_count": measurements.len(),
		}))
}

/// T4.4 for one PAM4 lane.
fn pam4_balance(m: &LaneMeasurement, port: u8) -> TestResult {
	let heights: Vec<_> = m.pam4_eyes.iter().map(|eye| eye.eye_height_mv).collect();
	let result = TestResult::new(
		SUITE,
		"T4.4",
		format!("PAM4 Eye Balance (Lane {})", m.lane),
		MARGINING_REF,
		port,
	)
	.lane(m.lane);
	let result = if m.balanced == Some(true) {
		result.verdict(Verdict::Pass, format!("Lane {}: upper/middle/lower eyes balanced", m.lane))
	} else {
		result.verdict(
			Verdict::Warn,
			format!("Lane {}: eye heights unbalanced {heights:?} mV", m.lane),
		)
	};
	result
		.criteria("Upper, middle and lower eye heights within 20% of their mean")
		.measured(json!({
			"lane": m.lane,
			"eye_heights_mv": heights,
			"balanced": m.balanced,
		}))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lane(lane: u8, eye_width_ui: f64, eye_height_mv: f64) -> LaneMeasurement {
		LaneMeasurement {
			lane,
			eye_width_ui,
			eye_height_mv,
			..LaneMeasurement::default()
		}
	}

	#[test]
	fn minimum_check_names_failing_dimensions() {
		let results = spec_minimum_check(&[lane(0, 0.30, 20.0), lane(1, 0.10, 5.0)], 4, 2);
		assert_eq!(results.len(), 2);
		assert_eq!(results[0].verdict, Verdict::Pass);
		assert_eq!(results[1].verdict, Verdict::Fail);
		assert!(results[1].message.contains("width 0.1000 < 0.25 UI"));
		assert!(results[1].message.contains("height 5.0 < 15 mV"));
		assert_eq!(results[1].lane, Some(1));
	}

	#[test]
	fn minimum_check_skips_unknown_generation() {
		let results = spec_minimum_check(&[lane(0, 0.5, 50.0)], 2, 0);
		assert_eq!(results.len(), 1);
		assert_eq!(results[0].verdict, Verdict::Skip);
	}

	#[test]
	fn lane_comparison_flags_outliers() {
		assert_eq!(lane_comparison(&[lane(0, 0.3, 20.0)], 30.0, 0).verdict, Verdict::Skip);

		let even = [lane(0, 0.30, 20.0), lane(1, 0.28, 19.0), lane(2, 0.31, 21.0)];
		assert_eq!(lane_comparison(&even, 30.0, 0).verdict, Verdict::Pass);

		let uneven = [lane(0, 0.30, 20.0), lane(1, 0.30, 20.0), lane(2, 0.05, 20.0)];
		let result = lane_comparison(&uneven, 30.0, 0);
		assert_eq!(result.verdict, Verdict::Warn);
		assert!(result.message.starts_with("1 outlier(s): Lane 2 width"));
	}
}
