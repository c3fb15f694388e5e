//! Pass/fail limits per link generation.

use serde::Serialize;

/// Minimum eye opening at one generation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EyeThreshold {
	pub generation: u8,
	pub min_eye_width_ui: f64,
	pub min_eye_height_mv: f64,
}

const EYE_THRESHOLDS: [EyeThreshold; 4] = [
	EyeThreshold {
		generation: 3,
		min_eye_width_ui: 0.30,
		min_eye_height_mv: 15.0,
	},
	EyeThreshold {
		generation: 4,
		min_eye_width_ui: 0.25,
		min_eye_height_mv: 15.0,
	},
	EyeThreshold {
		generation: 5,
		min_eye_width_ui: 0.20,
		min_eye_height_mv: 10.0,
	},
	EyeThreshold {
		generation: 6,
		min_eye_width_ui: 0.15,
		min_eye_height_mv: 8.0,
	},
];

/// `None` for generations without a defined limit.
pub fn eye_threshold(generation: u8) -> Option<EyeThreshold> {
	EYE_THRESHOLDS
		.iter()
		.find(|threshold| threshold.generation == generation)
		.copied()
}

/// Default outlier margin of the per-lane comparison.
pub const LANE_OUTLIER_PERCENT: f64 = 30.0;
