//! T3.x: capability list structure, payload sizes and link capability
//! consistency.

use serde_json::json;

use super::{
	model::{SuiteId, TestResult, Verdict},
	PortContext,
};
use crate::{
	clock::millis_since,
	config::{
		cpb::{
			pcie::{LinkSpeed, MaxSize},
			Capability,
		},
		ConfigSpace,
	},
	RegisterAccess, Result,
};

const SUITE: SuiteId = SuiteId::ConfigAudit;

/// Highest standard capability ID assigned so far (Flattening Portal Bridge).
const MAX_STD_CPB_ID: u16 = 0x15;

/// Issues listed in a failing capability list message.
const MAX_REPORTED_ISSUES: usize = 5;

pub fn run<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> Vec<TestResult> {
	vec![
		capability_list_integrity(config, ctx),
		mps_mrrs_validation(config, ctx),
		link_capability_consistency(config, ctx),
		speeds_contiguity(config, ctx),
	]
}

/// Both capability lists as walked, with the offset each walk looped back to.
#[derive(Debug, Default)]
struct CapabilityLists {
	std: Vec<Capability>,
	ext: Vec<Capability>,
	std_loop: Option<u16>,
	ext_loop: Option<u16>,
}

impl CapabilityLists {
	fn read<D: RegisterAccess>(config: &ConfigSpace<D>) -> Result<Self> {
		let mut std_iter = config.capabilities();
		let std = std_iter.by_ref().collect::<Result<Vec<_>>>()?;
		let mut ext_iter = config.ext_capabilities();
		let ext = ext_iter.by_ref().collect::<Result<Vec<_>>>()?;
		Ok(Self {
			std,
			ext,
			std_loop: std_iter.looped_at(),
			ext_loop: ext_iter.looped_at(),
		})
	}

	fn issues(&self) -> Vec<String> {
		let mut issues = Vec::new();
		if let Some(offset) = self.std_loop {
			issues.push(format!("Capability list loops back to 0x{offset:02X}"));
		}
		for cpb in &self.std {
			if cpb.cap_id == 0 || cpb.cap_id > MAX_STD_CPB_ID {
				issues.push(format!(
					"Suspicious std cap ID 0x{:02X} at 0x{:02X}",
					cpb.cap_id, cpb.offset
				));
			}
		}
		if let Some(offset) = self.ext_loop {
			issues.push(format!("Extended capability list loops back to 0x{offset:03X}"));
		}
		issues
	}
}

/// T3.1: both capability lists terminate and carry plausible IDs.
pub fn capability_list_integrity<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T3.1",
		"Capability List Integrity",
		"PCIe 6.0.1 Section 7.5.3",
		ctx.port.port_number,
	);
	let result = match CapabilityLists::read(config) {
		Ok(lists) => {
			let issues = lists.issues();
			let result = if issues.is_empty() {
				result.verdict(
					Verdict::Pass,
					format!(
						"Found {} std + {} ext capabilities, no issues",
						lists.std.len(),
						lists.ext.len()
					),
				)
			} else {
				let shown: Vec<_> = issues.iter().take(MAX_REPORTED_ISSUES).map(String::as_str).collect();
				result.verdict(
					Verdict::Fail,
					format!("{} issue(s): {}", issues.len(), shown.join("; ")),
				)
			};
			result
				.criteria("No loops, valid IDs, ext caps aligned to 0x100+")
				.measured(json!({
					"std_cap_count": lists.std.len(),
					"ext_cap_count": lists.ext.len(),
					"issues": issues,
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

/// T3.2: programmed max payload size within Device Capabilities, both sizes
/// valid encodings.
pub fn mps_mrrs_validation<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T3.2",
		"MPS/MRRS Validation",
		"PCIe 6.0.1 Section 7.5.3.4",
		ctx.port.port_number,
	);
	let outcome = config
		.get_device_capabilities()
		.and_then(|cpbs| Ok((cpbs, config.get_device_control()?)));
	let result = match outcome {
		Ok((cpbs, control)) => {
			let max = cpbs.max_payload_size();
			let mps = control.max_payload_size();
			let mrrs = control.max_read_request_size();
			let mut issues = Vec::new();
			if mps.is_none() {
				issues.push(format!("Invalid MPS encoding {}", control.max_payload_size_code()));
			}
			if mrrs.is_none() {
				issues.push(format!(
					"Invalid MRRS encoding {}",
					control.max_read_request_size_code()
				));
			}
			if max.is_none() {
				issues.push(format!(
					"Invalid max supported MPS encoding {}",
					cpbs.max_payload_size_code()
				));
			}
			if let (Some(mps), Some(max)) = (mps, max) {
				if mps > max {
					issues.push(format!("MPS ({}) > max supported ({})", mps.size(), max.size()));
				}
			}
			let size = |size: Option<MaxSize>| size.map(MaxSize::size);
			let result = match (issues.is_empty(), mps, mrrs, max) {
				(true, Some(mps), Some(mrrs), Some(max)) => result.verdict(
					Verdict::Pass,
					format!("MPS={}B (max {}B), MRRS={}B", mps.size(), max.size(), mrrs.size()),
				),
				_ => result.verdict(Verdict::Fail, issues.join("; ")),
			};
			result
				.criteria("MPS <= max_supported, both values from valid set")
				.measured(json!({
					"mps": size(mps),
					"mrrs": size(mrrs),
					"max_mps_supported": size(max),
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

/// T3.3: negotiated speed and width do not exceed Link Capabilities.
pub fn link_capability_consistency<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T3.3",
		"Link Capability Consistency",
		"PCIe 6.0.1 Section 7.5.3.6",
		ctx.port.port_number,
	);
	let outcome = config
		.get_link_capabilities()
		.and_then(|cpbs| Ok((cpbs, config.get_link_status()?)));
	let result = match outcome {
		Ok((cpbs, state)) => {
			let max_width = cpbs.max_link_width();
			let mut issues = Vec::new();
			if state.speed_code() > cpbs.max_link_speed_code() {
				issues.push(format!(
					"Current speed {} > max {}",
					speed_name(state.current_speed, state.speed_code()),
					speed_name(cpbs.max_link_speed(), cpbs.max_link_speed_code())
				));
			}
			if state.current_width > max_width {
				issues.push(format!(
					"Current width x{} > max x{max_width}",
					state.current_width
				));
			}
			let result = if issues.is_empty() {
				result.verdict(
					Verdict::Pass,
					format!(
						"Link {} x{} within caps ({} x{max_width})",
						speed_name(state.current_speed, state.speed_code()),
						state.current_width,
						speed_name(cpbs.max_link_speed(), cpbs.max_link_speed_code())
					),
				)
			} else {
				result.verdict(Verdict::Fail, issues.join("; "))
			};
			result
				.criteria("Current speed/width <= capabilities")
				.measured(json!({
					"current_speed": state.speed_code(),
					"current_width": state.current_width,
					"max_speed": cpbs.max_link_speed_code(),
					"max_width": max_width,
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}

fn speed_name(speed: Option<LinkSpeed>, code: u8) -> String {
	match speed {
		Some(speed) => speed.to_string(),
		None => format!("Unknown({code})"),
	}
}

/// Speeds missing below the highest supported one.
fn speed_gaps(supported: &[LinkSpeed]) -> Vec<LinkSpeed> {
	let Some(&highest) = supported.last() else {
		return Vec::new();
	};
	LinkSpeed::ALL
		.into_iter()
		.take_while(|&speed| speed < highest)
		.filter(|speed| !supported.contains(speed))
		.collect()
}

/// T3.4: the Supported Link Speeds vector has no holes below its highest
/// speed.
pub fn speeds_contiguity<D: RegisterAccess>(config: &ConfigSpace<D>, ctx: &PortContext<'_>) -> TestResult {
	let start = ctx.clock.now();
	let result = TestResult::new(
		SUITE,
		"T3.4",
		"Supported Speeds Contiguity",
		"PCIe 6.0.1 Section 7.5.3.18",
		ctx.port.port_number,
	);
	let result = match config.get_supported_speeds() {
		Ok(vector) => {
			let supported = vector.speeds();
			let gaps = speed_gaps(&supported);
			let label = |speed: &LinkSpeed| format!("Gen{}", speed.generation());
			let result = match supported.last() {
				None => result.verdict(Verdict::Warn, "No supported speeds reported"),
				Some(highest) if gaps.is_empty() => result.verdict(
					Verdict::Pass,
					format!(
						"Contiguous Gen1-{}: {}",
						label(highest),
						supported.iter().map(label).collect::<Vec<_>>().join(", ")
					),
				),
				Some(highest) => result.verdict(
					Verdict::Fail,
					format!(
						"Gap(s) in speed vector: missing {} (highest: {})",
						gaps.iter().map(label).collect::<Vec<_>>().join(", "),
						label(highest)
					),
				),
			};
			result
				.criteria("Supported speeds contiguous from Gen1 to max")
				.measured(json!({
					"supported_speeds": supported.iter().map(label).collect::<Vec<_>>(),
					"highest_gen": supported.last().map(|speed| speed.generation()),
					"raw_value": format!("{:#04X}", (vector.bits() as u32) << 1),
					"gaps": gaps.iter().map(label).collect::<Vec<_>>(),
				}))
		}
		Err(err) => result.error(&err),
	};
	result.duration_ms(millis_since(&**ctx.clock, start))
}
