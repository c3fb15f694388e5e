mod common;

use std::{sync::Arc, thread, time::Duration};

use common::{Eye, MarginModel, PortModel, SimClock, SimSwitch};
use pcie_margin::{
	clock::Clock,
	margin::{Direction, LaneMarginingEngine, MarginingReceiver, SweepRegistry},
	registry::RunStatus,
	Error, ErrorKind,
};

const PORT: u8 = 8;

fn engine(
	switch: &SimSwitch,
	registry: &Arc<SweepRegistry>,
) -> LaneMarginingEngine<common::SimDevice> {
	let clock: Arc<dyn Clock> = SimClock::new();
	LaneMarginingEngine::open(switch, "sw0", PORT, Arc::clone(registry))
		.unwrap()
		.with_clock(clock)
}

fn last_command(switch: &SimSwitch) -> Option<u16> {
	switch
		.port(PORT)
		.lane_writes
		.last()
		.map(|&(_, control)| (control >> 3) & 0x07)
}

#[test]
fn open_eye_passes_every_point() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4())]);
	let registry = Arc::new(SweepRegistry::new());
	let engine = engine(&switch, &registry);
	assert!(engine.is_margining_ready().unwrap());

	let result = engine.sweep_lane(0, MarginingReceiver::Broadcast).unwrap();
	assert_eq!(result.receiver, MarginingReceiver::Broadcast);
	assert_eq!(result.timing_points.len(), 8);
	assert_eq!(result.voltage_points.len(), 8);
	assert!(result
		.timing_points
		.iter()
		.chain(&result.voltage_points)
		.all(|p| p.passed && !p.timed_out && p.margin_value == p.step));
	assert_eq!(result.eye_width_steps, 8);
	assert_eq!(result.eye_height_steps, 8);
	assert_eq!(result.eye_width_ui, 1.0);
	assert_eq!(result.eye_height_mv, 1000.0);
	// one second of dwell per point
	assert!(result.sweep_time_ms >= 16_000.0);

	let progress = registry.progress("sw0", 0);
	assert_eq!(progress.status, RunStatus::Complete);
	assert_eq!(progress.current_step, 16);
	assert_eq!(progress.percent, 100.0);
	assert_eq!(registry.result("sw0", 0), Some(result));
	// receiver is back at normal settings
	assert_eq!(last_command(&switch), Some(7));
}

#[test]
fn eye_edges_follow_last_passing_step() {
	let mut port = PortModel::gen4();
	let margining = port.margining.as_mut().unwrap();
	margining.lane_eyes.insert(
		3,
		Eye {
			right: 2,
			left: 3,
			up: 1,
			down: 4,
		},
	);
	let switch = SimSwitch::new([(PORT, port)]);
	let registry = Arc::new(SweepRegistry::new());
	let result = engine(&switch, &registry)
		.sweep_lane(3, MarginingReceiver::Broadcast)
		.unwrap();

	assert_eq!(result.eye_width_steps, 5);
	assert_eq!(result.eye_height_steps, 5);
	assert_eq!(result.eye_width_ui, 0.625);
	assert_eq!(result.eye_height_mv, 625.0);
	let failed: Vec<_> = result
		.timing_points
		.iter()
		.filter(|p| !p.passed)
		.map(|p| (p.direction, p.step, p.status_code, p.timed_out))
		.collect();
	assert_eq!(
		failed,
		[
			(Direction::Right, 3, 0, false),
			(Direction::Right, 4, 0, false),
			(Direction::Left, 4, 0, false),
		]
	);
}

#[test]
fn capabilities_come_from_report_commands() {
	let mut port = PortModel::gen4();
	*port.margining.as_mut().unwrap() = MarginModel {
		timing_steps: 16,
		voltage_steps: 32,
		max_timing_offset: 40,
		max_voltage_offset: 25,
		sample_count: 12,
		..MarginModel::default()
	};
	let switch = SimSwitch::new([(PORT, port)]);
	let registry = Arc::new(SweepRegistry::new());
	let caps = engine(&switch, &registry)
		.get_capabilities(0, MarginingReceiver::Broadcast)
		.unwrap();
	assert_eq!(caps.num_timing_steps, 16);
	assert_eq!(caps.num_voltage_steps, 32);
	assert_eq!(caps.max_timing_offset, 40);
	assert_eq!(caps.max_voltage_offset, 25);
	assert_eq!(caps.sample_count, 12);
	assert_eq!(caps.total_steps(), 96);
}

#[test]
fn second_sweep_of_running_lane_conflicts() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4())]);
	let registry = Arc::new(SweepRegistry::new());
	let first = engine(&switch, &registry);
	let second = engine(&switch, &registry);

	switch.gate.close();
	let handle = first.spawn_sweep(1, MarginingReceiver::Broadcast).unwrap();
	assert_eq!(registry.progress("sw0", 1).status, RunStatus::Running);

	let err = second.sweep_lane(1, MarginingReceiver::Broadcast).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Conflict);
	assert_eq!(registry.progress("sw0", 1).status, RunStatus::Running);

	switch.gate.open();
	let result = handle.join().unwrap().unwrap();
	assert_eq!(result.eye_width_steps, 8);
	assert_eq!(registry.progress("sw0", 1).status, RunStatus::Complete);

	// a finished lane can be swept again
	second.sweep_lane(1, MarginingReceiver::Broadcast).unwrap();
}

#[test]
fn silent_receiver_times_out_with_diagnostics() {
	let mut port = PortModel::gen4();
	port.margining.as_mut().unwrap().mute_reports = true;
	let switch = SimSwitch::new([(PORT, port)]);
	let registry = Arc::new(SweepRegistry::new());
	let err = engine(&switch, &registry)
		.sweep_lane(0, MarginingReceiver::Broadcast)
		.unwrap_err();

	assert_eq!(err.kind(), ErrorKind::Timeout);
	let Error::Timeout { message, diagnostics } = &err else {
		unreachable!()
	};
	assert!(message.contains("0x88"), "{message}");
	assert_eq!(diagnostics.capability_header, Some(0x0001_0027));
	assert_eq!(diagnostics.port_status, Some(1 << 16));

	let progress = registry.progress("sw0", 0);
	assert_eq!(progress.status, RunStatus::Error);
	assert_eq!(progress.error, Some(err.to_string()));
	assert_eq!(registry.result("sw0", 0), None);
	assert_eq!(last_command(&switch), Some(7));
}

#[test]
fn preconditions_fail_without_touching_the_lane() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4().at_speed(3))]);
	let registry = Arc::new(SweepRegistry::new());
	let engine = engine(&switch, &registry);
	let err = engine.sweep_lane(0, MarginingReceiver::Broadcast).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidState);
	assert!(switch.port(PORT).lane_writes.is_empty());
	assert_eq!(registry.progress("sw0", 0).status, RunStatus::Error);

	let err = engine.sweep_lane(32, MarginingReceiver::Broadcast).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn construction_checks_link_and_capability() {
	let mut down = PortModel::gen4();
	down.dll_active = false;
	let mut bare = PortModel::gen4();
	bare.margining = None;
	let switch = SimSwitch::new([(1, down), (2, bare)]);
	let registry = Arc::new(SweepRegistry::new());

	let err = LaneMarginingEngine::open(&switch, "sw0", 1, Arc::clone(&registry)).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidState);
	let err = LaneMarginingEngine::open(&switch, "sw0", 2, Arc::clone(&registry)).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);
	let err = LaneMarginingEngine::open(&switch, "sw0", 9, registry).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn pam4_sweep_measures_three_eyes() {
	let mut port = PortModel::gen4().at_speed(6);
	port.margining
		.as_mut()
		.unwrap()
		.receiver_eyes
		.insert(3, Eye::symmetric(1, 1));
	let switch = SimSwitch::new([(PORT, port)]);
	let registry = Arc::new(SweepRegistry::new());
	let engine = engine(&switch, &registry);

	let result = engine.sweep_lane_pam4(2).unwrap();
	assert_eq!(result.upper.receiver, MarginingReceiver::ReceiverA);
	assert_eq!(result.middle.receiver, MarginingReceiver::ReceiverB);
	assert_eq!(result.lower.receiver, MarginingReceiver::ReceiverC);
	assert_eq!(result.upper.eye_height_mv, 1000.0);
	assert_eq!(result.lower.eye_height_mv, 250.0);
	assert_eq!(result.worst_eye_width_ui, 0.25);
	assert_eq!(result.worst_eye_height_mv, 250.0);
	assert!(!result.is_balanced);

	let progress = registry.pam4_progress("sw0", 2);
	assert_eq!(progress.status, RunStatus::Complete);
	assert_eq!(progress.total_steps, 48);
	assert_eq!(registry.pam4_result("sw0", 2), Some(result));

	// a broadcast request at 64 GT/s goes to receiver A
	let single = engine.sweep_lane(2, MarginingReceiver::Broadcast).unwrap();
	assert_eq!(single.receiver, MarginingReceiver::ReceiverA);
}

#[test]
fn broadcast_sweep_at_64gt_resets_through_pam4_broadcast() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4().at_speed(6))]);
	let registry = Arc::new(SweepRegistry::new());
	let result = engine(&switch, &registry)
		.sweep_lane(2, MarginingReceiver::Broadcast)
		.unwrap();
	assert_eq!(result.receiver, MarginingReceiver::ReceiverA);

	let port = switch.port(PORT);
	// every margin command went to receiver A
	assert!(port
		.lane_writes
		.iter()
		.filter(|&&(_, control)| matches!((control >> 3) & 0x07, 3 | 4))
		.all(|&(_, control)| control & 0x07 == 1));
	let &(lane, control) = port.lane_writes.last().unwrap();
	assert_eq!(lane, 2);
	assert_eq!(control & 0x07, 7);
	assert_eq!((control >> 3) & 0x07, 7);
}

#[test]
fn pam4_sweep_requires_64gt() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4())]);
	let registry = Arc::new(SweepRegistry::new());
	let err = engine(&switch, &registry).sweep_lane_pam4(0).unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidState);
	assert_eq!(registry.pam4_progress("sw0", 0).status, RunStatus::Error);
}

#[test]
fn spawned_sweep_reports_through_registry() {
	let switch = SimSwitch::new([(PORT, PortModel::gen4())]);
	let registry = Arc::new(SweepRegistry::new());
	let handle = engine(&switch, &registry)
		.spawn_sweep(5, MarginingReceiver::Broadcast)
		.unwrap();
	let result = handle.join().unwrap().unwrap();
	assert_eq!(registry.result("sw0", 5), Some(result));

	let done = (0..100).any(|_| {
		if registry.progress("sw0", 5).status == RunStatus::Complete {
			return true;
		}
		thread::sleep(Duration::from_millis(1));
		false
	});
	assert!(done);
}
