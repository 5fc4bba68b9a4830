//! Integration tests for the sweep controller state machine.
//!
//! All hardware is simulated with closure-backed resources; the tests
//! exercise the ordering, gating, pause/abort, and failure-routing contracts
//! end to end.

use labsweep::resource::Resource;
use labsweep::sweep::pulse::{
    Digitizer, PulseConfig, PulseProgram, RunMode, Waveform, WaveformGenerator,
};
use labsweep::sweep::variables::{
    ConditionGroup, ConditionVariable, SweepVariable, VariableGroup,
};
use labsweep::sweep::{MeasurementBinding, SweepController};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A write-only resource that records every value it receives.
fn recording_resource() -> (Arc<Resource>, Arc<Mutex<Vec<f64>>>) {
    let written = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&written);
    let resource = Arc::new(Resource::writable(move |v| {
        let sink = Arc::clone(&sink);
        Box::pin(async move {
            sink.lock().unwrap().push(v);
            anyhow::Ok(())
        })
    }));
    (resource, written)
}

/// A read-only resource that always fails.
fn broken_meter() -> Arc<Resource> {
    Arc::new(Resource::readable(|| {
        Box::pin(async { Err(anyhow::anyhow!("meter unplugged")) })
    }))
}

#[tokio::test]
async fn sweep_visits_every_pair_inner_fastest() {
    let (outer_res, outer_writes) = recording_resource();
    let (inner_res, inner_writes) = recording_resource();

    let groups = vec![
        VariableGroup::new(2).bind(SweepVariable::new("outer", vec![10.0, 20.0]), Some(outer_res)),
        VariableGroup::new(1).bind(
            SweepVariable::new("inner", vec![1.0, 2.0, 3.0]),
            Some(inner_res),
        ),
    ];
    let measurements = vec![MeasurementBinding::new(
        "meter",
        Some(Arc::new(Resource::constant(0.5))),
    )];

    let mut sweep = SweepController::new(groups, measurements);
    assert_eq!(sweep.total_steps(), 6);

    let seen: Arc<Mutex<Vec<Vec<f64>>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_in_cb = Arc::clone(&seen);
    sweep.on_data(move |_, values, readings| {
        assert_eq!(readings, vec![Some(0.5)]);
        seen_in_cb.lock().unwrap().push(values);
    });

    let closes = Arc::new(AtomicUsize::new(0));
    let closes_in_cb = Arc::clone(&closes);
    sweep.on_close(move || {
        closes_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    sweep.run().await;

    // The odometer property: every ordered pair exactly once, inner fastest.
    assert_eq!(
        seen.lock().unwrap().clone(),
        vec![
            vec![10.0, 1.0],
            vec![10.0, 2.0],
            vec![10.0, 3.0],
            vec![20.0, 1.0],
            vec![20.0, 2.0],
            vec![20.0, 3.0],
        ]
    );

    // Hardware saw each order only when it changed.
    assert_eq!(outer_writes.lock().unwrap().clone(), vec![10.0, 20.0]);
    assert_eq!(
        inner_writes.lock().unwrap().clone(),
        vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
    );

    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn write_callback_reports_order_and_variable_indices() {
    let (res, _) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![0.25, 0.75]),
        Some(res),
    )];

    let mut sweep = SweepController::new(groups, Vec::new());

    let progress: Arc<Mutex<Vec<(usize, usize, f64)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_in_cb = Arc::clone(&progress);
    sweep.on_write(move |order, var, value| {
        progress_in_cb.lock().unwrap().push((order, var, value));
    });

    sweep.run().await;

    assert_eq!(
        progress.lock().unwrap().clone(),
        vec![(0, 0, 0.25), (0, 0, 0.75)]
    );
}

#[tokio::test]
async fn pause_blocks_and_one_unpause_resumes() {
    let (res, writes) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0, 2.0]),
        Some(res),
    )];

    let mut sweep = SweepController::new(groups, Vec::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_in_cb = Arc::clone(&closes);
    sweep.on_close(move || {
        closes_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    let handle = sweep.handle();
    handle.pause();

    let run = tokio::spawn(async move {
        sweep.run().await;
    });

    // The trampoline is parked before its first state.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(writes.lock().unwrap().is_empty());
    assert_eq!(closes.load(Ordering::SeqCst), 0);

    // Exactly one unpause lets it run to completion, with no state skipped
    // or repeated.
    handle.unpause();
    run.await.unwrap();

    assert_eq!(writes.lock().unwrap().clone(), vec![1.0, 2.0]);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn true_conditions_let_the_sweep_complete_exactly() {
    let (res, _) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0, 2.0, 3.0]),
        Some(res),
    )];

    let settled = Arc::new(Resource::constant(0.1));
    let conditions = vec![ConditionGroup::new(1)
        .with(ConditionVariable::below("settled", settled, 1.0).with_settle(Duration::from_millis(1)))];

    let reads = Arc::new(AtomicUsize::new(0));
    let reads_in_cb = Arc::clone(&reads);

    let mut sweep = SweepController::new(groups, Vec::new()).with_conditions(conditions);
    sweep.on_data(move |_, _, _| {
        reads_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    sweep.run().await;

    // Exactly one measurement per step: the gate never withheld progression.
    assert_eq!(reads.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn false_conditions_dwell_without_advancing() {
    let (res, writes) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0, 2.0]),
        Some(res),
    )];

    // 0.1 is never below -1: the condition can never be satisfied.
    let stuck = Arc::new(Resource::constant(0.1));
    let conditions = vec![ConditionGroup::new(1)
        .with(ConditionVariable::below("stuck", stuck, -1.0).with_settle(Duration::from_millis(1)))];

    let reads = Arc::new(AtomicUsize::new(0));
    let reads_in_cb = Arc::clone(&reads);

    let mut sweep = SweepController::new(groups, Vec::new()).with_conditions(conditions);
    sweep.on_data(move |_, _, _| {
        reads_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    let handle = sweep.handle();
    let run = tokio::spawn(async move {
        sweep.run().await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.abort(false);
    run.await.unwrap();

    // The order cycled after its second step and then dwelled indefinitely:
    // the step counter froze while measurements kept coming.
    assert_eq!(writes.lock().unwrap().clone(), vec![1.0, 2.0]);
    assert!(reads.load(Ordering::SeqCst) > 2);
}

#[tokio::test]
async fn abort_ramps_down_and_completes_exactly_once() {
    let (res, writes) = recording_resource();
    let variable = SweepVariable::new("gate", (0..50).map(|i| i as f64).collect())
        .with_settle(Duration::from_millis(5))
        .with_const(-5.0)
        .ramp_steps(4)
        .ramp_out();
    let groups = vec![VariableGroup::new(1).bind(variable, Some(res))];

    let mut sweep = SweepController::new(groups, Vec::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let closes_in_cb = Arc::clone(&closes);
    sweep.on_close(move || {
        closes_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    let handle = sweep.handle();
    let run = tokio::spawn(async move {
        sweep.run().await;
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    handle.abort(false);
    handle.abort(false);
    handle.abort(false);
    run.await.unwrap();

    // Ramp-down happened: the last write is the constant resting value.
    let written = writes.lock().unwrap().clone();
    assert_eq!(written.last(), Some(&-5.0));

    // The completion callback fired exactly once, no matter how many times
    // abort was called.
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fatal_abort_skips_ramp_down() {
    let (res, writes) = recording_resource();
    let variable = SweepVariable::new("gate", (0..50).map(|i| i as f64).collect())
        .with_settle(Duration::from_millis(5))
        .with_const(-5.0)
        .ramp_out();
    let groups = vec![VariableGroup::new(1).bind(variable, Some(res))];

    let mut sweep = SweepController::new(groups, Vec::new());
    let handle = sweep.handle();
    let run = tokio::spawn(async move {
        sweep.run().await;
    });

    tokio::time::sleep(Duration::from_millis(40)).await;
    handle.abort(true);
    run.await.unwrap();

    // No write ever took the gate back to its resting value.
    assert!(!writes.lock().unwrap().contains(&-5.0));
}

#[tokio::test]
async fn wrapped_orders_ramp_across_while_stepping_order_writes_directly() {
    let (res, writes) = recording_resource();
    let inner = SweepVariable::new("inner", vec![0.0, 10.0])
        .ramp_steps(3)
        .ramp_across();
    let groups = vec![
        VariableGroup::new(2).bind(SweepVariable::new("outer", vec![1.0, 2.0]), None),
        VariableGroup::new(1).bind(inner, Some(res)),
    ];

    let mut sweep = SweepController::new(groups, Vec::new());
    sweep.run().await;

    // Steps: 0, 10, then the inner order wraps 10 -> 0 under the outer
    // carry, taking the smooth path before the direct write.
    assert_eq!(
        writes.lock().unwrap().clone(),
        vec![0.0, 10.0, 10.0, 5.0, 0.0, 0.0, 10.0]
    );
}

#[tokio::test]
async fn resource_write_failures_are_recovered() {
    let failing = Arc::new(Resource::writable(|_| {
        Box::pin(async { Err(anyhow::anyhow!("dac refused")) })
    }));
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0, 2.0]),
        Some(failing),
    )];

    let mut sweep = SweepController::new(groups, Vec::new());

    let failures: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_in_cb = Arc::clone(&failures);
    sweep.on_resource_error(move |name, _err, is_write| {
        failures_in_cb
            .lock()
            .unwrap()
            .push((name.to_string(), is_write));
    });

    let reads = Arc::new(AtomicUsize::new(0));
    let reads_in_cb = Arc::clone(&reads);
    sweep.on_data(move |_, _, _| {
        reads_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    sweep.run().await;

    // Both writes failed, were reported, and the sweep still completed.
    assert_eq!(
        failures.lock().unwrap().clone(),
        vec![("gate".to_string(), true), ("gate".to_string(), true)]
    );
    assert_eq!(reads.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn measurement_failures_leave_gaps() {
    let (res, _) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0]),
        Some(res),
    )];
    let measurements = vec![
        MeasurementBinding::new("good", Some(Arc::new(Resource::constant(2.5)))),
        MeasurementBinding::new("broken", Some(broken_meter())),
    ];

    let mut sweep = SweepController::new(groups, measurements);

    let readings: Arc<Mutex<Vec<Vec<Option<f64>>>>> = Arc::new(Mutex::new(Vec::new()));
    let readings_in_cb = Arc::clone(&readings);
    sweep.on_data(move |_, _, values| {
        readings_in_cb.lock().unwrap().push(values);
    });

    let failures: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let failures_in_cb = Arc::clone(&failures);
    sweep.on_resource_error(move |name, _err, is_write| {
        failures_in_cb
            .lock()
            .unwrap()
            .push((name.to_string(), is_write));
    });

    sweep.run().await;

    assert_eq!(
        readings.lock().unwrap().clone(),
        vec![vec![Some(2.5), None]]
    );
    assert_eq!(
        failures.lock().unwrap().clone(),
        vec![("broken".to_string(), false)]
    );
}

#[tokio::test]
async fn state_failures_are_fatal_but_still_ramp_down() {
    let (res, writes) = recording_resource();
    let variable = SweepVariable::new("gate", vec![1.0, 2.0])
        .with_const(0.0)
        .ramp_out();
    let groups = vec![VariableGroup::new(1).bind(variable, Some(res))];

    // A condition that cannot be measured makes the condition state fail.
    let conditions =
        vec![ConditionGroup::new(1).with(ConditionVariable::below("ghost", broken_meter(), 1.0))];

    let mut sweep = SweepController::new(groups, Vec::new()).with_conditions(conditions);

    let failed_states: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let failed_in_cb = Arc::clone(&failed_states);
    sweep.on_state_error(move |state, _err| {
        failed_in_cb.lock().unwrap().push(state.to_string());
    });

    let closes = Arc::new(AtomicUsize::new(0));
    let closes_in_cb = Arc::clone(&closes);
    sweep.on_close(move || {
        closes_in_cb.fetch_add(1, Ordering::SeqCst);
    });

    sweep.run().await;

    assert_eq!(
        failed_states.lock().unwrap().clone(),
        vec!["condition".to_string()]
    );
    assert_eq!(closes.load(Ordering::SeqCst), 1);

    // The pass was cut short, but the gate was still brought back to rest.
    assert_eq!(writes.lock().unwrap().last(), Some(&0.0));
}

// Minimal pulse instruments for exercising the pulse state inside a sweep.

struct OneShotProgram;

impl PulseProgram for OneShotProgram {
    fn sampling_rate(&self) -> f64 {
        1.0e9
    }

    fn repetitions(&self) -> u32 {
        2
    }

    fn acquisition_delay(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn waveforms(&self) -> anyhow::Result<HashMap<String, Waveform>> {
        let mut map = HashMap::new();
        map.insert(
            "gate".to_string(),
            Waveform {
                samples: vec![0.0, 1.0],
                markers: vec![0, 1],
            },
        );
        Ok(map)
    }
}

#[derive(Default)]
struct CountingGenerator {
    triggers: AtomicU32,
}

#[async_trait::async_trait]
impl WaveformGenerator for CountingGenerator {
    async fn set_enabled(&self, _enabled: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_sampling_rate(&self, _hz: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_run_mode(&self, _mode: RunMode) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_channels(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn load_waveform(
        &self,
        _channel: usize,
        _name: &str,
        _waveform: &Waveform,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_channel_enabled(&self, _channel: usize, _enabled: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn trigger(&self) -> anyhow::Result<()> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn opc(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct AgreeableDigitizer;

#[async_trait::async_trait]
impl Digitizer for AgreeableDigitizer {
    async fn set_acquiring(&self, _acquiring: bool) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_frame_averaging(&self, _frames: u32) -> anyhow::Result<()> {
        Ok(())
    }

    async fn disable_frame_averaging(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_single_sequence(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn acquisition_count(&self) -> anyhow::Result<u32> {
        Ok(2)
    }

    async fn opc(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn pulse_program_fires_on_every_step() {
    let (res, _) = recording_resource();
    let groups = vec![VariableGroup::new(1).bind(
        SweepVariable::new("gate", vec![1.0, 2.0, 3.0]),
        Some(res),
    )];

    let generator = Arc::new(CountingGenerator::default());
    let mut channels = HashMap::new();
    channels.insert("gate".to_string(), 1);
    let pulse = PulseConfig::new(
        Arc::new(OneShotProgram),
        channels,
        Arc::clone(&generator) as Arc<dyn WaveformGenerator>,
        Arc::new(AgreeableDigitizer) as Arc<dyn Digitizer>,
    )
    .with_trigger_arm_delay(Duration::ZERO);

    let mut sweep = SweepController::new(groups, Vec::new()).with_pulse(pulse);
    sweep.run().await;

    // Two repetitions per step, three steps.
    assert_eq!(generator.triggers.load(Ordering::SeqCst), 6);
}
