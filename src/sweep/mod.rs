//! SweepController - state machine for sweep orchestration.
//!
//! The controller drives nested variable groups through ordered iteration,
//! parallel smooth ramping, lock-step measurement, condition-gated dwelling,
//! and graceful shutdown. It consumes [`Resource`]s only; it never knows
//! which transport a value travels over.
//!
//! # State Machine
//!
//! ```text
//!                                                conditional_dwell
//!                                                      v       ^
//! init -> next_values -> transition -> write -> dwell -> (pulse) -> read -> condition -> ramp_down -> end
//!  ^          ^                                                                 |            |
//!  |          |_________________________________________________________________|            |
//!  |_________________________________________________________________________________________|
//! ```
//!
//! `ramp_down -> init` is taken only when continuous repeat is on and the run
//! is not being stopped. The states are an explicit enum dispatched from one
//! loop, so the machine stays inspectable; before every state the controller
//! honors the pause gate and the abort flag.
//!
//! # Concurrency
//!
//! The dispatch loop itself is a single logical task. Within `transition`,
//! `write`, `read`, and `ramp_down`, one short-lived worker is spawned per
//! affected resource and joined before the state returns (a step-scoped
//! fan-out, not a pool), so a step's parallel hardware calls always finish
//! before the next step begins.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut sweep = SweepController::new(groups, measurements);
//! sweep.on_data(|elapsed, values, readings| {
//!     println!("{:?}: {:?} -> {:?}", elapsed, values, readings);
//! });
//!
//! let handle = sweep.handle();
//! tokio::spawn(async move { sweep.run().await });
//!
//! // ... later, from the UI task:
//! handle.pause();
//! handle.unpause();
//! handle.abort(false);
//! ```

pub mod pulse;
pub mod variables;

use crate::resource::Resource;
use anyhow::Result;
use self::pulse::PulseConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use self::variables::{ConditionGroup, VariableGroup};

/// Sweep controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    NextValues,
    Transition,
    Write,
    Dwell,
    Pulse,
    Read,
    Condition,
    ConditionalDwell,
    RampDown,
    End,
}

impl State {
    /// Stable name used for failure routing and logging.
    pub fn name(self) -> &'static str {
        match self {
            State::Init => "init",
            State::NextValues => "next_values",
            State::Transition => "transition",
            State::Write => "write",
            State::Dwell => "dwell",
            State::Pulse => "pulse",
            State::Read => "read",
            State::Condition => "condition",
            State::ConditionalDwell => "conditional_dwell",
            State::RampDown => "ramp_down",
            State::End => "end",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A measurement channel read in lock-step with the sweep.
#[derive(Clone)]
pub struct MeasurementBinding {
    pub name: String,
    pub resource: Option<Arc<Resource>>,
}

impl MeasurementBinding {
    pub fn new(name: impl Into<String>, resource: Option<Arc<Resource>>) -> Self {
        Self {
            name: name.into(),
            resource,
        }
    }
}

type WriteProgressFn = Arc<dyn Fn(usize, usize, f64) + Send + Sync>;
type ReadProgressFn = Arc<dyn Fn(usize, f64) + Send + Sync>;
type DataFn = Arc<dyn Fn(Duration, Vec<f64>, Vec<Option<f64>>) + Send + Sync>;
type CloseFn = Arc<dyn Fn() + Send + Sync>;
type StateFailureFn = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;
type ResourceFailureFn = Arc<dyn Fn(&str, &anyhow::Error, bool) + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    write_progress: Option<WriteProgressFn>,
    read_progress: Option<ReadProgressFn>,
    data: Option<DataFn>,
    close: Option<CloseFn>,
    state_failure: Option<StateFailureFn>,
    resource_failure: Option<ResourceFailureFn>,
}

#[derive(Default)]
struct SweepSignals {
    paused: AtomicBool,
    resume: Notify,
    aborting: AtomicBool,
    abort_fatal: AtomicBool,
    stop_continuous: AtomicBool,
}

impl SweepSignals {
    async fn wait_while_paused(&self) {
        while self.paused.load(Ordering::Acquire) {
            self.resume.notified().await;
        }
    }
}

/// Cloneable control handle for a running sweep.
///
/// Cancellation is cooperative: `abort` only takes effect the next time the
/// controller checks its flags between states.
#[derive(Clone)]
pub struct SweepHandle {
    signals: Arc<SweepSignals>,
}

impl SweepHandle {
    /// Block the controller before its next state.
    pub fn pause(&self) {
        debug!("pausing sweep");
        self.signals.paused.store(true, Ordering::Release);
    }

    /// Release a paused controller.
    pub fn unpause(&self) {
        debug!("unpausing sweep");
        self.signals.paused.store(false, Ordering::Release);
        self.signals.resume.notify_one();
    }

    /// End the sweep abruptly.
    ///
    /// A non-fatal abort still ramps hardware back to its resting values; a
    /// fatal abort skips the ramp-down entirely.
    pub fn abort(&self, fatal: bool) {
        debug!(fatal, "aborting sweep");
        if fatal {
            warn!("aborting fatally; skipping ramp-down");
            self.signals.abort_fatal.store(true, Ordering::Release);
        }
        self.signals.aborting.store(true, Ordering::Release);
        self.unpause();
    }

    /// Let a continuous sweep finish its current pass and stop.
    pub fn stop(&self) {
        self.signals.stop_continuous.store(true, Ordering::Release);
    }
}

/// Job description for one smooth-ramp worker.
struct RampJob {
    name: String,
    resource: Arc<Resource>,
    from: f64,
    to: f64,
    steps: usize,
}

/// A simple controller for a sweep of several variables.
pub struct SweepController {
    groups: Vec<VariableGroup>,
    measurements: Vec<MeasurementBinding>,
    conditions: Vec<ConditionGroup>,
    pulse: Option<PulseConfig>,
    continuous: bool,
    total_steps: usize,

    callbacks: Callbacks,
    signals: Arc<SweepSignals>,

    cursors: Option<Vec<usize>>,
    current_values: Option<Vec<Vec<f64>>>,
    last_values: Option<Vec<Vec<f64>>>,
    changed: Vec<usize>,
    steps_taken: usize,
    order_periods: Vec<(i32, usize)>,
    conditional_wait: Duration,
    first_read_at: Option<Instant>,
    devices_configured: bool,
    done: bool,
}

impl SweepController {
    /// Create a controller over variable groups and measurement bindings.
    ///
    /// Groups are sorted outermost (highest order) first; the innermost order
    /// is consumed most frequently. The total step count is the product of
    /// the iterating groups' lengths.
    pub fn new(mut groups: Vec<VariableGroup>, measurements: Vec<MeasurementBinding>) -> Self {
        groups.sort_by_key(|g| std::cmp::Reverse(g.order()));

        let total_steps = groups
            .iter()
            .filter(|g| !g.constant_only())
            .map(|g| g.len())
            .product();

        Self {
            groups,
            measurements,
            conditions: Vec::new(),
            pulse: None,
            continuous: false,
            total_steps,
            callbacks: Callbacks::default(),
            signals: Arc::new(SweepSignals::default()),
            cursors: None,
            current_values: None,
            last_values: None,
            changed: Vec::new(),
            steps_taken: 0,
            order_periods: Vec::new(),
            conditional_wait: Duration::ZERO,
            first_read_at: None,
            devices_configured: false,
            done: false,
        }
    }

    /// Gate progression on condition variable groups.
    pub fn with_conditions(mut self, mut conditions: Vec<ConditionGroup>) -> Self {
        conditions.sort_by_key(|g| g.order);
        self.conditions = conditions;
        self
    }

    /// Execute a pulse program on every step.
    pub fn with_pulse(mut self, pulse: PulseConfig) -> Self {
        self.pulse = Some(pulse);
        self
    }

    /// Repeat the whole sweep until stopped.
    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    /// Number of steps one full pass takes.
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Control handle usable from other tasks.
    pub fn handle(&self) -> SweepHandle {
        SweepHandle {
            signals: Arc::clone(&self.signals),
        }
    }

    /// Value-progress callback, invoked on every write as
    /// `(order index, variable index, value)`.
    pub fn on_write(&mut self, f: impl Fn(usize, usize, f64) + Send + Sync + 'static) {
        self.callbacks.write_progress = Some(Arc::new(f));
    }

    /// Measurement-progress callback, invoked on every successful read as
    /// `(measurement index, value)`.
    pub fn on_read(&mut self, f: impl Fn(usize, f64) + Send + Sync + 'static) {
        self.callbacks.read_progress = Some(Arc::new(f));
    }

    /// Aggregate data callback: elapsed time since the first read, the full
    /// current value set, and the full measurement set (gaps are `None`).
    pub fn on_data(&mut self, f: impl Fn(Duration, Vec<f64>, Vec<Option<f64>>) + Send + Sync + 'static) {
        self.callbacks.data = Some(Arc::new(f));
    }

    /// Completion callback, invoked exactly once when the sweep ends.
    pub fn on_close(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.close = Some(Arc::new(f));
    }

    /// State-failure callback `(state name, error)`. A state failure is fatal
    /// to the current pass.
    pub fn on_state_error(&mut self, f: impl Fn(&str, &anyhow::Error) + Send + Sync + 'static) {
        self.callbacks.state_failure = Some(Arc::new(f));
    }

    /// Resource-failure callback `(resource name, error, is_write)`. Resource
    /// failures are recovered: the value is left unset and the sweep
    /// continues.
    pub fn on_resource_error(
        &mut self,
        f: impl Fn(&str, &anyhow::Error, bool) + Send + Sync + 'static,
    ) {
        self.callbacks.resource_failure = Some(Arc::new(f));
    }

    /// Run the sweep to completion.
    pub async fn run(&mut self) {
        info!(total_steps = self.total_steps, "starting sweep");

        let mut state = State::Init;
        loop {
            if self.signals.paused.load(Ordering::Acquire) {
                debug!(state = %state, "paused before state");
                self.signals.wait_while_paused().await;
            }

            if self.signals.aborting.load(Ordering::Acquire) {
                debug!(state = %state, "aborting before state");
                if !self.signals.abort_fatal.load(Ordering::Acquire) {
                    self.continuous = false;
                    self.ramp_down_values().await;
                }
                break;
            }

            debug!(state = %state, "starting state");

            match self.dispatch(state).await {
                Ok(Some(next)) => state = next,
                Ok(None) => break,
                Err(err) => {
                    self.report_state_error(state, &err);

                    // Fatal to this pass: bring the hardware back to rest,
                    // unless a fatal abort forbids touching it.
                    if state != State::RampDown && !self.signals.abort_fatal.load(Ordering::Acquire)
                    {
                        self.ramp_down_values().await;
                    }
                    break;
                }
            }
        }

        self.finish();
    }

    async fn dispatch(&mut self, state: State) -> Result<Option<State>> {
        match state {
            State::Init => self.init().await.map(Some),
            State::NextValues => Ok(Some(self.next_values())),
            State::Transition => self.transition().await.map(Some),
            State::Write => self.write_values().await.map(Some),
            State::Dwell => Ok(Some(self.dwell().await)),
            State::Pulse => self.pulse_program().await.map(Some),
            State::Read => self.read_values().await.map(Some),
            State::Condition => self.condition().await.map(Some),
            State::ConditionalDwell => Ok(Some(self.conditional_dwell().await)),
            State::RampDown => Ok(self.ramp_down().await),
            State::End => Ok(None),
        }
    }

    fn report_state_error(&self, state: State, err: &anyhow::Error) {
        match &self.callbacks.state_failure {
            Some(cb) => cb(state.name(), err),
            None => error!(state = %state, error = %err, "error in sweep state"),
        }
    }

    /// Reset iteration bookkeeping; on first entry, configure devices.
    async fn init(&mut self) -> Result<State> {
        self.cursors = None;
        self.current_values = None;
        self.last_values = None;
        self.steps_taken = 0;

        self.compute_order_periods();

        if !self.devices_configured {
            debug!("configuring devices");
            if let Some(pulse) = &self.pulse {
                pulse.configure_devices().await?;
            }
            self.devices_configured = true;
        }

        Ok(State::NextValues)
    }

    /// Advance the odometer: the innermost order steps; exhausted orders
    /// reset and carry outward.
    fn next_values(&mut self) -> State {
        self.steps_taken += 1;
        if let Some(current) = &self.current_values {
            self.last_values = Some(current.clone());
        }

        match self.cursors.as_mut() {
            None => {
                // First time around: every order presents its first value.
                self.cursors = Some(vec![0; self.groups.len()]);
                self.current_values = Some(self.groups.iter().map(|g| g.values_at(0)).collect());
                self.changed = (0..self.groups.len()).collect();
            }
            Some(cursors) => {
                let mut current = self
                    .current_values
                    .take()
                    .unwrap_or_else(|| self.groups.iter().map(|g| g.values_at(0)).collect());

                let mut pos = self.groups.len() as isize - 1;
                while pos >= 0 {
                    let i = pos as usize;
                    if cursors[i] + 1 < self.groups[i].len() {
                        cursors[i] += 1;
                        current[i] = self.groups[i].values_at(cursors[i]);
                        break;
                    }
                    cursors[i] = 0;
                    current[i] = self.groups[i].values_at(0);
                    pos -= 1;
                }

                let first_changed = pos.max(0) as usize;
                self.changed = (first_changed..self.groups.len()).collect();
                self.current_values = Some(current);
            }
        }

        State::Transition
    }

    /// Smoothly approach the new values where variables ask for it.
    async fn transition(&mut self) -> Result<State> {
        let mut jobs: Vec<RampJob> = Vec::new();

        if self.last_values.is_none() {
            // Smooth set from the constant resting values.
            if let Some(current) = &self.current_values {
                for (pos, group) in self.groups.iter().enumerate() {
                    for (i, member) in group.members().iter().enumerate() {
                        let var = &member.variable;
                        if var.const_only || !var.smooth_from {
                            continue;
                        }
                        if let Some(resource) = &member.resource {
                            jobs.push(RampJob {
                                name: var.name.clone(),
                                resource: Arc::clone(resource),
                                from: var.const_value,
                                to: current[pos][i],
                                steps: var.smooth_steps,
                            });
                        }
                    }
                }
            }
        } else if let (Some(current), Some(last)) = (&self.current_values, &self.last_values) {
            // The outermost changed group is simply stepping; all others
            // rolled over and may need to ramp across the wrap.
            for &pos in self.changed.iter().skip(1) {
                for (i, member) in self.groups[pos].members().iter().enumerate() {
                    let var = &member.variable;
                    if var.const_only || !var.smooth_transition {
                        continue;
                    }
                    if let Some(resource) = &member.resource {
                        jobs.push(RampJob {
                            name: var.name.clone(),
                            resource: Arc::clone(resource),
                            from: last[pos][i],
                            to: current[pos][i],
                            steps: var.smooth_steps,
                        });
                    }
                }
            }
        }

        self.ramp(jobs).await;
        Ok(State::Write)
    }

    /// Write the step's final values, one worker per changed resource.
    async fn write_values(&mut self) -> Result<State> {
        let Some(current) = &self.current_values else {
            return Ok(State::Dwell);
        };

        let mut workers = Vec::new();
        for &pos in &self.changed {
            for (i, member) in self.groups[pos].members().iter().enumerate() {
                let value = current[pos][i];

                if let Some(resource) = &member.resource {
                    let name = member.variable.name.clone();
                    let resource = Arc::clone(resource);
                    let failure = self.callbacks.resource_failure.clone();
                    workers.push(tokio::spawn(async move {
                        if let Err(err) = resource.set_value(value).await {
                            report_resource_error(&failure, &name, &err, true);
                        }
                    }));
                }

                if let Some(cb) = &self.callbacks.write_progress {
                    cb(pos, i, value);
                }
            }
        }

        for worker in workers {
            let _ = worker.await;
        }

        Ok(State::Dwell)
    }

    /// Wait out the longest settle delay among the changed variables.
    async fn dwell(&mut self) -> State {
        let delay = self
            .changed
            .iter()
            .map(|&pos| self.groups[pos].max_wait())
            .max()
            .unwrap_or_default();
        sleep(delay).await;

        if self.pulse.is_some() {
            State::Pulse
        } else {
            State::Read
        }
    }

    /// Run through the pulse program.
    async fn pulse_program(&mut self) -> Result<State> {
        if let Some(pulse) = &self.pulse {
            pulse.execute().await?;
        }
        Ok(State::Read)
    }

    /// Take measurements, one worker per bound resource.
    async fn read_values(&mut self) -> Result<State> {
        let mut workers = Vec::new();
        for (i, binding) in self.measurements.iter().enumerate() {
            if let Some(resource) = &binding.resource {
                let name = binding.name.clone();
                let resource = Arc::clone(resource);
                let failure = self.callbacks.resource_failure.clone();
                let progress = self.callbacks.read_progress.clone();
                workers.push(tokio::spawn(async move {
                    match resource.value().await {
                        Ok(value) => {
                            if let Some(cb) = &progress {
                                cb(i, value);
                            }
                            (i, Some(value))
                        }
                        Err(err) => {
                            report_resource_error(&failure, &name, &err, false);
                            (i, None)
                        }
                    }
                }));
            }
        }

        let mut measurements: Vec<Option<f64>> = vec![None; self.measurements.len()];
        for worker in workers {
            if let Ok((i, value)) = worker.await {
                measurements[i] = value;
            }
        }

        let elapsed = match self.first_read_at {
            Some(first) => first.elapsed(),
            None => {
                self.first_read_at = Some(Instant::now());
                Duration::ZERO
            }
        };

        if let Some(cb) = &self.callbacks.data {
            let values: Vec<f64> = self
                .current_values
                .iter()
                .flatten()
                .flatten()
                .copied()
                .collect();
            cb(elapsed, values, measurements);
        }

        Ok(State::Condition)
    }

    /// Gate progression on the condition variables of orders that just
    /// completed a full cycle.
    async fn condition(&mut self) -> Result<State> {
        let mut all_hold = true;

        if !self.conditions.is_empty() {
            // Orders whose value just cycled, in increasing order.
            let cycled: Vec<i32> = self
                .order_periods
                .iter()
                .filter(|(_, period)| self.steps_taken % period == 0)
                .map(|(order, _)| *order)
                .collect();

            // The wait is set by the lowest cycled order that has conditions.
            self.conditional_wait = Duration::ZERO;
            for order in &cycled {
                if let Some(group) = self.conditions.iter().find(|g| g.order == *order) {
                    self.conditional_wait = group.max_wait();
                    break;
                }
            }

            for order in &cycled {
                if let Some(group) = self.conditions.iter().find(|g| g.order == *order) {
                    for variable in &group.variables {
                        let holds = variable.evaluate().await?;
                        if !holds {
                            debug!(condition = %variable.name, "condition not met");
                        }
                        all_hold = all_hold && holds;
                    }
                }
            }
        }

        if all_hold {
            if self.steps_taken >= self.total_steps {
                Ok(State::RampDown)
            } else {
                Ok(State::NextValues)
            }
        } else {
            Ok(State::ConditionalDwell)
        }
    }

    /// Wait, then re-measure without re-stepping.
    async fn conditional_dwell(&mut self) -> State {
        sleep(self.conditional_wait).await;
        State::Read
    }

    /// Sweep from the last values back to the constant resting values.
    async fn ramp_down(&mut self) -> Option<State> {
        self.ramp_down_values().await;

        if self.continuous && !self.signals.stop_continuous.load(Ordering::Acquire) {
            Some(State::Init)
        } else {
            Some(State::End)
        }
    }

    async fn ramp_down_values(&mut self) {
        // Nothing was ever stepped: nothing to undo.
        let Some(current) = &self.current_values else {
            return;
        };

        let mut jobs: Vec<RampJob> = Vec::new();
        for (pos, group) in self.groups.iter().enumerate() {
            for (i, member) in group.members().iter().enumerate() {
                let var = &member.variable;
                if var.const_only || !var.smooth_to {
                    continue;
                }
                if let Some(resource) = &member.resource {
                    jobs.push(RampJob {
                        name: var.name.clone(),
                        resource: Arc::clone(resource),
                        from: current[pos][i],
                        to: var.const_value,
                        steps: var.smooth_steps,
                    });
                }
            }
        }

        self.ramp(jobs).await;
    }

    /// Apply smooth ramps in parallel, one worker per resource, joined
    /// before returning.
    async fn ramp(&self, jobs: Vec<RampJob>) {
        let mut workers = Vec::new();
        for job in jobs {
            let failure = self.callbacks.resource_failure.clone();
            workers.push(tokio::spawn(async move {
                if let Err(err) = job.resource.sweep(job.from, job.to, job.steps).await {
                    report_resource_error(&failure, &job.name, &err, true);
                }
            }));
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    /// How many total steps elapse before each order's value repeats.
    fn compute_order_periods(&mut self) {
        let mut orders: Vec<i32> = Vec::new();
        let mut periods: Vec<usize> = Vec::new();

        // Innermost first, so periods accumulate multiplicatively.
        for group in self.groups.iter().rev() {
            if group.constant_only() {
                continue;
            }
            let period = periods.last().map_or(group.len(), |last| last * group.len());
            orders.push(group.order());
            periods.push(period);
        }

        // Condition orders with no sweep group of their own inherit the
        // period of the next-inner order (1 when innermost).
        for condition in &self.conditions {
            if orders.contains(&condition.order) {
                continue;
            }
            let idx = orders
                .iter()
                .position(|&o| o > condition.order)
                .unwrap_or(orders.len());
            let period = if idx == 0 { 1 } else { periods[idx - 1] };
            orders.insert(idx, condition.order);
            periods.insert(idx, period);
        }

        self.order_periods = orders.into_iter().zip(periods).collect();
    }

    /// The sweep is over; runs exactly once.
    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        info!(steps = self.steps_taken, "sweep finished");

        if let Some(cb) = &self.callbacks.close {
            cb();
        }
    }
}

fn report_resource_error(
    handler: &Option<ResourceFailureFn>,
    name: &str,
    err: &anyhow::Error,
    is_write: bool,
) {
    match handler {
        Some(cb) => cb(name, err, is_write),
        None => warn!(resource = %name, error = %err, is_write, "resource error during sweep"),
    }
}
