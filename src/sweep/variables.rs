//! Sweep variables, variable groups, and condition variables.
//!
//! A sweep is described as ordered, nested groups of variables. Each group
//! carries an integer *order* (its nesting level): outer orders change less
//! frequently than inner orders, and within one group all variables iterate
//! together. A variable declares its discrete values, its settle delay, how
//! it ramps into, across, and out of the sweep, and the constant resting
//! value it returns to when the sweep is over.
//!
//! Condition variables are kept separate from the sweep variables: they never
//! drive hardware, they only gate progression by re-measuring until their
//! predicates hold.

use crate::resource::Resource;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// One swept (or held-constant) control variable.
#[derive(Clone)]
pub struct SweepVariable {
    /// Display name, used in callbacks and failure reporting.
    pub name: String,
    /// The discrete values this variable contributes, in sweep order.
    pub values: Vec<f64>,
    /// Resting value written outside the sweep.
    pub const_value: f64,
    /// Hold the variable at its constant value instead of iterating.
    pub const_only: bool,
    /// Settle delay after this variable changes.
    pub wait: Duration,
    /// Number of interpolation points used for smooth ramps.
    pub smooth_steps: usize,
    /// Ramp from the constant value into the first sweep value.
    pub smooth_from: bool,
    /// Ramp across wrap-arounds when an outer order advances.
    pub smooth_transition: bool,
    /// Ramp back to the constant value when the sweep ends.
    pub smooth_to: bool,
}

impl SweepVariable {
    pub fn new(name: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            values,
            const_value: 0.0,
            const_only: false,
            wait: Duration::ZERO,
            smooth_steps: 10,
            smooth_from: false,
            smooth_transition: false,
            smooth_to: false,
        }
    }

    /// Settle delay applied after each change of this variable.
    pub fn with_settle(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Resting value used outside the sweep.
    pub fn with_const(mut self, value: f64) -> Self {
        self.const_value = value;
        self
    }

    /// Hold the variable constant for the whole sweep.
    pub fn held_constant(mut self) -> Self {
        self.const_only = true;
        self
    }

    /// Number of interpolation points for smooth ramps.
    pub fn ramp_steps(mut self, steps: usize) -> Self {
        self.smooth_steps = steps;
        self
    }

    /// Ramp smoothly from the constant value into the sweep.
    pub fn ramp_in(mut self) -> Self {
        self.smooth_from = true;
        self
    }

    /// Ramp smoothly across wrap-arounds during the sweep.
    pub fn ramp_across(mut self) -> Self {
        self.smooth_transition = true;
        self
    }

    /// Ramp smoothly back to the constant value after the sweep.
    pub fn ramp_out(mut self) -> Self {
        self.smooth_to = true;
        self
    }

    /// Number of discrete values this variable contributes.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The value this variable takes at a group cursor position.
    pub fn value_at(&self, cursor: usize) -> f64 {
        if self.const_only || self.values.is_empty() {
            return self.const_value;
        }
        self.values[cursor.min(self.values.len() - 1)]
    }
}

/// A sweep variable bound to the resource it drives.
///
/// The resource is optional: an unbound variable still participates in
/// iteration and callbacks, it just never touches hardware.
#[derive(Clone)]
pub struct BoundVariable {
    pub variable: SweepVariable,
    pub resource: Option<Arc<Resource>>,
}

/// The variables of one nesting level, iterating together.
#[derive(Clone)]
pub struct VariableGroup {
    order: i32,
    members: Vec<BoundVariable>,
}

impl VariableGroup {
    pub fn new(order: i32) -> Self {
        Self {
            order,
            members: Vec::new(),
        }
    }

    /// Add a variable and the resource it drives.
    pub fn bind(mut self, variable: SweepVariable, resource: Option<Arc<Resource>>) -> Self {
        self.members.push(BoundVariable { variable, resource });
        self
    }

    /// Nesting level of this group.
    pub fn order(&self) -> i32 {
        self.order
    }

    pub fn members(&self) -> &[BoundVariable] {
        &self.members
    }

    /// Whether every member is held constant.
    pub fn constant_only(&self) -> bool {
        self.members.iter().all(|m| m.variable.const_only)
    }

    /// Usable iteration length: the shortest of the iterating members.
    pub fn len(&self) -> usize {
        self.members
            .iter()
            .filter(|m| !m.variable.const_only)
            .map(|m| m.variable.len())
            .min()
            .unwrap_or(1)
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// The group's value tuple at a cursor position.
    pub fn values_at(&self, cursor: usize) -> Vec<f64> {
        self.members
            .iter()
            .map(|m| m.variable.value_at(cursor))
            .collect()
    }

    /// Largest settle delay declared in this group.
    pub fn max_wait(&self) -> Duration {
        self.members
            .iter()
            .map(|m| m.variable.wait)
            .max()
            .unwrap_or_default()
    }
}

/// Predicate applied to a condition measurement.
pub type ConditionPredicate = Arc<dyn Fn(f64) -> bool + Send + Sync>;

/// A stability condition: a measured resource and the predicate its value
/// must satisfy before the sweep may advance past this order.
#[derive(Clone)]
pub struct ConditionVariable {
    pub name: String,
    pub wait: Duration,
    resource: Arc<Resource>,
    predicate: ConditionPredicate,
}

impl ConditionVariable {
    pub fn new(
        name: impl Into<String>,
        resource: Arc<Resource>,
        predicate: impl Fn(f64) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            wait: Duration::ZERO,
            resource,
            predicate: Arc::new(predicate),
        }
    }

    /// Re-check delay used while this condition withholds progression.
    pub fn with_settle(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// The measured value must stay above `threshold`.
    pub fn above(name: impl Into<String>, resource: Arc<Resource>, threshold: f64) -> Self {
        Self::new(name, resource, move |v| v > threshold)
    }

    /// The measured value must stay below `threshold`.
    pub fn below(name: impl Into<String>, resource: Arc<Resource>, threshold: f64) -> Self {
        Self::new(name, resource, move |v| v < threshold)
    }

    /// Measure the bound resource and apply the predicate.
    pub async fn evaluate(&self) -> Result<bool> {
        let value = self
            .resource
            .value()
            .await
            .with_context(|| format!("condition '{}' failed to measure", self.name))?;
        Ok((self.predicate)(value))
    }
}

/// The condition variables gating one order.
#[derive(Clone)]
pub struct ConditionGroup {
    pub order: i32,
    pub variables: Vec<ConditionVariable>,
}

impl ConditionGroup {
    pub fn new(order: i32) -> Self {
        Self {
            order,
            variables: Vec::new(),
        }
    }

    pub fn with(mut self, variable: ConditionVariable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Largest re-check delay declared in this group.
    pub fn max_wait(&self) -> Duration {
        self.variables
            .iter()
            .map(|v| v.wait)
            .max()
            .unwrap_or_default()
    }
}
