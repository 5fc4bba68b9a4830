//! Resource - a uniform read/write handle over one device capability.
//!
//! A [`Resource`] is how the sweep layer touches hardware without knowing
//! anything about it: an optional async getter, an optional async setter, an
//! optional converter for raw input, and optional allowed-value constraints.
//! The getter and setter are closures captured once at construction, bound
//! to the specific capability they read or write, rather than looked up by
//! name at call time.
//!
//! # Example
//!
//! ```rust,ignore
//! use labsweep::resource::Resource;
//!
//! // A gate voltage on a DAC channel, settable and readable over SCPI.
//! let handle = dac.subdevice("port1").unwrap().handle();
//! let gate = Resource::query(handle.clone(), "VOLT?")
//!     .with_command_setter(handle, |v| format!("VOLT {:.6}", v))
//!     .with_range(-2.0, 2.0);
//!
//! gate.set_value(-0.35).await?;
//! let readback = gate.value().await?;
//! ```

use crate::device::DeviceHandle;
use crate::error::SweepError;
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::fmt::Debug;
use std::sync::Arc;

/// Async getter closure bound at construction.
pub type Getter = Arc<dyn Fn() -> BoxFuture<'static, Result<f64>> + Send + Sync>;
/// Async setter closure bound at construction.
pub type Setter = Arc<dyn Fn(f64) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Converter applied to raw input values.
pub type Converter = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// Allowed-value constraints for a resource.
#[derive(Clone, Default)]
pub enum Constraints {
    /// No constraints.
    #[default]
    None,

    /// Closed numeric range.
    Range { min: f64, max: f64 },

    /// Allowed discrete values.
    Choices(Vec<f64>),
}

impl Constraints {
    /// Validate a value against the constraints.
    pub fn validate(&self, value: f64) -> Result<(), SweepError> {
        match self {
            Constraints::None => Ok(()),
            Constraints::Range { min, max } => {
                if value < *min || value > *max {
                    Err(SweepError::InvalidValue { value })
                } else {
                    Ok(())
                }
            }
            Constraints::Choices(choices) => {
                if choices.contains(&value) {
                    Ok(())
                } else {
                    Err(SweepError::InvalidValue { value })
                }
            }
        }
    }
}

impl Debug for Constraints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constraints::None => write!(f, "None"),
            Constraints::Range { min, max } => f
                .debug_struct("Range")
                .field("min", min)
                .field("max", max)
                .finish(),
            Constraints::Choices(choices) => f.debug_tuple("Choices").field(choices).finish(),
        }
    }
}

/// A named device capability that can potentially be read or written.
#[derive(Clone, Default)]
pub struct Resource {
    getter: Option<Getter>,
    setter: Option<Setter>,
    converter: Option<Converter>,
    constraints: Constraints,
}

impl Resource {
    /// A resource with no capabilities (useful as a builder starting point).
    pub fn new() -> Self {
        Self::default()
    }

    /// A read-only resource backed by a closure.
    pub fn readable(
        getter: impl Fn() -> BoxFuture<'static, Result<f64>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            getter: Some(Arc::new(getter)),
            ..Self::default()
        }
    }

    /// A write-only resource backed by a closure.
    pub fn writable(
        setter: impl Fn(f64) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            setter: Some(Arc::new(setter)),
            ..Self::default()
        }
    }

    /// A read-only resource that always produces `value`.
    pub fn constant(value: f64) -> Self {
        Self::readable(move || Box::pin(async move { anyhow::Ok(value) }))
    }

    /// A read-only resource backed by a device query.
    ///
    /// The getter asks the device and parses the reply as a number.
    pub fn query(handle: DeviceHandle, query: impl Into<String>) -> Self {
        let query = query.into();
        Self::readable(move || {
            let handle = handle.clone();
            let query = query.clone();
            Box::pin(async move {
                let reply = handle
                    .ask(&query)
                    .await?
                    .context("query issued during a multi-command capture")?;
                reply
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("unparseable reply to '{}': '{}'", query, reply))
            })
        })
    }

    /// Add a setter that formats each value into a device command.
    pub fn with_command_setter(
        mut self,
        handle: DeviceHandle,
        format: impl Fn(f64) -> String + Send + Sync + 'static,
    ) -> Self {
        let format = Arc::new(format);
        self.setter = Some(Arc::new(move |value| {
            let handle = handle.clone();
            let format = Arc::clone(&format);
            Box::pin(async move {
                handle.write(&format(value)).await?;
                anyhow::Ok(())
            })
        }));
        self
    }

    /// Add a getter closure.
    pub fn with_getter(
        mut self,
        getter: impl Fn() -> BoxFuture<'static, Result<f64>> + Send + Sync + 'static,
    ) -> Self {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// Add a setter closure.
    pub fn with_setter(
        mut self,
        setter: impl Fn(f64) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.setter = Some(Arc::new(setter));
        self
    }

    /// Add a converter for raw input values.
    pub fn with_converter(mut self, converter: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Constrain writes to a closed range.
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.constraints = Constraints::Range { min, max };
        self
    }

    /// Constrain writes to a set of allowed values.
    pub fn with_allowed_values(mut self, values: Vec<f64>) -> Self {
        self.constraints = Constraints::Choices(values);
        self
    }

    /// Whether the resource can be read.
    pub fn is_readable(&self) -> bool {
        self.getter.is_some()
    }

    /// Whether the resource can be written.
    pub fn is_writable(&self) -> bool {
        self.setter.is_some()
    }

    /// Read the value of the resource.
    pub async fn value(&self) -> Result<f64> {
        let getter = self.getter.as_ref().ok_or(SweepError::NotReadable)?;
        getter().await
    }

    /// Write a value to the resource.
    ///
    /// The value is validated against the allowed-value constraints before it
    /// ever reaches hardware.
    pub async fn set_value(&self, value: f64) -> Result<()> {
        let setter = self.setter.as_ref().ok_or(SweepError::NotWritable)?;
        self.constraints.validate(value)?;
        setter(value).await
    }

    /// Apply the configured converter to a raw input, or return it unchanged.
    ///
    /// No side effects.
    pub fn convert(&self, value: f64) -> f64 {
        match &self.converter {
            Some(converter) => converter(value),
            None => value,
        }
    }

    /// Slowly sweep the resource from one value to another.
    ///
    /// Applies a linear sequence of `steps` values; the final write is
    /// exactly `to`.
    pub async fn sweep(&self, from: f64, to: f64, steps: usize) -> Result<()> {
        let steps = steps.max(2);

        for i in 0..steps {
            let fraction = i as f64 / (steps - 1) as f64;
            self.set_value(from + (to - from) * fraction).await?;
        }
        Ok(())
    }
}

impl Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("readable", &self.is_readable())
            .field("writable", &self.is_writable())
            .field("converter", &self.converter.is_some())
            .field("constraints", &self.constraints)
            .finish()
    }
}
