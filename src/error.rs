//! Custom error types for the sweep automation layer.
//!
//! This module defines the primary error type, `SweepError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of instrument automation, from
//! connection problems to protocol misuse.
//!
//! ## Error Hierarchy
//!
//! `SweepError` is an enum that consolidates the error taxonomy:
//!
//! - **`DeviceNotFound`**: The underlying transport could not be opened
//!   (unreachable host, bad resource string). Carries the transport-level
//!   cause.
//! - **`Timeout`**: A transport-specific timeout, translated into a common
//!   kind so callers never need to know which link a device uses.
//! - **`Transport`**: Any other transport fault, propagated unchanged with
//!   the owning device named.
//! - **`NotReadable` / `NotWritable`**: A resource was read (written) but has
//!   no getter (setter) configured.
//! - **`InvalidValue`**: A value was rejected by a resource's allowed-value
//!   constraints before ever reaching hardware.
//! - **`BatchNotStarted`**: `multi_command_stop` was called without a
//!   matching `multi_command_start`.
//! - **`NoSuchDevice` / `NoSuchResource`**: A resource lookup path named an
//!   unknown segment; the error identifies the segment and the path
//!   traversed so far.
//! - **`Configuration`**: Semantic errors in device construction or settings,
//!   such as supplying no connection parameter at all, or requesting a
//!   transport that was compiled out.
//!
//! Connection and capability errors are never retried automatically; only
//! operation-complete polling retries, bounded by a device's maximum wait.

use crate::device::transport::TransportError;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("could not open device '{device}': {source}")]
    DeviceNotFound {
        device: String,
        #[source]
        source: TransportError,
    },

    #[error("device '{device}' timed out")]
    Timeout { device: String },

    #[error("transport error on device '{device}': {source}")]
    Transport {
        device: String,
        #[source]
        source: TransportError,
    },

    #[error("resource is not readable")]
    NotReadable,

    #[error("resource is not writable")]
    NotWritable,

    #[error("value {value} is not allowed for this resource")]
    InvalidValue { value: f64 },

    #[error("multi-command message not started")]
    BatchNotStarted,

    #[error("no subdevice '{name}' in {path:?}")]
    NoSuchDevice { name: String, path: Vec<String> },

    #[error("no resource '{name}' in {path:?}")]
    NoSuchResource { name: String, path: Vec<String> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("configuration file error: {0}")]
    ConfigFile(#[from] config::ConfigError),
}

impl SweepError {
    /// Translate a transport fault for a named device.
    ///
    /// Transport timeouts become the common [`SweepError::Timeout`] kind;
    /// everything else propagates unchanged as [`SweepError::Transport`].
    pub fn from_transport(device: &str, source: TransportError) -> Self {
        match source {
            TransportError::Timeout => SweepError::Timeout {
                device: device.to_string(),
            },
            other => SweepError::Transport {
                device: device.to_string(),
                source: other,
            },
        }
    }
}
