//! VISA transport for GPIB and raw-USB instruments.
//!
//! This driver wraps the `visa-rs` crate and covers the two links that still
//! need a vendor VISA stack: GPIB (`GPIB<board>::<pad>::<sad>::INSTR`) and
//! raw USB resources (`USB0::<vendor>::<product>::<serial>::RAW`). It is
//! compiled only with the `instrument_visa` feature; selecting a GPIB or USB
//! address without it is reported as a configuration error at device
//! construction.
//!
//! The VISA session does blocking I/O bounded by the session timeout, which
//! is short compared to a sweep step; calls are made directly under the
//! device lock.

use super::transport::{Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{Read, Write};
use std::time::Duration;
use visa_rs::prelude::*;

/// VISA session transport.
pub struct VisaTransport {
    resource_string: String,
    kind: TransportKind,
    timeout: Duration,
    session: Option<visa_rs::Instrument>,
}

impl VisaTransport {
    /// Create a GPIB transport for `GPIB<board>::<pad>::<sad>::INSTR`.
    pub fn gpib(board: u8, pad: u8, sad: u8, io_timeout: Duration) -> Self {
        Self {
            resource_string: format!("GPIB{}::{}::{}::INSTR", board, pad, sad),
            kind: TransportKind::Gpib,
            timeout: io_timeout,
            session: None,
        }
    }

    /// Create a transport for a raw USB VISA resource string.
    pub fn usb(resource: impl Into<String>, io_timeout: Duration) -> Self {
        Self {
            resource_string: resource.into(),
            kind: TransportKind::VisaUsb,
            timeout: io_timeout,
            session: None,
        }
    }

    fn session_mut(&mut self) -> Result<&mut visa_rs::Instrument, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }
}

fn from_visa_io(err: std::io::Error) -> TransportError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        TransportError::Timeout
    } else {
        TransportError::Io(err)
    }
}

#[async_trait]
impl Transport for VisaTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let rm = DefaultRM::new().map_err(|e| {
            TransportError::Io(std::io::Error::other(format!(
                "failed to initialize VISA resource manager: {}",
                e
            )))
        })?;

        let c_string = CString::new(self.resource_string.clone())
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let visa_string = visa_rs::VisaString::from(c_string);

        let mut session = rm
            .open(
                &visa_string,
                AccessMode::NO_LOCK,
                visa_rs::TIMEOUT_IMMEDIATE,
            )
            .map_err(|e| {
                TransportError::Io(std::io::Error::other(format!(
                    "failed to open VISA resource '{}': {}",
                    self.resource_string, e
                )))
            })?;

        session
            .set_timeout(self.timeout.as_millis() as u32)
            .map_err(|e| {
                TransportError::Io(std::io::Error::other(format!(
                    "failed to set VISA timeout: {}",
                    e
                )))
            })?;

        tracing::info!(resource = %self.resource_string, "opened VISA session");

        self.session = Some(session);
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let session = self.session_mut()?;
        session
            .write_all(message.as_bytes())
            .map_err(from_visa_io)?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        let session = self.session_mut()?;

        let mut buf = [0u8; 4096];
        let n = session.read(&mut buf).map_err(from_visa_io)?;

        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.session = None;
        Ok(())
    }
}
