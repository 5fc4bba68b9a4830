//! Transport capability interface.
//!
//! A device selects exactly one transport driver at construction time and
//! talks to it exclusively through the [`Transport`] trait. The trait is the
//! seam where real links (TCP sockets, VISA sessions, HTTP endpoints) and the
//! mock transport used in tests plug in, so higher layers never care which
//! physical channel a command travels over.

use async_trait::async_trait;
use thiserror::Error;

/// Faults raised by a transport driver.
///
/// Timeouts get their own variant so the device layer can translate them into
/// the common device-timeout kind; every other fault propagates unchanged.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("connection closed by peer")]
    Closed,

    #[error("transport not connected")]
    NotConnected,
}

/// The transport driver selected for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw-socket SCPI over Ethernet (the VISA-over-TCPIP role).
    Tcp,
    /// Telnet-style line protocol over Ethernet.
    Telnet,
    /// HTTP GET command endpoint.
    Http,
    /// GPIB via a VISA resource string.
    Gpib,
    /// USB via a raw VISA resource string.
    VisaUsb,
    /// Scripted in-memory transport for tests and simulation.
    Mock,
}

impl TransportKind {
    /// Whether multi-command batching makes sense on this link.
    ///
    /// Command batching assumes a message-oriented command/response channel;
    /// the HTTP and telnet links do not provide one.
    pub fn supports_batching(self) -> bool {
        matches!(
            self,
            TransportKind::Tcp | TransportKind::Gpib | TransportKind::VisaUsb | TransportKind::Mock
        )
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::Telnet => write!(f, "telnet"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::Gpib => write!(f, "gpib"),
            TransportKind::VisaUsb => write!(f, "visa-usb"),
            TransportKind::Mock => write!(f, "mock"),
        }
    }
}

/// One physical (or simulated) communication channel.
///
/// # Contract
/// - `open()` must be called before `send()`/`receive()`; drivers report
///   [`TransportError::NotConnected`] otherwise.
/// - `send()` transmits one textual command; drivers append their own line
///   termination where the link requires one.
/// - `receive()` returns exactly what the link produced for one response,
///   including any trailing whitespace. Stripping is the device layer's job.
/// - Drivers surface their native timeout as [`TransportError::Timeout`].
///
/// # Thread Safety
/// A transport is owned by its device's I/O state behind the subtree lock,
/// so implementations take `&mut self` and only need to be `Send`.
#[async_trait]
pub trait Transport: Send {
    /// The driver tag this transport was selected as.
    fn kind(&self) -> TransportKind;

    /// Open the underlying channel.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Transmit one command.
    async fn send(&mut self, message: &str) -> Result<(), TransportError>;

    /// Read one response.
    async fn receive(&mut self) -> Result<String, TransportError>;

    /// Close the channel, if possible.
    async fn close(&mut self) -> Result<(), TransportError>;
}
