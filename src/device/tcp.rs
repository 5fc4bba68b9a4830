//! Raw-socket SCPI transport over TCP.
//!
//! This is the Ethernet workhorse: modern instruments expose their SCPI
//! interpreter on a plain TCP port (commonly 5025), which fills the role the
//! VISA `TCPIP::<addr>::INSTR` resource plays elsewhere. Commands are
//! newline-terminated, responses are read line-by-line, and every blocking
//! operation is wrapped in a timeout that surfaces as
//! [`TransportError::Timeout`].

use super::transport::{Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Default SCPI-over-TCP port.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// SCPI socket transport.
pub struct TcpTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

impl TcpTransport {
    /// Create a transport for `host:port` with the given I/O timeout.
    pub fn new(host: impl Into<String>, port: u16, io_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: io_timeout,
            stream: None,
        }
    }

    fn stream_mut(&mut self) -> Result<&mut BufReader<TcpStream>, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.host, self.port);

        let stream = timeout(self.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)??;

        // Nagle hurts short command/response exchanges.
        stream.set_nodelay(true)?;

        tracing::info!(addr = %addr, "opened SCPI socket");

        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let io_timeout = self.timeout;
        let stream = self.stream_mut()?;

        let framed = format!("{}\n", message);
        timeout(io_timeout, async {
            stream.get_mut().write_all(framed.as_bytes()).await?;
            stream.get_mut().flush().await
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        let io_timeout = self.timeout;
        let stream = self.stream_mut()?;

        let mut line = String::new();
        let n = timeout(io_timeout, stream.read_line(&mut line))
            .await
            .map_err(|_| TransportError::Timeout)??;

        if n == 0 {
            return Err(TransportError::Closed);
        }

        Ok(line)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        Ok(())
    }
}
