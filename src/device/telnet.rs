//! Telnet-style line transport.
//!
//! Some older controllers only speak a CRLF-framed line protocol on the
//! telnet port. This driver keeps the same socket plumbing as the SCPI
//! transport but frames writes with CRLF and reads until a full CRLF-
//! terminated line arrives.

use super::transport::{Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Standard telnet port.
pub const DEFAULT_TELNET_PORT: u16 = 23;

/// CRLF line transport for telnet-era instruments.
pub struct TelnetTransport {
    host: String,
    port: u16,
    timeout: Duration,
    stream: Option<BufReader<TcpStream>>,
}

impl TelnetTransport {
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
impl Transport for TelnetTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Telnet
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let addr = format!("{}:{}", self.host, self.port);

        let stream = timeout(self.timeout, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| TransportError::Timeout)??;
        stream.set_nodelay(true)?;

        tracing::info!(addr = %addr, "opened telnet link");

        self.stream = Some(BufReader::new(stream));
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        let io_timeout = self.timeout;
        let stream = self.stream_mut()?;

        let framed = format!("{}\r\n", message);
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

        // Read until the CRLF terminator; a bare LF ends read_line, so keep
        // going while the line is still missing its terminator.
        let mut line = String::new();
        timeout(io_timeout, async {
            loop {
                let n = stream.read_line(&mut line).await?;
                if n == 0 {
                    return Err(TransportError::Closed);
                }
                if line.ends_with("\r\n") || line.ends_with('\n') {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout)??;

        Ok(line)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
        }
        Ok(())
    }
}
