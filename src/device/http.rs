//! HTTP GET command transport.
//!
//! A handful of embedded controllers (FPGA boards, bench supplies with a web
//! front end) take their commands as URL suffixes: `GET http://<addr><cmd>`.
//! Writes are GETs of the base address plus the command, reads return the
//! body the endpoint produced. The response body of the most recent command
//! is kept so that a write-then-read sequence observes the command's own
//! reply rather than issuing a second request.

use super::transport::{Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::time::Duration;

/// HTTP command endpoint transport.
pub struct HttpTransport {
    base: String,
    client: reqwest::Client,
    connected: bool,
    pending: Option<String>,
}

impl HttpTransport {
    /// Create a transport for `http://<request_address>`.
    pub fn new(request_address: &str, io_timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(io_timeout)
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base: format!("http://{}", request_address),
            client,
            connected: false,
            pending: None,
        })
    }

    async fn get(&self, url: &str) -> Result<String, TransportError> {
        let response = self.client.get(url).send().await.map_err(from_reqwest)?;

        if !response.status().is_success() {
            return Err(TransportError::Http(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }

        response.text().await.map_err(from_reqwest)
    }
}

fn from_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Http(err.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        // Probe the base address; a reachable endpoint answers 200.
        self.get(&self.base).await?;
        self.connected = true;

        tracing::info!(base = %self.base, "opened HTTP endpoint");
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        let url = format!("{}{}", self.base, message);
        let body = self.get(&url).await?;
        self.pending = Some(body);
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        match self.pending.take() {
            Some(body) => Ok(body),
            None => self.get(&self.base).await,
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.pending = None;
        Ok(())
    }
}
