//! Scripted mock transport for tests and simulation.
//!
//! Instead of faking devices through inheritance, tests construct a device
//! with a [`MockTransport`]: a map of command → canned response plus an
//! ordered transcript of everything that was sent. Queries whose command is
//! in the map enqueue their response at send time, so a write-then-read
//! sequence (and a batched combined message) observes the same ordering a
//! real link would produce.

use super::transport::{Transport, TransportError, TransportKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Shared transcript of messages a mock transport has sent.
pub type Transcript = Arc<Mutex<Vec<String>>>;

/// In-memory transport driven by canned responses.
pub struct MockTransport {
    responses: HashMap<String, String>,
    pending: VecDeque<String>,
    transcript: Transcript,
    connected: bool,
    fail_to_open: bool,
    time_out_reads: bool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: HashMap::new(),
            pending: VecDeque::new(),
            transcript: Arc::new(Mutex::new(Vec::new())),
            connected: false,
            fail_to_open: false,
            time_out_reads: false,
        }
    }

    /// Script a response for an exact command string.
    pub fn with_response(mut self, command: &str, response: &str) -> Self {
        self.responses
            .insert(command.to_string(), response.to_string());
        self
    }

    /// Make `open()` fail, to exercise connection-error paths.
    pub fn failing_to_open(mut self) -> Self {
        self.fail_to_open = true;
        self
    }

    /// Make every read report a transport timeout.
    pub fn timing_out_reads(mut self) -> Self {
        self.time_out_reads = true;
        self
    }

    /// Queue a raw response for the next read, bypassing the command map.
    pub fn push_response(&mut self, response: &str) {
        self.pending.push_back(response.to_string());
    }

    /// Handle to the transcript of sent messages.
    pub fn transcript(&self) -> Transcript {
        Arc::clone(&self.transcript)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.fail_to_open {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock transport scripted to refuse",
            )));
        }
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }

        self.transcript
            .lock()
            .expect("transcript lock poisoned")
            .push(message.to_string());

        if let Some(response) = self.responses.get(message) {
            self.pending.push_back(response.clone());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.time_out_reads {
            return Err(TransportError::Timeout);
        }

        self.pending.pop_front().ok_or(TransportError::Timeout)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_query_round_trip() {
        let mut mock = MockTransport::new().with_response("*IDN?", "ACME,MOCK,0,0.1\n");
        let transcript = mock.transcript();

        mock.open().await.unwrap();
        mock.send("*IDN?").await.unwrap();
        assert_eq!(mock.receive().await.unwrap(), "ACME,MOCK,0,0.1\n");

        assert_eq!(
            transcript.lock().unwrap().as_slice(),
            ["*IDN?".to_string()]
        );
    }

    #[tokio::test]
    async fn unscripted_read_times_out() {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();
        mock.send("SET 1").await.unwrap();
        assert!(matches!(
            mock.receive().await.unwrap_err(),
            TransportError::Timeout
        ));
    }
}
