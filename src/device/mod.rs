//! Device tree and synchronized command interface.
//!
//! A [`Device`] is a node in a transport tree: it owns named sub-devices
//! (channels, ports), named [`Resource`]s, and, at the root, the single
//! transport the whole subtree shares. Every node in a subtree holds the same
//! I/O lock, so two resources on the same physical link never interleave
//! commands even when they are driven from different worker tasks.
//!
//! The command surface mirrors what instrument code actually needs:
//!
//! - `write` / `read` / `ask`: synchronized primitives; `ask` holds the lock
//!   across its write and read so the pair is atomic on the wire.
//! - `multi_command_start` / `multi_command_stop`: buffer several commands
//!   and send them as one `;`-joined message, splitting the combined response
//!   back into per-query parts.
//! - `find_resource`: resolve a path of names through nested sub-devices to
//!   a concrete resource.
//! - `idn` / `opc`: the identification and operation-complete conveniences,
//!   with `opc` retrying through device timeouts up to a configured maximum
//!   wait.
//!
//! Transport selection happens once, at construction, from the connection
//! parameters in priority order: network address, then telnet host, then HTTP
//! request address, then GPIB, then USB resource.

pub mod http;
pub mod mock;
pub mod tcp;
pub mod telnet;
pub mod transport;
#[cfg(feature = "instrument_visa")]
pub mod visa;

use crate::config::{ConnectionConfig, TransportSelection};
use crate::error::{AppResult, SweepError};
use crate::resource::Resource;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use self::transport::{Transport, TransportKind};
use tracing::{debug, info};

/// Commands starting with this marker address the whole instrument and are
/// never given the subsystem prefix when batched.
const GLOBAL_MARKER: char = '*';
/// Prefix applied to batched subsystem commands.
const ADDRESS_PREFIX: char = ':';
/// Separator between batched commands and between combined response parts.
const COMMAND_SEPARATOR: char = ';';

/// Hook run on a device after its transport opens.
pub type ConnectHook =
    Arc<dyn Fn(DeviceHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// An in-progress multi-command capture.
struct CommandBatch {
    commands: Vec<String>,
    responses_expected: usize,
}

/// Transport state guarded by the subtree lock.
struct DeviceIo {
    transport: Box<dyn Transport>,
    batch: Option<CommandBatch>,
}

/// Shared, synchronized command interface for one device.
///
/// Handles are cheap to clone and safe to move into resource closures and
/// worker tasks; all clones of a subtree's handles funnel through the same
/// lock and transport.
#[derive(Clone)]
pub struct DeviceHandle {
    name: Arc<str>,
    kind: TransportKind,
    io: Arc<Mutex<DeviceIo>>,
    max_timeout: Duration,
}

impl DeviceHandle {
    /// Device name this handle addresses.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The transport driver selected at construction.
    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    fn translate(&self, source: transport::TransportError) -> SweepError {
        SweepError::from_transport(&self.name, source)
    }

    async fn send_locked(&self, io: &mut DeviceIo, message: &str) -> AppResult<()> {
        if let Some(batch) = io.batch.as_mut() {
            debug!(device = %self.name, message, "buffering command");
            batch.commands.push(message.to_string());
            return Ok(());
        }

        debug!(device = %self.name, message, "writing");
        io.transport
            .send(message)
            .await
            .map_err(|e| self.translate(e))
    }

    async fn receive_locked(&self, io: &mut DeviceIo) -> AppResult<String> {
        let buf = io
            .transport
            .receive()
            .await
            .map_err(|e| self.translate(e))?;
        debug!(device = %self.name, response = %buf.trim_end(), "read");
        Ok(buf)
    }

    async fn ask_locked(&self, io: &mut DeviceIo, message: &str) -> AppResult<Option<String>> {
        self.send_locked(io, message).await?;

        if let Some(batch) = io.batch.as_mut() {
            batch.responses_expected += 1;
            return Ok(None);
        }

        let buf = self.receive_locked(io).await?;
        Ok(Some(buf.trim_end().to_string()))
    }

    /// Write a message to the device.
    ///
    /// When a multi-command capture is active, the message is buffered
    /// instead of sent.
    pub async fn write(&self, message: &str) -> AppResult<()> {
        let mut io = self.io.lock().await;
        self.send_locked(&mut io, message).await
    }

    /// Read from the device, returning exactly what the transport produced.
    pub async fn read_raw(&self) -> AppResult<String> {
        let mut io = self.io.lock().await;
        self.receive_locked(&mut io).await
    }

    /// Read from the device with trailing whitespace stripped.
    pub async fn read(&self) -> AppResult<String> {
        Ok(self.read_raw().await?.trim_end().to_string())
    }

    /// Write then read, atomically under the device lock.
    ///
    /// Returns `None` when a multi-command capture is active; the query is
    /// buffered and its response will come back from `multi_command_stop`.
    pub async fn ask(&self, message: &str) -> AppResult<Option<String>> {
        let mut io = self.io.lock().await;
        self.ask_locked(&mut io, message).await
    }

    /// Redirect further commands into a buffer.
    ///
    /// Only message-oriented links support batching; requesting it on others
    /// is a configuration error.
    pub async fn multi_command_start(&self) -> AppResult<()> {
        if !self.kind.supports_batching() {
            return Err(SweepError::Configuration(format!(
                "multi-command batching is not supported over {}",
                self.kind
            )));
        }

        debug!(device = %self.name, "starting multi-command message");

        let mut io = self.io.lock().await;
        io.batch = Some(CommandBatch {
            commands: Vec::new(),
            responses_expected: 0,
        });
        Ok(())
    }

    /// Stop buffering and send the accumulated commands as one message.
    ///
    /// Each buffered command without the `*` global marker is given the `:`
    /// addressing prefix; the commands are joined with `;`. If any queries
    /// were buffered, the single combined response is split back into as many
    /// parts as queries were issued, in issue order.
    pub async fn multi_command_stop(&self) -> AppResult<Vec<String>> {
        debug!(device = %self.name, "stopping multi-command message");

        let mut io = self.io.lock().await;

        let batch = io.batch.take().ok_or(SweepError::BatchNotStarted)?;
        if batch.commands.is_empty() {
            return Ok(Vec::new());
        }

        let message = batch
            .commands
            .iter()
            .map(|cmd| {
                if cmd.starts_with(GLOBAL_MARKER) {
                    cmd.clone()
                } else {
                    format!("{}{}", ADDRESS_PREFIX, cmd)
                }
            })
            .collect::<Vec<_>>()
            .join(&COMMAND_SEPARATOR.to_string());

        if batch.responses_expected > 0 {
            let combined = self
                .ask_locked(&mut io, &message)
                .await?
                .unwrap_or_default();

            Ok(combined
                .splitn(batch.responses_expected, COMMAND_SEPARATOR)
                .map(str::to_string)
                .collect())
        } else {
            self.send_locked(&mut io, &message).await?;
            Ok(Vec::new())
        }
    }

    /// Ask the device for identification.
    pub async fn idn(&self) -> AppResult<String> {
        Ok(self.ask("*IDN?").await?.unwrap_or_default())
    }

    /// Wait until the device reports the current operation complete.
    ///
    /// Retries `*OPC?` through device timeouts until it succeeds or the
    /// configured maximum wait elapses, at which point the timeout is
    /// re-raised.
    pub async fn opc(&self) -> AppResult<()> {
        let deadline = Instant::now() + self.max_timeout;

        loop {
            match self.ask("*OPC?").await {
                Ok(_) => return Ok(()),
                Err(SweepError::Timeout { .. }) if Instant::now() < deadline => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Close the transport, if possible.
    pub async fn close(&self) -> AppResult<()> {
        debug!(device = %self.name, "closing device");

        let mut io = self.io.lock().await;
        io.transport.close().await.map_err(|e| self.translate(e))
    }
}

/// A node in a device tree.
///
/// The root node owns the transport; sub-devices share the root's lock and
/// link. Resources hang off whichever node owns the capability they expose.
pub struct Device {
    handle: DeviceHandle,
    subdevices: HashMap<String, Device>,
    resources: HashMap<String, Arc<Resource>>,
    post_connect: Option<ConnectHook>,
}

impl Device {
    /// Create a device, selecting its transport from the connection
    /// parameters in priority order.
    pub fn new(name: impl Into<String>, config: &ConnectionConfig) -> AppResult<Self> {
        let name = name.into();
        let io_timeout = config.io_timeout();

        let transport: Box<dyn Transport> = match config.select()? {
            TransportSelection::Tcp { host, port } => {
                debug!(device = %name, host = %host, port, "using SCPI socket transport");
                Box::new(tcp::TcpTransport::new(host, port, io_timeout))
            }
            TransportSelection::Telnet { host, port } => {
                debug!(device = %name, host = %host, port, "using telnet transport");
                Box::new(telnet::TelnetTransport::new(host, port, io_timeout))
            }
            TransportSelection::Http { address } => {
                debug!(device = %name, address = %address, "using HTTP transport");
                Box::new(
                    http::HttpTransport::new(&address, io_timeout)
                        .map_err(|e| SweepError::Configuration(e.to_string()))?,
                )
            }
            #[cfg(feature = "instrument_visa")]
            TransportSelection::Gpib { board, pad, sad } => {
                debug!(device = %name, board, pad, sad, "using VISA GPIB transport");
                Box::new(visa::VisaTransport::gpib(board, pad, sad, io_timeout))
            }
            #[cfg(feature = "instrument_visa")]
            TransportSelection::VisaUsb { resource } => {
                debug!(device = %name, resource = %resource, "using VISA USB transport");
                Box::new(visa::VisaTransport::usb(resource, io_timeout))
            }
            #[cfg(not(feature = "instrument_visa"))]
            TransportSelection::Gpib { .. } | TransportSelection::VisaUsb { .. } => {
                return Err(SweepError::Configuration(
                    "VISA support not enabled; rebuild with --features instrument_visa"
                        .to_string(),
                ));
            }
        };

        Ok(Self::with_transport_and_timeout(
            name,
            transport,
            config.operation_complete_timeout(),
        ))
    }

    /// Create a device around an explicit transport (mock or custom).
    pub fn with_transport(name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        Self::with_transport_and_timeout(name, transport, Duration::from_secs(15))
    }

    fn with_transport_and_timeout(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        max_timeout: Duration,
    ) -> Self {
        let name = name.into();
        info!(device = %name, "creating device");

        let kind = transport.kind();
        Self {
            handle: DeviceHandle {
                name: name.into(),
                kind,
                io: Arc::new(Mutex::new(DeviceIo {
                    transport,
                    batch: None,
                })),
                max_timeout,
            },
            subdevices: HashMap::new(),
            resources: HashMap::new(),
            post_connect: None,
        }
    }

    /// Override the maximum wait for operation-complete polling.
    ///
    /// Applies to sub-devices attached afterwards as well.
    pub fn with_operation_timeout(mut self, max_timeout: Duration) -> Self {
        self.handle.max_timeout = max_timeout;
        self
    }

    /// Device name.
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Shared command interface for this device.
    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    /// Install a post-connection hook, run after the transport opens.
    pub fn on_connected<F>(&mut self, hook: F)
    where
        F: Fn(DeviceHandle) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.post_connect = Some(Arc::new(hook));
    }

    /// Attach a named sub-device sharing this subtree's lock and transport.
    pub fn attach_subdevice(&mut self, name: impl Into<String>) -> &mut Device {
        let name = name.into();
        debug!(parent = %self.handle.name, subdevice = %name, "attaching subdevice");

        let sub = Device {
            handle: DeviceHandle {
                name: Arc::from(name.as_str()),
                kind: self.handle.kind,
                io: Arc::clone(&self.handle.io),
                max_timeout: self.handle.max_timeout,
            },
            subdevices: HashMap::new(),
            resources: HashMap::new(),
            post_connect: None,
        };

        self.subdevices.entry(name).or_insert(sub)
    }

    /// Register a resource on this node.
    pub fn add_resource(&mut self, name: impl Into<String>, resource: Resource) -> Arc<Resource> {
        let resource = Arc::new(resource);
        self.resources.insert(name.into(), Arc::clone(&resource));
        resource
    }

    /// Look up a direct sub-device.
    pub fn subdevice(&self, name: &str) -> Option<&Device> {
        self.subdevices.get(name)
    }

    /// Look up a resource registered directly on this node.
    pub fn resource(&self, name: &str) -> Option<Arc<Resource>> {
        self.resources.get(name).map(Arc::clone)
    }

    /// Resolve a path of names to a resource.
    ///
    /// All but the last segment address nested sub-devices; the last
    /// addresses a resource on the terminal device. An unknown segment is an
    /// error naming the segment and the path traversed so far.
    pub fn find_resource(&self, path: &[&str]) -> AppResult<Arc<Resource>> {
        debug!(device = %self.handle.name, ?path, "looking for resource");

        let (last, intermediate) = match path.split_last() {
            Some(parts) => parts,
            None => {
                return Err(SweepError::Configuration("no resource path provided".to_string()));
            }
        };

        let mut dev = self;
        let mut traversed: Vec<String> = Vec::new();

        for segment in intermediate {
            dev = dev.subdevices.get(*segment).ok_or_else(|| SweepError::NoSuchDevice {
                name: segment.to_string(),
                path: traversed.clone(),
            })?;
            traversed.push(segment.to_string());
        }

        dev.resources
            .get(*last)
            .map(Arc::clone)
            .ok_or_else(|| SweepError::NoSuchResource {
                name: last.to_string(),
                path: traversed,
            })
    }

    /// Open the transport and run post-connection setup over the subtree.
    pub async fn connect(&self) -> AppResult<()> {
        info!(
            device = %self.handle.name,
            driver = %self.handle.kind,
            "connecting to device"
        );

        {
            let mut io = self.handle.io.lock().await;
            io.transport
                .open()
                .await
                .map_err(|source| SweepError::DeviceNotFound {
                    device: self.handle.name.to_string(),
                    source,
                })?;
        }

        // Device-specific setup, recursively over the subtree.
        let mut pending: Vec<&Device> = vec![self];
        while let Some(dev) = pending.pop() {
            if let Some(hook) = &dev.post_connect {
                debug!(device = %dev.handle.name, "running post-connection setup");
                hook(dev.handle()).await.map_err(|e| SweepError::DeviceNotFound {
                    device: dev.handle.name.to_string(),
                    source: transport::TransportError::Io(std::io::Error::other(format!(
                        "post-connection setup failed: {}",
                        e
                    ))),
                })?;
            }
            pending.extend(dev.subdevices.values());
        }

        Ok(())
    }
}
