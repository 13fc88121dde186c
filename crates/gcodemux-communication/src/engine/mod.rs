//! Multiplexing engine
//!
//! The [`Engine`] is the entry point for UI-facing clients. It maps device
//! paths to connection tasks, rooms client sessions by port and routes
//! requests to the right task. Several clients may share one device; the
//! first `open` starts the connection, later ones hot-attach to it.

pub mod registry;

use crate::communication::{ConnectionParams, PortOpener, SerialPortInfo, SerialPortOpener};
use crate::connection::{self, ConnectionHandle, PortSnapshot};
use crate::firmware::grbl::{ControllerCommand, GrblController};
use gcodemux_core::{ClientId, ConnectionError, ControllerType, EngineEvent, Error, Result, WriteContext};
use gcodemux_settings::Config;
use registry::{Claim, PortRegistry};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use registry::{ClientSession, PortEntry};

/// Options for [`Engine::open`]; unset fields fall back to the config
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Baud rate
    pub baud_rate: Option<u32>,
    /// Firmware dialect
    pub controller_type: Option<ControllerType>,
}

impl OpenOptions {
    /// Options with an explicit baud rate
    pub fn baud(baud_rate: u32) -> Self {
        Self {
            baud_rate: Some(baud_rate),
            ..Default::default()
        }
    }
}

/// Receiving end of a client session
pub type EventStream = mpsc::UnboundedReceiver<EngineEvent>;

struct EngineInner {
    config: Config,
    opener: Arc<dyn PortOpener>,
    registry: PortRegistry,
}

/// Controller communication engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ports", &self.inner.registry.ports())
            .finish()
    }
}

impl Engine {
    /// Engine backed by real serial devices
    pub fn new(config: Config) -> Self {
        let opener = SerialPortOpener::new(config.devices.clone());
        Self::with_opener(config, Arc::new(opener))
    }

    /// Engine backed by a custom opener
    pub fn with_opener(config: Config, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                config,
                opener,
                registry: PortRegistry::new(),
            }),
        }
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn registry(&self) -> &PortRegistry {
        &self.inner.registry
    }

    fn ensure_client(&self, client: ClientId) -> std::result::Result<(), ConnectionError> {
        if self.registry().has_session(client) {
            Ok(())
        } else {
            Err(ConnectionError::UnknownClient {
                client: client.to_string(),
            })
        }
    }

    fn handle(&self, port: &str) -> std::result::Result<ConnectionHandle, ConnectionError> {
        self.registry()
            .get(port)
            .ok_or_else(|| ConnectionError::NotOpen {
                port: port.to_string(),
            })
    }

    /// Register a new client session
    pub fn connect_client(&self) -> (ClientId, EventStream) {
        let client = ClientId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry().add_session(client, tx);
        tracing::info!("Client {} connected", client);
        (client, rx)
    }

    /// Tear down a client session and detach it from every port
    ///
    /// Ports stay open for the remaining clients.
    pub async fn disconnect_client(&self, client: ClientId) {
        let Some(session) = self.registry().remove_session(client) else {
            return;
        };
        for port in session.rooms {
            if let Some(handle) = self.registry().get(&port) {
                if let Err(e) = handle.detach(client).await {
                    tracing::debug!("Detach from {} skipped: {}", port, e);
                }
            }
        }
        tracing::info!("Client {} disconnected", client);
    }

    /// Open a port, or attach to it if it is already open at the same settings
    pub async fn open(&self, client: ClientId, port: &str, options: OpenOptions) -> Result<()> {
        let events = self.registry().session_events(client)?;
        let baud_rate = options
            .baud_rate
            .unwrap_or(self.inner.config.connection.baud_rate);
        let controller_type = options
            .controller_type
            .unwrap_or(self.inner.config.connection.controller_type);

        match self.registry().claim(port, baud_rate, controller_type)? {
            Claim::Existing(handle) => {
                tracing::info!("Client {} attaching to open port {}", client, port);
                handle.attach(client, events, true).await?;
            }
            Claim::New { generation } => {
                // Detached so the reservation is published or released even
                // if this caller goes away mid-open
                let engine = self.clone();
                let path = port.to_string();
                let started = tokio::spawn(async move {
                    let result = engine.start(&path, baud_rate, controller_type, generation).await;
                    if result.is_err() {
                        engine.registry().release(&path, generation);
                    }
                    result
                });
                let handle = started.await.map_err(|e| {
                    self.registry().release(port, generation);
                    ConnectionError::Transport {
                        port: port.to_string(),
                        reason: e.to_string(),
                    }
                })??;
                handle.attach(client, events, false).await?;
            }
        }

        self.registry().join(client, port);
        Ok(())
    }

    async fn start(
        &self,
        port: &str,
        baud_rate: u32,
        controller_type: ControllerType,
        generation: u64,
    ) -> std::result::Result<ConnectionHandle, ConnectionError> {
        let params = ConnectionParams::serial(port, baud_rate);
        params.validate()?;

        let opener = Arc::clone(&self.inner.opener);
        let link = tokio::task::spawn_blocking(move || opener.open(&params))
            .await
            .map_err(|e| ConnectionError::Transport {
                port: port.to_string(),
                reason: e.to_string(),
            })??;

        let streaming = &self.inner.config.streaming;
        let controller = GrblController::new(port, baud_rate, controller_type, streaming);
        let handle = connection::spawn(
            link,
            controller,
            streaming.status_poll_interval(),
            self.registry().clone(),
            generation,
        );
        self.registry().publish(handle.clone());
        tracing::info!("Opened {} at {} baud ({})", port, baud_rate, controller_type);
        Ok(handle)
    }

    /// Close a port for every attached client
    ///
    /// Returns once the device is released and can be opened again.
    pub async fn close(&self, client: ClientId, port: &str) -> Result<()> {
        self.ensure_client(client)?;
        let handle = self.handle(port)?;
        tracing::info!("Client {} closing {}", client, port);
        handle.close().await?;
        self.registry().release(port, handle.generation());
        Ok(())
    }

    /// Detach one client from a port without closing it
    pub async fn leave(&self, client: ClientId, port: &str) -> Result<()> {
        self.ensure_client(client)?;
        let handle = self.handle(port)?;
        let remaining = handle.detach(client).await?;
        self.registry().leave(client, port);
        tracing::info!("Client {} left {} ({} remaining)", client, port, remaining);
        Ok(())
    }

    /// Run a named command on a port
    pub async fn command(&self, client: ClientId, port: &str, name: &str, args: &[Value]) -> Result<()> {
        self.ensure_client(client)?;
        let command = ControllerCommand::parse(name, args)?;
        let handle = self.handle(port)?;
        tracing::debug!("Client {} -> {}: {}", client, port, name);
        handle.command(client, command).await
    }

    /// Queue raw text on a port's immediate lane
    ///
    /// Without a context the write is attributed to `client`.
    pub async fn write(
        &self,
        client: ClientId,
        port: &str,
        text: &str,
        context: Option<WriteContext>,
    ) -> Result<()> {
        self.ensure_client(client)?;
        let handle = self.handle(port)?;
        handle
            .write(
                text.to_string(),
                context.unwrap_or_else(|| WriteContext::client(client)),
            )
            .await
    }

    /// Serial devices that look like CNC controllers
    pub async fn list(&self) -> Result<Vec<SerialPortInfo>> {
        let opener = Arc::clone(&self.inner.opener);
        tokio::task::spawn_blocking(move || opener.list())
            .await
            .map_err(|e| Error::other(e.to_string()))?
            .map_err(Error::from)
    }

    /// Current state of an open port
    pub async fn snapshot(&self, port: &str) -> Result<PortSnapshot> {
        Ok(self.handle(port)?.snapshot().await?)
    }

    /// Paths with a running connection
    pub fn ports(&self) -> Vec<String> {
        self.registry().ports()
    }

    /// Ports a client is attached to
    pub fn rooms(&self, client: ClientId) -> Vec<String> {
        self.registry().rooms(client)
    }
}
