//! Connection manager actor
//!
//! One task per open device. It owns the [`SerialLink`] and the
//! [`GrblController`], and serializes everything that touches them: firmware
//! lines, client requests and the poll timer all pass through one
//! `tokio::select!` loop, so transitions apply strictly in arrival order.

use crate::communication::{LinkEvent, SerialLink};
use crate::engine::registry::PortRegistry;
use crate::firmware::grbl::{ControllerCommand, Effect, GrblController};
use gcodemux_core::{
    ClientId, ConnectionError, ControllerError, ControllerType, EngineEvent, Error, JobStatus,
    MachineStatus, SenderStatus, WorkflowState, WriteContext,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Requests handled by a connection task
#[derive(Debug)]
pub enum PortRequest {
    /// Start broadcasting to a client and bring it up to date
    Attach {
        client: ClientId,
        events: mpsc::UnboundedSender<EngineEvent>,
        in_use: bool,
        respond_to: oneshot::Sender<()>,
    },
    /// Stop broadcasting to a client; answers with the clients left
    Detach {
        client: ClientId,
        respond_to: oneshot::Sender<usize>,
    },
    /// Run a parsed client command
    Command {
        client: ClientId,
        command: ControllerCommand,
        respond_to: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Queue raw text on the immediate lane
    Write {
        text: String,
        context: WriteContext,
        respond_to: oneshot::Sender<Result<(), ControllerError>>,
    },
    /// Read the current state
    Snapshot {
        respond_to: oneshot::Sender<PortSnapshot>,
    },
    /// Close the device for everyone
    Close { respond_to: oneshot::Sender<()> },
}

/// Point-in-time view of one open port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSnapshot {
    /// Device path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Firmware dialect
    pub controller_type: ControllerType,
    /// Attached clients
    pub clients: Vec<ClientId>,
    /// Mirrored machine status
    pub status: MachineStatus,
    /// Ledger and queues
    pub sender: SenderStatus,
    /// Job workflow state
    pub workflow: WorkflowState,
    /// Loaded job
    pub job: Option<JobStatus>,
}

/// Handle to a connection task
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    port: String,
    baud_rate: u32,
    controller_type: ControllerType,
    generation: u64,
    sender: mpsc::Sender<PortRequest>,
}

impl ConnectionHandle {
    /// Device path
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Baud rate the device was opened at
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Firmware dialect
    pub fn controller_type(&self) -> ControllerType {
        self.controller_type
    }

    /// Registry generation of this connection
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the task has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn gone(&self) -> ConnectionError {
        ConnectionError::ShuttingDown {
            port: self.port.clone(),
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> PortRequest,
    ) -> Result<T, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    /// Attach a client; it immediately receives the current state
    pub async fn attach(
        &self,
        client: ClientId,
        events: mpsc::UnboundedSender<EngineEvent>,
        in_use: bool,
    ) -> Result<(), ConnectionError> {
        self.request(|respond_to| PortRequest::Attach {
            client,
            events,
            in_use,
            respond_to,
        })
        .await
    }

    /// Detach a client; returns how many remain attached
    pub async fn detach(&self, client: ClientId) -> Result<usize, ConnectionError> {
        self.request(|respond_to| PortRequest::Detach { client, respond_to })
            .await
    }

    /// Run a client command
    pub async fn command(&self, client: ClientId, command: ControllerCommand) -> Result<(), Error> {
        self.request(|respond_to| PortRequest::Command {
            client,
            command,
            respond_to,
        })
        .await??;
        Ok(())
    }

    /// Queue raw text
    pub async fn write(&self, text: String, context: WriteContext) -> Result<(), Error> {
        self.request(|respond_to| PortRequest::Write {
            text,
            context,
            respond_to,
        })
        .await??;
        Ok(())
    }

    /// Current state of the port
    pub async fn snapshot(&self) -> Result<PortSnapshot, ConnectionError> {
        self.request(|respond_to| PortRequest::Snapshot { respond_to })
            .await
    }

    /// Close the device for every client
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.request(|respond_to| PortRequest::Close { respond_to })
            .await
    }
}

/// Start the task for a freshly opened device
pub fn spawn(
    link: SerialLink,
    controller: GrblController,
    poll_interval: Duration,
    registry: PortRegistry,
    generation: u64,
) -> ConnectionHandle {
    let (sender, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let handle = ConnectionHandle {
        port: controller.port().to_string(),
        baud_rate: controller.baud_rate(),
        controller_type: controller.controller_type(),
        generation,
        sender,
    };

    let span = tracing::info_span!("port", port = %handle.port);
    let actor = ConnectionManager {
        controller,
        link,
        requests,
        subscribers: HashMap::new(),
        poll_interval,
        registry,
        generation,
    };
    tokio::spawn(actor.run().instrument(span));

    handle
}

struct ConnectionManager {
    controller: GrblController,
    link: SerialLink,
    requests: mpsc::Receiver<PortRequest>,
    subscribers: HashMap<ClientId, mpsc::UnboundedSender<EngineEvent>>,
    poll_interval: Duration,
    registry: PortRegistry,
    generation: u64,
}

impl ConnectionManager {
    async fn run(mut self) {
        tracing::info!("Connection task started");
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let closed_by = loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => {
                        if let ControlFlow::Break(respond_to) = self.handle_request(request) {
                            break Some(respond_to);
                        }
                    }
                    None => {
                        self.shutdown("engine dropped");
                        break None;
                    }
                },
                event = self.link.events.recv() => match event {
                    Some(LinkEvent::Line(line)) => {
                        let effects = self.controller.handle_line(&line, Instant::now());
                        self.apply(effects);
                    }
                    Some(LinkEvent::Closed(reason)) => {
                        self.link_lost(reason);
                        break None;
                    }
                    None => {
                        self.link_lost(None);
                        break None;
                    }
                },
                _ = poll.tick() => {
                    let effects = self.controller.on_tick(Instant::now());
                    self.apply(effects);
                }
            }
        };

        let Self {
            controller,
            link,
            mut subscribers,
            registry,
            generation,
            ..
        } = self;
        let port = controller.port().to_string();

        // The device must be free before anyone learns the port is closed
        link.close().await;
        registry.release(&port, generation);

        let event = EngineEvent::SerialPortClose { port };
        for events in subscribers.values() {
            let _ = events.send(event.clone());
        }
        subscribers.clear();
        if let Some(respond_to) = closed_by {
            let _ = respond_to.send(());
        }
        tracing::info!("Connection task stopped");
    }

    /// Breaks with the closer's reply channel once the port is closed
    fn handle_request(&mut self, request: PortRequest) -> ControlFlow<oneshot::Sender<()>> {
        match request {
            PortRequest::Attach {
                client,
                events,
                in_use,
                respond_to,
            } => {
                for event in self.controller.attach_events(in_use) {
                    let _ = events.send(event);
                }
                self.subscribers.insert(client, events);
                tracing::info!("Client {} attached ({} total)", client, self.subscribers.len());
                let _ = respond_to.send(());
            }
            PortRequest::Detach { client, respond_to } => {
                if self.subscribers.remove(&client).is_some() {
                    tracing::info!("Client {} detached", client);
                }
                let _ = respond_to.send(self.subscribers.len());
            }
            PortRequest::Command {
                client,
                command,
                respond_to,
            } => {
                let result = self
                    .controller
                    .handle_command(command, client, Instant::now())
                    .map(|effects| self.apply(effects));
                let _ = respond_to.send(result);
            }
            PortRequest::Write {
                text,
                context,
                respond_to,
            } => {
                let result = self
                    .controller
                    .handle_write(&text, context, Instant::now())
                    .map(|effects| self.apply(effects));
                let _ = respond_to.send(result);
            }
            PortRequest::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
            PortRequest::Close { respond_to } => {
                self.shutdown("port closed");
                return ControlFlow::Break(respond_to);
            }
        }
        ControlFlow::Continue(())
    }

    fn snapshot(&self) -> PortSnapshot {
        let mut clients: Vec<ClientId> = self.subscribers.keys().copied().collect();
        clients.sort();
        PortSnapshot {
            port: self.controller.port().to_string(),
            baud_rate: self.controller.baud_rate(),
            controller_type: self.controller.controller_type(),
            clients,
            status: self.controller.status().clone(),
            sender: self.controller.sender().status(),
            workflow: self.controller.workflow(),
            job: self.controller.job().cloned(),
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Write {
                    data,
                    context,
                    echo,
                } => {
                    if self.link.outbound.send(data).is_err() {
                        tracing::error!("Write after the device closed");
                        continue;
                    }
                    if let Some(data) = echo {
                        self.broadcast(EngineEvent::SerialPortWrite {
                            port: self.controller.port().to_string(),
                            data,
                            context,
                        });
                    }
                }
                Effect::Emit(event) => self.broadcast(event),
            }
        }
    }

    fn broadcast(&mut self, event: EngineEvent) {
        let before = self.subscribers.len();
        self.subscribers
            .retain(|_, events| events.send(event.clone()).is_ok());
        if self.subscribers.len() < before {
            tracing::debug!("Pruned {} dead subscribers", before - self.subscribers.len());
        }
    }

    /// Halt the job; `serialport:close` follows once the device is released
    fn shutdown(&mut self, message: &str) {
        tracing::info!("Closing: {}", message);
        let effects = self.controller.on_disconnect(message);
        self.broadcast_only(effects);
    }

    fn link_lost(&mut self, reason: Option<String>) {
        let message = reason.unwrap_or_else(|| "device disconnected".to_string());
        tracing::error!("Link lost: {}", message);
        self.broadcast(EngineEvent::SerialPortError {
            port: self.controller.port().to_string(),
            message: message.clone(),
        });
        self.shutdown(&message);
    }

    /// Forward events but never write to a closing device
    fn broadcast_only(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            if let Effect::Emit(event) = effect {
                self.broadcast(event);
            }
        }
    }
}
