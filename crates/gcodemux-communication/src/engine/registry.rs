//! Port and client-session registry
//!
//! Owned by one [`Engine`](super::Engine); several engines in one process
//! keep separate registries. Each port entry carries a generation so a
//! connection task that outlives a reopen can never remove its successor.

use crate::connection::ConnectionHandle;
use gcodemux_core::{ClientId, ConnectionError, ControllerType, EngineEvent};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// State of one device path
#[derive(Debug, Clone)]
pub enum PortEntry {
    /// The device is being opened on a blocking thread
    Opening { baud_rate: u32, generation: u64 },
    /// A connection task owns the device
    Open(ConnectionHandle),
}

impl PortEntry {
    fn generation(&self) -> u64 {
        match self {
            Self::Opening { generation, .. } => *generation,
            Self::Open(handle) => handle.generation(),
        }
    }
}

/// Outcome of [`PortRegistry::claim`]
#[derive(Debug)]
pub enum Claim {
    /// Already open at the requested settings
    Existing(ConnectionHandle),
    /// Reserved for the caller, who must `publish` or `release` it
    New { generation: u64 },
}

/// One UI-facing client
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Where this client's events go
    pub events: mpsc::UnboundedSender<EngineEvent>,
    /// Ports this client is attached to
    pub rooms: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    ports: RwLock<HashMap<String, PortEntry>>,
    sessions: RwLock<HashMap<ClientId, ClientSession>>,
    next_generation: AtomicU64,
}

/// Shared registry of ports and client sessions
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    inner: Arc<RegistryInner>,
}

impl PortRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a port, or find it already open
    pub fn claim(
        &self,
        port: &str,
        baud_rate: u32,
        controller_type: ControllerType,
    ) -> Result<Claim, ConnectionError> {
        let unavailable = |reason: String| ConnectionError::PortUnavailable {
            port: port.to_string(),
            reason,
        };

        let mut ports = self.inner.ports.write();
        match ports.get(port) {
            Some(PortEntry::Opening { .. }) => {
                return Err(unavailable("open in progress".to_string()));
            }
            Some(PortEntry::Open(handle)) if !handle.is_closed() => {
                if handle.baud_rate() != baud_rate {
                    return Err(unavailable(format!(
                        "already open at {} baud",
                        handle.baud_rate()
                    )));
                }
                if handle.controller_type() != controller_type {
                    return Err(unavailable(format!(
                        "already open as {}",
                        handle.controller_type()
                    )));
                }
                return Ok(Claim::Existing(handle.clone()));
            }
            _ => {}
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        ports.insert(
            port.to_string(),
            PortEntry::Opening {
                baud_rate,
                generation,
            },
        );
        Ok(Claim::New { generation })
    }

    /// Replace a reservation with its running connection
    pub fn publish(&self, handle: ConnectionHandle) {
        self.inner
            .ports
            .write()
            .insert(handle.port().to_string(), PortEntry::Open(handle));
    }

    /// Forget a port if the entry still belongs to `generation`
    ///
    /// Every client attached to it leaves its room.
    pub fn release(&self, port: &str, generation: u64) -> bool {
        let removed = {
            let mut ports = self.inner.ports.write();
            match ports.get(port) {
                Some(entry) if entry.generation() == generation => ports.remove(port).is_some(),
                _ => false,
            }
        };

        if removed {
            for session in self.inner.sessions.write().values_mut() {
                session.rooms.remove(port);
            }
            tracing::debug!("Released {} (generation {})", port, generation);
        }
        removed
    }

    /// The running connection for a port
    pub fn get(&self, port: &str) -> Option<ConnectionHandle> {
        match self.inner.ports.read().get(port) {
            Some(PortEntry::Open(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Paths with a running connection
    pub fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self
            .inner
            .ports
            .read()
            .iter()
            .filter(|(_, entry)| matches!(entry, PortEntry::Open(_)))
            .map(|(port, _)| port.clone())
            .collect();
        ports.sort();
        ports
    }

    /// Register a client session
    pub fn add_session(&self, client: ClientId, events: mpsc::UnboundedSender<EngineEvent>) {
        self.inner.sessions.write().insert(
            client,
            ClientSession {
                events,
                rooms: BTreeSet::new(),
            },
        );
    }

    /// Remove a client session
    pub fn remove_session(&self, client: ClientId) -> Option<ClientSession> {
        self.inner.sessions.write().remove(&client)
    }

    /// The event channel of a client
    pub fn session_events(
        &self,
        client: ClientId,
    ) -> Result<mpsc::UnboundedSender<EngineEvent>, ConnectionError> {
        self.inner
            .sessions
            .read()
            .get(&client)
            .map(|session| session.events.clone())
            .ok_or_else(|| ConnectionError::UnknownClient {
                client: client.to_string(),
            })
    }

    /// Whether a client session exists
    pub fn has_session(&self, client: ClientId) -> bool {
        self.inner.sessions.read().contains_key(&client)
    }

    /// Put a client in a port's room
    pub fn join(&self, client: ClientId, port: &str) {
        if let Some(session) = self.inner.sessions.write().get_mut(&client) {
            session.rooms.insert(port.to_string());
        }
    }

    /// Take a client out of a port's room
    pub fn leave(&self, client: ClientId, port: &str) {
        if let Some(session) = self.inner.sessions.write().get_mut(&client) {
            session.rooms.remove(port);
        }
    }

    /// Ports a client is attached to
    pub fn rooms(&self, client: ClientId) -> Vec<String> {
        self.inner
            .sessions
            .read()
            .get(&client)
            .map(|session| session.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_claim_while_opening_is_rejected() {
        let registry = PortRegistry::new();
        let first = registry.claim("COM3", 115200, ControllerType::Grbl).unwrap();
        assert!(matches!(first, Claim::New { generation: 1 }));

        let second = registry.claim("COM3", 115200, ControllerType::Grbl);
        assert!(matches!(
            second,
            Err(ConnectionError::PortUnavailable { .. })
        ));
    }

    #[test]
    fn test_release_checks_generation() {
        let registry = PortRegistry::new();
        let Claim::New { generation } = registry.claim("COM3", 115200, ControllerType::Grbl).unwrap() else {
            panic!("expected a new claim");
        };
        assert!(!registry.release("COM3", generation + 1));
        assert!(registry.release("COM3", generation));
        assert!(registry.claim("COM3", 115200, ControllerType::Grbl).is_ok());
    }

    #[test]
    fn test_rooms_follow_release() {
        let registry = PortRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = ClientId::new();
        registry.add_session(client, tx);

        let Claim::New { generation } = registry.claim("COM3", 115200, ControllerType::Grbl).unwrap() else {
            panic!("expected a new claim");
        };
        registry.join(client, "COM3");
        assert_eq!(registry.rooms(client), vec!["COM3".to_string()]);

        registry.release("COM3", generation);
        assert!(registry.rooms(client).is_empty());
    }

    #[test]
    fn test_unknown_client() {
        let registry = PortRegistry::new();
        assert!(matches!(
            registry.session_events(ClientId::new()),
            Err(ConnectionError::UnknownClient { .. })
        ));
    }
}
