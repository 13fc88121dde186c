//! # gcodemux
//!
//! Controller communication engine for GRBL-family CNC firmware: several
//! clients share one serial connection, see the same live machine status and
//! stream G-code through a byte-counting sender that never overruns the
//! firmware's receive buffer.
//!
//! ## Architecture
//!
//! gcodemux is organized as a workspace with multiple crates:
//!
//! 1. **gcodemux-core** - Error taxonomy, machine data model, client events
//! 2. **gcodemux-settings** - Configuration files and the firmware error policy
//! 3. **gcodemux-communication** - Serial transport, GRBL protocol, streaming
//!    sender, connection tasks and the multiplexing engine
//! 4. **gcodemux** - Logging setup and the command-line front end

pub use gcodemux_communication::{
    firmware, list_ports, ConnectionParams, ControllerCommand, Engine, EventStream, OpenOptions,
    PortOpener, PortSnapshot, SerialPortInfo,
};
pub use gcodemux_core::{
    ClientId, ConnectionError, ControllerError, ControllerState, ControllerType, EngineEvent,
    Error, FirmwareError, HaltCode, HaltReason, JobStatus, MachineStatus, Result, WorkflowState,
    WriteContext,
};
pub use gcodemux_settings::Config;

use std::time::Duration;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Wait until the firmware on a freshly opened port reports in
///
/// Fails if no connected status arrives within `timeout`, which usually means
/// a wrong baud rate or a device that is not a controller.
pub async fn wait_connected(events: &mut EventStream, timeout: Duration) -> anyhow::Result<()> {
    let connected = async {
        while let Some(event) = events.recv().await {
            if let EngineEvent::ControllerStatus { status, .. } = &event {
                if status.state.is_connected() {
                    return Ok(());
                }
            }
        }
        Err(anyhow::anyhow!("engine stopped before the controller reported in"))
    };
    tokio::time::timeout(timeout, connected).await.map_err(|_| {
        anyhow::anyhow!(
            "controller did not report in within {} ms",
            timeout.as_millis()
        )
    })?
}

/// Initialize logging
///
/// Logs go to stderr so stdout stays free for command output. `RUST_LOG` is
/// respected and defaults to `info`; `json` switches to one JSON object per
/// line.
pub fn init_logging(json: bool) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_thread_ids(true)
        .with_line_number(true);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn status(state: ControllerState) -> EngineEvent {
        EngineEvent::ControllerStatus {
            port: "COM3".to_string(),
            status: Box::new(MachineStatus {
                state,
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_wait_connected_on_first_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(status(ControllerState::Connecting)).unwrap();
        tx.send(status(ControllerState::Idle)).unwrap();
        wait_connected(&mut rx, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_connected_gives_up() {
        let (_tx, mut rx) = mpsc::unbounded_channel();
        let err = wait_connected(&mut rx, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not report in"));
    }

    #[tokio::test]
    async fn test_wait_connected_stream_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        drop(tx);
        assert!(wait_connected(&mut rx, Duration::from_secs(1)).await.is_err());
    }
}
