use anyhow::Context;
use clap::{Parser, Subcommand};
use gcodemux::{
    init_logging, wait_connected, ClientId, Config, ControllerType, Engine, EngineEvent,
    EventStream, OpenOptions, BUILD_DATE, VERSION,
};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "gcodemux")]
#[command(about = "Stream G-code to GRBL-family CNC controllers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to <config dir>/gcodemux/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial devices that look like CNC controllers
    List,

    /// Open a port, stream a file and wait for it to finish
    Stream(StreamArgs),
}

#[derive(Parser)]
struct StreamArgs {
    /// Device path (e.g. /dev/ttyUSB0, COM3)
    #[arg(short, long)]
    port: String,

    /// Baud rate (defaults to the configured one)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Controller dialect (grbl or grblhal)
    #[arg(long)]
    controller: Option<ControllerType>,

    /// Seconds to wait for the firmware to report in
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// G-code file
    file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;
    tracing::info!("gcodemux {} (built {})", VERSION, BUILD_DATE);

    let path = match cli.config {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?;
    let engine = Engine::new(config);

    match cli.command {
        Commands::List => list(&engine).await,
        Commands::Stream(args) => stream(&engine, args).await,
    }
}

async fn list(engine: &Engine) -> anyhow::Result<()> {
    let ports = engine.list().await?;
    if ports.is_empty() {
        println!("No controllers found");
    }
    for port in ports {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}\t{:04x}:{:04x}\t{}",
                port.port_name, vid, pid, port.description
            ),
            _ => println!("{}\t-\t{}", port.port_name, port.description),
        }
    }
    Ok(())
}

async fn stream(engine: &Engine, args: StreamArgs) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let name = args
        .file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.file.display().to_string());

    let (client, mut events) = engine.connect_client();
    let options = OpenOptions {
        baud_rate: args.baud,
        controller_type: args.controller,
    };
    engine.open(client, &args.port, options).await?;

    let outcome = run_job(engine, client, &mut events, &args, name, text).await;

    if let Err(e) = engine.close(client, &args.port).await {
        tracing::warn!("Closing {} failed: {}", args.port, e);
    }
    engine.disconnect_client(client).await;
    outcome
}

async fn run_job(
    engine: &Engine,
    client: ClientId,
    events: &mut EventStream,
    args: &StreamArgs,
    name: String,
    text: String,
) -> anyhow::Result<()> {
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    // The firmware must report in before a job may start
    tokio::select! {
        connected = wait_connected(events, Duration::from_secs(args.connect_timeout)) => connected?,
        _ = &mut interrupt => anyhow::bail!("interrupted"),
    }

    engine
        .command(client, &args.port, "gcode:load", &[json!(name), json!(text)])
        .await?;
    engine
        .command(client, &args.port, "gcode:start", &[])
        .await?;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = &mut interrupt => {
                tracing::warn!("Interrupted, stopping the job on {}", args.port);
                engine
                    .command(client, &args.port, "gcode:stop", &[])
                    .await?;
                anyhow::bail!("interrupted");
            }
        };
        let Some(event) = event else {
            anyhow::bail!("engine stopped");
        };
        match &event {
            EngineEvent::SenderStatus { job: Some(job), .. } => {
                tracing::debug!("{}/{} lines acknowledged", job.received, job.total)
            }
            EngineEvent::TaskFinish { job, .. } => {
                println!(
                    "Finished {}: {} lines, {} errors",
                    job.name, job.total, job.errors
                );
                return Ok(());
            }
            EngineEvent::TaskError { reason, .. } => {
                anyhow::bail!("job halted: {}", reason);
            }
            EngineEvent::SerialPortClose { .. } => {
                anyhow::bail!("port closed");
            }
            EngineEvent::SerialPortRead { .. } | EngineEvent::Halted { .. } => {
                println!("{}", event)
            }
            _ => {}
        }
    }
}
