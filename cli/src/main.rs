//! procbus-cli — in-process diagnostic harness for the bus.
//!
//! Wires a hub plus two event endpoints over the in-memory transport and
//! exercises the protocol end to end: `ping` measures request round trips,
//! `emit` shows what a remote listener observes for plain and tagged
//! arguments.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::time::timeout;

use envelope::EventArg;
use procbus::{
    ChannelService, ClientPool, EventService, MemoryTransport, RequestOptions, install_event_relay,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("transport error: {0}")]
    Transport(#[from] procbus::TransportError),
    #[error("request failed: {0}")]
    Request(#[from] procbus::RequestError),
    #[error("invalid JSON argument `{arg}`: {source}")]
    InvalidArg { arg: String, source: serde_json::Error },
    #[error("invalid tagged argument `{0}`; expected TAG:JSON")]
    InvalidTag(String),
    #[error("timed out waiting for a reply")]
    Timeout,
}

#[derive(Parser, Debug)]
#[command(name = "procbus-cli", about = "procbus diagnostic harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Round-trip `ping` requests between two in-process endpoints.
    Ping {
        /// Number of requests to issue.
        #[arg(long, default_value_t = 5)]
        count: u32,
        /// Per-request acknowledgement timeout.
        #[arg(long, env = "EVENT_REQUEST_TIMEOUT_MS", default_value_t = 700)]
        timeout_ms: u64,
    },
    /// Emit one event and print what a remote listener observed.
    Emit {
        /// Event type to emit.
        #[arg(long)]
        event: String,
        /// Plain JSON arguments (repeatable).
        #[arg(long = "arg")]
        args: Vec<String>,
        /// Tagged arguments as TAG:JSON (repeatable).
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

// =============================================================================
// HARNESS
// =============================================================================

/// Hub plus two endpoints, all auto-ticking.
struct Harness {
    hub: ChannelService,
    requester: EventService,
    responder: EventService,
}

impl Harness {
    async fn bring_up() -> Result<Self, CliError> {
        let transport = Arc::new(MemoryTransport::new());
        let hub = ChannelService::new(transport.clone());
        install_event_relay(&hub)?;
        hub.start(Duration::from_millis(1));

        let requester_pool = ClientPool::new(transport.clone());
        let requester = EventService::new(&requester_pool)?;
        requester.start(Some(Duration::from_millis(1))).await?;

        let responder_pool = ClientPool::new(transport.clone());
        let responder = EventService::new(&responder_pool)?;
        responder.start(Some(Duration::from_millis(1))).await?;

        Ok(Self { hub, requester, responder })
    }

    fn tear_down(&self) {
        self.requester.close();
        self.responder.close();
        self.hub.close();
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

async fn run_ping(count: u32, timeout_ms: u64) -> Result<(), CliError> {
    let harness = Harness::bring_up().await?;
    harness.responder.on("ping", |_, args| {
        Ok(Some(args.first().cloned().unwrap_or(Value::Null)))
    });

    let per_request = Duration::from_millis(timeout_ms);
    let mut latencies = Vec::with_capacity(count as usize);

    for seq in 0..count {
        let started = Instant::now();
        let fut = harness.requester.request_with(
            "ping",
            &[EventArg::plain(Value::from(seq))],
            RequestOptions { timeout: per_request },
        );
        let result = timeout(per_request * 2, fut)
            .await
            .map_err(|_| CliError::Timeout)??;
        let elapsed = started.elapsed();
        latencies.push(elapsed);
        println!("ping {seq}: {result:?} in {elapsed:?}");
    }

    if let (Some(min), Some(max)) = (latencies.iter().min(), latencies.iter().max()) {
        let total: Duration = latencies.iter().sum();
        let avg = total / count.max(1);
        println!("{count} round trips: min {min:?}, avg {avg:?}, max {max:?}");
    }

    harness.tear_down();
    Ok(())
}

async fn run_emit(event: &str, args: &[String], tags: &[String]) -> Result<(), CliError> {
    let harness = Harness::bring_up().await?;

    let seen: Arc<Mutex<Vec<Vec<Value>>>> = Arc::default();
    let sink = Arc::clone(&seen);
    harness.responder.on(event, move |_, observed| {
        sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(observed.to_vec());
        Ok(None)
    });

    let payload = build_args(args, tags)?;
    harness.requester.emit(event, &payload)?;

    // Auto tick delivers shortly; poll instead of guessing one sleep.
    for _ in 0..100 {
        if !seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let seen = seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    match seen.first() {
        Some(observed) => println!("remote listener observed: {observed:?}"),
        None => println!("remote listener observed nothing"),
    }

    harness.tear_down();
    Ok(())
}

fn build_args(args: &[String], tags: &[String]) -> Result<Vec<EventArg>, CliError> {
    let mut payload = Vec::with_capacity(args.len() + tags.len());

    for arg in args {
        let value: Value = serde_json::from_str(arg)
            .map_err(|source| CliError::InvalidArg { arg: arg.clone(), source })?;
        payload.push(EventArg::plain(value));
    }
    for tag in tags {
        let Some((name, raw)) = tag.split_once(':') else {
            return Err(CliError::InvalidTag(tag.clone()));
        };
        let value: Value = serde_json::from_str(raw)
            .map_err(|source| CliError::InvalidArg { arg: raw.to_owned(), source })?;
        payload.push(EventArg::tagged(name, value));
    }
    Ok(payload)
}

// =============================================================================
// MAIN
// =============================================================================

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Ping { count, timeout_ms } => run_ping(count, timeout_ms).await,
        Command::Emit { event, args, tags } => run_emit(&event, &args, &tags).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
