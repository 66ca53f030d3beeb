//! Tunnelmux Echo Client
//!
//! Opens one physical connection to a tunnelmux echo server and drives many
//! channels over it concurrently. Every channel sends its own messages and
//! checks that exactly those come back, then the round-trip times are
//! reported.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use tunnelmux::{
    config::{generate_example_config, Config},
    transport::{dial, TransportConfig},
    tunnel::TunnelError,
    Channelizer, Channels, Connection, Machine, Ticker, Transition, Virtual,
};

/// Tunnelmux echo client
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-client")]
#[command(about = "Tunnelmux echo client - multiplexed channel demo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Channels to drive concurrently
    #[arg(long, default_value_t = 16)]
    channels: usize,

    /// Messages per channel
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Message size in bytes
    #[arg(long, default_value_t = 64)]
    size: usize,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Channels are consumed by their own tasks; the registry only routes.
struct Passive;

#[async_trait]
impl Machine for Passive {
    async fn bootup(&mut self) -> tunnelmux::Result<Transition> {
        Ok(Transition::Finished)
    }

    async fn tick(&mut self) -> tunnelmux::Result<Transition> {
        Ok(Transition::Finished)
    }

    async fn shutdown(&mut self) -> tunnelmux::Result<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => generate_example_config(),
    };

    let level = args.log_level.as_deref().unwrap_or(&config.logging.level);
    let builder = tracing_subscriber::fmt().with_env_filter(level);
    match config.logging.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }

    if args.channels == 0 || args.channels > config.mux.channels {
        bail!("--channels must be within 1..={}", config.mux.channels);
    }

    let client_config = config.client.clone().unwrap_or_default();
    let server_addr = args.server.clone().unwrap_or(client_config.server);
    let transport = TransportConfig {
        connect_timeout: client_config.connect_timeout,
        ..Default::default()
    };

    info!("Tunnelmux Client v{}", tunnelmux::VERSION);
    info!("Connecting to {}", server_addr);

    let stream = dial(&server_addr, &transport)
        .await
        .context("Failed to connect to server")?;

    let ticker = Ticker::new(config.ticker.clone());
    let requester = ticker.serve()?;

    let conn = Connection::new(stream);
    let mux = Channelizer::new(conn, requester, &config.mux);

    let channels = Channels::new(config.mux.channels, |_| Passive)?;
    let dispatcher = {
        let mux = mux.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = mux.dispatch(&channels).await {
                    debug!("Dispatch stopped: {}", e);
                    return e;
                }
            }
        })
    };

    let started = Instant::now();
    let mut sessions = JoinSet::new();
    for id in 0..args.channels {
        let virt = mux.for_channel(id)?;
        let (messages, size) = (args.messages, args.size);
        sessions.spawn(async move { exchange(virt, messages, size).await });
    }

    let mut rtts = Vec::with_capacity(args.channels * args.messages);
    let mut failures = 0usize;
    while let Some(joined) = sessions.join_next().await {
        match joined.context("Channel task panicked")? {
            Ok(mut samples) => rtts.append(&mut samples),
            Err(e) => {
                warn!("Channel failed: {:#}", e);
                failures += 1;
            }
        }
    }
    let elapsed = started.elapsed();

    if let Err(e) = mux.close_all().await {
        debug!("Connection close: {}", e);
    }
    let reason = dispatcher.await?;
    ticker.close()?;

    report(&rtts, elapsed);

    if failures > 0 {
        return Err(anyhow!(
            "{} of {} channel(s) failed (dispatch: {})",
            failures,
            args.channels,
            reason
        ));
    }
    Ok(())
}

/// Send `messages` payloads on one channel and verify each echo.
async fn exchange(virt: Virtual, messages: usize, size: usize) -> Result<Vec<Duration>> {
    let mut rtts = Vec::with_capacity(messages);

    for seq in 0..messages {
        let payload = message(virt.id(), seq, size);
        let sent = Instant::now();
        virt.write(&payload).await?;

        // Payloads above one segment come back split.
        let mut echoed = Vec::with_capacity(payload.len());
        while echoed.len() < payload.len() {
            match virt.read_segment().await {
                Ok(segment) => echoed.extend_from_slice(&segment),
                Err(TunnelError::TimedOut) => {
                    bail!("channel {} timed out waiting for echo {}", virt.id(), seq)
                }
                Err(e) => return Err(e.into()),
            }
        }

        if echoed != payload {
            bail!("channel {} echo {} mismatched", virt.id(), seq);
        }
        rtts.push(sent.elapsed());
    }

    debug!(channel = virt.id(), messages, "channel verified");
    Ok(rtts)
}

fn message(channel: u8, seq: usize, size: usize) -> Vec<u8> {
    let tag = format!("channel {} message {} ", channel, seq);
    tag.bytes().cycle().take(size.max(1)).collect()
}

fn report(rtts: &[Duration], elapsed: Duration) {
    if rtts.is_empty() {
        info!("No round trips completed");
        return;
    }

    let mut sorted = rtts.to_vec();
    sorted.sort();
    let total: Duration = sorted.iter().sum();
    let mean = total / sorted.len() as u32;
    let p99 = sorted[(sorted.len() * 99 / 100).min(sorted.len() - 1)];

    info!(
        "{} round trip(s) in {:?}: min {:?}, mean {:?}, p99 {:?}, max {:?}",
        sorted.len(),
        elapsed,
        sorted[0],
        mean,
        p99,
        sorted[sorted.len() - 1]
    );
}
