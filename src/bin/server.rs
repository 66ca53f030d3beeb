//! Tunnelmux Echo Server
//!
//! Accepts multiplexed connections and echoes every segment back on the
//! channel it arrived on. Each connection gets its own Channelizer; all of
//! them share one Ticker for their idle timeouts.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, trace, warn};
use tunnelmux::{
    config::{generate_example_config, Config, LoggingConfig},
    tunnel::TunnelError,
    Channelizer, Channels, Connection, Machine, Requester, Ticker, Transition,
    Virtual,
};

/// Tunnelmux echo server
#[derive(Parser, Debug)]
#[command(name = "tunnelmux-server")]
#[command(about = "Tunnelmux echo server - multiplexed channel demo")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Per-channel echo machine
struct Echo {
    virt: Virtual,
    echoed: u64,
}

#[async_trait]
impl Machine for Echo {
    async fn bootup(&mut self) -> tunnelmux::Result<Transition> {
        debug!(channel = self.virt.id(), "channel started");
        Ok(Transition::Next)
    }

    async fn tick(&mut self) -> tunnelmux::Result<Transition> {
        match self.virt.read_segment().await {
            Ok(payload) => {
                self.virt.write(&payload).await?;
                self.echoed += 1;
                trace!(channel = self.virt.id(), bytes = payload.len(), "echoed");
                Ok(Transition::Next)
            }
            // Idle channel, keep waiting.
            Err(TunnelError::TimedOut) => Ok(Transition::Next),
            Err(e) => Err(e.into()),
        }
    }

    async fn shutdown(&mut self) -> tunnelmux::Result<()> {
        debug!(channel = self.virt.id(), segments = self.echoed, "channel stopped");
        Ok(())
    }
}

fn init_logging(logging: &LoggingConfig, level: Option<&str>) {
    let filter = level.unwrap_or(&logging.level);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match logging.format.as_str() {
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())?;
        println!("{}", example);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => generate_example_config(),
    };

    init_logging(&config.logging, args.log_level.as_deref());

    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;
    let listen_addr = args.listen.unwrap_or(server_config.listen);

    let ticker = Ticker::new(config.ticker.clone());
    let requester = ticker.serve()?;
    let conn_semaphore = Arc::new(Semaphore::new(server_config.max_connections));
    let config = Arc::new(config);

    info!("Tunnelmux Server v{}", tunnelmux::VERSION);
    info!("Listening on {}", listen_addr);
    info!("Channels per connection: {}", config.mux.channels);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                continue;
                            }
                        };

                        debug!("New connection from {}", peer_addr);
                        let requester = requester.clone();
                        let config = Arc::clone(&config);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, requester, &config).await {
                                debug!("Connection {} ended: {}", peer_addr, e);
                            }
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    ticker.close()?;
    Ok(())
}

/// Serve one physical connection until it drops or fails.
async fn handle_connection(
    stream: TcpStream,
    requester: Requester,
    config: &Config,
) -> Result<()> {
    stream.set_nodelay(true).ok();

    let conn = Connection::new(stream);

    let mux = Channelizer::new(conn, requester, &config.mux);
    let channels = Channels::try_new(config.mux.channels, |id| {
        mux.for_channel(id as usize)
            .map(|virt| Echo { virt, echoed: 0 })
            .map_err(tunnelmux::Error::from)
    })?;

    // Machines start on the first segment addressed to their channel.
    let mut started = vec![false; channels.size()];
    let mut machines = JoinSet::new();

    let result = loop {
        let (id, fsm) = match mux.dispatch(&channels).await {
            Ok(dispatched) => dispatched,
            Err(e) => break e,
        };

        let slot = &mut started[id as usize];
        if *slot {
            continue;
        }
        *slot = true;

        let fsm = Arc::clone(fsm);
        let mux = mux.clone();
        machines.spawn(async move {
            if let Err(e) = fsm.run().await {
                debug!(channel = id, "channel failed: {}", e);
                // The read cursor position is unknown after a failure.
                if let Err(e) = mux.close_all().await {
                    debug!(channel = id, "close after failure: {}", e);
                }
            }
        });
    };

    if let Err(e) = mux.close_all().await {
        debug!("Connection close: {}", e);
    }
    while machines.join_next().await.is_some() {}
    channels.shutdown().await?;

    match result {
        TunnelError::ShutDown | TunnelError::ConnectionDropped => {
            let used = started.iter().filter(|s| **s).count();
            debug!("Connection closed after {} channel(s)", used);
            Ok(())
        }
        e => Err(e.into()),
    }
}
