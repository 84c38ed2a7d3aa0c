// CLI entry point for LAN party sessions.
//
// Runs a host, joins one, or lists the hosts answering on the LAN. Events
// are logged through `tracing`; set `RUST_LOG` to change the level (default
// `info`). See `session.rs` for how the transport fits together.
//
// Usage:
//   lanparty [--config <FILE>] host [--port <PORT>] [--name <NAME>] [--max-clients <N>]
//   lanparty [--config <FILE>] join <ADDRESS> [--port <PORT>] [--unreliable-port <PORT>]
//   lanparty [--config <FILE>] discover [--window-ms <MS>]
//
// The process runs until killed; threads are torn down with it.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use lanparty_net::{NetConfig, NetError, NetHandler, Outbox, Role, Service, Session, discover};
use lanparty_protocol::{Channel, ClientId, Envelope, HostDescriptor, Message, Target};
use tracing::{info, warn};

/// LAN party session host and client
#[derive(Parser)]
#[command(name = "lanparty")]
#[command(version)]
struct Cli {
    /// TOML config file; command-line flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Host a session and log what happens in it
    Host {
        /// Reliable port; the unreliable port is the next one up
        #[arg(long)]
        port: Option<u16>,
        /// Name advertised to discovery
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        max_clients: Option<usize>,
    },
    /// Join a host and stream position updates to it
    Join {
        address: String,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        unreliable_port: Option<u16>,
        /// Milliseconds between position updates
        #[arg(long, default_value_t = 100)]
        rate_ms: u64,
    },
    /// List hosts answering on the LAN
    Discover {
        #[arg(long)]
        window_ms: Option<u64>,
    },
}

/// Logs every event. The host greets newcomers in the chat.
struct ConsoleHandler {
    role: Role,
}

impl NetHandler for ConsoleHandler {
    fn client_connected(&mut self, id: ClientId, outbox: &mut Outbox) {
        info!(%id, "connected");
        match self.role {
            Role::Host => outbox.send(
                Target::Broadcast,
                Message::Chat {
                    text: format!("client {id} joined"),
                },
            ),
            Role::Client => outbox.send(Target::Server, Message::screen_size(1280, 720)),
            Role::None => {}
        }
    }

    fn client_disconnected(&mut self, id: ClientId, _outbox: &mut Outbox) {
        info!(%id, "disconnected");
    }

    fn message_received(
        &mut self,
        from: ClientId,
        channel: Channel,
        envelope: &Envelope,
        _outbox: &mut Outbox,
    ) {
        match &envelope.message {
            Message::Chat { text } => info!(%from, "chat: {text}"),
            Message::ScreenSize { .. } => {
                info!(%from, size = ?envelope.message.parse_screen_size(), "screen size")
            }
            Message::PositionUpdate { x, y } => {
                tracing::debug!(%from, %channel, x, y, "position")
            }
            other => info!(%from, %channel, tag = other.tag(), target = %envelope.target_id, "message"),
        }
    }

    fn connection_error(&mut self, error: &NetError, _outbox: &mut Outbox) {
        warn!(%error, "connection error");
    }

    fn warning(&mut self, error: &NetError) {
        warn!(%error, "network warning");
    }

    fn service_stopped(&mut self, service: Service) {
        info!(%service, "stopped");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NetConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => NetConfig::default(),
    };

    match cli.command {
        Commands::Host {
            port,
            name,
            max_clients,
        } => {
            if let Some(name) = name {
                config.display_name = name;
            }
            if let Some(max_clients) = max_clients {
                config.max_clients = max_clients;
            }
            run_host(config, port)
        }
        Commands::Join {
            address,
            port,
            unreliable_port,
            rate_ms,
        } => {
            if unreliable_port.is_some() {
                config.unreliable_port = unreliable_port;
            }
            run_join(config, &address, port, Duration::from_millis(rate_ms.max(1)))
        }
        Commands::Discover { window_ms } => {
            if let Some(window_ms) = window_ms {
                config.discovery_window_ms = window_ms;
            }
            run_discover(&config)
        }
    }
}

fn run_host(config: NetConfig, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or(config.reliable_port);
    let poll = config.poll_interval();
    let mut session = Session::new(config, ConsoleHandler { role: Role::Host });
    let ports = session.start_host(port).context("starting host")?;
    println!(
        "Hosting on reliable port {}, unreliable port {}",
        ports.reliable, ports.unreliable
    );
    println!("Press Ctrl+C to stop.");

    loop {
        session.tick();
        thread::sleep(poll);
    }
}

fn run_join(config: NetConfig, address: &str, port: Option<u16>, rate: Duration) -> Result<()> {
    let port = port.unwrap_or(config.reliable_port);
    let mut session = Session::new(config, ConsoleHandler { role: Role::Client });
    let id = session
        .start_client(address, port)
        .with_context(|| format!("joining {address}:{port}"))?;
    println!("Joined as client {id}");

    let mut step = 0u32;
    loop {
        session.tick();
        if session.role() != Role::Client {
            bail!("connection to host lost");
        }
        let angle = step as f32 * 0.1;
        session.send(
            Target::Broadcast,
            Message::PositionUpdate {
                x: angle.cos() * 100.0,
                y: angle.sin() * 100.0,
            },
        )?;
        step = step.wrapping_add(1);
        thread::sleep(rate);
    }
}

fn run_discover(config: &NetConfig) -> Result<()> {
    let hosts = discover(config).context("discovery failed")?;
    if hosts.is_empty() {
        println!("No hosts found.");
        return Ok(());
    }
    for HostDescriptor {
        display_name,
        address,
        reliable_port,
        unreliable_port,
        player_count,
    } in hosts
    {
        println!(
            "{display_name}  {address}:{reliable_port} (unreliable {unreliable_port}), {player_count} player(s)"
        );
    }
    Ok(())
}
