//! A module speaking the `echo` protocol, as a server or as a one-shot client.
//!
//! Under a connection management tool the module's standard streams belong to the tool. Tracing
//!  output then goes to the module's log file, and the client prints its reply through
//!  `write_stdio`, i.e. over the tool's stdio connection. The one direct write to stderr is the
//!  final error line in `main`, which is kept because logging may not be set up yet when `run`
//!  fails.

use std::process::exit;
use std::sync::{Arc, Mutex};
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use karma::config::ConnConfig;
use karma::conn::{ConnectionId, ConnectionManager, ProtocolHandler};
use karma::event_loop::tokio_channel_manager;
use tracing::{error, info, Level};
use transport::error::{is_fatal, FATAL_EXIT_STATUS};

const ECHO_PROTOCOL: &str = "echo";
const ECHO_VERSION: u32 = 1;

#[derive(Parser)]
struct Args {
    #[clap(short, long, default_value_t = String::from("echo_module"))]
    name: String,

    /// -v for debug output, -vv for trace output
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// serves the echo protocol until a peer connects to `server_exit`
    Serve {
        #[clap(short, long, default_value_t = 1)]
        port: u16,
        #[clap(long, default_value_t = 10)]
        retries: u16,
    },
    /// sends a message to an echo server and prints the reply
    Connect {
        #[clap(long, default_value_t = String::from("unix"))]
        host: String,
        #[clap(short, long, default_value_t = 1)]
        port: u16,
        message: String,
    },
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        error!("{:#}", e);
        // logging may not be initialized yet
        eprintln!("echo_module: {:#}", e);
        if is_fatal(&e) {
            exit(FATAL_EXIT_STATUS);
        }
        exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = ConnConfig::from_env(args.name)?;
    init_logging(&config, args.verbose)?;

    let (channel_manager, mut event_loop) = tokio_channel_manager();
    let mut mgr = ConnectionManager::new(config)?;
    mgr.register_managers(Box::new(channel_manager));

    match args.mode {
        Mode::Serve { port, retries } => {
            mgr.register_server_protocol(ECHO_PROTOCOL, ECHO_VERSION, 0, Arc::new(EchoServer));
            if mgr.init_cm_tool().await? {
                info!("supervised by a connection management tool");
            }
            let port = mgr.become_server(port, retries).await?;
            info!("serving the echo protocol on port {}", port);
            mgr.signal_quiescent().await?;
        }
        Mode::Connect { host, port, message } => {
            let client = Arc::new(EchoClient {
                message,
                reply: Mutex::new(Vec::new()),
            });
            mgr.register_client_protocol(ECHO_PROTOCOL, ECHO_VERSION, 1, client.clone());
            mgr.init_cm_tool().await?;
            mgr.attempt_connection(&host, port, ECHO_PROTOCOL).await?;
        }
    }

    event_loop.run(&mut mgr).await?;
    mgr.shutdown().await
}

/// Logs go to stderr, or to a file of their own when a connection management tool owns the
///  module's standard streams
fn init_logging(config: &ConnConfig, verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    if std::env::var_os(&config.cm_control_env).is_some() {
        let file = std::fs::File::create(config.cm_log_path())?;
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .ok();
    }
    else {
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .try_init()
            .ok();
    }
    Ok(())
}

struct EchoServer;

#[async_trait::async_trait]
impl ProtocolHandler for EchoServer {
    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let channel = mgr.channel(id);
        let data = channel.read_available()?;
        channel.write_all(&data).await?;
        channel.flush().await
    }
}

struct EchoClient {
    message: String,
    reply: Mutex<Vec<u8>>,
}

#[async_trait::async_trait]
impl ProtocolHandler for EchoClient {
    async fn on_open(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        info!("connected to {:?}", mgr.peer_module_name(id));
        let channel = mgr.channel(id);
        channel.write_all(self.message.as_bytes()).await?;
        channel.flush().await
    }

    async fn on_read(&self, mgr: &mut ConnectionManager, id: ConnectionId) -> anyhow::Result<()> {
        let data = mgr.channel(id).read_available()?;
        let reply = {
            let mut reply = self.reply.lock()
                .map_err(|_| anyhow::anyhow!("reply buffer poisoned"))?;
            reply.extend_from_slice(&data);
            if reply.len() < self.message.len() {
                return Ok(());
            }
            std::mem::take(&mut *reply)
        };

        mgr.write_stdio(&reply).await?;
        mgr.write_stdio(b"\n").await?;
        mgr.close(id).await?;
        mgr.request_exit();
        Ok(())
    }
}
