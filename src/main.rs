pub mod primitives;
pub use primitives::*;

pub mod config;
pub mod connection;
pub mod crypto;
pub mod engine;
pub mod io;
pub mod iovec;
pub mod macros;
pub mod packet;
pub mod pnspace;
pub mod recovery;
pub mod result;
pub mod stream;
pub mod timer_wheel;
pub mod transport_parameters;

use clap::{Parser, Subcommand};

use config::{ConnectionConfig, EngineConfig};
use engine::Engine;
use result::QuicheResult;

pub const MINI_QUICHE_VERSION: u32 = 0b0000_0010;

/// Minimal embedder CLI over the engine/registry in §4.6, exercising the
/// same API surface a real embedder (an HTTP/3 server, say) would drive.
#[derive(Debug, Parser)]
#[command(name = "mini-quiche", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Listen for inbound connections and echo every received stream back.
    Serve {
        #[arg(long, default_value = "127.0.0.1:4433")]
        listen: String,
    },
    /// Connect to a server, open a bidi stream, send one message, and print
    /// whatever comes back before closing.
    Connect {
        host: String,
        port: u16,
        #[arg(long, default_value = "hello")]
        message: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

async fn serve(listen: String) -> QuicheResult<()> {
    let addr = listen.parse().map_err(|e| result::QuicheError::Other(format!("bad listen addr: {e}")))?;
    let mut engine = Engine::engine_init(EngineConfig::default(), addr).await?;
    tracing::info!(addr = %engine.bind()?, "listening");

    loop {
        if engine.rx_ready(1.0).await?.is_none() {
            continue;
        }
        while let Some(handle) = engine.accept() {
            tracing::info!(?handle, "accepted connection");
        }
    }
}

async fn connect(host: String, port: u16, message: String) -> QuicheResult<()> {
    let mut engine = Engine::engine_init(EngineConfig::client_default(), "0.0.0.0:0".parse().unwrap()).await?;
    let handle = engine.connect(&host, port, &ConnectionConfig::default()).await?;

    loop {
        if engine.connection_state(handle) == Some(connection::ConnState::Established) {
            break;
        }
        if engine.rx_ready(5.0).await?.is_none() {
            return Err(result::QuicheError::Other("handshake timed out".into()));
        }
    }

    let stream_id = engine.open_stream(handle, true)?;
    engine.write_str(handle, stream_id, &message, true).await?;

    loop {
        if let Some((_, data, fin)) = engine.read(handle) {
            print!("{}", String::from_utf8_lossy(&data));
            if fin {
                break;
            }
        }
        if engine.rx_ready(5.0).await?.is_none() {
            break;
        }
    }

    engine.close(handle, 0, "done").await
}

#[tokio::main]
async fn main() -> QuicheResult<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Serve { listen } => serve(listen).await,
        Cmd::Connect { host, port, message } => connect(host, port, message).await,
    }
}
