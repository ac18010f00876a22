//! Sealgram CLI tools: echo server, interactive client, key generation.

#![forbid(unsafe_code)]

use std::io::{self, BufRead, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rand::RngCore;
use sealgram_core::{AddressFamily, SocketConfig};
use sealgram_psk::PskSocket;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sealgram")]
#[command(about = "Secure datagram tools")]
struct Args {
    #[command(flatten)]
    socket: SocketArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct SocketArgs {
    /// JSON file with socket settings
    #[arg(long, global = true, env = "SEALGRAM_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds an idle peer session is kept (overrides the config file)
    #[arg(long, global = true, env = "SEALGRAM_EVICTION_TIMEOUT_SECS")]
    eviction_timeout_secs: Option<u64>,

    /// Seconds a send waits for a handshake; 0 waits forever
    #[arg(long, global = true, env = "SEALGRAM_HANDSHAKE_TIMEOUT_SECS")]
    handshake_timeout_secs: Option<u64>,
}

#[derive(ClapArgs, Debug)]
struct Credentials {
    /// PSK identity
    #[arg(long, default_value = "Client_identity", env = "SEALGRAM_IDENTITY")]
    identity: String,

    /// Pre-shared key
    #[arg(long, default_value = "secretPSK", env = "SEALGRAM_PSK")]
    psk: String,

    /// Interpret --psk as hex
    #[arg(long)]
    psk_hex: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an echo server
    Server {
        /// Address to listen on (host:port)
        #[arg(short, long, default_value = "[::1]:2342")]
        listen: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Send stdin lines to a server and print what comes back
    Client {
        /// Server address (host:port)
        #[arg(short, long, default_value = "[::1]:2342")]
        connect: String,

        #[command(flatten)]
        credentials: Credentials,
    },

    /// Generate a random pre-shared key
    Keygen {
        /// Key length in bytes
        #[arg(short, long, default_value_t = 32)]
        bytes: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    sealgram_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Server {
            listen,
            credentials,
        } => {
            let addr = resolve(&listen)?;
            let socket = open_socket(&args.socket, &credentials, addr)?;
            socket
                .bind_addr(addr)
                .with_context(|| format!("failed to bind {addr}"))?;
            info!(addr = %socket.local_addr()?, "echo server listening");
            run_echo(&socket)
        }
        Command::Client {
            connect,
            credentials,
        } => {
            let addr = resolve(&connect)?;
            let socket = Arc::new(open_socket(&args.socket, &credentials, addr)?);
            socket.connect_addr(addr)?;
            run_client(socket)
        }
        Command::Keygen { bytes } => {
            if bytes == 0 {
                return Err(anyhow!("key length must be at least one byte"));
            }
            let mut key = vec![0u8; bytes];
            rand::thread_rng().fill_bytes(&mut key);
            println!("{}", hex::encode(key));
            Ok(())
        }
        Command::Version => {
            println!("sealgram {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn resolve(spec: &str) -> Result<SocketAddr> {
    spec.to_socket_addrs()
        .with_context(|| format!("invalid address: {spec}"))?
        .next()
        .ok_or_else(|| anyhow!("no address found for {spec}"))
}

fn load_config(args: &SocketArgs) -> Result<SocketConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid config in {}", path.display()))?
        }
        None => SocketConfig::default(),
    };

    if let Some(secs) = args.eviction_timeout_secs {
        config = config.with_eviction_timeout(Duration::from_secs(secs));
    }
    if let Some(secs) = args.handshake_timeout_secs {
        let timeout = (secs > 0).then(|| Duration::from_secs(secs));
        config = config.with_handshake_timeout(timeout);
    }
    Ok(config)
}

fn open_socket(args: &SocketArgs, credentials: &Credentials, addr: SocketAddr) -> Result<PskSocket> {
    let config = load_config(args)?.with_family(AddressFamily::of(&addr));
    let socket = PskSocket::new(config).context("failed to create socket")?;

    let key = if credentials.psk_hex {
        hex::decode(&credentials.psk).context("--psk is not valid hex")?
    } else {
        credentials.psk.as_bytes().to_vec()
    };
    socket.add_identity(credentials.identity.as_bytes(), key)?;
    Ok(socket)
}

fn run_echo(socket: &PskSocket) -> Result<()> {
    loop {
        let datagram = socket.recv_from(None)?;
        info!(peer = %datagram.peer, bytes = datagram.payload.len(), "echoing");
        if let Err(e) = socket.send_to_addr(&datagram.payload, datagram.peer) {
            warn!(peer = %datagram.peer, error = %e, "echo failed");
        }
    }
}

fn run_client(socket: Arc<PskSocket>) -> Result<()> {
    let reader = {
        let socket = socket.clone();
        thread::Builder::new()
            .name("sealgram-client-rx".into())
            .spawn(move || {
                while let Ok(datagram) = socket.recv_from(None) {
                    let mut out = io::stdout().lock();
                    let _ = out.write_all(&datagram.payload);
                    let _ = out.write_all(b"\n");
                    let _ = out.flush();
                }
            })?
    };

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        socket
            .send(line.as_bytes())
            .with_context(|| format!("failed to send to {:?}", socket.peer_addr()))?;
    }

    // Give in-flight replies a moment before shutting down.
    thread::sleep(Duration::from_millis(500));
    socket.close();
    drop(reader);
    Ok(())
}
