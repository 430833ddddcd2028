//! `bus` - serve and talk to message bus transports
//!
//! ```bash
//! # echo every message back, one peer at a time
//! bus listen unix:/tmp/bus.sock
//!
//! # send one JSON message and print the reply
//! bus send unix:/tmp/bus.sock '{"ping": "hello"}'
//!
//! # more logging
//! RUST_LOG=bus_transport=trace bus -v send tcp:127.0.0.1:5000 '"hi"'
//! ```

use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use bus_transport::{BusConnection, Listener, Message, TransportConfig};
use clap::{Parser, Subcommand};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "bus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// More logging, repeat for even more
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Bytes read from the socket at a time
    #[arg(long, global = true, value_name = "BYTES")]
    read_chunk_size: Option<usize>,

    /// Largest message accepted from a peer
    #[arg(long, global = true, value_name = "BYTES")]
    max_message_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept peers on ADDRESS and echo their messages back
    Listen {
        /// unix:/path, unix:@abstract or tcp:host:port
        #[arg(env = "BUS_ADDRESS")]
        address: String,

        /// Exit after the first peer disconnects
        #[arg(long)]
        once: bool,
    },
    /// Send one JSON message to ADDRESS and print the first reply
    Send {
        #[arg(env = "BUS_ADDRESS")]
        address: String,

        /// Message body, as JSON
        json: String,

        #[arg(long, default_value_t = 5000, value_name = "MS")]
        timeout_ms: u64,
    },
}

impl Args {
    fn transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            read_chunk_size: self.read_chunk_size.unwrap_or(defaults.read_chunk_size),
            max_message_size: self.max_message_size.unwrap_or(defaults.max_message_size),
            ..defaults
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bus={level},bus_transport={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Echo messages of accepted peers until one disconnects (`once`) or forever.
fn serve(listener: Listener, once: bool, config: &TransportConfig) -> Result<()> {
    loop {
        let transport = listener.accept(0, config).context("Failed to accept peer")?;
        let connection = BusConnection::from_transport(transport)?;
        info!("peer connected");

        let mut echoed = 0usize;
        while connection.read_write_dispatch(-1)? {
            while let Some(message) = connection.pop_message() {
                debug!(len = message.len(), "echoing message");
                connection.send(message)?;
                echoed += 1;
            }
        }

        match connection.last_error() {
            Some(reason) => info!(echoed, %reason, "peer disconnected"),
            None => info!(echoed, "peer disconnected"),
        }

        if once || listener.is_already_accepted() {
            return Ok(());
        }
    }
}

/// Send `body` and wait for one reply.
fn request(
    address: &str,
    body: &serde_json::Value,
    timeout: Duration,
    config: TransportConfig,
) -> Result<Message> {
    let deadline = Instant::now() + timeout;
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);

    let connection = BusConnection::open(address, config)
        .with_context(|| format!("Failed to connect to '{address}'"))?;
    connection
        .block_until_authenticated(timeout_ms)
        .with_context(|| format!("Failed to authenticate with '{address}'"))?;

    connection.send(Message::from_json(body)?)?;
    connection.flush(timeout_ms).context("Failed to send message")?;

    loop {
        if let Some(reply) = connection.pop_message() {
            return Ok(reply);
        }

        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            bail!("No reply from '{address}' within {timeout:?}");
        }
        let left_ms = i32::try_from(left.as_millis()).unwrap_or(i32::MAX).max(1);

        if !connection.read_write_dispatch(left_ms)? {
            // a reply may have arrived right before the hangup
            if let Some(reply) = connection.pop_message() {
                return Ok(reply);
            }
            bail!(
                "Connection to '{address}' closed: {}",
                connection
                    .last_error()
                    .unwrap_or_else(|| "no reason given".into())
            );
        }
    }
}

fn print_reply(reply: &Message) {
    match reply.to_json::<serde_json::Value>() {
        Ok(value) => match serde_json::to_string_pretty(&value) {
            Ok(s) => println!("{s}"),
            Err(_) => println!("{value}"),
        },
        Err(e) => {
            warn!(error = %e, "reply is not JSON");
            println!("{}", String::from_utf8_lossy(reply.body()));
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = args.transport_config();

    match args.command {
        Command::Listen { address, once } => {
            let listener = Listener::new(&address)
                .with_context(|| format!("Failed to listen on '{address}'"))?;
            info!(address = %listener.local_address().unwrap_or(address), "listening");
            serve(listener, once, &config)
        }
        Command::Send {
            address,
            json,
            timeout_ms,
        } => {
            let body: serde_json::Value =
                serde_json::from_str(&json).with_context(|| format!("Invalid JSON '{json}'"))?;
            let reply = request(&address, &body, Duration::from_millis(timeout_ms), config)?;
            print_reply(&reply);
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(args) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::CommandFactory;
    use std::thread;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_config_flags() {
        let args = Args::try_parse_from([
            "bus",
            "--read-chunk-size",
            "16",
            "send",
            "unix:/tmp/x",
            "{}",
        ])
        .unwrap();
        let config = args.transport_config();
        assert_eq!(config.read_chunk_size, 16);
        assert_eq!(
            config.max_message_size,
            TransportConfig::default().max_message_size
        );
        assert!(matches!(args.command, Command::Send { timeout_ms: 5000, .. }));
    }

    #[test]
    fn test_echo_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix:{}", dir.path().join("bus.sock").display());
        let listener = Listener::new(&address).unwrap();

        let server = thread::spawn(move || serve(listener, true, &TransportConfig::default()));

        let body = serde_json::json!({ "ping": "hello" });
        let reply = request(
            &address,
            &body,
            Duration::from_secs(5),
            TransportConfig::default(),
        )
        .unwrap();
        assert_eq!(reply.to_json::<serde_json::Value>().unwrap(), body);

        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_request_to_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let address = format!("unix:{}", dir.path().join("none").display());
        let err = request(
            &address,
            &serde_json::json!(null),
            Duration::from_millis(100),
            TransportConfig::default(),
        )
        .unwrap_err();
        assert!(err.to_string().starts_with("Failed to connect"));
    }
}
