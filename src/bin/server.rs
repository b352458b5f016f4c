//! Turnlink Server Binary
//!
//! Runs a chat lobby: MESSAGE commands are relayed to every other player and
//! a `lobby` remote object answers `who()` and `roll(sides)`.

use std::collections::HashMap;
use std::io::{self, BufRead};
use std::sync::Arc;

use clap::Parser;
use parking_lot::RwLock;
use rand::Rng;
use tracing_subscriber::{fmt, EnvFilter};
use turnlink::cipher::XorCipher;
use turnlink::network::{MethodTable, RemoteError};
use turnlink::protocol::names;
use turnlink::{ClientConnection, Command, GameServer, ServerConfig, ServerListener, Value};

/// Turnlink lobby server
#[derive(Parser, Debug)]
#[command(name = "turnlink-server")]
#[command(about = "Lobby server for turn-based games")]
#[command(version)]
struct Args {
    /// Server name announced to clients
    #[arg(short, long, default_value = "lobby")]
    name: String,

    /// Bind host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Listen port
    #[arg(short, long, default_value = "16000")]
    port: u16,

    /// Maximum concurrent players
    #[arg(short, long, default_value = "8")]
    max_connections: usize,

    /// Protocol version clients must match
    #[arg(long, default_value = "1.0")]
    game_version: String,

    /// Password clients must answer with
    #[arg(long)]
    password: Option<String>,

    /// Passphrase for the stream cipher
    #[arg(long)]
    cipher: Option<String>,

    /// Keep-alive interval in milliseconds
    #[arg(long, default_value = "10000")]
    keep_alive_ms: u64,
}

/// Tracks live players and relays chat between them
#[derive(Default)]
struct Lobby {
    players: RwLock<HashMap<String, Arc<ClientConnection>>>,
}

impl Lobby {
    fn who(&self) -> String {
        let mut names: Vec<String> = self.players.read().keys().cloned().collect();
        names.sort();
        names.join(", ")
    }

    fn relay(&self, from: &str, message: &str) {
        let line = format!("{}: {}", from, message);
        for (name, conn) in self.players.read().iter() {
            if name == from {
                continue;
            }
            if let Err(e) = conn.send_message(&line) {
                tracing::debug!("Relay to {} failed: {}", name, e);
            }
        }
    }
}

impl ServerListener for Lobby {
    fn on_connected(&self, conn: &Arc<ClientConnection>) {
        self.players.write().insert(conn.name().to_string(), Arc::clone(conn));
        self.relay(conn.name(), "joined the lobby");
    }

    fn on_reconnected(&self, conn: &Arc<ClientConnection>) {
        self.players.write().insert(conn.name().to_string(), Arc::clone(conn));
        self.relay(conn.name(), "is back");
    }

    fn on_disconnected(&self, conn: &Arc<ClientConnection>, reason: &str) {
        self.players.write().remove(conn.name());
        self.relay(conn.name(), &format!("left ({})", reason));
    }

    fn on_command(&self, conn: &Arc<ClientConnection>, command: &Command) {
        if command.type_name() == names::MESSAGE {
            if let Some(message) = command.get_str("msg") {
                self.relay(conn.name(), message);
            }
        }
    }
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,turnlink=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("Turnlink Server v{}", turnlink::VERSION);

    let mut builder = ServerConfig::builder()
        .name(&args.name)
        .bind_host(&args.host)
        .port(args.port)
        .max_connections(args.max_connections)
        .version(&args.game_version)
        .keep_alive_ms(args.keep_alive_ms);
    if let Some(password) = &args.password {
        builder = builder.password(password);
    }
    if let Some(passphrase) = &args.cipher {
        builder = builder.cipher(Arc::new(XorCipher::new(passphrase)));
    }

    let server = match GameServer::new(builder.build()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let lobby = Arc::new(Lobby::default());
    server.add_listener(lobby.clone());

    let table = MethodTable::new(Arc::clone(&lobby))
        .method("who", 0, |lobby, _| Ok(Value::from(lobby.who())))
        .method("roll", 1, |_, params| {
            let sides = params[0]
                .as_i32()
                .filter(|s| *s > 0)
                .ok_or_else(|| RemoteError::BadParams("sides must be a positive int".to_string()))?;
            Ok(Value::Int32(rand::thread_rng().gen_range(1..=sides)))
        });
    server.register_remote_object("lobby", Arc::new(table));

    match server.listen() {
        Ok(addr) => tracing::info!("Listening on {}", addr),
        Err(e) => {
            tracing::error!("Failed to listen: {}", e);
            std::process::exit(1);
        }
    }

    // Console: say <msg> | kick <name> | unkick <name> | list | stats | quit
    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let (verb, rest) = line.trim().split_once(' ').unwrap_or((line.trim(), ""));
        match verb {
            "say" => server.broadcast_message(rest),
            "kick" => println!("kicked {}: {}", rest, server.kick(rest)),
            "unkick" => println!("unkicked {}: {}", rest, server.unkick(rest)),
            "list" => {
                for conn in server.connections() {
                    println!(
                        "{:<16} {:<10} {:>6} {}",
                        conn.name(),
                        conn.status(),
                        conn.speed_ms().map(|ms| format!("{}ms", ms)).unwrap_or_default(),
                        if conn.is_connected() { "online" } else { "offline" },
                    );
                }
            }
            "stats" => print!("{}", server.config().registry.stats_report()),
            "quit" => break,
            "" => {}
            other => println!("unknown command: {}", other),
        }
    }

    server.stop();
    tracing::info!("Server stopped");
}
