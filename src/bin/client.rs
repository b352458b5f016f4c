//! Turnlink Client Binary
//!
//! Joins a lobby and turns stdin lines into chat messages.
//! Lines starting with `/` are commands: `/who`, `/roll <sides>`, `/quit`.

use std::io::{self, BufRead};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};
use turnlink::cipher::XorCipher;
use turnlink::{ClientConfig, ClientListener, Command, GameClient, Value};

/// Turnlink chat client
#[derive(Parser, Debug)]
#[command(name = "turnlink-client")]
#[command(about = "Chat client for a turnlink lobby")]
#[command(version)]
struct Args {
    /// Player name
    #[arg(short, long)]
    name: String,

    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "16000")]
    port: u16,

    /// Protocol version
    #[arg(long, default_value = "1.0")]
    game_version: String,

    /// Answer to the server's password challenge
    #[arg(long)]
    password: Option<String>,

    /// Passphrase for the stream cipher
    #[arg(long)]
    cipher: Option<String>,
}

struct Printer;

impl ClientListener for Printer {
    fn on_connected(&self) {
        println!("* connected");
    }

    fn on_disconnected(&self, reason: &str, server_initiated: bool) {
        let by = if server_initiated { "server" } else { "client" };
        println!("* disconnected by {}: {}", by, reason);
    }

    fn on_message(&self, message: &str) {
        println!("{}", message);
    }

    fn on_command(&self, command: &Command) {
        println!("* {}", command);
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,turnlink=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    let mut builder = ClientConfig::builder()
        .name(&args.name)
        .version(&args.game_version);
    if let Some(password) = &args.password {
        builder = builder.password(password);
    }
    if let Some(passphrase) = &args.cipher {
        builder = builder.cipher(Arc::new(XorCipher::new(passphrase)));
    }

    let client = match GameClient::new(builder.build()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    client.add_listener(Arc::new(Printer));

    if let Err(e) = client.connect_blocking(&args.host, args.port) {
        eprintln!("could not join {}:{}: {}", args.host, args.port, e);
        std::process::exit(1);
    }
    println!("* joined {}", client.server_name().unwrap_or_default());

    for line in io::stdin().lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim();
        let result = match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/who", _) => client
                .call_remote("lobby", "who", &[])
                .map(|reply| println!("* {}", reply.into_value().unwrap_or_default())),
            ("/roll", sides) => match sides.trim().parse::<i32>() {
                Ok(sides) => client
                    .call_remote("lobby", "roll", &[Value::Int32(sides)])
                    .map(|reply| println!("* rolled {}", reply.into_value().unwrap_or_default())),
                Err(_) => {
                    println!("* usage: /roll <sides>");
                    Ok(())
                }
            },
            ("/ping", _) => {
                println!("* {:?} ms", client.last_ping_ms());
                Ok(())
            }
            ("", _) => Ok(()),
            _ => client.send_message(line),
        };

        if let Err(e) = result {
            eprintln!("* {}", e);
            if !client.is_connected() {
                break;
            }
        }
    }

    client.disconnect("bye");
}
