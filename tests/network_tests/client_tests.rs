//! Client Tests
//!
//! Tests for the client state machine against a live server.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use turnlink::config::{ClientConfigBuilder, ServerConfigBuilder};
use turnlink::protocol::{names, Command};
use turnlink::{
    ClientConfig, ClientConnection, ClientListener, ClientState, GameClient, GameServer, LinkError,
    ServerConfig, ServerListener, Value,
};

const WAIT: Duration = Duration::from_secs(5);

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn start_server(configure: impl FnOnce(ServerConfigBuilder) -> ServerConfigBuilder) -> GameServer {
    let builder = ServerConfig::builder()
        .name("arena")
        .port(free_port())
        .handshake_timeout_ms(2_000);
    let server = GameServer::new(configure(builder).build()).unwrap();
    server.listen().unwrap();
    server
}

fn client(name: &str, configure: impl FnOnce(ClientConfigBuilder) -> ClientConfigBuilder) -> GameClient {
    let builder = ClientConfig::builder().name(name).connect_timeout_ms(3_000);
    GameClient::new(configure(builder).build()).unwrap()
}

fn port_of(server: &GameServer) -> u16 {
    server.local_addr().unwrap().port()
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[derive(Debug, PartialEq)]
enum ClientEvent {
    Connected,
    Disconnected(String, bool),
    Message(String),
    Command(String),
    Ping,
    Properties(HashMap<String, Value>),
}

struct ClientRecorder(Sender<ClientEvent>);

impl ClientRecorder {
    fn install(client: &GameClient) -> Receiver<ClientEvent> {
        let (tx, rx) = channel::unbounded();
        client.add_listener(Arc::new(ClientRecorder(tx)));
        rx
    }
}

impl ClientListener for ClientRecorder {
    fn on_connected(&self) {
        let _ = self.0.send(ClientEvent::Connected);
    }

    fn on_disconnected(&self, reason: &str, server_initiated: bool) {
        let _ = self
            .0
            .send(ClientEvent::Disconnected(reason.to_string(), server_initiated));
    }

    fn on_command(&self, command: &Command) {
        let _ = self.0.send(ClientEvent::Command(command.type_name().to_string()));
    }

    fn on_message(&self, message: &str) {
        let _ = self.0.send(ClientEvent::Message(message.to_string()));
    }

    fn on_ping(&self, _round_trip_ms: i64) {
        let _ = self.0.send(ClientEvent::Ping);
    }

    fn on_properties_changed(&self, properties: &HashMap<String, Value>) {
        let _ = self.0.send(ClientEvent::Properties(properties.clone()));
    }
}

#[derive(Debug, PartialEq)]
enum ServerEvent {
    Connected(String),
    Reconnected(String),
    Disconnected(String),
    Properties(String),
    Command(String, String),
}

struct ServerRecorder(Sender<ServerEvent>);

impl ServerRecorder {
    fn install(server: &GameServer) -> Receiver<ServerEvent> {
        let (tx, rx) = channel::unbounded();
        server.add_listener(Arc::new(ServerRecorder(tx)));
        rx
    }
}

impl ServerListener for ServerRecorder {
    fn on_connected(&self, conn: &Arc<ClientConnection>) {
        let _ = self.0.send(ServerEvent::Connected(conn.name().to_string()));
    }

    fn on_reconnected(&self, conn: &Arc<ClientConnection>) {
        let _ = self.0.send(ServerEvent::Reconnected(conn.name().to_string()));
    }

    fn on_disconnected(&self, conn: &Arc<ClientConnection>, _reason: &str) {
        let _ = self.0.send(ServerEvent::Disconnected(conn.name().to_string()));
    }

    fn on_properties_changed(&self, conn: &Arc<ClientConnection>) {
        let _ = self.0.send(ServerEvent::Properties(conn.name().to_string()));
    }

    fn on_command(&self, conn: &Arc<ClientConnection>, command: &Command) {
        let _ = self
            .0
            .send(ServerEvent::Command(conn.name().to_string(), command.type_name().to_string()));
    }
}

// =============================================================================
// Connect Tests
// =============================================================================

#[test]
fn test_connect_blocking() {
    let server = start_server(|b| b.keep_alive_ms(4_000));
    let server_events = ServerRecorder::install(&server);
    let player = client("alice", |b| b);
    let events = ClientRecorder::install(&player);
    assert_eq!(player.state(), ClientState::Ready);

    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();

    assert_eq!(player.state(), ClientState::Connected);
    assert_eq!(player.server_name().as_deref(), Some("arena"));
    assert_eq!(player.keep_alive(), Duration::from_millis(4_000));
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ClientEvent::Connected);
    assert_eq!(server_events.recv_timeout(WAIT).unwrap(), ServerEvent::Connected("alice".into()));
}

#[test]
fn test_connect_rejected_on_version() {
    let server = start_server(|b| b.version("2.0"));
    let player = client("bob", |b| b.version("1.0"));

    let err = player.connect_blocking("127.0.0.1", port_of(&server)).unwrap_err();

    assert!(matches!(err, LinkError::Rejected(ref r) if r.contains("incompatible version")), "{}", err);
    assert_eq!(player.state(), ClientState::Disconnected);
    assert!(server.connection("bob").is_none());
}

#[test]
fn test_connect_refused() {
    let player = client("carl", |b| b);
    let err = player.connect_blocking("127.0.0.1", free_port()).unwrap_err();

    assert!(matches!(err, LinkError::Io(_)));
    assert_eq!(player.state(), ClientState::Disconnected);
}

#[test]
fn test_connect_while_connected_fails() {
    let server = start_server(|b| b);
    let player = client("dana", |b| b);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();

    assert!(matches!(
        player.connect_blocking("127.0.0.1", port_of(&server)),
        Err(LinkError::InvalidState(_))
    ));
}

#[test]
fn test_password_answered() {
    let server = start_server(|b| b.password("hunter2"));

    let good = client("ed", |b| b.password("hunter2"));
    good.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    assert!(good.is_connected());

    let bad = client("fay", |b| b.password("wrong"));
    let err = bad.connect_blocking("127.0.0.1", port_of(&server)).unwrap_err();
    assert!(matches!(err, LinkError::Rejected(ref r) if r == "bad password"), "{}", err);
}

// =============================================================================
// Disconnect / Reconnect Tests
// =============================================================================

#[test]
fn test_client_disconnect() {
    let server = start_server(|b| b);
    let server_events = ServerRecorder::install(&server);
    let player = client("gus", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = events.recv_timeout(WAIT);
    let _ = server_events.recv_timeout(WAIT);

    player.disconnect("leaving");

    assert_eq!(player.state(), ClientState::Disconnected);
    assert_eq!(player.disconnect_reason().as_deref(), Some("leaving"));
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected("leaving".into(), false)
    );
    assert_eq!(server_events.recv_timeout(WAIT).unwrap(), ServerEvent::Disconnected("gus".into()));
    assert!(wait_until(WAIT, || server.connection("gus").is_none()));

    // Second disconnect is a no-op
    player.disconnect("again");
    assert!(events.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_server_initiated_disconnect() {
    let server = start_server(|b| b);
    let player = client("hal", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = events.recv_timeout(WAIT);

    server.connection("hal").unwrap().disconnect("match over");

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected("match over".into(), true)
    );
    assert_eq!(player.state(), ClientState::Disconnected);
}

#[test]
fn test_reconnect_after_kick_and_unkick() {
    let server = start_server(|b| b);
    let server_events = ServerRecorder::install(&server);
    let player = client("ida", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = server_events.recv_timeout(WAIT);
    let _ = events.recv_timeout(WAIT);

    server.kick("ida");
    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Disconnected("kicked".into(), true)
    );

    let banned = player.reconnect_async().unwrap().join().unwrap();
    assert!(matches!(banned, Err(LinkError::Rejected(ref r)) if r.contains("banned")));

    server.unkick("ida");
    player.reconnect_async().unwrap().join().unwrap().unwrap();
    assert!(player.is_connected());
    assert!(wait_until(WAIT, || server_events
        .try_iter()
        .any(|e| e == ServerEvent::Reconnected("ida".into()))));
}

#[test]
fn test_reconnect_requires_disconnected() {
    let player = client("jo", |b| b);
    assert!(matches!(player.reconnect_async(), Err(LinkError::InvalidState(_))));
}

#[test]
fn test_reset() {
    let server = start_server(|b| b);
    let player = client("kim", |b| b);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    assert!(matches!(player.reset(), Err(LinkError::InvalidState(_))));

    player.disconnect("bye");
    player.reset().unwrap();
    assert_eq!(player.state(), ClientState::Ready);
    assert!(player.server_name().is_none());
    assert!(player.disconnect_reason().is_none());
}

// =============================================================================
// Traffic Tests
// =============================================================================

#[test]
fn test_send_requires_connection() {
    let player = client("lee", |b| b);
    assert!(matches!(player.send_message("hi"), Err(LinkError::NotConnected)));
}

#[test]
fn test_messages_both_ways() {
    let server = start_server(|b| b);
    let server_events = ServerRecorder::install(&server);
    let player = client("max", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = events.recv_timeout(WAIT);
    let _ = server_events.recv_timeout(WAIT);

    server.connection("max").unwrap().send_message("welcome").unwrap();
    assert_eq!(events.recv_timeout(WAIT).unwrap(), ClientEvent::Message("welcome".into()));

    player.send_message("thanks").unwrap();
    assert_eq!(
        server_events.recv_timeout(WAIT).unwrap(),
        ServerEvent::Command("max".into(), names::MESSAGE.into())
    );
}

#[test]
fn test_custom_command_reaches_client_listener() {
    let server = start_server(|b| b);
    let player = client("ned", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = events.recv_timeout(WAIT);

    let turn = server.config().registry.get_or_register("CLIENT_TEST_TURN").unwrap();
    server.broadcast_command(&Command::new(turn).with("n", 1i32));

    assert_eq!(
        events.recv_timeout(WAIT).unwrap(),
        ClientEvent::Command("CLIENT_TEST_TURN".into())
    );
}

#[test]
fn test_properties_sent_on_connect_and_on_change() {
    let server = start_server(|b| b);
    let server_events = ServerRecorder::install(&server);
    let player = client("ola", |b| b);
    player.set_property("team", "red");
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = server_events.recv_timeout(WAIT);

    let conn = server.connection("ola").unwrap();
    assert_eq!(conn.attribute("team"), Some(Value::from("red")));

    player.set_properties([("team", Value::from("blue")), ("seat", Value::Int32(3))]);
    assert_eq!(server_events.recv_timeout(WAIT).unwrap(), ServerEvent::Properties("ola".into()));
    assert_eq!(conn.attribute("team"), Some(Value::from("blue")));
    assert_eq!(conn.attribute("seat"), Some(Value::Int32(3)));

    let local: Vec<String> = player.properties().keys().cloned().collect();
    assert_eq!(local, vec!["team".to_string(), "seat".to_string()]);
}

#[test]
fn test_server_properties_reach_client() {
    let server = start_server(|b| b);
    let player = client("pia", |b| b);
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    let _ = events.recv_timeout(WAIT);

    let props = Command::new(server.config().registry.reserved().properties.clone()).with("map", "dunes");
    server.connection("pia").unwrap().send_command(props).unwrap();

    match events.recv_timeout(WAIT).unwrap() {
        ClientEvent::Properties(map) => assert_eq!(map.get("map"), Some(&Value::from("dunes"))),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(player.server_properties().get("map"), Some(&Value::from("dunes")));
}

#[test]
fn test_keep_alive_ping_measures_round_trip() {
    let server = start_server(|b| b.keep_alive_ms(100));
    // The writer's first idle window starts before SVR_CONNECTED arrives
    let player = client("quin", |b| b.keep_alive_ms(100));
    let events = ClientRecorder::install(&player);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();
    assert_eq!(player.last_ping_ms(), None);

    assert!(wait_until(WAIT, || events.try_iter().any(|e| e == ClientEvent::Ping)));
    assert!(player.last_ping_ms().is_some());

    let conn = server.connection("quin").unwrap();
    assert!(wait_until(WAIT, || conn.speed_ms().is_some()));
}

#[test]
fn test_send_error_is_accepted() {
    let server = start_server(|b| b);
    let player = client("rex", |b| b);
    player.connect_blocking("127.0.0.1", port_of(&server)).unwrap();

    player.send_error("texture missing").unwrap();
    player.send_message("still here").unwrap();
    assert!(server.connection("rex").unwrap().is_connected());
}
