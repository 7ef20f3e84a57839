//! End to end: WebSocket client -> gateway -> SSH -> agent -> process

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use ops_agent::auth::{Authenticator, AuthorizedKeys};
use ops_agent::server::{ephemeral_host_key, AgentServer};
use ops_agent::{AgentState, CommandSpec, CommandTable};
use ops_core::config::{AgentConfig, GatewayConfig, UpstreamConfig};
use ops_gateway::gateway;
use ops_gateway::upstream::{ConfiguredCredentials, SshDialer};
use ops_gateway::GatewayState;

const USER: &str = "ops";
const PASSWORD: &str = "correct horse";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Bridge {
    gateway: SocketAddr,
    agent: Arc<AgentServer>,
    cancel: CancellationToken,
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn agent_commands() -> CommandTable {
    CommandTable::new()
        .with("logs", CommandSpec::new("sh", ["-c", "printf 'L1\\nL2\\nL3\\n'"]))
        .with("errors", CommandSpec::new("sh", ["-c", "printf 'E1\\n' >&2"]))
        .with("pid", CommandSpec::new("sh", ["-c", "echo $$; exec sleep 30"]))
        .with("term", CommandSpec::new("sh", ["-c", "echo $TERM"]))
}

async fn start_bridge(command: &str, expected_host_key: Option<String>) -> Bridge {
    let cancel = CancellationToken::new();

    let agent_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let agent_port = agent_listener.local_addr().unwrap().port();
    let agent_state = Arc::new(AgentState::with_commands(
        AgentConfig::default(),
        Authenticator::new(Some(PASSWORD.into()), AuthorizedKeys::new()),
        Arc::new(agent_commands()),
    ));
    let agent = Arc::new(AgentServer::new(
        ephemeral_host_key().unwrap(),
        agent_state,
        cancel.child_token(),
    ));
    let serving = Arc::clone(&agent);
    tokio::spawn(async move { serving.serve(agent_listener).await });

    let upstream = UpstreamConfig {
        port: agent_port,
        username: USER.to_string(),
        password: Some(PASSWORD.to_string()),
        private_key_path: None,
        expected_host_key,
        ..Default::default()
    };
    let config = GatewayConfig {
        command: command.to_string(),
        static_dir: None,
        upstream: upstream.clone(),
        ..Default::default()
    };
    let dialer = SshDialer::new(upstream, Arc::new(ConfiguredCredentials::password(USER, PASSWORD)));

    let gateway_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = gateway_listener.local_addr().unwrap();
    let state = Arc::new(GatewayState::new(config, Arc::new(dialer), cancel.clone()));
    tokio::spawn(gateway::serve(gateway_listener, state));

    Bridge {
        gateway: gateway_addr,
        agent,
        cancel,
    }
}

async fn connect(bridge: &Bridge) -> Client {
    let url = format!("ws://{}/logs", bridge.gateway);
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    client
        .send(Message::text(r#"{"target":"127.0.0.1","data":"","type":"text"}"#.to_string()))
        .await
        .unwrap();
    client
}

async fn next_frame(client: &mut Client) -> Message {
    loop {
        let msg = timeout(Duration::from_secs(10), client.next())
            .await
            .expect("expected a frame")
            .expect("stream ended")
            .unwrap();
        if !matches!(msg, Message::Ping(_) | Message::Pong(_)) {
            return msg;
        }
    }
}

async fn next_text(client: &mut Client) -> String {
    match next_frame(client).await {
        Message::Text(text) => text.as_str().to_string(),
        other => panic!("expected text, got {:?}", other),
    }
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_lines_arrive_in_order() {
    let bridge = start_bridge("logs", None).await;
    let mut client = connect(&bridge).await;

    assert_eq!(next_text(&mut client).await, "L1");
    assert_eq!(next_text(&mut client).await, "L2");
    assert_eq!(next_text(&mut client).await, "L3");
}

#[tokio::test]
async fn test_stderr_is_relayed() {
    let bridge = start_bridge("errors", None).await;
    let mut client = connect(&bridge).await;

    assert_eq!(next_text(&mut client).await, "E1");
}

#[tokio::test]
async fn test_unknown_command_reply() {
    let bridge = start_bridge("foo", None).await;
    let mut client = connect(&bridge).await;

    assert_eq!(next_text(&mut client).await, "foo <- Unknown command.");
    // Nothing else follows
    assert!(timeout(Duration::from_millis(300), client.next()).await.is_err());
}

#[tokio::test]
async fn test_pty_term_reaches_process() {
    let bridge = start_bridge("term", None).await;
    let mut client = connect(&bridge).await;

    assert_eq!(next_text(&mut client).await, "xterm-256color");
}

#[tokio::test]
async fn test_client_disconnect_kills_remote_process() {
    let bridge = start_bridge("pid", None).await;
    let mut client = connect(&bridge).await;

    let pid = next_text(&mut client).await;
    assert!(process_alive(&pid));

    client.close(None).await.unwrap();

    for _ in 0..50 {
        if !process_alive(&pid) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("process {} survived the client", pid);
}

#[tokio::test]
async fn test_agent_going_away_closes_client_with_error() {
    let bridge = start_bridge("pid", None).await;
    let mut client = connect(&bridge).await;

    let pid = next_text(&mut client).await;
    bridge.agent.shutdown(Duration::from_secs(5)).await;
    assert!(!process_alive(&pid));

    // Let the gateway's SSH client notice the disconnect
    tokio::time::sleep(Duration::from_millis(200)).await;

    client
        .send(Message::text(r#"{"target":"127.0.0.1"}"#.to_string()))
        .await
        .unwrap();

    match next_frame(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("expected close, got {:?}", other),
    }
}

#[tokio::test]
async fn test_host_key_mismatch_closes_with_error() {
    let bridge = start_bridge("logs", Some("SHA256:not-the-agent-key".to_string())).await;
    let mut client = connect(&bridge).await;

    match next_frame(&mut client).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("expected close, got {:?}", other),
    }
}
