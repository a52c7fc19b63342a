//! Daemon 集成测试（Unix Socket + JSONL）

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use ai_agent_daemon::{
    Daemon, DaemonConfig, Event, EventType, Push, QueryType, Request, Response, SessionInput,
};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

struct TestDaemon {
    _dir: TempDir,
    daemon: Arc<Daemon>,
    handle: JoinHandle<()>,
}

/// 启动 daemon 并等待 socket 就绪
async fn start_daemon() -> TestDaemon {
    let dir = TempDir::new().unwrap();
    let mut config = DaemonConfig::with_data_dir(dir.path());
    config.shutdown_timeout = Duration::from_secs(2);

    let daemon = Arc::new(Daemon::new(config).unwrap());
    let handle = {
        let daemon = daemon.clone();
        tokio::spawn(async move {
            daemon.run().await.unwrap();
        })
    };

    let socket_path = daemon.socket_path();
    for _ in 0..100 {
        if socket_path.exists() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(socket_path.exists(), "daemon socket not created");

    TestDaemon {
        _dir: dir,
        daemon,
        handle,
    }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(daemon: &Daemon) -> Self {
        let stream = UnixStream::connect(daemon.socket_path()).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\n", line).as_bytes())
            .await
            .unwrap();
    }

    async fn read_value(&mut self) -> serde_json::Value {
        let mut line = String::new();
        timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for daemon")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, request: &Request) -> Response {
        self.send_raw(&serde_json::to_string(request).unwrap()).await;
        serde_json::from_value(self.read_value().await).unwrap()
    }
}

#[tokio::test]
async fn test_handshake_and_heartbeat() {
    let t = start_daemon().await;
    let mut client = Client::connect(&t.daemon).await;

    let response = client
        .request(&Request::Handshake {
            component: "test".to_string(),
            version: "1.0.0".to_string(),
        })
        .await;
    match response {
        Response::HandshakeOk { daemon_version } => assert!(!daemon_version.is_empty()),
        other => panic!("Expected HandshakeOk, got {:?}", other),
    }

    assert!(matches!(client.request(&Request::Heartbeat).await, Response::Ok));
    t.handle.abort();
}

#[tokio::test]
async fn test_errors_carry_status_codes() {
    let t = start_daemon().await;
    let mut client = Client::connect(&t.daemon).await;

    let response = client
        .request(&Request::GetSession {
            session_id: "missing".to_string(),
        })
        .await;
    assert!(matches!(response, Response::Error { code: 404, .. }));

    let response = client
        .request(&Request::SendDecision {
            approval_id: "whatever".to_string(),
            decision_type: "human_contact".to_string(),
            decision: "respond".to_string(),
            comment: None,
        })
        .await;
    match response {
        Response::Error { code, message } => {
            assert_eq!(code, 400);
            assert!(message.contains("human contact"));
        }
        other => panic!("Expected Error, got {:?}", other),
    }

    // 非法 JSON 不断开连接
    client.send_raw("{not json").await;
    let value = client.read_value().await;
    assert_eq!(value["type"], "Error");
    assert_eq!(value["code"], 400);
    assert!(matches!(client.request(&Request::Heartbeat).await, Response::Ok));

    t.handle.abort();
}

#[tokio::test]
async fn test_subscription_receives_pushes() {
    let t = start_daemon().await;
    t.daemon
        .context()
        .db
        .create_session(&SessionInput {
            id: "s1".to_string(),
            run_id: "r1".to_string(),
            query: "q".to_string(),
            ..Default::default()
        })
        .unwrap();

    let mut client = Client::connect(&t.daemon).await;
    let subscription_id = match client
        .request(&Request::Subscribe {
            events: vec![EventType::SessionSettingsChanged],
            session_id: Some("s1".to_string()),
            run_id: None,
        })
        .await
    {
        Response::Subscribed { subscription_id } => subscription_id,
        other => panic!("Expected Subscribed, got {:?}", other),
    };

    client
        .send_raw(
            &serde_json::to_string(&Request::UpdateSessionSettings {
                session_id: "s1".to_string(),
                skip_permissions: true,
                expires_at: None,
            })
            .unwrap(),
        )
        .await;

    // 响应和推送的先后顺序不固定
    let mut push = None;
    let mut response = None;
    for _ in 0..2 {
        let value = client.read_value().await;
        if value["type"] == "Event" {
            push = Some(serde_json::from_value::<Push>(value).unwrap());
        } else {
            response = Some(serde_json::from_value::<Response>(value).unwrap());
        }
    }

    assert!(matches!(response, Some(Response::Session { .. })));
    match push {
        Some(Push::Event {
            subscription_id: id,
            event: Event::SessionSettingsChanged {
                session_id,
                skip_permissions,
                ..
            },
            ..
        }) => {
            assert_eq!(id, subscription_id);
            assert_eq!(session_id, "s1");
            assert!(skip_permissions);
        }
        other => panic!("Expected settings push, got {:?}", other),
    }

    let response = client
        .request(&Request::Unsubscribe { subscription_id })
        .await;
    assert!(matches!(response, Response::Ok));
    assert_eq!(t.daemon.context().broadcaster.subscriber_count(), 0);

    t.handle.abort();
}

#[tokio::test]
async fn test_closing_connection_drops_subscriptions() {
    let t = start_daemon().await;
    let mut client = Client::connect(&t.daemon).await;
    client
        .request(&Request::Subscribe {
            events: vec![],
            session_id: None,
            run_id: None,
        })
        .await;
    assert_eq!(t.daemon.context().broadcaster.subscriber_count(), 1);

    drop(client);
    for _ in 0..100 {
        if t.daemon.context().broadcaster.subscriber_count() == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(t.daemon.context().broadcaster.subscriber_count(), 0);

    t.handle.abort();
}

#[tokio::test]
async fn test_query_status() {
    let t = start_daemon().await;
    let mut client = Client::connect(&t.daemon).await;

    match client
        .request(&Request::Query {
            query_type: QueryType::Status,
        })
        .await
    {
        Response::QueryResult { data } => {
            assert_eq!(data["pid"], std::process::id());
            assert_eq!(data["active_sessions"], 0);
            assert!(data["version"].is_string());
        }
        other => panic!("Expected QueryResult, got {:?}", other),
    }

    t.handle.abort();
}

#[tokio::test]
async fn test_shutdown_cleans_up() {
    let t = start_daemon().await;
    let socket_path = t.daemon.socket_path();
    let pid_path = t.daemon.context().config.pid_path();
    assert!(pid_path.exists());

    t.daemon.trigger_shutdown();
    timeout(Duration::from_secs(5), t.handle)
        .await
        .expect("daemon did not shut down")
        .unwrap();

    assert!(!socket_path.exists());
    assert!(!pid_path.exists());
}
