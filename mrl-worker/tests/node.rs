use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use common::message::{Control, Message};
use common::Record;
use mrl_worker::executor::ExecutionChannel;
use mrl_worker::peer::PeerClient;
use mrl_worker::retry::ExponentialBackoff;
use mrl_worker::{NodeConfig, NodeController, NodeHandle, NodeStatus};

const WAIT: Duration = Duration::from_secs(5);

/// The master side of the control connection.
struct Master {
    listener: TcpListener,
}

impl Master {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    fn url(&self) -> Url {
        let addr = self.listener.local_addr().unwrap();
        Url::parse(&format!("ws://{addr}/bsmr/")).unwrap()
    }

    async fn accept(&self) -> Socket {
        let (stream, _) = timeout(WAIT, self.listener.accept()).await.unwrap().unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, mut response: Response| {
            assert_eq!(
                request.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
                "worker"
            );
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("worker"));
            Ok(response)
        })
        .await
        .unwrap();
        Socket { ws }
    }
}

struct Socket {
    ws: WebSocketStream<TcpStream>,
}

impl Socket {
    async fn send(&mut self, message: Value) {
        self.ws.send(Frame::Text(message.to_string().into())).await.unwrap();
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Frame::Text(text.to_string().into())).await.unwrap();
    }

    /// Next message from the node, as raw JSON.
    async fn recv(&mut self) -> Value {
        loop {
            let frame = timeout(WAIT, self.ws.next())
                .await
                .expect("timed out waiting for the node")
                .expect("connection closed")
                .unwrap();
            if let Frame::Text(text) = frame {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    /// Next message that is not a heartbeat.
    async fn recv_work(&mut self) -> Value {
        loop {
            let message = self.recv().await;
            if message["type"] != "HB" {
                return message;
            }
        }
    }

    /// Whether the node closed the connection.
    async fn closed(&mut self) -> bool {
        loop {
            match timeout(WAIT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Frame::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

/// The executor side of the execution channel.
struct Executor {
    inbox: UnboundedReceiver<Message>,
    outbox: UnboundedSender<Message>,
}

impl Executor {
    async fn recv(&mut self) -> Option<Message> {
        timeout(WAIT, self.inbox.recv()).await.expect("timed out waiting for the node")
    }
}

fn config(master: &Master) -> NodeConfig {
    let mut config = NodeConfig::new(master.url());
    config.listen = "127.0.0.1:0".parse().unwrap();
    config.heartbeat = Duration::from_secs(60);
    config
}

/// Start a node with a scripted executor and wait for its greeting.
async fn start(config: NodeConfig, master: &Master) -> (NodeHandle, Socket, Executor, u16) {
    let (to_executor, inbox) = mpsc::unbounded_channel();
    let (outbox, from_executor) = mpsc::unbounded_channel();

    let handle = NodeController::new(config)
        .with_executor(ExecutionChannel::from_parts(to_executor, from_executor))
        .spawn();
    let mut socket = master.accept().await;
    let mut executor = Executor { inbox, outbox };

    let greeting = socket.recv().await;
    assert_eq!(greeting["type"], "ACK");
    assert_eq!(greeting["payload"]["action"], "socket");
    let port = greeting["payload"]["port"].as_u64().unwrap() as u16;

    assert_eq!(
        executor.recv().await,
        Some(Message::Control(Control::Heartbeat))
    );
    (handle, socket, executor, port)
}

fn map_task(job_id: u64, split: &str, reducers: u32, input: &str) -> Value {
    json!({
        "type": "DO",
        "payload": {
            "action": "mapTask",
            "job": {"jobId": job_id, "M": 1, "R": reducers, "code": "wc"},
            "mapStatus": {"splitId": split, "input": input},
            "attempt": 1
        }
    })
}

fn upload(job_id: u64, split: &str, records: Value, more: bool) -> Message {
    serde_json::from_value(json!({
        "type": "UPL",
        "payload": {
            "action": "mapOutput",
            "jobId": job_id,
            "splitId": split,
            "records": records,
            "more": more
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn greeting_announces_the_peer_listener() {
    let master = Master::bind().await;
    let (to_executor, mut inbox) = mpsc::unbounded_channel();
    let (_outbox, from_executor) = mpsc::unbounded_channel();

    let mut handle = NodeController::new(config(&master))
        .with_executor(ExecutionChannel::from_parts(to_executor, from_executor))
        .spawn();
    let mut socket = master.accept().await;

    let greeting = socket.recv().await;
    assert_eq!(greeting["type"], "ACK");
    assert_eq!(greeting["payload"]["action"], "socket");
    assert_eq!(greeting["payload"]["protocol"], "tcp");
    assert_eq!(greeting["payload"]["resource"], "/shuffle");
    assert_ne!(greeting["payload"]["port"], 0);

    assert_eq!(inbox.recv().await, Some(Message::Control(Control::Heartbeat)));
    let status = timeout(WAIT, handle.wait_for(|s| *s == NodeStatus::Idle))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, NodeStatus::Idle);
}

#[tokio::test]
async fn assignments_and_acknowledgements_are_relayed_verbatim() {
    let master = Master::bind().await;
    let (mut handle, mut socket, mut executor, _) = start(config(&master), &master).await;

    let task = map_task(1, "s1", 2, "a b");
    socket.send(task.clone()).await;

    let relayed = executor.recv().await.unwrap();
    assert_eq!(serde_json::to_value(&relayed).unwrap(), task);
    timeout(WAIT, handle.wait_for(|s| *s == NodeStatus::Mapping))
        .await
        .unwrap()
        .unwrap();

    let heartbeat: Message = serde_json::from_value(json!({
        "type": "HB", "payload": {"action": "hb", "load": [1, 2]}
    }))
    .unwrap();
    executor.outbox.send(heartbeat.clone()).unwrap();
    executor.outbox.send(Message::log("not for the master")).unwrap();
    let ack: Message = serde_json::from_value(json!({
        "type": "ACK",
        "payload": {"action": "mapTask", "jobId": 1, "mapStatus": {"splitId": "s1"}, "took": 3}
    }))
    .unwrap();
    executor.outbox.send(ack.clone()).unwrap();

    assert_eq!(socket.recv().await, serde_json::to_value(&heartbeat).unwrap());
    assert_eq!(socket.recv().await, serde_json::to_value(&ack).unwrap());
    timeout(WAIT, handle.wait_for(|s| *s == NodeStatus::Idle))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn garbage_from_the_master_changes_nothing() {
    let master = Master::bind().await;
    let (handle, mut socket, mut executor, _) = start(config(&master), &master).await;

    socket.send(json!({"type": "PING", "payload": {}})).await;
    socket.send(json!({"type": "DO", "payload": {"action": "dance"}})).await;
    socket.send_raw("{ not json").await;
    socket
        .send(json!({"type": "CTL", "payload": {"action": "step"}}))
        .await;

    let idle = json!({"type": "DO", "payload": {"action": "idle"}});
    socket.send(idle.clone()).await;

    // Only the idle assignment reaches the executor.
    let relayed = executor.recv().await.unwrap();
    assert_eq!(serde_json::to_value(&relayed).unwrap(), idle);
    assert_eq!(handle.status(), NodeStatus::Idle);
}

#[tokio::test]
async fn map_output_is_acknowledged_and_served_to_peers() {
    let master = Master::bind().await;
    let (mut handle, mut socket, mut executor, port) = start(config(&master), &master).await;

    socket.send(map_task(3, "s1", 3, "unused")).await;
    executor.recv().await.unwrap();

    executor
        .outbox
        .send(upload(3, "s1", json!([["a", 1], ["b", 2]]), true))
        .unwrap();
    executor
        .outbox
        .send(upload(3, "s1", json!([["c", 3], ["a", 4]]), false))
        .unwrap();

    let ack = socket.recv().await;
    assert_eq!(
        ack,
        json!({"type": "ACK", "payload": {"action": "mapTask", "jobId": 3, "mapStatus": {"splitId": "s1"}}})
    );
    timeout(WAIT, handle.wait_for(|s| *s == NodeStatus::Idle))
        .await
        .unwrap()
        .unwrap();

    let peers = PeerClient::new("/shuffle");
    let addr = format!("127.0.0.1:{port}");
    assert_eq!(
        peers.fetch(&addr, 1, "s1").await.unwrap(),
        vec![Record::new("a", 1), Record::new("a", 4)]
    );
    assert_eq!(peers.fetch(&addr, 2, "s1").await.unwrap(), vec![Record::new("b", 2)]);
    assert_eq!(peers.fetch(&addr, 0, "s1").await.unwrap(), vec![Record::new("c", 3)]);
    assert!(peers.fetch(&addr, 0, "s2").await.unwrap().is_empty());
}

#[tokio::test]
async fn silent_tasks_time_out() {
    let master = Master::bind().await;
    let mut config = config(&master);
    config.task_timeout = Some(Duration::from_millis(200));
    let (mut handle, mut socket, mut executor, _) = start(config, &master).await;

    socket.send(map_task(4, "s9", 2, "x")).await;
    executor.recv().await.unwrap();

    let failure = socket.recv().await;
    assert_eq!(failure["payload"]["action"], "taskFailed");
    assert_eq!(failure["payload"]["jobId"], 4);
    assert_eq!(failure["payload"]["splitId"], "s9");
    assert_eq!(failure["payload"]["reason"], "timeout");

    // The executor is told to drop the task.
    let idle = executor.recv().await.unwrap();
    assert_eq!(idle.action(), Some("idle"));
    timeout(WAIT, handle.wait_for(|s| *s == NodeStatus::Idle))
        .await
        .unwrap()
        .unwrap();

    // A late acknowledgement is not relayed.
    let late: Message = serde_json::from_value(json!({
        "type": "ACK",
        "payload": {"action": "mapTask", "jobId": 4, "mapStatus": {"splitId": "s9"}}
    }))
    .unwrap();
    executor.outbox.send(late).unwrap();
    executor.outbox.send(Message::heartbeat()).unwrap();
    assert_eq!(socket.recv().await["type"], "HB");
}

#[tokio::test]
async fn master_disconnect_stops_the_node() {
    let master = Master::bind().await;
    let (handle, socket, mut executor, _) = start(config(&master), &master).await;

    drop(socket);

    assert_eq!(timeout(WAIT, handle.join()).await.unwrap(), NodeStatus::Stopped);
    assert_eq!(executor.recv().await, None);
}

#[tokio::test]
async fn stop_closes_every_channel() {
    let master = Master::bind().await;
    let (handle, mut socket, mut executor, port) = start(config(&master), &master).await;

    handle.stop().unwrap();
    assert_eq!(timeout(WAIT, handle.join()).await.unwrap(), NodeStatus::Stopped);

    assert!(socket.closed().await);
    assert_eq!(executor.recv().await, None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn unreachable_master_is_an_error() {
    let master = Master::bind().await;
    let config = config(&master);
    drop(master);

    let (to_executor, _inbox) = mpsc::unbounded_channel();
    let (_outbox, from_executor) = mpsc::unbounded_channel();
    let handle = NodeController::new(config)
        .with_executor(ExecutionChannel::from_parts(to_executor, from_executor))
        .spawn();

    let status = timeout(WAIT, handle.join()).await.unwrap();
    assert!(matches!(status, NodeStatus::Error(_)), "got {status}");
}

#[tokio::test]
async fn reconnects_when_allowed() {
    let master = Master::bind().await;
    let policy = ExponentialBackoff {
        initial: Duration::from_millis(10),
        max: Duration::from_millis(50),
        max_attempts: 3,
    };

    let (to_executor, mut inbox) = mpsc::unbounded_channel();
    let (_outbox, from_executor) = mpsc::unbounded_channel();
    let handle = NodeController::new(config(&master))
        .with_executor(ExecutionChannel::from_parts(to_executor, from_executor))
        .with_reconnect(Box::new(policy))
        .spawn();

    let mut first = master.accept().await;
    assert_eq!(first.recv().await["payload"]["action"], "socket");
    drop(first);

    let mut second = master.accept().await;
    assert_eq!(second.recv().await["payload"]["action"], "socket");
    assert_eq!(handle.status(), NodeStatus::Idle);

    // The executor was asked to start heartbeats once per greeting.
    assert_eq!(inbox.recv().await, Some(Message::Control(Control::Heartbeat)));
    assert_eq!(inbox.recv().await, Some(Message::Control(Control::Heartbeat)));
}

#[tokio::test]
async fn word_count_end_to_end() {
    let master = Master::bind().await;
    let mut config = config(&master);
    config.heartbeat = Duration::from_millis(100);

    let handle = NodeController::new(config).spawn();
    let mut socket = master.accept().await;

    let greeting = socket.recv().await;
    let port = greeting["payload"]["port"].as_u64().unwrap();
    let location = format!("127.0.0.1:{port}");

    // Heartbeats start right after the greeting.
    assert_eq!(socket.recv().await["type"], "HB");

    socket.send(map_task(7, "s1", 1, "a b a")).await;
    assert_eq!(
        socket.recv_work().await,
        json!({"type": "ACK", "payload": {"action": "mapTask", "jobId": 7, "mapStatus": {"splitId": "s1"}}})
    );

    let job = json!({"jobId": 7, "M": 1, "R": 1, "code": "wc"});
    socket
        .send(json!({"type": "DO", "payload": {
            "action": "reduceTask", "job": job, "reduceStatus": {"bucketId": 0}
        }}))
        .await;
    socket
        .send(json!({"type": "DO", "payload": {
            "action": "reduceSplit", "job": job,
            "reduceStatus": {"bucketId": 0, "splitId": "s1", "locations": [location]}
        }}))
        .await;

    assert_eq!(
        socket.recv_work().await,
        json!({"type": "ACK", "payload": {
            "action": "reduceSplit", "jobId": 7, "reduceStatus": {"bucketId": 0, "splitId": "s1"}
        }})
    );
    assert_eq!(
        socket.recv_work().await,
        json!({"type": "ACK", "payload": {
            "action": "reduceTask", "jobId": 7, "reduceStatus": {"bucketId": 0},
            "output": {"a": 2, "b": 1}
        }})
    );

    handle.stop().unwrap();
    assert_eq!(timeout(WAIT, handle.join()).await.unwrap(), NodeStatus::Stopped);
}
