//! End-to-end scenarios over real WebSocket connections.

use std::net::SocketAddr;
use std::time::Duration;

use apiary_core::{HubConfig, PeerKind};
use apiary_hub::Hub;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub() -> Hub {
    let config = HubConfig {
        port: 0,
        client_port: 0,
        service_port: 0,
        ..Default::default()
    };
    Hub::start(config).await.expect("hub should start")
}

async fn connect(addr: SocketAddr) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}", addr))
        .await
        .expect("peer should connect");
    ws
}

async fn send(ws: &mut Ws, frame: Value) {
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("send should succeed");
}

/// Next protocol frame, skipping everything that isn't `kind`.
async fn recv_until(ws: &mut Ws, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("socket open").expect("read ok");
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).expect("valid frame");
                if frame["type"] == kind {
                    return frame;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", kind))
}

/// Strictly the next protocol frame.
async fn recv_next(ws: &mut Ws) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let msg = ws.next().await.expect("socket open").expect("read ok");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).expect("valid frame");
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

async fn register_agent(ws: &mut Ws, name: &str, id: Option<&str>, caps: Value) -> String {
    let mut content = json!({"name": name, "capabilities": caps});
    if let Some(id) = id {
        content["id"] = json!(id);
    }
    send(ws, json!({"id": format!("reg-{}", name), "type": "agent.register", "content": content})).await;
    let reply = recv_until(ws, "agent.registered").await;
    assert_eq!(reply["requestId"], format!("reg-{}", name));
    assert_eq!(reply["content"]["status"], "online");
    reply["content"]["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn lifecycle_client_task_roundtrip() {
    let hub = start_hub().await;

    let mut client = connect(hub.addr(PeerKind::Client).unwrap()).await;
    let welcome = recv_until(&mut client, "orchestrator.client.welcome").await;
    let client_id = welcome["content"]["clientId"].as_str().unwrap().to_string();
    assert!(welcome["content"]["version"].is_string());

    let mut agent = connect(hub.addr(PeerKind::Agent).unwrap()).await;
    let agent_welcome = recv_until(&mut agent, "orchestrator.welcome").await;
    assert!(agent_welcome["content"]["connectionId"].is_string());
    let agent_id = register_agent(&mut agent, "A1", None, json!(["echo"])).await;

    send(
        &mut client,
        json!({
            "id": "create-1",
            "type": "client.agent.task.create.request",
            "content": {"agentName": "A1", "taskData": {"msg": "hi"}},
        }),
    )
    .await;
    let created = recv_until(&mut client, "task.created").await;
    assert_eq!(created["requestId"], "create-1");
    assert_eq!(created["content"]["agentId"], agent_id.as_str());
    let task_id = created["content"]["taskId"].as_str().unwrap().to_string();

    let execute = recv_until(&mut agent, "task.execute").await;
    assert_eq!(execute["content"]["taskId"], task_id.as_str());
    assert_eq!(execute["content"]["taskData"]["msg"], "hi");
    assert_eq!(execute["content"]["clientId"], client_id.as_str());

    send(
        &mut agent,
        json!({
            "id": "res-1",
            "type": "task.result",
            "requestId": execute["id"],
            "content": {"taskId": task_id, "result": "hi"},
        }),
    )
    .await;

    // task.status {completed} strictly before the standalone task.result.
    let status = recv_until(&mut client, "task.status").await;
    assert_eq!(status["content"]["status"], "completed");
    assert_eq!(status["content"]["taskId"], task_id.as_str());
    let result = recv_next(&mut client).await;
    assert_eq!(result["type"], "task.result");
    assert_eq!(result["content"]["result"], "hi");
    assert_eq!(result["content"]["status"], "completed");

    hub.stop().await;
}

#[tokio::test]
async fn delegation_between_agents() {
    let hub = start_hub().await;
    let agent_addr = hub.addr(PeerKind::Agent).unwrap();

    let mut parent = connect(agent_addr).await;
    recv_until(&mut parent, "orchestrator.welcome").await;
    register_agent(&mut parent, "P", None, json!([])).await;

    let mut child = connect(agent_addr).await;
    recv_until(&mut child, "orchestrator.welcome").await;
    register_agent(&mut child, "C", None, json!(["echo"])).await;

    send(
        &mut parent,
        json!({
            "id": "r1",
            "type": "agent.task.request",
            "content": {"targetAgentName": "C", "taskType": "echo", "taskData": {"x": 1}},
        }),
    )
    .await;
    let accepted = recv_until(&mut parent, "childagent.request.accepted").await;
    assert_eq!(accepted["requestId"], "r1");
    let child_task = accepted["content"]["childTaskId"].as_str().unwrap().to_string();

    let execute = recv_until(&mut child, "task.execute").await;
    assert_eq!(execute["content"]["taskId"], child_task.as_str());
    assert_eq!(execute["content"]["taskData"]["x"], 1);

    send(
        &mut child,
        json!({
            "id": "res-c",
            "type": "task.result",
            "content": {"taskId": child_task, "result": {"y": 1}},
        }),
    )
    .await;

    let response = recv_until(&mut parent, "childagent.response").await;
    assert_eq!(response["content"]["childTaskId"], child_task.as_str());
    assert_eq!(response["content"]["status"], "completed");
    assert_eq!(response["content"]["result"]["y"], 1);

    hub.stop().await;
}

#[tokio::test]
async fn service_invocation_with_watching_client() {
    let hub = start_hub().await;

    let mut client = connect(hub.addr(PeerKind::Client).unwrap()).await;
    let welcome = recv_until(&mut client, "orchestrator.client.welcome").await;
    let client_id = welcome["content"]["clientId"].as_str().unwrap().to_string();

    let mut agent = connect(hub.addr(PeerKind::Agent).unwrap()).await;
    recv_until(&mut agent, "orchestrator.welcome").await;
    register_agent(&mut agent, "A", None, json!([])).await;

    let mut service = connect(hub.addr(PeerKind::Service).unwrap()).await;
    recv_until(&mut service, "orchestrator.welcome").await;
    send(
        &mut service,
        json!({
            "id": "sreg",
            "type": "service.register",
            "content": {"id": "S", "name": "S", "capabilities": ["t"]},
        }),
    )
    .await;
    let registered = recv_until(&mut service, "service.registered").await;
    assert_eq!(registered["content"]["id"], "S");

    send(
        &mut agent,
        json!({
            "id": "exec-1",
            "type": "service.task.execute",
            "content": {"serviceId": "S", "toolName": "t", "params": {}, "clientId": client_id},
        }),
    )
    .await;

    let started = recv_until(&mut client, "service.started").await;
    assert_eq!(started["content"]["serviceName"], "S");
    assert_eq!(started["content"]["toolName"], "t");
    let service_task = started["content"]["serviceTaskId"].as_str().unwrap().to_string();

    let dispatched = recv_until(&mut service, "service.task.execute").await;
    assert_eq!(dispatched["content"]["taskId"], service_task.as_str());

    let accepted = recv_until(&mut agent, "service.request.accepted").await;
    assert_eq!(accepted["requestId"], "exec-1");
    assert_eq!(accepted["content"]["serviceTaskId"], service_task.as_str());

    send(
        &mut service,
        json!({
            "id": "sres",
            "type": "service.task.result",
            "content": {"taskId": service_task, "result": "ok"},
        }),
    )
    .await;

    let completed = recv_until(&mut client, "service.completed").await;
    assert_eq!(completed["content"]["serviceTaskId"], service_task.as_str());
    assert_eq!(completed["content"]["result"], "ok");

    let response = recv_until(&mut agent, "service.response").await;
    assert_eq!(response["content"]["status"], "completed");
    assert_eq!(response["content"]["result"], "ok");

    hub.stop().await;
}

#[tokio::test]
async fn dispatch_deadline_does_not_fail_the_task() {
    let hub = start_hub().await;
    let agent_addr = hub.addr(PeerKind::Agent).unwrap();

    let mut parent = connect(agent_addr).await;
    recv_until(&mut parent, "orchestrator.welcome").await;
    register_agent(&mut parent, "P", None, json!([])).await;

    let mut child = connect(agent_addr).await;
    recv_until(&mut child, "orchestrator.welcome").await;
    register_agent(&mut child, "C", None, json!([])).await;

    // Tiny dispatch deadline; the child sits on the task past it.
    send(
        &mut parent,
        json!({
            "id": "r1",
            "type": "agent.task.request",
            "content": {"targetAgentName": "C", "taskData": {}, "timeout": 100},
        }),
    )
    .await;
    let accepted = recv_until(&mut parent, "childagent.request.accepted").await;
    let child_task = accepted["content"]["childTaskId"].as_str().unwrap().to_string();
    let execute = recv_until(&mut child, "task.execute").await;
    assert_eq!(execute["content"]["taskId"], child_task.as_str());

    tokio::time::sleep(Duration::from_millis(400)).await;

    // Past the deadline the task is still alive: only an explicit
    // task.error or a disconnect fails it. A late result completes it.
    send(
        &mut child,
        json!({
            "id": "late",
            "type": "task.result",
            "content": {"taskId": child_task, "result": "slow"},
        }),
    )
    .await;
    let response = recv_until(&mut parent, "childagent.response").await;
    assert_eq!(response["content"]["status"], "completed");
    assert_eq!(response["content"]["result"], "slow");

    hub.stop().await;
}

#[tokio::test]
async fn ping_pong_echoes_request_id() {
    let hub = start_hub().await;
    for kind in [PeerKind::Agent, PeerKind::Client, PeerKind::Service] {
        let mut peer = connect(hub.addr(kind).unwrap()).await;
        send(
            &mut peer,
            json!({"id": "ping-1", "type": "ping", "content": {"timestamp": "2020-01-01T00:00:00Z"}}),
        )
        .await;
        let pong = recv_until(&mut peer, "pong").await;
        assert_eq!(pong["requestId"], "ping-1");
        let ts = pong["content"]["timestamp"].as_str().unwrap();
        assert!(ts >= "2020-01-01T00:00:00Z");
    }
    hub.stop().await;
}

#[tokio::test]
async fn same_name_registration_evicts_older() {
    let hub = start_hub().await;
    let agent_addr = hub.addr(PeerKind::Agent).unwrap();

    let mut first = connect(agent_addr).await;
    recv_until(&mut first, "orchestrator.welcome").await;
    send(
        &mut first,
        json!({"id": "r1", "type": "agent.register", "content": {"id": "id-1", "name": "A1"}}),
    )
    .await;
    recv_until(&mut first, "agent.registered").await;

    let mut second = connect(agent_addr).await;
    recv_until(&mut second, "orchestrator.welcome").await;
    send(
        &mut second,
        json!({"id": "r2", "type": "agent.register", "content": {"id": "id-2", "name": "A1"}}),
    )
    .await;
    recv_until(&mut second, "agent.registered").await;

    // Exactly one record is online and it is the newer one; the older is
    // retained offline with the replacement reason.
    let mut client = connect(hub.addr(PeerKind::Client).unwrap()).await;
    recv_until(&mut client, "orchestrator.client.welcome").await;
    send(
        &mut client,
        json!({"id": "l1", "type": "client.agent.list.request", "content": {}}),
    )
    .await;
    let listing = recv_until(&mut client, "agent.list").await;
    let agents = listing["content"]["agents"].as_array().unwrap();
    assert_eq!(agents.len(), 2);
    let online: Vec<&Value> = agents.iter().filter(|a| a["status"] == "online").collect();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0]["id"], "id-2");
    let evicted = agents.iter().find(|a| a["id"] == "id-1").unwrap();
    assert_eq!(evicted["status"], "offline");
    assert_eq!(
        evicted["statusDetails"]["disconnectedReason"],
        "Replaced by agent with same name"
    );

    hub.stop().await;
}

#[tokio::test]
async fn agent_disconnect_fails_open_tasks() {
    let hub = start_hub().await;

    let mut client = connect(hub.addr(PeerKind::Client).unwrap()).await;
    recv_until(&mut client, "orchestrator.client.welcome").await;

    let mut agent = connect(hub.addr(PeerKind::Agent).unwrap()).await;
    recv_until(&mut agent, "orchestrator.welcome").await;
    register_agent(&mut agent, "A1", None, json!([])).await;

    send(
        &mut client,
        json!({
            "id": "create-1",
            "type": "client.agent.task.create.request",
            "content": {"agentName": "A1", "taskData": {}},
        }),
    )
    .await;
    let created = recv_until(&mut client, "task.created").await;
    let task_id = created["content"]["taskId"].as_str().unwrap().to_string();
    recv_until(&mut agent, "task.execute").await;

    // Agent accepts the task, then the transport closes.
    drop(agent);

    let error = recv_until(&mut client, "task.error").await;
    assert_eq!(error["content"]["taskId"], task_id.as_str());
    assert_eq!(error["content"]["error"], "Agent disconnected");

    hub.stop().await;
}

#[tokio::test]
async fn unknown_type_and_malformed_json_are_rejected() {
    let hub = start_hub().await;
    let mut agent = connect(hub.addr(PeerKind::Agent).unwrap()).await;
    recv_until(&mut agent, "orchestrator.welcome").await;

    send(&mut agent, json!({"id": "x1", "type": "bogus.type", "content": {}})).await;
    let error = recv_until(&mut agent, "error").await;
    assert_eq!(error["content"]["code"], "UnsupportedMessageType");
    assert_eq!(error["requestId"], "x1");

    agent
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    let error = recv_until(&mut agent, "error").await;
    assert_eq!(error["content"]["code"], "InvalidMessage");

    // The connection survives both rejections.
    send(&mut agent, json!({"id": "p", "type": "ping", "content": {}})).await;
    recv_until(&mut agent, "pong").await;

    hub.stop().await;
}

#[tokio::test]
async fn client_register_and_status_query() {
    let hub = start_hub().await;

    let mut client = connect(hub.addr(PeerKind::Client).unwrap()).await;
    let welcome = recv_until(&mut client, "orchestrator.client.welcome").await;
    let client_id = welcome["content"]["clientId"].as_str().unwrap().to_string();

    send(
        &mut client,
        json!({
            "id": "cr",
            "type": "client.register",
            "content": {"name": "dashboard", "metadata": {"ui": true}},
        }),
    )
    .await;
    let reply = recv_until(&mut client, "client.register.response").await;
    assert_eq!(reply["content"]["clientId"], client_id.as_str());
    assert_eq!(reply["content"]["name"], "dashboard");
    assert_eq!(reply["content"]["status"], "online");

    // Status query for an unknown task is a NotFound error.
    send(
        &mut client,
        json!({
            "id": "q1",
            "type": "client.agent.task.status.request",
            "content": {"taskId": "nope"},
        }),
    )
    .await;
    let error = recv_until(&mut client, "error").await;
    assert_eq!(error["content"]["code"], "NotFound");
    assert_eq!(error["requestId"], "q1");

    hub.stop().await;
}
