//! Coordinator tests: merged event stream, approval interleaving, and the
//! pause-aware budget, driven end to end against a scripted gateway and a
//! real tool server.
//!
//! The fake gateway behaves like a kernel: when submitted code "calls a
//! tool", the gateway POSTs the broker's own `/run` surface and blocks until
//! the approval decision resolves, exactly as in-kernel code blocked in a
//! synchronous tool call would.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

use codebroker::{BrokerConfig, CodeBroker, ExecuteOptions, ExecutionError, ExecutionEvent};

struct FakeGateway {
    /// Set by the test once the broker's tool server is listening.
    tool_server: Mutex<Option<std::net::SocketAddr>>,
    interrupt_notify: tokio::sync::Notify,
}

async fn create_kernel() -> Json<Value> {
    Json(json!({"id": uuid::Uuid::new_v4().simple().to_string()}))
}

async fn list_kernels() -> Json<Value> {
    Json(json!([]))
}

async fn delete_kernel(Path(_id): Path<String>) -> Json<Value> {
    Json(json!({}))
}

async fn interrupt_kernel(
    State(state): State<Arc<FakeGateway>>,
    Path(_id): Path<String>,
) -> Json<Value> {
    state.interrupt_notify.notify_one();
    Json(json!({}))
}

async fn channels(
    State(state): State<Arc<FakeGateway>>,
    Path(_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| drive_channel(socket, state))
}

fn frame(msg_type: &str, parent_id: &str, content: Value) -> Message {
    let value = json!({
        "header": {
            "msg_id": uuid::Uuid::new_v4().simple().to_string(),
            "msg_type": msg_type,
            "username": "",
            "session": "fake",
            "version": "5.0",
        },
        "parent_header": {"msg_id": parent_id},
        "content": content,
        "channel": "iopub",
        "metadata": {},
    });
    Message::Text(value.to_string().into())
}

fn stream_frame(parent_id: &str, text: &str) -> Message {
    frame("stream", parent_id, json!({"name": "stdout", "text": text}))
}

fn reply_ok(parent_id: &str) -> Message {
    frame("execute_reply", parent_id, json!({"status": "ok"}))
}

fn raise(parent_id: &str, ename: &str, evalue: &str) -> Vec<Message> {
    vec![
        frame(
            "error",
            parent_id,
            json!({"ename": ename, "evalue": evalue, "traceback": [format!("{ename}: {evalue}")]}),
        ),
        frame("execute_reply", parent_id, json!({"status": "error"})),
    ]
}

async fn drive_channel(mut socket: WebSocket, state: Arc<FakeGateway>) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        if request["header"]["msg_type"] != "execute_request" {
            continue;
        }
        let msg_id = request["header"]["msg_id"].as_str().unwrap().to_string();
        let code = request["content"]["code"].as_str().unwrap_or_default().to_string();

        for message in script(&state, &msg_id, &code).await {
            if socket.send(message).await.is_err() {
                return;
            }
        }
    }
}

async fn script(state: &FakeGateway, msg_id: &str, code: &str) -> Vec<Message> {
    if code.contains("print('Hello')") {
        vec![stream_frame(msg_id, "Hello\n"), reply_ok(msg_id)]
    } else if code.contains("SPIN") {
        state.interrupt_notify.notified().await;
        raise(msg_id, "KeyboardInterrupt", "")
    } else if code.contains("print(a)") {
        vec![stream_frame(msg_id, "5\n"), reply_ok(msg_id)]
    } else if code.contains("RUN_TOOL") {
        run_tool(state, msg_id).await
    } else {
        vec![reply_ok(msg_id)]
    }
}

/// Behave like kernel code calling `tool_2` through the tool server: print,
/// block in `/run` until the decision lands, then print the outcome.
async fn run_tool(state: &FakeGateway, msg_id: &str) -> Vec<Message> {
    let addr = state.tool_server.lock().expect("tool server address not set");

    let mut frames = vec![stream_frame(msg_id, "before tool call\n")];

    let envelope: Value = reqwest::Client::new()
        .post(format!("http://{addr}/run"))
        .json(&json!({
            "server_name": "test",
            "server_params": {"command": "codebroker-test-missing-provider-binary"},
            "tool": "tool_2",
            "arguments": {"s": "hello"},
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    match envelope["error"].as_str() {
        // Denials and channel faults surface in the kernel as the stub's
        // exception class.
        Some(error) if error.starts_with("Approval request") => {
            frames.extend(raise(msg_id, "ToolRunnerError", error));
        }
        // Any other outcome means the call passed the approval gate.
        _ => {
            frames.push(stream_frame(msg_id, "tool call passed approval\n"));
            frames.push(reply_ok(msg_id));
        }
    }
    frames
}

async fn start_fake_gateway() -> (std::net::SocketAddr, Arc<FakeGateway>) {
    let state = Arc::new(FakeGateway {
        tool_server: Mutex::new(None),
        interrupt_notify: tokio::sync::Notify::new(),
    });

    let app = Router::new()
        .route("/api/kernels", post(create_kernel).get(list_kernels))
        .route("/api/kernels/{id}", axum::routing::delete(delete_kernel))
        .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/api/kernels/{id}/channels", get(channels))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn start_broker_with(
    configure: impl FnOnce(&mut BrokerConfig),
) -> (CodeBroker, Arc<FakeGateway>) {
    let (gateway_addr, state) = start_fake_gateway().await;

    let mut config = BrokerConfig::default();
    config.spawn_gateway = false;
    config.gateway.host = gateway_addr.ip().to_string();
    config.gateway.port = gateway_addr.port();
    config.tool_server.port = 0;
    config.tool_server.approval_timeout = Some(5.0);
    config.kernel.images_dir = std::env::temp_dir().join("codebroker-test-images");
    config.kernel.connect_retries = 3;
    config.kernel.connect_retry_interval = 0.1;
    configure(&mut config);

    let broker = CodeBroker::start(config).await.unwrap();
    *state.tool_server.lock() = Some(broker.tool_server().addr());
    (broker, state)
}

async fn start_broker(approval_required: bool) -> (CodeBroker, Arc<FakeGateway>) {
    start_broker_with(|config| config.tool_server.approval_required = approval_required).await
}

#[tokio::test]
async fn test_hello_single_result_event() {
    let (broker, _state) = start_broker(false).await;

    let mut execution = broker.submit("print('Hello')").await;
    let mut events = Vec::new();
    while let Some(event) = execution.next_event().await.unwrap() {
        events.push(event);
    }

    assert_eq!(events.len(), 1);
    let ExecutionEvent::Result(result) = &events[0] else {
        panic!("expected a single result event");
    };
    assert_eq!(result.text.as_deref(), Some("Hello"));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_streaming_yields_chunks_then_result() {
    let (broker, _state) = start_broker(false).await;

    let mut execution = broker.execute("print('Hello')", ExecuteOptions::streaming()).await;

    let Some(ExecutionEvent::Chunk(chunk)) = execution.next_event().await.unwrap() else {
        panic!("expected chunk first");
    };
    assert_eq!(chunk, "Hello\n");

    let Some(ExecutionEvent::Result(result)) = execution.next_event().await.unwrap() else {
        panic!("expected terminal result");
    };
    assert_eq!(result.text.as_deref(), Some("Hello"));
    assert!(execution.next_event().await.unwrap().is_none());

    broker.shutdown().await;
}

#[tokio::test]
async fn test_approval_accepted_before_following_output() {
    let (broker, _state) = start_broker(true).await;

    let mut execution = broker.execute("RUN_TOOL", ExecuteOptions::streaming()).await;

    let mut seen = Vec::new();
    loop {
        match execution.next_event().await.unwrap() {
            Some(ExecutionEvent::Approval(request)) => {
                assert_eq!(request.server_name(), "test");
                assert_eq!(request.tool_name(), "tool_2");
                assert_eq!(request.tool_args()["s"], "hello");
                seen.push("approval".to_string());
                request.approve().await.unwrap();
            }
            Some(ExecutionEvent::Chunk(text)) => seen.push(format!("chunk:{}", text.trim_end())),
            Some(ExecutionEvent::Image(_)) => seen.push("image".to_string()),
            Some(ExecutionEvent::Result(_)) => {
                seen.push("result".to_string());
                break;
            }
            None => break,
        }
    }

    // The approval is observed before any output that follows the tool call.
    assert_eq!(
        seen,
        vec![
            "chunk:before tool call",
            "approval",
            "chunk:tool call passed approval",
            "result",
        ]
    );

    broker.shutdown().await;
}

#[tokio::test]
async fn test_approval_rejected_surfaces_tool_error() {
    let (broker, _state) = start_broker(true).await;

    let mut execution = broker.submit("RUN_TOOL").await;

    let outcome = loop {
        match execution.next_event().await {
            Ok(Some(ExecutionEvent::Approval(request))) => {
                request.reject().await.unwrap();
            }
            Ok(Some(_)) => {}
            Ok(None) => panic!("expected a terminal error"),
            Err(e) => break e,
        }
    };

    assert!(matches!(&outcome, ExecutionError::Tool(message) if message.contains("denied")));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_budget_pauses_during_approval() {
    let (broker, _state) = start_broker(true).await;

    // Budget far smaller than the decision delay.
    let mut execution = broker
        .execute(
            "RUN_TOOL",
            ExecuteOptions {
                timeout: Some(Duration::from_millis(300)),
                stream: false,
            },
        )
        .await;

    let result = loop {
        match execution.next_event().await.unwrap() {
            Some(ExecutionEvent::Approval(request)) => {
                // Sit on the decision well past the budget.
                tokio::time::sleep(Duration::from_millis(500)).await;
                request.approve().await.unwrap();
            }
            Some(ExecutionEvent::Result(result)) => break result,
            Some(_) => {}
            None => panic!("stream ended without result"),
        }
    };

    assert!(result.text.unwrap().contains("tool call passed approval"));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_budget_expiry_interrupts_and_kernel_survives() {
    let (broker, state) = start_broker(false).await;

    let mut execution = broker
        .execute(
            "a=0\nSPIN",
            ExecuteOptions {
                timeout: Some(Duration::from_millis(300)),
                stream: false,
            },
        )
        .await;

    let err = loop {
        match execution.next_event().await {
            Ok(Some(_)) => {}
            Ok(None) => panic!("expected timeout"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, ExecutionError::Timeout(_)));
    drop(execution);

    // The interrupt reached the gateway, and the kernel session still
    // answers with the state assigned before the interrupt.
    let mut follow_up = broker.submit("print(a)").await;
    let result = follow_up.result().await.unwrap();
    assert_eq!(result.text.as_deref(), Some("5"));

    broker.shutdown().await;
    let _ = state;
}

#[tokio::test]
async fn test_dropped_execution_with_pending_approval_frees_broker() {
    // No approval timeout: if the dropped handle did not free the kernel,
    // the worker would hold the serialization lock forever.
    let (broker, _state) = start_broker_with(|config| {
        config.tool_server.approval_required = true;
        config.tool_server.approval_timeout = None;
    })
    .await;

    let mut execution = broker.execute("RUN_TOOL", ExecuteOptions::streaming()).await;
    loop {
        match execution.next_event().await.unwrap() {
            Some(ExecutionEvent::Approval(_undecided)) => break,
            Some(_) => {}
            None => panic!("stream ended before the approval arrived"),
        }
    }

    // Walk away without deciding.
    drop(execution);

    // The broker is not wedged: the next execution gets the kernel.
    let mut follow_up = broker.submit("print('Hello')").await;
    let result = tokio::time::timeout(Duration::from_secs(10), follow_up.result())
        .await
        .expect("broker still serialized behind the dropped execution")
        .unwrap();
    assert_eq!(result.text.as_deref(), Some("Hello"));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_executions_serialize_fifo() {
    let (broker, _state) = start_broker(false).await;

    let mut first = broker.submit("print('Hello')").await;
    let mut second = broker.submit("print('Hello')").await;

    // Both complete despite sharing one kernel; order is submission order.
    let first_result = first.result().await.unwrap();
    let second_result = second.result().await.unwrap();
    assert_eq!(first_result.text.as_deref(), Some("Hello"));
    assert_eq!(second_result.text.as_deref(), Some("Hello"));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_reset_reconnects_kernel() {
    let (broker, _state) = start_broker(false).await;

    let mut before = broker.submit("x = 42").await;
    before.result().await.unwrap();

    broker.reset().await.unwrap();

    let mut after = broker.submit("print('Hello')").await;
    let result = after.result().await.unwrap();
    assert_eq!(result.text.as_deref(), Some("Hello"));

    broker.shutdown().await;
}

#[tokio::test]
async fn test_execute_code_renders_markdown() {
    let (broker, _state) = start_broker(false).await;

    let output = broker.execute_code("print('Hello')", None).await.unwrap();
    assert_eq!(output, "Hello");

    broker.shutdown().await;
}

/// Scenarios that need a real IPython kernel behind a Jupyter Kernel
/// Gateway (`pip install jupyter_kernel_gateway ipykernel`).
mod live_kernel {
    use super::*;

    async fn start_live_broker() -> CodeBroker {
        let mut config = BrokerConfig::ephemeral().unwrap();
        config.kernel.images_dir = std::env::temp_dir().join("codebroker-live-images");
        CodeBroker::start(config).await.unwrap()
    }

    #[tokio::test]
    #[ignore = "requires a local Jupyter Kernel Gateway install"]
    async fn test_state_persists_across_executions() {
        let broker = start_live_broker().await;

        broker.submit("x = 42").await.result().await.unwrap();
        let result = broker.submit("print(x)").await.result().await.unwrap();
        assert_eq!(result.text.as_deref(), Some("42"));

        broker.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "requires a local Jupyter Kernel Gateway install"]
    async fn test_reset_clears_kernel_state() {
        let broker = start_live_broker().await;

        broker.submit("x = 1").await.result().await.unwrap();
        broker.reset().await.unwrap();

        let err = broker.submit("print(x)").await.result().await.unwrap_err();
        assert!(
            matches!(&err, ExecutionError::Execution { name, .. } if name == "NameError"),
            "got {err}"
        );

        // Still executable after the failed lookup.
        let result = broker
            .submit("print('after reset')")
            .await
            .result()
            .await
            .unwrap();
        assert_eq!(result.text.as_deref(), Some("after reset"));

        broker.shutdown().await;
    }

    #[tokio::test]
    #[ignore = "requires a local Jupyter Kernel Gateway install"]
    async fn test_interrupted_loop_leaves_state() {
        let broker = start_live_broker().await;

        let mut execution = broker
            .execute(
                "a=0\nwhile True: a=5",
                ExecuteOptions {
                    timeout: Some(Duration::from_secs(1)),
                    stream: false,
                },
            )
            .await;
        let err = execution.result().await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout(_)));
        drop(execution);

        let result = broker.submit("print(a)").await.result().await.unwrap();
        assert_eq!(result.text.as_deref(), Some("5"));

        broker.shutdown().await;
    }
}

#[tokio::test]
async fn test_execution_error_propagates() {
    let (broker, state) = start_broker(false).await;

    // Unattended approval requests cannot happen here; instead exercise the
    // kernel-raised path through the scripted interrupt error.
    let mut execution = broker.submit("SPIN").await;
    state.interrupt_notify.notify_one();

    let err = execution.result().await.unwrap_err();
    assert!(
        matches!(&err, ExecutionError::Execution { name, .. } if name == "KeyboardInterrupt"),
        "got {err}"
    );

    broker.shutdown().await;
}
