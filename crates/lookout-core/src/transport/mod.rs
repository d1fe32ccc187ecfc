//! Line-delimited JSON-RPC over stdio.
//!
//! Each request runs on its own task so a long `lookout/ask` does not block
//! `lookout/cancel`; a single writer task serializes all outgoing frames.

use std::time::Duration;

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::LookoutError,
    executor::{ExecutorError, LookoutExecutor},
};

const PARSE_ERROR: i32 = -32700;
const METHOD_NOT_FOUND: i32 = -32601;
const INVALID_PARAMS: i32 = -32602;
const OPERATION_FAILED: i32 = -32000;
const REQUEST_CANCELLED: i32 = -32800;

const DEFAULT_SESSION: &str = "default";

pub async fn serve_stdio(executor: LookoutExecutor) -> Result<()> {
    serve(executor, BufReader::new(io::stdin()), io::stdout()).await
}

pub async fn serve<R, W>(executor: LookoutExecutor, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing, frames) = mpsc::unbounded_channel::<Outgoing>();
    let writer_task = tokio::spawn(write_frames(writer, frames));
    let mut in_flight = JoinSet::new();

    let mut buffer = String::new();
    loop {
        reap_finished(&mut in_flight);
        buffer.clear();
        let bytes = reader.read_line(&mut buffer).await?;
        if bytes == 0 {
            info!(target: "lookout_transport", "STDIO closed; shutting down");
            break;
        }
        let line = buffer.trim();
        if line.is_empty() {
            continue;
        }

        debug!(target: "lookout_transport", request = line);
        match serde_json::from_str::<RpcRequest>(line) {
            Ok(request) => {
                let executor = executor.clone();
                let outgoing = outgoing.clone();
                in_flight.spawn(async move {
                    if let Some(response) = handle_request(&executor, request, &outgoing).await {
                        let _ = outgoing.send(Outgoing::Response(response));
                    }
                });
            }
            Err(error) => {
                warn!(target: "lookout_transport", error = %error, "Failed to parse request");
                let _ = outgoing.send(Outgoing::Response(RpcResponse::error(
                    None,
                    PARSE_ERROR,
                    "Parse error",
                )));
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join_failure(joined);
    }
    drop(outgoing);
    writer_task.await??;
    Ok(())
}

/// Drops the bookkeeping of request tasks that already finished.
fn reap_finished(in_flight: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = in_flight.try_join_next() {
        log_join_failure(joined);
        reaped += 1;
    }
    reaped
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        warn!(target: "lookout_transport", error = %error, "request task failed");
    }
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Outgoing>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        let payload = serde_json::to_string(&frame)?;
        writer.write_all(payload.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outgoing {
    Response(RpcResponse),
    Notification(RpcNotification),
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Debug, Serialize)]
struct RpcNotification {
    jsonrpc: &'static str,
    method: &'static str,
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

impl RpcResponse {
    fn result(id: Option<Value>, value: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(value),
            error: None,
        }
    }

    fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    fn from_executor_error(id: Option<Value>, error: &ExecutorError) -> Self {
        let code = match error.lookout_error() {
            LookoutError::Cancelled => REQUEST_CANCELLED,
            LookoutError::Validation(_) => INVALID_PARAMS,
            LookoutError::Provider(_) | LookoutError::SearchService(_) => OPERATION_FAILED,
        };
        Self::error(id, code, error.lookout_error().to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DetectParams {
    text: String,
    #[serde(default)]
    snippets: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryParams {
    question: String,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AskParams {
    #[serde(default = "default_session")]
    session: String,
    text: String,
    #[serde(default)]
    snippets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    #[serde(default = "default_session")]
    session: String,
}

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T, String> {
    serde_json::from_value(params.unwrap_or_else(|| json!({}))).map_err(|err| err.to_string())
}

fn to_result<T: Serialize>(id: Value, value: &T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(value) => RpcResponse::result(Some(id), value),
        Err(error) => RpcResponse::error(Some(id), OPERATION_FAILED, error.to_string()),
    }
}

async fn handle_request(
    executor: &LookoutExecutor,
    request: RpcRequest,
    outgoing: &mpsc::UnboundedSender<Outgoing>,
) -> Option<RpcResponse> {
    let method = request.method.as_str();

    let Some(id) = request.id.clone() else {
        match method {
            "notifications/initialized" => {
                info!(target: "lookout_transport", "Client signaled initialized");
            }
            other => {
                debug!(
                    target: "lookout_transport",
                    method = other,
                    "Ignoring notification without handler"
                );
            }
        }
        return None;
    };

    macro_rules! params {
        ($ty:ty) => {
            match parse_params::<$ty>(request.params) {
                Ok(params) => params,
                Err(message) => {
                    return Some(RpcResponse::error(Some(id), INVALID_PARAMS, message));
                }
            }
        };
    }

    let response = match method {
        "initialize" => RpcResponse::result(
            Some(id),
            json!({
                "protocolVersion": "0.1.0",
                "serverInfo": {
                    "name": "lookout",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "trigger": executor.context().detector.trigger(),
            }),
        ),
        "lookout/detect" => {
            let params = params!(DetectParams);
            let command = executor.detect(&params.text, &params.snippets).await;
            to_result(id, &command)
        }
        "lookout/query" => {
            let params = params!(QueryParams);
            match executor
                .generate_query(
                    &params.question,
                    params.context.as_deref(),
                    params.timeout_ms.map(Duration::from_millis),
                    &CancellationToken::new(),
                )
                .await
            {
                Ok(query) => to_result(id, &query),
                Err(error) => RpcResponse::from_executor_error(Some(id), &error),
            }
        }
        "lookout/search" => {
            let body = request.params.unwrap_or(Value::Null);
            match executor.search(&body, &CancellationToken::new()).await {
                Ok(response) => to_result(id, &response),
                Err(error) => RpcResponse::from_executor_error(Some(id), &error),
            }
        }
        "lookout/ask" => {
            let params = params!(AskParams);
            let session = params.session.clone();
            let notifications = outgoing.clone();
            let result = executor
                .ask(&params.session, &params.text, &params.snippets, |state| {
                    let _ = notifications.send(Outgoing::Notification(RpcNotification {
                        jsonrpc: "2.0",
                        method: "lookout/stage",
                        params: json!({ "session": session, "state": state }),
                    }));
                })
                .await;
            match result {
                Ok(state) => to_result(id, &state),
                Err(error) => RpcResponse::from_executor_error(Some(id), &error),
            }
        }
        "lookout/retry" => {
            let params = params!(SessionParams);
            match executor.retry(&params.session).await {
                Ok(state) => to_result(id, &state),
                Err(error) => RpcResponse::from_executor_error(Some(id), &error),
            }
        }
        "lookout/cancel" => {
            let params = params!(SessionParams);
            let closed = executor.cancel(&params.session).await;
            RpcResponse::result(Some(id), json!({ "closed": closed }))
        }
        "lookout/state" => {
            let params = params!(SessionParams);
            to_result(id, &executor.session_state(&params.session))
        }
        "lookout/stats" => to_result(id, &executor.cache_stats()),
        "lookout/telemetry" => to_result(id, &executor.telemetry().await),
        _ => RpcResponse::error(
            Some(id),
            METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        ),
    };
    Some(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LookoutConfig, provider::UnconfiguredProvider, state::AppContext};
    use async_trait::async_trait;
    use lookout_client::{ClientError, InstantAnswer, SearchBackend};
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;

    struct Offline;

    #[async_trait]
    impl SearchBackend for Offline {
        async fn fetch(&self, _query: &str) -> Result<InstantAnswer, ClientError> {
            Err(ClientError::Http("offline".into()))
        }
    }

    async fn exchange(lines: &[&str]) -> Vec<Value> {
        let context = Arc::new(AppContext::new(
            LookoutConfig::default(),
            Arc::new(UnconfiguredProvider),
            Arc::new(Offline),
        ));
        let executor = LookoutExecutor::builder(context).build();

        let (client, server) = io::duplex(64 * 1024);
        let (server_read, server_write) = io::split(server);
        let (mut client_read, mut client_write) = io::split(client);

        let serving = tokio::spawn(serve(executor, BufReader::new(server_read), server_write));
        for line in lines {
            client_write.write_all(line.as_bytes()).await.expect("write");
            client_write.write_all(b"\n").await.expect("write");
        }
        client_write.shutdown().await.expect("shutdown");
        serving.await.expect("joins").expect("serves");

        let mut output = String::new();
        client_read.read_to_string(&mut output).await.expect("read");
        output
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid frame"))
            .collect()
    }

    fn response_for(frames: &[Value], id: i64) -> &Value {
        frames
            .iter()
            .find(|frame| frame["id"] == id)
            .expect("response present")
    }

    #[tokio::test]
    async fn answers_initialize_and_unknown_methods() {
        let frames = exchange(&[
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#,
            r#"{"jsonrpc":"2.0","id":2,"method":"lookout/nope"}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        ])
        .await;

        assert_eq!(frames.len(), 2);
        assert_eq!(response_for(&frames, 1)["result"]["trigger"], "@lookout");
        assert_eq!(response_for(&frames, 2)["error"]["code"], METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn reports_parse_errors() {
        let frames = exchange(&["{not json"]).await;
        assert_eq!(frames[0]["error"]["code"], PARSE_ERROR);
    }

    #[tokio::test]
    async fn detects_commands() {
        let frames = exchange(&[
            r#"{"jsonrpc":"2.0","id":7,"method":"lookout/detect","params":{"text":"@lookout tides","snippets":["moon"]}}"#,
            r#"{"jsonrpc":"2.0","id":8,"method":"lookout/detect","params":{}}"#,
        ])
        .await;
        let result = &response_for(&frames, 7)["result"];
        assert_eq!(result["isCommand"], true);
        assert_eq!(result["question"], "tides");
        assert_eq!(result["highlightedContext"], "moon");
        assert_eq!(response_for(&frames, 8)["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn search_validation_is_a_400_result() {
        let frames = exchange(&[
            r#"{"jsonrpc":"2.0","id":3,"method":"lookout/search","params":{"query":""}}"#,
        ])
        .await;
        let result = &response_for(&frames, 3)["result"];
        assert_eq!(result["status"], 400);
        assert_eq!(result["body"]["success"], false);
    }

    #[tokio::test]
    async fn ask_streams_stages_before_the_result() {
        let frames = exchange(&[
            r#"{"jsonrpc":"2.0","id":4,"method":"lookout/ask","params":{"text":"@lookout why is the sky blue"}}"#,
        ])
        .await;

        let last = frames.last().expect("frames");
        assert_eq!(last["id"], 4);
        assert_eq!(last["result"]["stage"], "error");
        assert_eq!(last["result"]["generated"]["usedFallback"], true);

        let stages: Vec<&Value> = frames
            .iter()
            .filter(|frame| frame["method"] == "lookout/stage")
            .map(|frame| &frame["params"]["state"]["stage"])
            .collect();
        assert_eq!(stages.last().copied(), Some(&json!("error")));
    }

    #[tokio::test]
    async fn ask_rejects_plain_chat() {
        let frames = exchange(&[
            r#"{"jsonrpc":"2.0","id":5,"method":"lookout/ask","params":{"text":"hello"}}"#,
        ])
        .await;
        assert_eq!(response_for(&frames, 5)["error"]["code"], INVALID_PARAMS);
    }

    #[tokio::test]
    async fn finished_request_tasks_are_reaped() {
        let mut in_flight = JoinSet::new();
        for _ in 0..3 {
            in_flight.spawn(async {});
        }
        let gate = CancellationToken::new();
        let pending = gate.clone();
        in_flight.spawn(async move { pending.cancelled().await });

        while in_flight.len() > 1 {
            tokio::task::yield_now().await;
            reap_finished(&mut in_flight);
        }
        assert_eq!(in_flight.len(), 1);

        gate.cancel();
        assert!(in_flight.join_next().await.expect("task").is_ok());
        assert_eq!(reap_finished(&mut in_flight), 0);
        assert!(in_flight.is_empty());
    }
}
