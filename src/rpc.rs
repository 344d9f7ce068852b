//! Line-delimited JSON-RPC 2.0 transport over stdin/stdout.
//!
//! Requests are processed strictly serially: the engine is a cooperative
//! single writer, so each invocation runs to completion before the next line
//! is read. Replies go to stdout, one JSON object per line; logging goes to
//! stderr.

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::engine::Engine;
use crate::errors::EngineError;

#[derive(Debug, Deserialize)]
struct Request {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

fn wire_code(error: &EngineError) -> i64 {
    match error {
        EngineError::Validation { .. } => -32602,
        EngineError::NotFound(what) if what.starts_with("method") => -32601,
        EngineError::NotFound(_) => -32001,
        EngineError::Invariant(_) => -32002,
        _ => -32000,
    }
}

fn error_response(id: Value, code: i64, message: String, data: Option<Value>) -> Value {
    let mut error = json!({ "code": code, "message": message });
    if let Some(data) = data {
        error["data"] = data;
    }
    json!({ "jsonrpc": "2.0", "id": id, "error": error })
}

async fn handle_line(engine: &Arc<Engine>, line: &str) -> Value {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            return error_response(Value::Null, -32700, format!("Parse error: {e}"), None);
        }
    };

    let id = request.id.unwrap_or(Value::Null);
    let engine = Arc::clone(engine);
    let method = request.method.clone();
    let params = request.params;

    // Handlers may block on embedding or store I/O; run off the reactor.
    let outcome =
        tokio::task::spawn_blocking(move || engine.dispatch(&method, params)).await;

    match outcome {
        Ok(Ok(result)) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Ok(Err(engine_error)) => error_response(
            id,
            wire_code(&engine_error),
            engine_error.message(),
            Some(json!({ "kind": engine_error.code() })),
        ),
        Err(join_error) => error_response(
            id,
            -32000,
            format!("Handler panicked or was cancelled: {join_error}"),
            None,
        ),
    }
}

/// Serve requests from stdin until EOF.
pub async fn serve(engine: Arc<Engine>) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&engine, &line).await;
        let mut frame = serde_json::to_string(&response)?;
        frame.push('\n');
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("stdin closed, transport draining");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_maps_to_parse_error() {
        let request: std::result::Result<Request, _> = serde_json::from_str("{not json");
        assert!(request.is_err());
    }

    #[test]
    fn request_parses_without_id() {
        let request: Request =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"memory_status"}"#).unwrap();
        assert!(request.id.is_none());
        assert_eq!(request.method, "memory_status");
        assert!(request.params.is_null());
    }

    #[test]
    fn wire_codes_match_kinds() {
        assert_eq!(
            wire_code(&EngineError::validation("content", "too short")),
            -32602
        );
        assert_eq!(
            wire_code(&EngineError::NotFound("method 'x'".to_string())),
            -32601
        );
        assert_eq!(
            wire_code(&EngineError::NotFound("memory m-1".to_string())),
            -32001
        );
        assert_eq!(wire_code(&EngineError::Storage("disk".to_string())), -32000);
    }
}
