//! Local control-plane RPC (spec section 6): a JSON-RPC 2.0 server over a
//! Unix domain socket that lets an external harness process, in any
//! language, introspect and drive a running driver process without linking
//! against it.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Context;

#[derive(Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
}

#[derive(Serialize)]
struct RpcError {
    code: i32,
    message: String,
}

/// A Unix-socket JSON-RPC server. One request per line, one response per
/// line (newline-delimited JSON), matching the framing the retrieval pack's
/// other RPC-over-socket examples use.
pub struct RpcServer {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn start(socket_path: impl Into<String>) -> std::io::Result<Self> {
        let socket_path = socket_path.into();
        let _ = std::fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = Arc::clone(&shutdown);

        let handle = std::thread::Builder::new()
            .name("nvme-rpc".into())
            .spawn(move || {
                while !shutdown_thread.load(Ordering::Relaxed) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(e) = handle_connection(stream) {
                                log::warn!("rpc connection error: {e}");
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            std::thread::sleep(std::time::Duration::from_millis(20));
                        }
                        Err(e) => log::warn!("rpc accept error: {e}"),
                    }
                }
            })?;

        Ok(RpcServer { shutdown, handle: Some(handle) })
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle_connection(stream: UnixStream) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(req) => dispatch(req),
            Err(e) => RpcResponse {
                jsonrpc: "2.0",
                id: Value::Null,
                result: None,
                error: Some(RpcError { code: -32700, message: format!("parse error: {e}") }),
            },
        };
        let body = serde_json::to_string(&response).unwrap_or_default();
        writer.write_all(body.as_bytes())?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

fn dispatch(req: RpcRequest) -> RpcResponse {
    let result = match req.method.as_str() {
        "list_all_qpair" => Ok(list_all_qpair()),
        "srand" => srand_method(&req.params),
        "current_seed" => Ok(Value::from(Context::global().current_seed())),
        other => Err((-32601, format!("method not found: {other}"))),
    };
    match result {
        Ok(value) => RpcResponse { jsonrpc: "2.0", id: req.id, result: Some(value), error: None },
        Err((code, message)) => {
            RpcResponse { jsonrpc: "2.0", id: req.id, result: None, error: Some(RpcError { code, message }) }
        }
    }
}

/// Snapshot every registered queue pair across the whole process (spec
/// section 6, "the supervisor exposes one RPC method, `list_all_qpair`,
/// that any connected client can poll").
fn list_all_qpair() -> Value {
    let registry = Context::global().registry();
    let rows: Vec<Value> = registry
        .snapshot()
        .into_iter()
        .map(|(key, outstanding, completions, timeouts)| {
            serde_json::json!({
                "controller": key.controller,
                "qid": key.qid,
                "outstanding": outstanding,
                "completions_total": completions,
                "timeouts_total": timeouts,
            })
        })
        .collect();
    Value::Array(rows)
}

fn srand_method(params: &Value) -> Result<Value, (i32, String)> {
    let seed = params
        .get("seed")
        .and_then(Value::as_u64)
        .ok_or((-32602, "missing u64 'seed' param".to_string()))?;
    Context::global().srand(seed);
    Ok(Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_is_method_not_found() {
        let req = RpcRequest {
            jsonrpc: None,
            id: Value::from(1),
            method: "does_not_exist".into(),
            params: Value::Null,
        };
        let resp = dispatch(req);
        assert!(resp.result.is_none());
        assert_eq!(resp.error.unwrap().code, -32601);
    }

    #[test]
    fn srand_without_seed_param_is_invalid_params() {
        let req = RpcRequest {
            jsonrpc: None,
            id: Value::from(2),
            method: "srand".into(),
            params: serde_json::json!({}),
        };
        let resp = dispatch(req);
        assert_eq!(resp.error.unwrap().code, -32602);
    }
}
