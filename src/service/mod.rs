//! NDJSON front end for the revive runtime.
//!
//! This module plays the transport adapter: it reads newline-delimited JSON
//! requests, hands message bodies to [`Runtime::handle_body`], and writes one
//! response line per request carrying the status code and the batch the
//! invocation produced. Requests are processed sequentially, which is what
//! gives the runtime its one-invocation-at-a-time guarantee.
//!
//! A connection must open with a successful `handshake`. Until then `invoke`
//! and `connect` answer with a `protocol_error` and never reach the runtime.
//! `status` is always available and reports whether the handshake happened.
//!
//! ```text
//! {"id":1,"command":"handshake","params":{"client":"cli","protocol_version":"1.0.0"}}
//! {"id":2,"command":"invoke","params":{"workerID":"W1","counter":1,"op":"spawn","payload":{"reset":true}}}
//! {"id":3,"command":"connect"}
//! {"id":4,"command":"status"}
//! ```

use crate::PROTOCOL_VERSION;
use crate::runtime::Runtime;
use crate::runtime::engine::EngineFactory;
use crate::runtime::storage::SnapshotStore;
use crate::runtime::transport::CollectingTransport;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Service entry point: wraps a [`Runtime`] and answers NDJSON requests.
pub struct Service<S, F> {
    runtime: Runtime<S, F>,
    handshake_completed: bool,
}

impl<S: SnapshotStore, F: EngineFactory> Service<S, F> {
    /// Create a new service around the provided runtime.
    pub fn new(runtime: Runtime<S, F>) -> Self {
        Self {
            runtime,
            handshake_completed: false,
        }
    }

    /// The wrapped runtime.
    pub fn runtime(&self) -> &Runtime<S, F> {
        &self.runtime
    }

    /// Consume requests from `reader` until EOF, writing responses to `writer`.
    pub async fn handle<R, W>(&mut self, reader: R, mut writer: W) -> io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<RequestEnvelope>(&line) {
                Ok(request) => self.handle_request(request).await,
                Err(err) => {
                    ResponseEnvelope::from_error(Value::Null, ServiceError::Parse(err.to_string()))
                }
            };

            let mut encoded = serde_json::to_vec(&response)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }

        Ok(())
    }

    async fn handle_request(&mut self, request: RequestEnvelope) -> ResponseEnvelope {
        debug!(command = %request.command, "service request");
        match self.dispatch(&request.command, request.params).await {
            Ok(value) => ResponseEnvelope::success(request.id, value),
            Err(err) => ResponseEnvelope::from_error(request.id, err),
        }
    }

    async fn dispatch(&mut self, command: &str, params: Value) -> Result<Value, ServiceError> {
        match command {
            "handshake" => self.cmd_handshake(&params),
            "invoke" => self.cmd_invoke(params).await,
            "connect" => self.cmd_connect().await,
            "status" => Ok(self.cmd_status()),
            other => Err(ServiceError::Unsupported(other.to_string())),
        }
    }

    fn cmd_handshake(&mut self, params: &Value) -> Result<Value, ServiceError> {
        let client = params
            .get("client")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::invalid_param("client"))?;

        let requested = params
            .get("protocol_version")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceError::invalid_param("protocol_version"))?;

        if requested != PROTOCOL_VERSION {
            return Err(ServiceError::Protocol(format!(
                "unsupported protocol version: expected {}, got {}",
                PROTOCOL_VERSION, requested
            )));
        }

        self.handshake_completed = true;

        Ok(json!({
            "protocol_version": PROTOCOL_VERSION,
            "runtime": {
                "version": crate::VERSION,
                "client": client,
                "features": ["invoke", "connect", "status"]
            }
        }))
    }

    fn ensure_handshake(&self) -> Result<(), ServiceError> {
        if self.handshake_completed {
            Ok(())
        } else {
            Err(ServiceError::Protocol(
                "handshake required before issuing commands".into(),
            ))
        }
    }

    async fn cmd_invoke(&mut self, params: Value) -> Result<Value, ServiceError> {
        self.ensure_handshake()?;
        let body = match &params {
            Value::String(body) => body.clone(),
            Value::Object(_) => params.to_string(),
            _ => return Err(ServiceError::invalid_param("message")),
        };

        let transport = CollectingTransport::new();
        let status = self.runtime.handle_body(Some(&body), &transport).await;
        let batch = transport.take().pop();

        Ok(json!({
            "status": status.as_u16(),
            "batch": batch,
        }))
    }

    async fn cmd_connect(&mut self) -> Result<Value, ServiceError> {
        self.ensure_handshake()?;
        let transport = CollectingTransport::new();
        let status = self.runtime.handle_body(None, &transport).await;
        Ok(json!({ "status": status.as_u16() }))
    }

    fn cmd_status(&self) -> Value {
        let session = self.runtime.session().map(|session| {
            json!({
                "workerID": session.worker_id(),
                "counter": session.counter(),
                "options": session.options(),
            })
        });

        json!({
            "version": crate::VERSION,
            "handshake": self.handshake_completed,
            "session": session,
        })
    }
}

#[derive(Debug)]
enum ServiceError {
    Parse(String),
    InvalidParams(String),
    Unsupported(String),
    Protocol(String),
}

impl ServiceError {
    fn invalid_param(name: &str) -> Self {
        ServiceError::InvalidParams(format!("missing or invalid parameter: {}", name))
    }
}

#[derive(Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    id: Value,
    command: String,
    #[serde(default)]
    params: Value,
}

#[derive(Serialize)]
struct ResponseEnvelope {
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorEnvelope>,
}

impl ResponseEnvelope {
    fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn from_error(id: Value, error: ServiceError) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorEnvelope::from(error)),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    code: String,
    message: String,
}

impl From<ServiceError> for ErrorEnvelope {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::Parse(message) => ErrorEnvelope {
                code: "parse_error".into(),
                message,
            },
            ServiceError::InvalidParams(message) => ErrorEnvelope {
                code: "invalid_params".into(),
                message,
            },
            ServiceError::Unsupported(command) => ErrorEnvelope {
                code: "unsupported_command".into(),
                message: format!("Command '{command}' is not supported"),
            },
            ServiceError::Protocol(message) => ErrorEnvelope {
                code: "protocol_error".into(),
                message,
            },
        }
    }
}
