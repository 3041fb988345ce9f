//! Wire messages for the control and worker protocols.
//!
//! Messages are prost-derived structs (no generated code; the structs are
//! the schema) carried inside the length-delimited framing of
//! [`crate::framing`]. The first payload byte is a message-kind
//! discriminant; the prost body follows. Unknown kinds are rejected so a
//! version skew between host and runner fails loudly instead of
//! misparsing.
//!
//! Two peers speak subsets of this protocol:
//!
//! - host ↔ runner (control socket): [`LoadBinary`], [`DeleteBinary`],
//!   [`CancelExecution`], [`Shutdown`], [`Ack`], [`SpawnFailed`],
//!   [`EntryUnhealthy`]
//! - host ↔ worker (per-worker rendezvous connection): [`ExecRequest`],
//!   [`ExecResponse`], [`CallbackRequest`], [`CallbackResponse`]

use std::collections::HashMap;

use prost::Message;

/// How a code entry's payload is turned into an executable worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum LoaderKind {
    /// A self-contained native binary speaking the worker protocol.
    NativeBinary = 0,
    /// JavaScript source run by the configured engine shim.
    Javascript = 1,
    /// JavaScript source with a wasm blob staged alongside it.
    JavascriptWithWasm = 2,
    /// A bare wasm module run by the engine shim.
    WasmOnly = 3,
}

/// Terminal status of one UDF invocation, carried on [`ExecResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum ExecStatus {
    /// Handler ran and returned output.
    Ok = 0,
    /// Handler ran and returned a structured error.
    HandlerError = 1,
    /// No handler registered under the requested name.
    HandlerNotFound = 2,
}

/// host → runner: stage a binary and bring up workers for a token.
#[derive(Clone, PartialEq, Message)]
pub struct LoadBinary {
    /// Correlates the [`Ack`].
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Token the new workers will present at rendezvous.
    #[prost(string, tag = "2")]
    pub code_token: String,
    /// Native binary bytes. Empty for alias loads and JS kinds.
    #[prost(bytes = "vec", tag = "3")]
    pub binary_content: Vec<u8>,
    /// Number of workers to clone.
    #[prost(uint32, tag = "4")]
    pub n_workers: u32,
    /// Redirect worker stdout/stderr to a per-execution log file.
    #[prost(bool, tag = "5")]
    pub enable_log_egress: bool,
    /// When non-empty, hard-link the named entry's staged payload instead
    /// of writing `binary_content`.
    #[prost(string, tag = "6")]
    pub source_code_token: String,
    /// Loader discriminant; see [`LoaderKind`].
    #[prost(enumeration = "LoaderKind", tag = "7")]
    pub loader_kind: i32,
    /// JavaScript source for the JS loader kinds.
    #[prost(bytes = "vec", tag = "8")]
    pub js_source: Vec<u8>,
    /// Wasm blob staged next to the source for
    /// [`LoaderKind::JavascriptWithWasm`] and [`LoaderKind::WasmOnly`].
    #[prost(bytes = "vec", tag = "9")]
    pub wasm_blob: Vec<u8>,
}

/// host → runner: tear down every worker for a token and drop its staged
/// payload.
#[derive(Clone, PartialEq, Message)]
pub struct DeleteBinary {
    /// Correlates the [`Ack`].
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Token to delete.
    #[prost(string, tag = "2")]
    pub code_token: String,
}

/// host → runner: kill the worker currently identified by an execution
/// token.
#[derive(Clone, PartialEq, Message)]
pub struct CancelExecution {
    /// Correlates the [`Ack`].
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// The serving worker's execution token.
    #[prost(string, tag = "2")]
    pub execution_token: String,
}

/// host → runner: drain and exit.
#[derive(Clone, PartialEq, Message)]
pub struct Shutdown {
    /// Correlates the [`Ack`].
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
}

/// runner → host: outcome of one control request.
#[derive(Clone, PartialEq, Message)]
pub struct Ack {
    /// Id of the control request this answers.
    #[prost(uint64, tag = "1")]
    pub request_id: u64,
    /// Whether the request was applied.
    #[prost(bool, tag = "2")]
    pub ok: bool,
    /// Failure detail when `ok` is false.
    #[prost(string, tag = "3")]
    pub message: String,
}

/// runner → host: one worker clone failed before reaching rendezvous.
#[derive(Clone, PartialEq, Message)]
pub struct SpawnFailed {
    /// Token the worker was being spawned for.
    #[prost(string, tag = "1")]
    pub code_token: String,
    /// Failure detail.
    #[prost(string, tag = "2")]
    pub message: String,
}

/// runner → host: startup respawns for a token exceeded the retry cap.
#[derive(Clone, PartialEq, Message)]
pub struct EntryUnhealthy {
    /// Token whose workers keep dying during startup.
    #[prost(string, tag = "1")]
    pub code_token: String,
}

/// host → worker: one UDF invocation.
#[derive(Clone, PartialEq, Message)]
pub struct ExecRequest {
    /// Request uuid; also stamped into `tags` for UDF visibility.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Name of the handler to invoke.
    #[prost(string, tag = "2")]
    pub handler_name: String,
    /// Positional inputs.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub inputs: Vec<Vec<u8>>,
    /// Request tags; see [`crate::tags`] for the recognised keys.
    #[prost(map = "string, string", tag = "4")]
    pub tags: HashMap<String, String>,
}

/// worker → host: the invocation's terminal record.
#[derive(Clone, PartialEq, Message)]
pub struct ExecResponse {
    /// Echoes [`ExecRequest::uuid`].
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Terminal status; see [`ExecStatus`].
    #[prost(enumeration = "ExecStatus", tag = "2")]
    pub status: i32,
    /// Handler output on success.
    #[prost(bytes = "vec", tag = "3")]
    pub output: Vec<u8>,
    /// Failure detail for non-`Ok` statuses.
    #[prost(string, tag = "4")]
    pub error_message: String,
    /// Named durations in nanoseconds measured inside the worker.
    #[prost(map = "string, uint64", tag = "5")]
    pub metrics: HashMap<String, u64>,
}

/// worker → host, mid-execution: invoke a registered host function.
#[derive(Clone, PartialEq, Message)]
pub struct CallbackRequest {
    /// The uuid of the request being served; keys the metadata sideband.
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Registered host function to invoke.
    #[prost(string, tag = "2")]
    pub function_name: String,
    /// Opaque argument payload, owned by the function contract.
    #[prost(bytes = "vec", tag = "3")]
    pub io_payload: Vec<u8>,
}

/// host → worker: the host function's reply.
#[derive(Clone, PartialEq, Message)]
pub struct CallbackResponse {
    /// Echoes [`CallbackRequest::uuid`].
    #[prost(string, tag = "1")]
    pub uuid: String,
    /// Opaque result payload.
    #[prost(bytes = "vec", tag = "2")]
    pub io_payload: Vec<u8>,
    /// Routing or handler errors, empty on success.
    #[prost(string, repeated, tag = "3")]
    pub errors: Vec<String>,
}

/// Envelope over every message the two protocols carry.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    LoadBinary(LoadBinary),
    DeleteBinary(DeleteBinary),
    CancelExecution(CancelExecution),
    Shutdown(Shutdown),
    Ack(Ack),
    SpawnFailed(SpawnFailed),
    EntryUnhealthy(EntryUnhealthy),
    ExecRequest(ExecRequest),
    ExecResponse(ExecResponse),
    CallbackRequest(CallbackRequest),
    CallbackResponse(CallbackResponse),
}

/// Decode failures for the envelope.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Zero-length payload: no kind byte.
    #[error("empty wire payload")]
    Empty,

    /// Kind byte not assigned in this protocol version.
    #[error("unknown message kind {0}")]
    UnknownKind(u8),

    /// Prost body failed to decode.
    #[error("malformed {kind} body: {source}")]
    Body {
        /// Human name of the kind that failed.
        kind: &'static str,
        /// Prost decode error.
        source: prost::DecodeError,
    },
}

mod kind {
    pub const LOAD_BINARY: u8 = 1;
    pub const DELETE_BINARY: u8 = 2;
    pub const CANCEL_EXECUTION: u8 = 3;
    pub const SHUTDOWN: u8 = 4;
    pub const ACK: u8 = 5;
    pub const SPAWN_FAILED: u8 = 6;
    pub const ENTRY_UNHEALTHY: u8 = 7;
    pub const EXEC_REQUEST: u8 = 16;
    pub const EXEC_RESPONSE: u8 = 17;
    pub const CALLBACK_REQUEST: u8 = 18;
    pub const CALLBACK_RESPONSE: u8 = 19;
}

impl WireMessage {
    /// Serialises the envelope: kind byte followed by the prost body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        fn put<M: Message>(kind: u8, msg: &M) -> Vec<u8> {
            let mut buf = Vec::with_capacity(1 + msg.encoded_len());
            buf.push(kind);
            buf.append(&mut msg.encode_to_vec());
            buf
        }
        match self {
            Self::LoadBinary(m) => put(kind::LOAD_BINARY, m),
            Self::DeleteBinary(m) => put(kind::DELETE_BINARY, m),
            Self::CancelExecution(m) => put(kind::CANCEL_EXECUTION, m),
            Self::Shutdown(m) => put(kind::SHUTDOWN, m),
            Self::Ack(m) => put(kind::ACK, m),
            Self::SpawnFailed(m) => put(kind::SPAWN_FAILED, m),
            Self::EntryUnhealthy(m) => put(kind::ENTRY_UNHEALTHY, m),
            Self::ExecRequest(m) => put(kind::EXEC_REQUEST, m),
            Self::ExecResponse(m) => put(kind::EXEC_RESPONSE, m),
            Self::CallbackRequest(m) => put(kind::CALLBACK_REQUEST, m),
            Self::CallbackResponse(m) => put(kind::CALLBACK_RESPONSE, m),
        }
    }

    /// Parses an envelope from one frame payload.
    ///
    /// # Errors
    ///
    /// Returns [`WireError`] on an empty payload, unknown kind byte, or a
    /// body that prost rejects.
    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        fn get<M: Message + Default>(
            kind: &'static str,
            body: &[u8],
        ) -> Result<M, WireError> {
            M::decode(body).map_err(|source| WireError::Body { kind, source })
        }
        let (&first, body) = payload.split_first().ok_or(WireError::Empty)?;
        match first {
            kind::LOAD_BINARY => Ok(Self::LoadBinary(get("LoadBinary", body)?)),
            kind::DELETE_BINARY => Ok(Self::DeleteBinary(get("DeleteBinary", body)?)),
            kind::CANCEL_EXECUTION => Ok(Self::CancelExecution(get("CancelExecution", body)?)),
            kind::SHUTDOWN => Ok(Self::Shutdown(get("Shutdown", body)?)),
            kind::ACK => Ok(Self::Ack(get("Ack", body)?)),
            kind::SPAWN_FAILED => Ok(Self::SpawnFailed(get("SpawnFailed", body)?)),
            kind::ENTRY_UNHEALTHY => Ok(Self::EntryUnhealthy(get("EntryUnhealthy", body)?)),
            kind::EXEC_REQUEST => Ok(Self::ExecRequest(get("ExecRequest", body)?)),
            kind::EXEC_RESPONSE => Ok(Self::ExecResponse(get("ExecResponse", body)?)),
            kind::CALLBACK_REQUEST => Ok(Self::CallbackRequest(get("CallbackRequest", body)?)),
            kind::CALLBACK_RESPONSE => Ok(Self::CallbackResponse(get("CallbackResponse", body)?)),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_binary_roundtrip() {
        let msg = WireMessage::LoadBinary(LoadBinary {
            request_id: 7,
            code_token: "t".repeat(36),
            binary_content: vec![1, 2, 3],
            n_workers: 2,
            enable_log_egress: true,
            source_code_token: String::new(),
            loader_kind: LoaderKind::NativeBinary as i32,
            js_source: Vec::new(),
            wasm_blob: Vec::new(),
        });
        let decoded = WireMessage::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn exec_request_roundtrip_with_tags() {
        let mut tags = HashMap::new();
        tags.insert("roma.request_uuid".to_owned(), "u".repeat(36));
        tags.insert("roma.min_log_level".to_owned(), "2".to_owned());
        let msg = WireMessage::ExecRequest(ExecRequest {
            uuid: "u".repeat(36),
            handler_name: "Sample".to_owned(),
            inputs: vec![b"Hello".to_vec()],
            tags,
        });
        assert_eq!(WireMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn exec_response_metrics_roundtrip() {
        let mut metrics = HashMap::new();
        metrics.insert("udf.duration_ns".to_owned(), 1_234_567u64);
        let msg = WireMessage::ExecResponse(ExecResponse {
            uuid: "u".repeat(36),
            status: ExecStatus::Ok as i32,
            output: b"out".to_vec(),
            error_message: String::new(),
            metrics,
        });
        assert_eq!(WireMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn empty_payload_rejected() {
        assert!(matches!(WireMessage::decode(&[]), Err(WireError::Empty)));
    }

    #[test]
    fn unknown_kind_rejected() {
        assert!(matches!(
            WireMessage::decode(&[0xEE, 0, 0]),
            Err(WireError::UnknownKind(0xEE))
        ));
    }

    #[test]
    fn malformed_body_rejected() {
        // Kind byte for Ack followed by an invalid varint field.
        let result = WireMessage::decode(&[5, 0x08]);
        assert!(matches!(result, Err(WireError::Body { kind: "Ack", .. })));
    }

    #[test]
    fn kind_bytes_are_distinct() {
        let kinds = [1u8, 2, 3, 4, 5, 6, 7, 16, 17, 18, 19];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
