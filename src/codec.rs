//! Framing and envelope encoding for post-handshake traffic.
//!
//! Every frame in either direction is `token (u64 LE) || length (u32 LE) ||
//! body`, where the body is UTF-8 JSON. Outgoing bodies are query arrays
//! (`[query_type, term, optargs]` for START, bare `[query_type]` for the
//! rest); incoming bodies are response envelopes. No I/O happens here.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ReqlDriverError, ReqlError, ReqlRuntimeError, Result, ServerError};
use crate::printer::Frame;
use crate::proto::{ErrorType, QueryType, ResponseNote, ResponseType};
use crate::term::Term;

/// Size of the token + length header.
pub const HEADER_LEN: usize = 12;

/// Wrap a serialized body in the wire framing.
pub fn encode_frame(token: u64, body: &[u8]) -> Vec<u8> {
  let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
  frame.extend_from_slice(&token.to_le_bytes());
  frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
  frame.extend_from_slice(body);
  frame
}

/// Split a response header into token and body length.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (u64, u32) {
  let token = u64::from_le_bytes(header[..8].try_into().unwrap());
  let length = u32::from_le_bytes(header[8..].try_into().unwrap());
  (token, length)
}

/// Body of a START envelope: `[1, term, optargs]`. The optarg object is
/// always present, even when empty.
pub fn start_body(term: &Term, optargs: &BTreeMap<String, Term>) -> Vec<u8> {
  let opts = Value::Object(
    optargs
      .iter()
      .map(|(k, v)| (k.clone(), v.build()))
      .collect(),
  );
  Value::Array(vec![
    Value::from(QueryType::Start as u8),
    term.build(),
    opts,
  ])
  .to_string()
  .into_bytes()
}

/// Body of a term-less envelope: CONTINUE, STOP, NOREPLY_WAIT, SERVER_INFO.
pub fn control_body(query_type: QueryType) -> Vec<u8> {
  Value::Array(vec![Value::from(query_type as u8)])
    .to_string()
    .into_bytes()
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
  t: u8,
  #[serde(default)]
  r: Vec<Value>,
  #[serde(default)]
  b: Option<Vec<Value>>,
  #[serde(default)]
  p: Option<Value>,
  #[serde(default)]
  e: Option<u32>,
  #[serde(default)]
  n: Option<Vec<u8>>,
}

/// A decoded response envelope.
#[derive(Debug)]
pub struct Response {
  pub token: u64,
  pub response_type: ResponseType,
  pub data: Vec<Value>,
  pub backtrace: Vec<Frame>,
  pub profile: Option<Value>,
  pub error_type: Option<u32>,
  pub notes: Vec<ResponseNote>,
}

impl Response {
  /// Parse a response body received for `token`.
  pub fn from_body(token: u64, body: &[u8]) -> Result<Self> {
    let envelope: ResponseEnvelope = serde_json::from_slice(body)?;
    let response_type = ResponseType::try_from(envelope.t)
      .map_err(|t| ReqlError::driver(format!("Unknown response type {t} received.")))?;

    let backtrace = envelope
      .b
      .unwrap_or_default()
      .iter()
      .filter_map(Frame::from_wire)
      .collect();

    let notes = envelope
      .n
      .unwrap_or_default()
      .into_iter()
      .filter_map(|n| ResponseNote::try_from(n).ok())
      .collect();

    Ok(Self {
      token,
      response_type,
      data: envelope.r,
      backtrace,
      profile: envelope.p,
      error_type: envelope.e,
      notes,
    })
  }

  /// Whether the sequence behind this response is a changefeed.
  pub fn is_feed(&self) -> bool {
    self.notes.iter().any(|n| n.is_feed())
  }

  /// Build the error a `*_ERROR` response stands for, attaching the
  /// originating term for caret diagnostics.
  pub fn make_error(&self, term: Option<Term>) -> ReqlError {
    let message = self
      .data
      .first()
      .and_then(Value::as_str)
      .unwrap_or("Unknown error")
      .to_string();
    let server_error = ServerError::new(message, term, self.backtrace.clone());

    match self.response_type {
      ResponseType::ClientError => {
        ReqlError::Driver(ReqlDriverError::ClientError(server_error))
      }
      ResponseType::CompileError => ReqlError::Compile(server_error),
      ResponseType::RuntimeError => {
        let kind = self.error_type.and_then(|e| ErrorType::try_from(e).ok());
        let runtime = match kind {
          Some(ErrorType::Internal) => ReqlRuntimeError::Internal(server_error),
          Some(ErrorType::ResourceLimit) => ReqlRuntimeError::ResourceLimit(server_error),
          Some(ErrorType::QueryLogic) => ReqlRuntimeError::QueryLogic(server_error),
          Some(ErrorType::NonExistence) => ReqlRuntimeError::NonExistence(server_error),
          Some(ErrorType::OpFailed) => ReqlRuntimeError::OpFailed(server_error),
          Some(ErrorType::OpIndeterminate) => ReqlRuntimeError::OpIndeterminate(server_error),
          Some(ErrorType::User) => ReqlRuntimeError::User(server_error),
          Some(ErrorType::PermissionError) => ReqlRuntimeError::Permission(server_error),
          None => ReqlRuntimeError::Other(server_error),
        };
        ReqlError::Runtime(runtime)
      }
      other => ReqlError::driver(format!(
        "Unexpected response type {other:?} treated as an error."
      )),
    }
  }
}
