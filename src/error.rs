//! Error types for the ReQL client driver.
//!
//! Errors split along two axes: who caused them (driver vs server) and what
//! kind they are. Server errors carry the offending term and backtrace and
//! render with a caret-annotated pretty-print of the query.

use std::fmt;

use thiserror::Error;

use crate::printer::{Frame, QueryPrinter};
use crate::term::Term;

/// A server-reported error together with the term that produced it and the
/// backtrace frames blaming a sub-term.
#[derive(Debug, Clone)]
pub struct ServerError {
  pub message: String,
  pub term: Option<Term>,
  pub backtrace: Vec<Frame>,
}

impl ServerError {
  pub fn new(message: impl Into<String>, term: Option<Term>, backtrace: Vec<Frame>) -> Self {
    Self {
      message: message.into(),
      term,
      backtrace,
    }
  }

  /// Bare message, without a term to point at.
  pub fn bare(message: impl Into<String>) -> Self {
    Self::new(message, None, Vec::new())
  }
}

impl fmt::Display for ServerError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.term {
      Some(term) => {
        let printer = QueryPrinter::new(term, &self.backtrace);
        write!(
          f,
          "{} in:\n{}\n{}",
          self.message.trim_end_matches('.'),
          printer.query(),
          printer.carets()
        )
      }
      None => write!(f, "{}", self.message),
    }
  }
}

/// Errors raised for queries the server executed and rejected at runtime.
#[derive(Error, Debug, Clone)]
pub enum ReqlRuntimeError {
  #[error("{0}")]
  Internal(ServerError),
  #[error("{0}")]
  ResourceLimit(ServerError),
  #[error("{0}")]
  QueryLogic(ServerError),
  #[error("{0}")]
  NonExistence(ServerError),
  #[error("{0}")]
  OpFailed(ServerError),
  #[error("{0}")]
  OpIndeterminate(ServerError),
  #[error("{0}")]
  User(ServerError),
  #[error("{0}")]
  Permission(ServerError),
  /// Runtime error whose kind code the driver does not recognize.
  #[error("{0}")]
  Other(ServerError),
}

/// Errors originating in the driver rather than in query evaluation.
#[derive(Error, Debug)]
pub enum ReqlDriverError {
  /// Authentication failed: bad credentials, unsupported protocol version,
  /// or a server signature mismatch.
  #[error("{0}")]
  Auth(String),

  /// A wall-clock deadline elapsed during connect or handshake.
  #[error("{0}")]
  Timeout(String),

  /// The handshake state machine was driven past its final state.
  #[error("{0}")]
  InvalidHandshakeState(String),

  /// The server reported that the client sent a malformed query.
  #[error("{0}")]
  ClientError(ServerError),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("{0}")]
  Other(String),
}

impl ReqlDriverError {
  /// Auth failure with connection context attached.
  pub fn auth_at(message: impl fmt::Display, host: &str, port: u16) -> Self {
    Self::Auth(format!("Could not connect to {host}:{port}, {message}"))
  }

  /// Timeout with connection context attached.
  pub fn timeout_at(host: &str, port: u16) -> Self {
    Self::Timeout(format!(
      "Could not connect to {host}:{port}, Operation timed out."
    ))
  }
}

/// Top of the driver's error hierarchy.
#[derive(Error, Debug)]
pub enum ReqlError {
  /// The server could not compile the query.
  #[error("{0}")]
  Compile(ServerError),

  #[error(transparent)]
  Runtime(#[from] ReqlRuntimeError),

  #[error(transparent)]
  Driver(#[from] ReqlDriverError),

  /// The cursor was closed or re-polled after completion.
  #[error("Cursor is empty.")]
  CursorEmpty,
}

impl ReqlError {
  /// Shorthand for a plain driver error message.
  pub fn driver(message: impl Into<String>) -> Self {
    Self::Driver(ReqlDriverError::Other(message.into()))
  }

  /// The error every operation on a closed connection reports.
  pub fn connection_closed() -> Self {
    Self::driver("Connection is closed.")
  }
}

impl From<std::io::Error> for ReqlError {
  fn from(e: std::io::Error) -> Self {
    Self::Driver(ReqlDriverError::Io(e))
  }
}

impl From<serde_json::Error> for ReqlError {
  fn from(e: serde_json::Error) -> Self {
    Self::Driver(ReqlDriverError::Serialization(e))
  }
}

pub type Result<T> = std::result::Result<T, ReqlError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_bare_server_error_displays_message_only() {
    let err = ServerError::bare("Table `m` does not exist.");
    assert_eq!(err.to_string(), "Table `m` does not exist.");
  }

  #[test]
  fn test_connection_closed_message() {
    assert_eq!(
      ReqlError::connection_closed().to_string(),
      "Connection is closed."
    );
  }

  #[test]
  fn test_auth_error_carries_address_context() {
    let err = ReqlDriverError::auth_at("Wrong password", "localhost", 28015);
    assert_eq!(
      err.to_string(),
      "Could not connect to localhost:28015, Wrong password"
    );
  }
}
