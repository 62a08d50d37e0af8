//! ReQL Rust Client Driver
//!
//! A native TCP client for ReQL-speaking realtime document databases.
//! Queries are composed as immutable term trees, serialized to the JSON
//! wire protocol, and multiplexed over one authenticated socket; streaming
//! results arrive through demand-driven cursors.
//!
//! # Example
//!
//! ```no_run
//! use reql::{r, ConnectOptions, Connection, RunResult};
//!
//! #[tokio::main]
//! async fn main() -> reql::Result<()> {
//!     // Connect and authenticate (SCRAM-SHA-256)
//!     let conn = Connection::connect(ConnectOptions::new().db("app")).await?;
//!
//!     // Run a scalar query
//!     if let Some(RunResult::Atom(value)) = (r::expr(1) + 2).run(&conn).await? {
//!         println!("1 + 2 = {value:?}");
//!     }
//!
//!     // Stream a table
//!     if let Some(RunResult::Cursor(mut users)) = r::table("users")
//!         .filter(r::row().get_field("active").eq(true))
//!         .run(&conn)
//!         .await?
//!     {
//!         while let Some(user) = users.next().await? {
//!             println!("{user:?}");
//!         }
//!     }
//!
//!     // Subscribe to changes
//!     if let Some(RunResult::Cursor(mut changes)) =
//!         r::table("users").changes().run(&conn).await?
//!     {
//!         while let Some(change) = changes.next().await? {
//!             println!("Change: {change:?}");
//!         }
//!     }
//!
//!     conn.close(true).await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
mod connection;
mod cursor;
mod datum;
mod error;
mod handshake;
mod printer;
pub mod proto;
mod query;
mod term;

pub use connection::{ConnectOptions, Connection, RunResult, ServerInfo, TlsOptions};
pub use cursor::Cursor;
pub use datum::{Datum, Format, FormatOptions};
pub use error::{ReqlDriverError, ReqlError, ReqlRuntimeError, Result, ServerError};
pub use handshake::{Handshake, HandshakeState};
pub use printer::{Frame, QueryPrinter};
pub use query::{r, Durability, ReadMode, RunOptions};
pub use term::Term;
