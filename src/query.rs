//! Root query constructors and per-run global options.
//!
//! The [`r`] module is the entry point for building queries:
//!
//! ```
//! use reql::r;
//!
//! let query = r::table("users").filter(r::row().get_field("age").gt(21)).limit(10);
//! ```

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::datum::Format;
use crate::proto::TermType;
use crate::term::Term;

/// Write durability requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
  Hard,
  Soft,
}

impl Durability {
  fn as_str(self) -> &'static str {
    match self {
      Self::Hard => "hard",
      Self::Soft => "soft",
    }
  }
}

/// Read consistency requested for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
  Single,
  Majority,
  Outdated,
}

impl ReadMode {
  fn as_str(self) -> &'static str {
    match self {
      Self::Single => "single",
      Self::Majority => "majority",
      Self::Outdated => "outdated",
    }
  }
}

/// Global options attached to a START envelope.
///
/// Every field is optional; unset fields are omitted from the wire so the
/// server applies its defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub(crate) db: Option<String>,
  pub(crate) use_outdated: Option<bool>,
  pub(crate) noreply: bool,
  pub(crate) time_format: Option<Format>,
  pub(crate) binary_format: Option<Format>,
  pub(crate) group_format: Option<Format>,
  pub(crate) profile: Option<bool>,
  pub(crate) durability: Option<Durability>,
  pub(crate) read_mode: Option<ReadMode>,
  pub(crate) array_limit: Option<u64>,
  pub(crate) min_batch_rows: Option<u64>,
  pub(crate) max_batch_rows: Option<u64>,
  pub(crate) max_batch_bytes: Option<u64>,
  pub(crate) max_batch_seconds: Option<f64>,
  pub(crate) first_batch_scaledown_factor: Option<u64>,
}

impl RunOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Default database for unqualified `table(...)` terms in this run.
  pub fn db(mut self, name: impl Into<String>) -> Self {
    self.db = Some(name.into());
    self
  }

  /// Deprecated alias for stale reads; prefer [`RunOptions::read_mode`].
  pub fn use_outdated(mut self, allow: bool) -> Self {
    self.use_outdated = Some(allow);
    self
  }

  /// Fire and forget: the server sends no response for this run.
  pub fn noreply(mut self, noreply: bool) -> Self {
    self.noreply = noreply;
    self
  }

  pub fn time_format(mut self, format: Format) -> Self {
    self.time_format = Some(format);
    self
  }

  pub fn binary_format(mut self, format: Format) -> Self {
    self.binary_format = Some(format);
    self
  }

  pub fn group_format(mut self, format: Format) -> Self {
    self.group_format = Some(format);
    self
  }

  /// Ask the server to attach evaluation profiling data to the response.
  pub fn profile(mut self, profile: bool) -> Self {
    self.profile = Some(profile);
    self
  }

  pub fn durability(mut self, durability: Durability) -> Self {
    self.durability = Some(durability);
    self
  }

  pub fn read_mode(mut self, mode: ReadMode) -> Self {
    self.read_mode = Some(mode);
    self
  }

  /// Maximum array length the server will return (server default 100000).
  pub fn array_limit(mut self, limit: u64) -> Self {
    self.array_limit = Some(limit);
    self
  }

  pub fn min_batch_rows(mut self, rows: u64) -> Self {
    self.min_batch_rows = Some(rows);
    self
  }

  pub fn max_batch_rows(mut self, rows: u64) -> Self {
    self.max_batch_rows = Some(rows);
    self
  }

  pub fn max_batch_bytes(mut self, bytes: u64) -> Self {
    self.max_batch_bytes = Some(bytes);
    self
  }

  pub fn max_batch_seconds(mut self, seconds: f64) -> Self {
    self.max_batch_seconds = Some(seconds);
    self
  }

  pub fn first_batch_scaledown_factor(mut self, factor: u64) -> Self {
    self.first_batch_scaledown_factor = Some(factor);
    self
  }

  /// Serialize to the optarg object of a START envelope. The connection's
  /// default database fills in when the run itself names none.
  pub(crate) fn to_optargs(&self, default_db: Option<&str>) -> BTreeMap<String, Term> {
    let mut optargs = BTreeMap::new();

    if let Some(db) = self.db.as_deref().or(default_db) {
      optargs.insert(
        "db".to_string(),
        Term::op(TermType::Db, vec![Term::from(db)]),
      );
    }
    if let Some(v) = self.use_outdated {
      optargs.insert("use_outdated".to_string(), Term::from(v));
    }
    if self.noreply {
      optargs.insert("noreply".to_string(), Term::from(true));
    }
    if let Some(f) = self.time_format {
      optargs.insert("time_format".to_string(), Term::from(f.as_str()));
    }
    if let Some(f) = self.binary_format {
      optargs.insert("binary_format".to_string(), Term::from(f.as_str()));
    }
    if let Some(f) = self.group_format {
      optargs.insert("group_format".to_string(), Term::from(f.as_str()));
    }
    if let Some(v) = self.profile {
      optargs.insert("profile".to_string(), Term::from(v));
    }
    if let Some(d) = self.durability {
      optargs.insert("durability".to_string(), Term::from(d.as_str()));
    }
    if let Some(m) = self.read_mode {
      optargs.insert("read_mode".to_string(), Term::from(m.as_str()));
    }
    if let Some(v) = self.array_limit {
      optargs.insert("array_limit".to_string(), Term::from(v));
    }
    if let Some(v) = self.min_batch_rows {
      optargs.insert("min_batch_rows".to_string(), Term::from(v));
    }
    if let Some(v) = self.max_batch_rows {
      optargs.insert("max_batch_rows".to_string(), Term::from(v));
    }
    if let Some(v) = self.max_batch_bytes {
      optargs.insert("max_batch_bytes".to_string(), Term::from(v));
    }
    if let Some(v) = self.max_batch_seconds {
      optargs.insert("max_batch_seconds".to_string(), Term::from(v));
    }
    if let Some(v) = self.first_batch_scaledown_factor {
      optargs.insert(
        "first_batch_scaledown_factor".to_string(),
        Term::from(v),
      );
    }

    optargs
  }

  /// How this run wants pseudo-types decoded.
  pub(crate) fn format_options(&self) -> crate::datum::FormatOptions {
    crate::datum::FormatOptions {
      time_format: self.time_format.unwrap_or(Format::Native),
      binary_format: self.binary_format.unwrap_or(Format::Native),
      group_format: self.group_format.unwrap_or(Format::Native),
    }
  }
}

/// Top-level query constructors.
pub mod r {
  use super::*;

  pub use crate::term::{func, func2};

  /// Convert a Rust value into a query term.
  pub fn expr(value: impl Into<Term>) -> Term {
    value.into()
  }

  /// Reference a database by name.
  pub fn db(name: impl Into<Term>) -> Term {
    Term::op(TermType::Db, vec![name.into()])
  }

  /// Reference a table in the connection's default database.
  pub fn table(name: impl Into<Term>) -> Term {
    Term::op(TermType::Table, vec![name.into()])
  }

  pub fn db_create(name: impl Into<Term>) -> Term {
    Term::op(TermType::DbCreate, vec![name.into()])
  }

  pub fn db_drop(name: impl Into<Term>) -> Term {
    Term::op(TermType::DbDrop, vec![name.into()])
  }

  pub fn db_list() -> Term {
    Term::op(TermType::DbList, vec![])
  }

  pub fn table_create(name: impl Into<Term>) -> Term {
    Term::op(TermType::TableCreate, vec![name.into()])
  }

  pub fn table_drop(name: impl Into<Term>) -> Term {
    Term::op(TermType::TableDrop, vec![name.into()])
  }

  pub fn table_list() -> Term {
    Term::op(TermType::TableList, vec![])
  }

  /// The implicit row variable bound by the innermost function.
  pub fn row() -> Term {
    Term::op(TermType::ImplicitVar, vec![])
  }

  /// Conditional: evaluates `if_true` or `if_false` depending on `test`.
  pub fn branch(
    test: impl Into<Term>,
    if_true: impl Into<Term>,
    if_false: impl Into<Term>,
  ) -> Term {
    Term::op(
      TermType::Branch,
      vec![test.into(), if_true.into(), if_false.into()],
    )
  }

  /// Raise a runtime error on the server.
  pub fn error(message: impl Into<Term>) -> Term {
    Term::op(TermType::Error, vec![message.into()])
  }

  /// Evaluate a function over explicit arguments. On the wire the function
  /// comes first, then the arguments it binds.
  pub fn do_(mut args: Vec<Term>, body: Term) -> Term {
    let mut wire_args = vec![crate::term::func_wrap(body)];
    wire_args.append(&mut args);
    Term::op(TermType::Funcall, wire_args)
  }

  /// Current server time.
  pub fn now() -> Term {
    Term::op(TermType::Now, vec![])
  }

  /// Construct a time from parts: year, month, day, optionally hour,
  /// minute, second, and finally a timezone string.
  pub fn time(parts: Vec<Term>) -> Term {
    Term::op(TermType::Time, parts)
  }

  /// Construct a time from seconds since the Unix epoch.
  pub fn epoch_time(seconds: impl Into<Term>) -> Term {
    Term::op(TermType::EpochTime, vec![seconds.into()])
  }

  /// Parse an ISO 8601 timestamp into a time.
  pub fn iso8601(timestamp: impl Into<Term>) -> Term {
    Term::op(TermType::Iso8601, vec![timestamp.into()])
  }

  /// Embed raw bytes; encoded as a BINARY pseudo-type literal.
  pub fn binary(data: &[u8]) -> Term {
    let mut obj = BTreeMap::new();
    obj.insert(
      "$reql_type$".to_string(),
      Term::Datum(Value::from("BINARY")),
    );
    obj.insert(
      "data".to_string(),
      Term::Datum(Value::from(BASE64_STANDARD.encode(data))),
    );
    Term::Object(obj)
  }

  /// Parse a JSON string server-side.
  pub fn json(source: impl Into<Term>) -> Term {
    Term::op(TermType::Json, vec![source.into()])
  }

  /// Evaluate a JavaScript expression server-side.
  pub fn js(code: impl Into<Term>) -> Term {
    Term::op(TermType::JavaScript, vec![code.into()])
  }

  /// Retrieve data from an HTTP endpoint server-side.
  pub fn http(url: impl Into<Term>) -> Term {
    Term::op(TermType::Http, vec![url.into()])
  }

  /// Splice an array of arguments into the enclosing term's argument list.
  pub fn args(values: impl Into<Term>) -> Term {
    Term::op(TermType::Args, vec![values.into()])
  }

  /// Replace instead of merge during an update.
  pub fn literal(value: impl Into<Term>) -> Term {
    Term::op(TermType::Literal, vec![value.into()])
  }

  /// Build an object from alternating key/value arguments.
  pub fn object(pairs: Vec<Term>) -> Term {
    Term::op(TermType::Object, pairs)
  }

  pub fn random() -> Term {
    Term::op(TermType::Random, vec![])
  }

  pub fn uuid() -> Term {
    Term::op(TermType::Uuid, vec![])
  }

  /// Stream of integers in `[start, end)`.
  pub fn range(start: impl Into<Term>, end: impl Into<Term>) -> Term {
    Term::op(TermType::Range, vec![start.into(), end.into()])
  }

  /// Smallest possible key, for open-ended `between` bounds.
  pub fn minval() -> Term {
    Term::op(TermType::Minval, vec![])
  }

  /// Largest possible key, for open-ended `between` bounds.
  pub fn maxval() -> Term {
    Term::op(TermType::Maxval, vec![])
  }

  /// Ascending sort key for `order_by`.
  pub fn asc(key: impl Into<Term>) -> Term {
    Term::op(TermType::Asc, vec![crate::term::func_wrap(key.into())])
  }

  /// Descending sort key for `order_by`.
  pub fn desc(key: impl Into<Term>) -> Term {
    Term::op(TermType::Desc, vec![crate::term::func_wrap(key.into())])
  }
}
