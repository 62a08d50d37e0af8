//! Result values and pseudo-type decoding.
//!
//! The server returns plain JSON plus tagged objects (`$reql_type$`) for
//! times, binaries, and grouped aggregations. [`Datum`] is the decoded form
//! handed to callers; [`FormatOptions`] picks between native decoding and
//! the raw tagged objects per run.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;

use crate::error::{ReqlError, Result};
use crate::term::Term;

/// Whether a pseudo-type decodes to its native value or stays a raw tagged
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
  #[default]
  Native,
  Raw,
}

impl Format {
  pub(crate) fn as_str(self) -> &'static str {
    match self {
      Self::Native => "native",
      Self::Raw => "raw",
    }
  }
}

/// Per-run pseudo-type decoding choices.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
  pub time_format: Format,
  pub binary_format: Format,
  pub group_format: Format,
}

/// A decoded response value.
#[derive(Debug, Clone, PartialEq)]
pub enum Datum {
  Null,
  Bool(bool),
  Number(serde_json::Number),
  String(String),
  Array(Vec<Datum>),
  Object(BTreeMap<String, Datum>),
  /// A TIME pseudo-type with its original zone offset.
  Time(DateTime<FixedOffset>),
  /// A BINARY pseudo-type.
  Binary(Vec<u8>),
  /// A GROUPED_DATA pseudo-type: key/value pairs in server order.
  Grouped(Vec<(Datum, Datum)>),
}

impl Datum {
  /// Decode one wire value, converting pseudo-types per `opts`.
  pub fn from_wire(value: &Value, opts: &FormatOptions) -> Result<Self> {
    match value {
      Value::Null => Ok(Datum::Null),
      Value::Bool(b) => Ok(Datum::Bool(*b)),
      Value::Number(n) => Ok(Datum::Number(n.clone())),
      Value::String(s) => Ok(Datum::String(s.clone())),
      Value::Array(items) => Ok(Datum::Array(
        items
          .iter()
          .map(|v| Datum::from_wire(v, opts))
          .collect::<Result<_>>()?,
      )),
      Value::Object(map) => match map.get("$reql_type$").and_then(Value::as_str) {
        Some("TIME") if opts.time_format == Format::Native => convert_time(map),
        Some("BINARY") if opts.binary_format == Format::Native => convert_binary(map),
        Some("GROUPED_DATA") if opts.group_format == Format::Native => {
          convert_grouped(map, opts)
        }
        Some("TIME") | Some("BINARY") | Some("GROUPED_DATA") | Some("GEOMETRY") | None => {
          Ok(Datum::Object(
            map
              .iter()
              .map(|(k, v)| Ok((k.clone(), Datum::from_wire(v, opts)?)))
              .collect::<Result<_>>()?,
          ))
        }
        Some(other) => Err(ReqlError::driver(format!(
          "Unknown pseudo-type \"{other}\"."
        ))),
      },
    }
  }

  pub fn is_null(&self) -> bool {
    matches!(self, Datum::Null)
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Datum::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Datum::Number(n) => n.as_i64(),
      _ => None,
    }
  }

  pub fn as_f64(&self) -> Option<f64> {
    match self {
      Datum::Number(n) => n.as_f64(),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Datum::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&[Datum]> {
    match self {
      Datum::Array(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_object(&self) -> Option<&BTreeMap<String, Datum>> {
    match self {
      Datum::Object(map) => Some(map),
      _ => None,
    }
  }

  /// Field access on objects; `None` for anything else.
  pub fn get(&self, key: &str) -> Option<&Datum> {
    self.as_object().and_then(|map| map.get(key))
  }
}

fn convert_time(map: &serde_json::Map<String, Value>) -> Result<Datum> {
  let epoch = map
    .get("epoch_time")
    .and_then(Value::as_f64)
    .ok_or_else(|| {
      ReqlError::driver("Pseudo-type TIME object is missing the \"epoch_time\" field.")
    })?;

  let offset = match map.get("timezone") {
    Some(tz) => {
      let tz = tz.as_str().ok_or_else(|| {
        ReqlError::driver("Pseudo-type TIME object has a non-string \"timezone\" field.")
      })?;
      parse_offset(tz)?
    }
    None => FixedOffset::east_opt(0).unwrap(),
  };

  let secs = epoch.floor() as i64;
  let nanos = ((epoch - epoch.floor()) * 1e9).round() as u32;
  let nanos = nanos.min(999_999_999);
  let utc = DateTime::from_timestamp(secs, nanos)
    .ok_or_else(|| ReqlError::driver(format!("TIME value {epoch} is out of range.")))?;

  Ok(Datum::Time(utc.with_timezone(&offset)))
}

fn convert_binary(map: &serde_json::Map<String, Value>) -> Result<Datum> {
  let data = map.get("data").and_then(Value::as_str).ok_or_else(|| {
    ReqlError::driver("Pseudo-type BINARY object is missing the \"data\" field.")
  })?;

  let bytes = BASE64_STANDARD
    .decode(data)
    .map_err(|e| ReqlError::driver(format!("Invalid base64 in BINARY object: {e}.")))?;

  Ok(Datum::Binary(bytes))
}

fn convert_grouped(
  map: &serde_json::Map<String, Value>,
  opts: &FormatOptions,
) -> Result<Datum> {
  let data = map.get("data").and_then(Value::as_array).ok_or_else(|| {
    ReqlError::driver("Pseudo-type GROUPED_DATA object is missing the \"data\" field.")
  })?;

  let mut groups = Vec::with_capacity(data.len());
  for pair in data {
    let pair = pair.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
      ReqlError::driver("GROUPED_DATA entries must be [key, value] pairs.")
    })?;
    groups.push((
      Datum::from_wire(&pair[0], opts)?,
      Datum::from_wire(&pair[1], opts)?,
    ));
  }

  Ok(Datum::Grouped(groups))
}

/// Parse a `±HH:MM` zone offset.
fn parse_offset(tz: &str) -> Result<FixedOffset> {
  let bad = || ReqlError::driver(format!("Invalid timezone offset \"{tz}\"."));

  let bytes = tz.as_bytes();
  if bytes.len() != 6 || bytes[3] != b':' {
    return Err(bad());
  }
  let sign = match bytes[0] {
    b'+' => 1,
    b'-' => -1,
    _ => return Err(bad()),
  };
  let hours: i32 = tz[1..3].parse().map_err(|_| bad())?;
  let minutes: i32 = tz[4..6].parse().map_err(|_| bad())?;
  if hours > 23 || minutes > 59 {
    return Err(bad());
  }

  FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

/// Format a zone offset back to `±HH:MM`; UTC renders as `+00:00`.
pub(crate) fn format_offset(offset: &FixedOffset) -> String {
  let secs = offset.local_minus_utc();
  let sign = if secs < 0 { '-' } else { '+' };
  let secs = secs.abs();
  format!("{}{:02}:{:02}", sign, secs / 3600, (secs % 3600) / 60)
}

impl From<Datum> for Value {
  fn from(datum: Datum) -> Value {
    match datum {
      Datum::Null => Value::Null,
      Datum::Bool(b) => Value::Bool(b),
      Datum::Number(n) => Value::Number(n),
      Datum::String(s) => Value::String(s),
      Datum::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
      Datum::Object(map) => Value::Object(
        map
          .into_iter()
          .map(|(k, v)| (k, Value::from(v)))
          .collect(),
      ),
      Datum::Time(dt) => {
        let epoch = dt.timestamp() as f64 + f64::from(dt.timestamp_subsec_nanos()) / 1e9;
        serde_json::json!({
          "$reql_type$": "TIME",
          "epoch_time": epoch,
          "timezone": format_offset(dt.offset()),
        })
      }
      Datum::Binary(bytes) => serde_json::json!({
        "$reql_type$": "BINARY",
        "data": BASE64_STANDARD.encode(bytes),
      }),
      Datum::Grouped(groups) => {
        let data: Vec<Value> = groups
          .into_iter()
          .map(|(k, v)| Value::Array(vec![Value::from(k), Value::from(v)]))
          .collect();
        serde_json::json!({"$reql_type$": "GROUPED_DATA", "data": data})
      }
    }
  }
}

impl From<Datum> for Term {
  fn from(datum: Datum) -> Term {
    Term::from(Value::from(datum))
  }
}
