//! The query AST.
//!
//! A [`Term`] is an immutable node in the query tree: a scalar literal, an
//! object literal, or an operator applied to positional and optional
//! arguments. Every builder method consumes its receiver and returns a new
//! term; nothing is mutated after construction.
//!
//! Terms serialize to the canonical JSON the server understands via
//! [`Term::build`]: scalars as JSON scalars, arrays as the `MAKE_ARRAY`
//! operator `[2, [...]]`, objects as plain JSON objects, and operators as
//! `[code, [args...]]` or `[code, [args...], {optargs...}]`.

use std::collections::BTreeMap;
use std::ops;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::connection::{Connection, RunResult};
use crate::error::{ReqlError, Result};
use crate::proto::TermType;
use crate::query::RunOptions;

/// One node of the query tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
  /// Scalar literal: null, boolean, number, or string.
  Datum(Value),
  /// Object literal. Serializes to a JSON object whose values are built
  /// terms; reserved `$reql_type$`-tagged objects ride through unchanged.
  Object(BTreeMap<String, Term>),
  /// Operator application.
  Op {
    op: TermType,
    args: Vec<Term>,
    optargs: BTreeMap<String, Term>,
  },
}

// Anonymous-function parameters get process-wide unique ids so nested
// closures never shadow each other on the wire.
static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);

fn next_var_id() -> u64 {
  NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)
}

impl Term {
  pub(crate) fn op(op: TermType, args: Vec<Term>) -> Self {
    Term::Op {
      op,
      args,
      optargs: BTreeMap::new(),
    }
  }

  pub(crate) fn op_with(op: TermType, args: Vec<Term>, optargs: BTreeMap<String, Term>) -> Self {
    Term::Op { op, args, optargs }
  }

  fn chain(self, op: TermType, rest: Vec<Term>) -> Self {
    let mut args = Vec::with_capacity(rest.len() + 1);
    args.push(self);
    args.extend(rest);
    Term::op(op, args)
  }

  /// Attach an optional argument to this operator term, returning the new
  /// term. Attaching to a literal is a no-op because literals carry no
  /// optional arguments on the wire.
  pub fn opt_arg(self, key: impl Into<String>, value: impl Into<Term>) -> Self {
    match self {
      Term::Op { op, args, mut optargs } => {
        optargs.insert(key.into(), value.into());
        Term::Op { op, args, optargs }
      }
      other => other,
    }
  }

  /// Serialize to the canonical wire JSON.
  pub fn build(&self) -> Value {
    match self {
      Term::Datum(v) => v.clone(),
      Term::Object(map) => Value::Object(
        map
          .iter()
          .map(|(k, v)| (k.clone(), v.build()))
          .collect(),
      ),
      Term::Op { op, args, optargs } => {
        let mut parts = vec![
          Value::from(*op as u32),
          Value::Array(args.iter().map(Term::build).collect()),
        ];
        if !optargs.is_empty() {
          parts.push(Value::Object(
            optargs
              .iter()
              .map(|(k, v)| (k.clone(), v.build()))
              .collect(),
          ));
        }
        Value::Array(parts)
      }
    }
  }

  /// Parse wire JSON back into a term. Inverse of [`Term::build`] for trees
  /// whose leaves are datums.
  pub fn from_wire(value: &Value) -> Result<Self> {
    match value {
      Value::Array(parts) => {
        let code = parts
          .first()
          .and_then(Value::as_u64)
          .ok_or_else(|| ReqlError::driver("Malformed term: missing operator code."))?;
        let op = TermType::try_from(code as u32)
          .map_err(|code| ReqlError::driver(format!("Unknown term code {code}.")))?;
        let args = match parts.get(1) {
          Some(Value::Array(args)) => args.iter().map(Term::from_wire).collect::<Result<_>>()?,
          Some(_) => return Err(ReqlError::driver("Malformed term: arguments must be an array.")),
          None => Vec::new(),
        };
        let optargs = match parts.get(2) {
          Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), Term::from_wire(v)?)))
            .collect::<Result<_>>()?,
          Some(_) => {
            return Err(ReqlError::driver(
              "Malformed term: optional arguments must be an object.",
            ))
          }
          None => BTreeMap::new(),
        };
        Ok(Term::op_with(op, args, optargs))
      }
      Value::Object(map) => Ok(Term::Object(
        map
          .iter()
          .map(|(k, v)| Ok((k.clone(), Term::from_wire(v)?)))
          .collect::<Result<_>>()?,
      )),
      scalar => Ok(Term::Datum(scalar.clone())),
    }
  }

  /// Whether `r.row` occurs anywhere in this tree.
  pub(crate) fn has_implicit_var(&self) -> bool {
    match self {
      Term::Datum(_) => false,
      Term::Object(map) => map.values().any(Term::has_implicit_var),
      Term::Op { op, args, optargs } => {
        *op == TermType::ImplicitVar
          || args.iter().any(Term::has_implicit_var)
          || optargs.values().any(Term::has_implicit_var)
      }
    }
  }

  /// Submit this term with default options.
  pub async fn run(&self, conn: &Connection) -> Result<Option<RunResult>> {
    conn.start(self.clone(), RunOptions::new()).await
  }

  /// Submit this term with explicit global options.
  pub async fn run_with_opts(
    &self,
    conn: &Connection,
    opts: RunOptions,
  ) -> Result<Option<RunResult>> {
    conn.start(self.clone(), opts).await
  }

  /// Submit through the connection registered with
  /// [`Connection::repl`](crate::Connection::repl).
  pub async fn run_repl(&self) -> Result<Option<RunResult>> {
    let conn = crate::connection::repl_connection()
      .ok_or_else(|| ReqlError::driver("run must be given a connection to run on."))?;
    self.run(&conn).await
  }
}

/// Build a one-argument anonymous function term.
pub fn func(body: impl FnOnce(Term) -> Term) -> Term {
  let id = next_var_id();
  let body = body(Term::op(TermType::Var, vec![Term::from(id)]));
  Term::op(
    TermType::Func,
    vec![Term::op(TermType::MakeArray, vec![Term::from(id)]), body],
  )
}

/// Build a two-argument anonymous function term.
pub fn func2(body: impl FnOnce(Term, Term) -> Term) -> Term {
  let (a, b) = (next_var_id(), next_var_id());
  let body = body(
    Term::op(TermType::Var, vec![Term::from(a)]),
    Term::op(TermType::Var, vec![Term::from(b)]),
  );
  Term::op(
    TermType::Func,
    vec![
      Term::op(TermType::MakeArray, vec![Term::from(a), Term::from(b)]),
      body,
    ],
  )
}

/// Wrap a term in a function when it mentions `r.row`, so the server can
/// bind the implicit variable.
pub(crate) fn func_wrap(term: Term) -> Term {
  if term.has_implicit_var() {
    let id = next_var_id();
    Term::op(
      TermType::Func,
      vec![Term::op(TermType::MakeArray, vec![Term::from(id)]), term],
    )
  } else {
    term
  }
}

macro_rules! chained {
  ($($(#[$doc:meta])* $name:ident => $op:ident ($($arg:ident),*) $(wrap: $wrap:ident)?;)*) => {
    impl Term {
      $(
        $(#[$doc])*
        pub fn $name(self $(, $arg: impl Into<Term>)*) -> Term {
          #[allow(unused_mut)]
          let mut rest: Vec<Term> = vec![$($arg.into()),*];
          $(
            if let Some(last) = rest.last_mut() {
              *last = $wrap(std::mem::replace(last, Term::Datum(Value::Null)));
            }
          )?
          self.chain(TermType::$op, rest)
        }
      )*
    }
  };
}

chained! {
  /// Equality comparison.
  eq => Eq(other);
  ne => Ne(other);
  lt => Lt(other);
  le => Le(other);
  gt => Gt(other);
  ge => Ge(other);
  /// Sum, concatenation, or date arithmetic depending on operand types.
  add => Add(other);
  sub => Sub(other);
  mul => Mul(other);
  div => Div(other);
  /// Remainder; the server calls this `mod`.
  rem => Mod(other);
  and => And(other);
  or => Or(other);
  not => Not();
  floor => Floor();
  ceil => Ceil();
  round => Round();

  /// Index into a sequence by position or into an object by key.
  bracket => Bracket(key);
  get_field => GetField(name);
  nth => Nth(index);
  has_fields => HasFields(field);
  with_fields => WithFields(field);
  keys => Keys();
  values => Values();
  default => Default(fallback);
  merge => Merge(other) wrap: func_wrap;

  append => Append(value);
  prepend => Prepend(value);
  difference => Difference(other);
  set_insert => SetInsert(value);
  set_union => SetUnion(other);
  set_intersection => SetIntersection(other);
  set_difference => SetDifference(other);
  insert_at => InsertAt(index, value);
  splice_at => SpliceAt(index, values);
  delete_at => DeleteAt(index);
  change_at => ChangeAt(index, value);

  /// Keep only the elements the predicate accepts. The predicate may be a
  /// function term, an `r.row` expression, or a match object.
  filter => Filter(predicate) wrap: func_wrap;
  map => Map(mapper) wrap: func_wrap;
  concat_map => ConcatMap(mapper) wrap: func_wrap;
  group => Group(key) wrap: func_wrap;
  ungroup => Ungroup();
  count => Count();
  is_empty => IsEmpty();
  offsets_of => OffsetsOf(needle) wrap: func_wrap;
  distinct => Distinct();
  contains => Contains(value) wrap: func_wrap;
  union => Union(other);
  inner_join => InnerJoin(other, predicate);
  outer_join => OuterJoin(other, predicate);
  eq_join => EqJoin(key, other);
  zip => Zip();
  skip => Skip(count);
  limit => Limit(count);
  sample => Sample(count);
  reduce => Reduce(reducer) wrap: func_wrap;
  fold => Fold(base, combinator) wrap: func_wrap;
  sum_by => Sum(field) wrap: func_wrap;
  avg_by => Avg(field) wrap: func_wrap;
  min_by => Min(field) wrap: func_wrap;
  max_by => Max(field) wrap: func_wrap;

  get => Get(key);
  between => Between(lower, upper);
  insert => Insert(document);
  update => Update(change) wrap: func_wrap;
  replace => Replace(replacement) wrap: func_wrap;
  table_create => TableCreate(name);
  table_drop => TableDrop(name);
  table_list => TableList();
  index_create => IndexCreate(name);
  index_drop => IndexDrop(name);
  index_list => IndexList();
  index_wait => IndexWait(name);
  index_status => IndexStatus(name);
  index_rename => IndexRename(from, to);
  sync => Sync();
  status => Status();
  config => Config();
  wait => Wait();
  grant => Grant(user, permissions);
  set_write_hook => SetWriteHook(hook) wrap: func_wrap;
  get_write_hook => GetWriteHook();

  for_each => ForEach(writer) wrap: func_wrap;
  coerce_to => CoerceTo(type_name);
  type_of => TypeOf();
  info => Info();

  match_ => Match(regex);
  split => Split();
  upcase => Upcase();
  downcase => Downcase();
  to_json => ToJsonString();

  to_iso8601 => ToIso8601();
  to_epoch_time => ToEpochTime();
  in_timezone => InTimezone(timezone);
  timezone => Timezone();
  during => During(start, end);
  date => Date();
  time_of_day => TimeOfDay();
  year => Year();
  month => Month();
  day => Day();
  day_of_week => DayOfWeek();
  day_of_year => DayOfYear();
  hours => Hours();
  minutes => Minutes();
  seconds => Seconds();
}

impl Term {
  /// Resolve a table inside this database term.
  pub fn table(self, name: impl Into<Term>) -> Term {
    self.chain(TermType::Table, vec![name.into()])
  }

  /// Look up several documents by key, usually with an `index` optarg.
  pub fn get_all(self, keys: Vec<Term>) -> Term {
    self.chain(TermType::GetAll, keys)
  }

  /// Project the named fields out of an object or sequence.
  pub fn pluck(self, fields: Vec<Term>) -> Term {
    self.chain(TermType::Pluck, fields)
  }

  /// The opposite of `pluck`: drop the named fields.
  pub fn without(self, fields: Vec<Term>) -> Term {
    self.chain(TermType::Without, fields)
  }

  /// Delete the selected documents.
  pub fn delete(self) -> Term {
    self.chain(TermType::Delete, vec![])
  }

  /// Sort by one or more keys; wrap keys in [`crate::r::asc`] or
  /// [`crate::r::desc`] to pick a direction.
  pub fn order_by(self, keys: Vec<Term>) -> Term {
    let keys = keys
      .into_iter()
      .map(|key| {
        let directed = matches!(
          &key,
          Term::Op { op: TermType::Asc, .. } | Term::Op { op: TermType::Desc, .. }
        );
        if directed {
          key
        } else {
          func_wrap(key)
        }
      })
      .collect();
    self.chain(TermType::OrderBy, keys)
  }

  /// Sum of the sequence's elements.
  pub fn sum(self) -> Term {
    self.chain(TermType::Sum, vec![])
  }

  /// Average of the sequence's elements.
  pub fn avg(self) -> Term {
    self.chain(TermType::Avg, vec![])
  }

  /// Smallest element of the sequence.
  pub fn min(self) -> Term {
    self.chain(TermType::Min, vec![])
  }

  /// Largest element of the sequence.
  pub fn max(self) -> Term {
    self.chain(TermType::Max, vec![])
  }

  /// Take a sub-sequence; bounds default to closed-left, open-right and can
  /// be adjusted with the `left_bound`/`right_bound` optargs.
  pub fn slice(self, start: impl Into<Term>, end: impl Into<Term>) -> Term {
    self.chain(TermType::Slice, vec![start.into(), end.into()])
  }

  /// Turn the query into a changefeed: an infinite stream of change events.
  pub fn changes(self) -> Term {
    self.chain(TermType::Changes, vec![])
  }

  /// Evaluate a function with this term (and any extra arguments) bound to
  /// its parameters. On the wire the function comes first.
  pub fn do_(self, mut args: Vec<Term>, body: Term) -> Term {
    let mut wire_args = vec![func_wrap(body), self];
    wire_args.append(&mut args);
    Term::op(TermType::Funcall, wire_args)
  }

  /// Conditional: `self.branch(then, else)`.
  pub fn branch(self, if_true: impl Into<Term>, if_false: impl Into<Term>) -> Term {
    self.chain(TermType::Branch, vec![if_true.into(), if_false.into()])
  }
}

impl<T: Into<Term>> ops::Add<T> for Term {
  type Output = Term;
  fn add(self, rhs: T) -> Term {
    Term::op(TermType::Add, vec![self, rhs.into()])
  }
}

impl<T: Into<Term>> ops::Sub<T> for Term {
  type Output = Term;
  fn sub(self, rhs: T) -> Term {
    Term::op(TermType::Sub, vec![self, rhs.into()])
  }
}

impl<T: Into<Term>> ops::Mul<T> for Term {
  type Output = Term;
  fn mul(self, rhs: T) -> Term {
    Term::op(TermType::Mul, vec![self, rhs.into()])
  }
}

impl<T: Into<Term>> ops::Div<T> for Term {
  type Output = Term;
  fn div(self, rhs: T) -> Term {
    Term::op(TermType::Div, vec![self, rhs.into()])
  }
}

impl<T: Into<Term>> ops::Rem<T> for Term {
  type Output = Term;
  fn rem(self, rhs: T) -> Term {
    Term::op(TermType::Mod, vec![self, rhs.into()])
  }
}

impl ops::Not for Term {
  type Output = Term;
  fn not(self) -> Term {
    Term::op(TermType::Not, vec![self])
  }
}

impl From<Value> for Term {
  fn from(value: Value) -> Self {
    match value {
      Value::Array(items) => Term::op(
        TermType::MakeArray,
        items.into_iter().map(Term::from).collect(),
      ),
      Value::Object(map) => Term::Object(
        map
          .into_iter()
          .map(|(k, v)| (k, Term::from(v)))
          .collect(),
      ),
      scalar => Term::Datum(scalar),
    }
  }
}

macro_rules! datum_from {
  ($($ty:ty),*) => {
    $(
      impl From<$ty> for Term {
        fn from(value: $ty) -> Self {
          Term::Datum(Value::from(value))
        }
      }
    )*
  };
}

datum_from!(bool, i32, i64, u32, u64, f32, f64, &str, String);

impl<T: Into<Term>> From<Vec<T>> for Term {
  fn from(items: Vec<T>) -> Self {
    Term::op(
      TermType::MakeArray,
      items.into_iter().map(Into::into).collect(),
    )
  }
}

impl From<BTreeMap<String, Term>> for Term {
  fn from(map: BTreeMap<String, Term>) -> Self {
    Term::Object(map)
  }
}
