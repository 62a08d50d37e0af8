//! Pretty-printing of query terms with caret-aligned backtraces.
//!
//! Given a term and the backtrace frames a server error blames, the printer
//! produces two character-aligned strings: a human-syntax rendering of the
//! query and a second line of carets marking exactly the blamed sub-term.

use crate::proto::TermType;
use crate::term::Term;

/// One backtrace step: a positional argument index or an optional-argument
/// name.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
  Pos(usize),
  Opt(String),
}

impl Frame {
  /// Parse a frame from its wire form (an integer or a string).
  pub fn from_wire(value: &serde_json::Value) -> Option<Frame> {
    if let Some(i) = value.as_u64() {
      Some(Frame::Pos(i as usize))
    } else {
      value.as_str().map(|s| Frame::Opt(s.to_string()))
    }
  }
}

/// A rendered query plus the caret line for its backtrace.
pub struct QueryPrinter {
  query: String,
  carets: String,
}

impl QueryPrinter {
  pub fn new(term: &Term, frames: &[Frame]) -> Self {
    let doc = render(term, Some(frames));
    Self {
      query: doc.text,
      carets: doc.mask.trim_end().to_string(),
    }
  }

  /// The pretty-printed query.
  pub fn query(&self) -> &str {
    &self.query
  }

  /// Carets aligned under the blamed sub-term.
  pub fn carets(&self) -> &str {
    &self.carets
  }
}

/// Text plus a same-length mask of spaces and carets.
struct Doc {
  text: String,
  mask: String,
}

impl Doc {
  fn lit(text: &str) -> Doc {
    Doc {
      text: text.to_string(),
      mask: text.chars().map(|_| ' ').collect(),
    }
  }

  fn caret_all(text: String) -> Doc {
    let mask = text.chars().map(|_| '^').collect();
    Doc { text, mask }
  }

  fn push(&mut self, other: Doc) {
    self.text.push_str(&other.text);
    self.mask.push_str(&other.mask);
  }

  fn push_lit(&mut self, text: &str) {
    self.push(Doc::lit(text));
  }

  fn empty() -> Doc {
    Doc {
      text: String::new(),
      mask: String::new(),
    }
  }
}

fn join(items: Vec<Doc>, separator: &str) -> Doc {
  let mut out = Doc::empty();
  for (i, item) in items.into_iter().enumerate() {
    if i > 0 {
      out.push_lit(separator);
    }
    out.push(item);
  }
  out
}

/// `blame` is `None` off the backtrace path, `Some([])` when this whole node
/// is blamed, and `Some([next, ...])` while descending.
fn render(term: &Term, blame: Option<&[Frame]>) -> Doc {
  if matches!(blame, Some([])) {
    return Doc::caret_all(render(term, None).text);
  }

  match term {
    Term::Datum(value) => Doc::lit(&value.to_string()),
    Term::Object(map) => {
      let mut doc = Doc::lit("{");
      let fields = map
        .iter()
        .map(|(key, value)| {
          let mut field = Doc::lit(&serde_json::Value::from(key.as_str()).to_string());
          field.push_lit(": ");
          field.push(render(value, blame_for_opt(blame, key)));
          field
        })
        .collect();
      doc.push(join(fields, ", "));
      doc.push_lit("}");
      doc
    }
    Term::Op { op, args, optargs } => {
      let arg = |i: usize| render(&args[i], blame_for_pos(blame, i));
      let rest_with_optargs = |from: usize| {
        let mut items: Vec<Doc> = (from..args.len()).map(arg).collect();
        for (key, value) in optargs {
          let mut item = Doc::lit(key);
          item.push_lit("=");
          item.push(render(value, blame_for_opt(blame, key)));
          items.push(item);
        }
        items
      };
      // Literal receivers read better wrapped in an explicit conversion.
      let receiver = |i: usize| {
        if needs_wrap(&args[i]) {
          let mut doc = Doc::lit("r.expr(");
          doc.push(arg(i));
          doc.push_lit(")");
          doc
        } else {
          arg(i)
        }
      };

      match op {
        TermType::MakeArray => {
          let mut doc = Doc::lit("[");
          doc.push(join((0..args.len()).map(arg).collect(), ", "));
          doc.push_lit("]");
          doc
        }
        TermType::Var => Doc::lit(&format!("var_{}", render(&args[0], None).text)),
        TermType::ImplicitVar => Doc::lit("r.row"),
        TermType::Func => {
          let params = match &args[0] {
            Term::Op { args: ids, .. } => ids
              .iter()
              .map(|id| Doc::lit(&format!("var_{}", render(id, None).text)))
              .collect(),
            _ => vec![],
          };
          let mut doc = Doc::lit("|");
          doc.push(join(params, ", "));
          doc.push_lit("| ");
          doc.push(arg(1));
          doc
        }
        TermType::Funcall => {
          if args.len() == 2 {
            let mut doc = receiver(1);
            doc.push_lit(".do_(");
            doc.push(arg(0));
            doc.push_lit(")");
            doc
          } else {
            let mut doc = Doc::lit("r.do_(");
            let mut items: Vec<Doc> = (1..args.len()).map(arg).collect();
            items.push(arg(0));
            doc.push(join(items, ", "));
            doc.push_lit(")");
            doc
          }
        }
        TermType::Bracket => {
          let mut doc = receiver(0);
          doc.push_lit("[");
          doc.push(arg(1));
          doc.push_lit("]");
          doc
        }
        TermType::Not => {
          let mut doc = Doc::lit("(!");
          doc.push(receiver(0));
          doc.push_lit(")");
          doc
        }
        _ => {
          if let Some(symbol) = infix_symbol(*op) {
            let mut doc = Doc::lit("(");
            let items = (0..args.len()).map(receiver).collect();
            doc.push(join(items, &format!(" {symbol} ")));
            doc.push_lit(")");
            return doc;
          }

          // Table-level ops read as `r.table(...)` at the root but chain as
          // methods off a database term.
          let dual_root = matches!(
            op,
            TermType::Table | TermType::TableCreate | TermType::TableDrop | TermType::TableList
          ) && !matches!(args.first(), Some(Term::Op { op: TermType::Db, .. }));
          if is_top_level(*op) || args.is_empty() || dual_root {
            let mut doc = Doc::lit(&format!("r.{}(", term_name(*op)));
            doc.push(join(rest_with_optargs(0), ", "));
            doc.push_lit(")");
            doc
          } else {
            let mut doc = receiver(0);
            doc.push_lit(&format!(".{}(", term_name(*op)));
            doc.push(join(rest_with_optargs(1), ", "));
            doc.push_lit(")");
            doc
          }
        }
      }
    }
  }
}

fn blame_for_pos<'a>(blame: Option<&'a [Frame]>, index: usize) -> Option<&'a [Frame]> {
  match blame {
    Some([Frame::Pos(i), rest @ ..]) if *i == index => Some(rest),
    _ => None,
  }
}

fn blame_for_opt<'a>(blame: Option<&'a [Frame]>, key: &str) -> Option<&'a [Frame]> {
  match blame {
    Some([Frame::Opt(name), rest @ ..]) if name.as_str() == key => Some(rest),
    _ => None,
  }
}

fn needs_wrap(term: &Term) -> bool {
  matches!(
    term,
    Term::Datum(_) | Term::Object(_) | Term::Op { op: TermType::MakeArray, .. }
  )
}

fn infix_symbol(op: TermType) -> Option<&'static str> {
  use TermType::*;
  Some(match op {
    Add => "+",
    Sub => "-",
    Mul => "*",
    Div => "/",
    Mod => "%",
    Eq => "==",
    Ne => "!=",
    Lt => "<",
    Le => "<=",
    Gt => ">",
    Ge => ">=",
    And => "&",
    Or => "|",
    _ => return None,
  })
}

fn is_top_level(op: TermType) -> bool {
  use TermType::*;
  matches!(
    op,
    Db | DbCreate
      | DbDrop
      | DbList
      | Error
      | Now
      | Time
      | EpochTime
      | Iso8601
      | Json
      | JavaScript
      | Http
      | Args
      | Literal
      | Object
      | Random
      | Uuid
      | Range
      | Minval
      | Maxval
      | Asc
      | Desc
      | Branch
  )
}

/// Builder-style name for an operator: `GetAll` renders as `get_all`.
/// Unknown combinations still produce a readable `r.<name>(...)` call.
fn term_name(op: TermType) -> String {
  if op == TermType::JavaScript {
    return "js".to_string();
  }
  let camel = format!("{op:?}");
  let mut name = String::with_capacity(camel.len() + 4);
  for (i, c) in camel.chars().enumerate() {
    if c.is_ascii_uppercase() {
      if i > 0 {
        name.push('_');
      }
      name.push(c.to_ascii_lowercase());
    } else {
      name.push(c);
    }
  }
  name
}
