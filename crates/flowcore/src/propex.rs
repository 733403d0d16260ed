//! Property expressions: `payload`, `a.b[0]`, `a["key"]`, `lookup[msg.topic]`.
//!
//! A [`PropPath`] is parsed once at configuration time. Before it is used
//! against a concrete tree it is *bound*: nested `[msg.…]` segments are
//! resolved against the current message, producing a flat list of
//! [`PathKey`]s that the walk functions below operate on.

use crate::{Map, Msg, PropexError, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Name(String),
    Index(usize),
    /// `[msg.path]`: the key is the value found at `path` in the message
    Nested(PropPath),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PropPath {
    expr: String,
    segments: Vec<Segment>,
}

/// A concrete step of a bound path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKey {
    Name(String),
    Index(usize),
}

impl PathKey {
    fn as_index(&self) -> Option<usize> {
        match self {
            PathKey::Index(i) => Some(*i),
            PathKey::Name(n) => n.parse().ok(),
        }
    }

    fn is_index(&self) -> bool {
        matches!(self, PathKey::Index(_))
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathKey::Name(n) => f.write_str(n),
            PathKey::Index(i) => write!(f, "{i}"),
        }
    }
}

impl PropPath {
    pub fn parse(expr: &str) -> Result<Self, PropexError> {
        if expr.trim().is_empty() {
            return Err(PropexError::Empty);
        }
        let mut parser = Parser {
            expr,
            chars: expr.chars().collect(),
            pos: 0,
        };
        let segments = parser.parse_path()?;
        Ok(Self {
            expr: expr.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Resolve nested indices against `msg`. Returns `None` when a nested
    /// reference has no value or does not name a usable key.
    pub fn bind(&self, msg: Option<&Msg>) -> Option<Vec<PathKey>> {
        self.segments
            .iter()
            .map(|seg| match seg {
                Segment::Name(n) => Some(PathKey::Name(n.clone())),
                Segment::Index(i) => Some(PathKey::Index(*i)),
                Segment::Nested(inner) => match msg?.get_path(inner)? {
                    Value::String(s) => Some(PathKey::Name(s.clone())),
                    Value::Number(n) => index_from(*n).map(PathKey::Index),
                    _ => None,
                },
            })
            .collect()
    }
}

impl FromStr for PropPath {
    type Err = PropexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PropPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

struct Parser<'a> {
    expr: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: &'static str) -> PropexError {
        PropexError::BadSyntax {
            expr: self.expr.to_string(),
            offset: self.pos,
            reason,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(' ') | Some('\t')) {
            self.pos += 1;
        }
    }

    fn parse_path(&mut self) -> Result<Vec<Segment>, PropexError> {
        let mut segments = vec![self.parse_name()?];
        while let Some(c) = self.peek() {
            match c {
                '.' => {
                    self.pos += 1;
                    segments.push(self.parse_name()?);
                }
                '[' => {
                    self.pos += 1;
                    segments.push(self.parse_bracket()?);
                }
                _ => return Err(self.error("expected '.' or '['")),
            }
        }
        Ok(segments)
    }

    fn parse_name(&mut self) -> Result<Segment, PropexError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, '.' | '[' | ']') {
                break;
            }
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        let name = name.trim();
        if name.is_empty() {
            return Err(self.error("expected a property name"));
        }
        Ok(Segment::Name(name.to_string()))
    }

    fn parse_bracket(&mut self) -> Result<Segment, PropexError> {
        self.skip_whitespace();
        let seg = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let mut key = String::new();
                loop {
                    match self.peek() {
                        None => return Err(self.error("unterminated string index")),
                        Some('\\') => {
                            self.pos += 1;
                            if let Some(escaped) = self.peek() {
                                key.push(escaped);
                                self.pos += 1;
                            }
                        }
                        Some(c) if c == q => {
                            self.pos += 1;
                            break;
                        }
                        Some(c) => {
                            key.push(c);
                            self.pos += 1;
                        }
                    }
                }
                Segment::Name(key)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                let index = digits.parse().map_err(|_| self.error("index out of range"))?;
                Segment::Index(index)
            }
            Some(_) if self.remaining_starts_with("msg.") => {
                self.pos += 4;
                let start = self.pos;
                let mut depth = 0usize;
                while let Some(c) = self.peek() {
                    match c {
                        '[' => depth += 1,
                        ']' if depth == 0 => break,
                        ']' => depth -= 1,
                        _ => {}
                    }
                    self.pos += 1;
                }
                let inner: String = self.chars[start..self.pos].iter().collect();
                Segment::Nested(PropPath::parse(inner.trim())?)
            }
            _ => return Err(self.error("expected a number, a quoted key or a msg reference")),
        };
        self.skip_whitespace();
        if self.peek() != Some(']') {
            return Err(self.error("expected ']'"));
        }
        self.pos += 1;
        Ok(seg)
    }

    fn remaining_starts_with(&self, prefix: &str) -> bool {
        let rest = &self.chars[self.pos..];
        rest.len() >= prefix.len() && rest.iter().zip(prefix.chars()).all(|(a, b)| *a == b)
    }
}

/// Find the value at `keys` below `root`.
pub fn lookup<'a>(root: &'a Map, keys: &[PathKey]) -> Option<&'a Value> {
    let (first, rest) = keys.split_first()?;
    let mut cur = root.get(&first.to_string())?;
    for key in rest {
        cur = child(cur, key)?;
    }
    Some(cur)
}

fn child<'a>(value: &'a Value, key: &PathKey) -> Option<&'a Value> {
    match value {
        Value::Object(m) => m.get(&key.to_string()),
        Value::Array(a) => a.get(key.as_index()?),
        _ => None,
    }
}

fn child_mut<'a>(value: &'a mut Value, key: &PathKey) -> Option<&'a mut Value> {
    match value {
        Value::Object(m) => m.get_mut(&key.to_string()),
        Value::Array(a) => a.get_mut(key.as_index()?),
        _ => None,
    }
}

/// Write `value` at `keys`, creating missing or null intermediate
/// containers (arrays for numeric indices, objects otherwise). Fails when
/// the path runs through a scalar.
pub fn assign(root: &mut Map, keys: &[PathKey], value: Value) -> bool {
    let Some((first, rest)) = keys.split_first() else {
        return false;
    };
    let slot = root.entry(first.to_string()).or_insert(Value::Null);
    assign_in(slot, rest, value)
}

/// Largest index a path may name; anything above does not resolve.
const MAX_INDEX: f64 = u32::MAX as f64;

/// How far past the end of an array an assignment may reach. The gap is
/// padded with nulls.
const MAX_ARRAY_GAP: usize = 1024;

fn index_from(n: f64) -> Option<usize> {
    (n >= 0.0 && n <= MAX_INDEX && n.fract() == 0.0).then(|| n as usize)
}

fn assign_in(slot: &mut Value, keys: &[PathKey], value: Value) -> bool {
    let Some((key, rest)) = keys.split_first() else {
        *slot = value;
        return true;
    };
    if slot.is_null() {
        *slot = if key.is_index() {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }
    let child = match slot {
        Value::Object(m) => m.entry(key.to_string()).or_insert(Value::Null),
        Value::Array(a) => {
            let Some(i) = key.as_index() else {
                return false;
            };
            if i >= a.len() {
                if i - a.len() > MAX_ARRAY_GAP {
                    return false;
                }
                a.resize(i + 1, Value::Null);
            }
            &mut a[i]
        }
        _ => return false,
    };
    assign_in(child, rest, value)
}

/// Remove and return the value at `keys`.
pub fn remove(root: &mut Map, keys: &[PathKey]) -> Option<Value> {
    let (last, parents) = keys.split_last()?;
    let Some((first, middle)) = parents.split_first() else {
        return root.remove(&last.to_string());
    };
    let mut cur = root.get_mut(&first.to_string())?;
    for key in middle {
        cur = child_mut(cur, key)?;
    }
    match cur {
        Value::Object(m) => m.remove(&last.to_string()),
        Value::Array(a) => {
            let i = last.as_index()?;
            (i < a.len()).then(|| a.remove(i))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn keys(expr: &str) -> Vec<PathKey> {
        PropPath::parse(expr).unwrap().bind(None).unwrap()
    }

    #[test]
    fn parses_dotted_and_bracketed_paths() {
        let path = PropPath::parse("a.b[0]['c d'][\"e\"]").unwrap();
        assert_eq!(
            path.segments(),
            &[
                Segment::Name("a".into()),
                Segment::Name("b".into()),
                Segment::Index(0),
                Segment::Name("c d".into()),
                Segment::Name("e".into()),
            ]
        );
    }

    #[test]
    fn parses_nested_message_reference() {
        let path = PropPath::parse("payload[msg.topic]").unwrap();
        assert_eq!(path.segments()[0], Segment::Name("payload".into()));
        match &path.segments()[1] {
            Segment::Nested(inner) => assert_eq!(inner.as_str(), "topic"),
            other => panic!("unexpected segment {other:?}"),
        }
        let deep = PropPath::parse("a[msg.b[msg.c]].d").unwrap();
        assert_eq!(deep.segments().len(), 3);
    }

    #[test]
    fn rejects_malformed_paths() {
        assert_eq!(PropPath::parse("  "), Err(PropexError::Empty));
        assert!(PropPath::parse("a..b").is_err());
        assert!(PropPath::parse("a[").is_err());
        assert!(PropPath::parse("a[foo]").is_err());
        assert!(PropPath::parse("a['x'").is_err());
        assert!(PropPath::parse(".a").is_err());
    }

    #[test]
    fn binds_nested_index_against_message() {
        let msg = Msg::from_json(json!({"topic": "foo", "n": 2})).unwrap();
        let path = PropPath::parse("payload[msg.topic]").unwrap();
        assert_eq!(
            path.bind(Some(&msg)).unwrap(),
            vec![PathKey::Name("payload".into()), PathKey::Name("foo".into())]
        );
        let by_number = PropPath::parse("list[msg.n]").unwrap();
        assert_eq!(by_number.bind(Some(&msg)).unwrap()[1], PathKey::Index(2));
        let missing = PropPath::parse("payload[msg.nope]").unwrap();
        assert!(missing.bind(Some(&msg)).is_none());
        assert!(path.bind(None).is_none());
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let Value::Object(root) = Value::from(json!({"a": {"b": [10, {"c": true}]}})) else {
            unreachable!()
        };
        assert_eq!(lookup(&root, &keys("a.b[0]")), Some(&Value::Number(10.0)));
        assert_eq!(lookup(&root, &keys("a.b[1].c")), Some(&Value::Bool(true)));
        assert_eq!(lookup(&root, &keys("a.b.1.c")), Some(&Value::Bool(true)));
        assert_eq!(lookup(&root, &keys("a.x.c")), None);
        assert_eq!(lookup(&root, &keys("a.b[0].c")), None);
    }

    #[test]
    fn assign_creates_missing_containers() {
        let mut root = Map::new();
        assert!(assign(&mut root, &keys("foo.bar"), Value::from("x")));
        assert!(assign(&mut root, &keys("list[2]"), Value::from(1.0)));
        assert_eq!(
            serde_json::to_value(Value::Object(root)).unwrap(),
            json!({"foo": {"bar": "x"}, "list": [null, null, 1]})
        );
    }

    #[test]
    fn assign_refuses_to_walk_through_scalars() {
        let mut root = Map::new();
        root.insert("s".into(), Value::from("text"));
        assert!(!assign(&mut root, &keys("s.inner"), Value::Null));
        assert_eq!(root.get("s"), Some(&Value::from("text")));
    }

    #[test]
    fn huge_indices_do_not_grow_arrays() {
        let msg = Msg::from_json(json!({"big": 1e20, "neg": -1, "half": 1.5})).unwrap();
        for expr in ["list[msg.big]", "list[msg.neg]", "list[msg.half]"] {
            assert!(PropPath::parse(expr).unwrap().bind(Some(&msg)).is_none(), "{expr}");
        }

        let mut root = Map::new();
        assert!(!assign(&mut root, &keys("list[4000000000]"), Value::from(1.0)));
        assert!(!assign(&mut root, &keys("list[1025]"), Value::from(1.0)));
        assert_eq!(root.get("list").and_then(|l| l.len()), Some(0));
        assert!(assign(&mut root, &keys("list[1024]"), Value::from(1.0)));
        assert_eq!(root.get("list").and_then(|l| l.len()), Some(1025));
    }

    #[test]
    fn remove_returns_old_value() {
        let Value::Object(mut root) = Value::from(json!({"a": {"b": 1, "c": 2}})) else {
            unreachable!()
        };
        assert_eq!(remove(&mut root, &keys("a.b")), Some(Value::Number(1.0)));
        assert_eq!(remove(&mut root, &keys("a.b")), None);
        assert_eq!(remove(&mut root, &keys("a")).and_then(|v| v.len()), Some(1));
    }
}
