//! Symbolic path navigation over the session object graph.
//!
//! Paths are `.`-separated segments evaluated against a root value. The
//! resolver dispatches per carrier shape (record, sequence) and stays
//! VM-agnostic: method segments (`name()` / `name(_)`) locate the callable
//! through the record's prototype chain and hand invocation to a [`CallHost`]
//! supplied by the caller, so the script runtime plugs in without this crate
//! depending on it.
//!
//! Segment forms:
//! - `ident` — named field
//! - integer — sequence index (0-based; negatives resolve but fail range)
//! - `name()` — zero-argument method call, result becomes the value
//! - `name(_)` — computed-with-setter: reads call no-arg, writes pass the
//!   new value as the sole argument
//! - `@name` — standard-variable lookup, first segment only
//! - `..` — parent traversal, errors at the walk root

use std::rc::Rc;

use core_value::{FuncRef, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("invalid path {path:?}: {detail}")]
    Syntax { path: String, detail: &'static str },
    #[error("unsupported segment {segment:?}")]
    UnsupportedSegment { segment: String },
    #[error("segment {segment:?} expects {expected}, found {found}")]
    WrongShape {
        segment: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("index {index} out of range for sequence of length {len}")]
    IndexOutOfRange { index: i64, len: usize },
    #[error("method {name:?} not found on {on}")]
    MethodNotFound { name: String, on: &'static str },
    #[error("{name:?} is not a function")]
    NotAFunction { name: String },
    #[error("path has no parent at the walk root")]
    RootHasNoParent,
    #[error("unknown standard variable @{name}")]
    UnknownStandardVar { name: String },
    #[error("call to {name:?} failed: {message}")]
    CallFailed { name: String, message: String },
}

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(Rc<str>),
    /// Kept signed so a protocol-supplied `-1` parses and then fails range
    /// checking rather than syntax.
    Index(i64),
    Call(Rc<str>),
    CallSetter(Rc<str>),
    Standard(Rc<str>),
    Parent,
}

impl Segment {
    pub fn describe(&self) -> String {
        match self {
            Segment::Field(n) => n.to_string(),
            Segment::Index(i) => i.to_string(),
            Segment::Call(n) => format!("{n}()"),
            Segment::CallSetter(n) => format!("{n}(_)"),
            Segment::Standard(n) => format!("@{n}"),
            Segment::Parent => "..".into(),
        }
    }
}

/// A parsed, validated path. Parsing happens once at variable creation; the
/// sweep re-resolves segments against live values every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    raw: Rc<str>,
    segments: Vec<Segment>,
}

impl Path {
    pub fn parse(raw: &str) -> Result<Path, PathError> {
        let syntax = |detail| PathError::Syntax {
            path: raw.to_string(),
            detail,
        };
        if raw.is_empty() {
            return Err(syntax("empty path"));
        }
        let mut segments = Vec::new();
        let mut rest = raw;
        loop {
            // `..` is a segment that doubles as its own separator, so
            // `items..title` and `items...title` both read parent-of-items.
            if let Some(after) = rest.strip_prefix("..") {
                segments.push(Segment::Parent);
                rest = after;
                if rest.is_empty() {
                    break;
                }
                if rest.starts_with("..") {
                    continue;
                }
                rest = rest.strip_prefix('.').unwrap_or(rest);
                if rest.is_empty() {
                    return Err(syntax("trailing separator"));
                }
                continue;
            }
            let end = rest.find('.').unwrap_or(rest.len());
            let comp = &rest[..end];
            if comp.is_empty() {
                return Err(syntax("empty segment"));
            }
            segments.push(parse_component(comp, segments.is_empty(), raw)?);
            rest = &rest[end..];
            if rest.is_empty() {
                break;
            }
            if rest.starts_with("..") {
                continue;
            }
            rest = rest
                .strip_prefix('.')
                .ok_or_else(|| syntax("missing segment separator"))?;
            if rest.is_empty() {
                return Err(syntax("trailing separator"));
            }
        }
        Ok(Path {
            raw: Rc::from(raw),
            segments,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn last(&self) -> &Segment {
        self.segments.last().expect("parsed path is never empty")
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_component(comp: &str, first: bool, raw: &str) -> Result<Segment, PathError> {
    if let Some(name) = comp.strip_prefix('@') {
        if !first {
            return Err(PathError::Syntax {
                path: raw.to_string(),
                detail: "@name is only valid as the first segment",
            });
        }
        if !is_ident(name) {
            return Err(PathError::UnsupportedSegment {
                segment: comp.to_string(),
            });
        }
        return Ok(Segment::Standard(Rc::from(name)));
    }
    if comp.chars().all(|c| c.is_ascii_digit())
        || (comp.starts_with('-') && comp[1..].chars().all(|c| c.is_ascii_digit()) && comp.len() > 1)
    {
        return comp
            .parse::<i64>()
            .map(Segment::Index)
            .map_err(|_| PathError::UnsupportedSegment {
                segment: comp.to_string(),
            });
    }
    if let Some(name) = comp.strip_suffix("(_)") {
        if is_ident(name) {
            return Ok(Segment::CallSetter(Rc::from(name)));
        }
    } else if let Some(name) = comp.strip_suffix("()") {
        if is_ident(name) {
            return Ok(Segment::Call(Rc::from(name)));
        }
    } else if is_ident(comp) {
        return Ok(Segment::Field(Rc::from(comp)));
    }
    Err(PathError::UnsupportedSegment {
        segment: comp.to_string(),
    })
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Invocation hook for method segments and `@name` resolution. The script
/// runtime implements this; plain-data callers can use [`NoHost`].
pub trait CallHost {
    /// Invoke `func` with `recv` bound as the receiver.
    fn invoke(
        &mut self,
        recv: &Value,
        func: &FuncRef,
        args: Vec<Value>,
    ) -> Result<Value, PathError>;

    /// Resolve a registered standard variable by name.
    fn standard_var(&mut self, _name: &str) -> Option<Value> {
        None
    }
}

/// Host for navigation over inert data: method segments fail, `@name`
/// resolves nothing.
pub struct NoHost;

impl CallHost for NoHost {
    fn invoke(
        &mut self,
        _recv: &Value,
        func: &FuncRef,
        _args: Vec<Value>,
    ) -> Result<Value, PathError> {
        Err(PathError::NotAFunction {
            name: func
                .name()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<anon>".into()),
        })
    }
}

fn seq_index(index: i64, len: usize) -> Result<usize, PathError> {
    if index < 0 || index as usize >= len {
        return Err(PathError::IndexOutOfRange { index, len });
    }
    Ok(index as usize)
}

fn method(value: &Value, name: &str) -> Result<FuncRef, PathError> {
    let rec = value.as_record().ok_or(PathError::MethodNotFound {
        name: name.to_string(),
        on: value.kind(),
    })?;
    match rec.lookup(name) {
        Some(Value::Func(f)) => Ok(f),
        Some(_) => Err(PathError::NotAFunction {
            name: name.to_string(),
        }),
        None => Err(PathError::MethodNotFound {
            name: name.to_string(),
            on: value.kind(),
        }),
    }
}

/// Read one segment off `value`.
pub fn get(host: &mut dyn CallHost, value: &Value, segment: &Segment) -> Result<Value, PathError> {
    match segment {
        Segment::Field(name) => match value {
            Value::Record(rec) => Ok(rec.lookup(name).unwrap_or(Value::Null)),
            other => Err(PathError::WrongShape {
                segment: segment.describe(),
                expected: "record",
                found: other.kind(),
            }),
        },
        Segment::Index(index) => match value {
            Value::List(list) => {
                let idx = seq_index(*index, list.len())?;
                Ok(list.get(idx).unwrap_or(Value::Null))
            }
            other => Err(PathError::WrongShape {
                segment: segment.describe(),
                expected: "sequence",
                found: other.kind(),
            }),
        },
        Segment::Call(name) | Segment::CallSetter(name) => {
            let func = method(value, name)?;
            host.invoke(value, &func, Vec::new())
        }
        Segment::Standard(name) => host
            .standard_var(name)
            .ok_or_else(|| PathError::UnknownStandardVar {
                name: name.to_string(),
            }),
        Segment::Parent => Err(PathError::RootHasNoParent),
    }
}

/// Write through one segment of `value`. The segment form picks the
/// strategy: field assignment, index store, or setter dispatch.
pub fn set(
    host: &mut dyn CallHost,
    value: &Value,
    segment: &Segment,
    new: Value,
) -> Result<(), PathError> {
    match segment {
        Segment::Field(name) => match value {
            Value::Record(rec) => {
                rec.set(name, new);
                Ok(())
            }
            other => Err(PathError::WrongShape {
                segment: segment.describe(),
                expected: "record",
                found: other.kind(),
            }),
        },
        Segment::Index(index) => match value {
            Value::List(list) => {
                let idx = seq_index(*index, list.len())?;
                list.borrow_mut()[idx] = new;
                Ok(())
            }
            other => Err(PathError::WrongShape {
                segment: segment.describe(),
                expected: "sequence",
                found: other.kind(),
            }),
        },
        Segment::CallSetter(name) => {
            let func = method(value, name)?;
            host.invoke(value, &func, vec![new])?;
            Ok(())
        }
        Segment::Call(_) | Segment::Standard(_) | Segment::Parent => {
            Err(PathError::UnsupportedSegment {
                segment: segment.describe(),
            })
        }
    }
}

/// Invoke a zero-argument method by name, e.g. a `name()` segment.
pub fn call(host: &mut dyn CallHost, value: &Value, name: &str) -> Result<Value, PathError> {
    let func = method(value, name)?;
    host.invoke(value, &func, Vec::new())
}

/// Invoke a one-argument setter method by name, e.g. a `name(_)` segment.
pub fn call_with(
    host: &mut dyn CallHost,
    value: &Value,
    name: &str,
    arg: Value,
) -> Result<(), PathError> {
    let func = method(value, name)?;
    host.invoke(value, &func, vec![arg])?;
    Ok(())
}

/// Walk a run of segments starting at `root`, tracking ancestors so `..`
/// can back out of the walk. `..` beyond the walk root errors.
pub fn resolve_segments(
    host: &mut dyn CallHost,
    root: &Value,
    segments: &[Segment],
) -> Result<Value, PathError> {
    let mut ancestors: Vec<Value> = Vec::new();
    let mut current = root.clone();
    for segment in segments {
        match segment {
            Segment::Parent => {
                current = ancestors.pop().ok_or(PathError::RootHasNoParent)?;
            }
            _ => {
                let next = get(host, &current, segment)?;
                ancestors.push(current);
                current = next;
            }
        }
    }
    Ok(current)
}

/// Walk every segment of `path` starting at `root`.
pub fn resolve(host: &mut dyn CallHost, root: &Value, path: &Path) -> Result<Value, PathError> {
    resolve_segments(host, root, path.segments())
}

/// Resolve all but the last segment, then write through the final one.
pub fn write_segments(
    host: &mut dyn CallHost,
    root: &Value,
    segments: &[Segment],
    new: Value,
) -> Result<(), PathError> {
    let (last, init) = segments.split_last().expect("parsed path is never empty");
    let target = resolve_segments(host, root, init)?;
    set(host, &target, last, new)
}

/// Write through `path` from `root`.
pub fn write(
    host: &mut dyn CallHost,
    root: &Value,
    path: &Path,
    new: Value,
) -> Result<(), PathError> {
    write_segments(host, root, path.segments(), new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_value::{ListRef, Record, RecordRef};

    fn record(fields: &[(&str, Value)]) -> Value {
        let mut rec = Record::default();
        for (k, v) in fields {
            rec.set(k, v.clone());
        }
        Value::Record(RecordRef::new(rec))
    }

    #[test]
    fn parses_segment_forms() {
        let p = Path::parse("@app.items.0.describe().title(_)").unwrap();
        assert_eq!(
            p.segments(),
            &[
                Segment::Standard(Rc::from("app")),
                Segment::Field(Rc::from("items")),
                Segment::Index(0),
                Segment::Call(Rc::from("describe")),
                Segment::CallSetter(Rc::from("title")),
            ]
        );
    }

    #[test]
    fn parses_parent_segments() {
        let p = Path::parse("a.....b").unwrap();
        assert_eq!(
            p.segments(),
            &[
                Segment::Field(Rc::from("a")),
                Segment::Parent,
                Segment::Parent,
                Segment::Field(Rc::from("b")),
            ]
        );
    }

    #[test]
    fn rejects_malformed_paths() {
        for bad in ["", ".", "a.", ".a", "a..b.@x", "a b", "x.y..z()extra"] {
            assert!(Path::parse(bad).is_err(), "expected parse failure: {bad:?}");
        }
    }

    #[test]
    fn standard_segment_only_first() {
        assert!(matches!(
            Path::parse("a.@b"),
            Err(PathError::Syntax { .. })
        ));
    }

    #[test]
    fn field_read_and_write() {
        let root = record(&[("title", Value::str("X"))]);
        let p = Path::parse("title").unwrap();
        let got = resolve(&mut NoHost, &root, &p).unwrap();
        assert_eq!(got.as_str(), Some("X"));

        write(&mut NoHost, &root, &p, Value::str("Y")).unwrap();
        assert_eq!(
            resolve(&mut NoHost, &root, &p).unwrap().as_str(),
            Some("Y")
        );
    }

    #[test]
    fn absent_field_reads_null() {
        let root = record(&[]);
        let p = Path::parse("missing").unwrap();
        assert!(resolve(&mut NoHost, &root, &p).unwrap().is_null());
    }

    #[test]
    fn index_bounds_checked() {
        let items = Value::List(ListRef::new(vec![Value::Int(1), Value::Int(2)]));
        let root = record(&[("items", items)]);
        for (path, index) in [("items.2", 2), ("items.-1", -1)] {
            let p = Path::parse(path).unwrap();
            match resolve(&mut NoHost, &root, &p) {
                Err(PathError::IndexOutOfRange { index: i, len: 2 }) => assert_eq!(i, index),
                other => panic!("expected out-of-range, got {other:?}"),
            }
        }
    }

    #[test]
    fn index_on_record_is_wrong_shape() {
        let root = record(&[("a", Value::Int(1))]);
        let p = Path::parse("0").unwrap();
        assert!(matches!(
            resolve(&mut NoHost, &root, &p),
            Err(PathError::WrongShape { .. })
        ));
    }

    #[test]
    fn parent_traversal_backs_out() {
        let inner = record(&[("value", Value::Int(7))]);
        let root = record(&[("inner", inner), ("sibling", Value::Int(9))]);
        let p = Path::parse("inner...sibling").unwrap();
        assert_eq!(
            resolve(&mut NoHost, &root, &p).unwrap().as_int(),
            Some(9)
        );
    }

    #[test]
    fn parent_at_root_errors() {
        let root = record(&[]);
        let p = Path::parse("..").unwrap();
        assert!(matches!(
            resolve(&mut NoHost, &root, &p),
            Err(PathError::RootHasNoParent)
        ));
    }

    #[test]
    fn method_segment_without_host_support_fails() {
        let root = record(&[("x", Value::Int(1))]);
        let p = Path::parse("describe()").unwrap();
        assert!(matches!(
            resolve(&mut NoHost, &root, &p),
            Err(PathError::MethodNotFound { .. })
        ));
    }

    #[test]
    fn unknown_standard_var_errors() {
        let p = Path::parse("@nope").unwrap();
        let root = record(&[]);
        assert!(matches!(
            resolve(&mut NoHost, &root, &p),
            Err(PathError::UnknownStandardVar { .. })
        ));
    }

    /// Host that answers calls with a canned value and records setter args.
    struct RecordingHost {
        result: Value,
        called_with: Vec<Value>,
    }

    impl CallHost for RecordingHost {
        fn invoke(
            &mut self,
            _recv: &Value,
            _func: &core_value::FuncRef,
            args: Vec<Value>,
        ) -> Result<Value, PathError> {
            self.called_with.extend(args);
            Ok(self.result.clone())
        }
    }

    #[test]
    fn call_segment_reads_through_the_host() {
        let func = Value::Func(core_value::FuncRef::new(None, Box::new(())));
        let root = record(&[("describe", func)]);
        let mut host = RecordingHost {
            result: Value::str("summary"),
            called_with: Vec::new(),
        };
        let p = Path::parse("describe()").unwrap();
        let got = resolve(&mut host, &root, &p).unwrap();
        assert_eq!(got.as_str(), Some("summary"));
        assert!(host.called_with.is_empty());
    }

    #[test]
    fn setter_segment_writes_through_the_host() {
        let func = Value::Func(core_value::FuncRef::new(None, Box::new(())));
        let root = record(&[("title", func)]);
        let mut host = RecordingHost {
            result: Value::Null,
            called_with: Vec::new(),
        };
        let p = Path::parse("title(_)").unwrap();
        write(&mut host, &root, &p, Value::str("new title")).unwrap();
        assert_eq!(host.called_with.len(), 1);
        assert_eq!(host.called_with[0].as_str(), Some("new title"));
    }

    #[test]
    fn setter_write_on_sequence_is_wrong_shape() {
        let root = record(&[(
            "items",
            Value::List(ListRef::new(vec![Value::Int(1)])),
        )]);
        let mut host = RecordingHost {
            result: Value::Null,
            called_with: Vec::new(),
        };
        // Sequences have no method table to dispatch a setter through.
        let p = Path::parse("items.first(_)").unwrap();
        assert!(matches!(
            write(&mut host, &root, &p, Value::Int(9)),
            Err(PathError::MethodNotFound { .. })
        ));
    }
}
