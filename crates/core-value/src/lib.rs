//! Dynamic value model shared by the script runtime and the variable tracker.
//!
//! Records and lists are `Rc<RefCell<..>>` handles: cloning a [`Value`] clones
//! the handle, not the data, so script code and tracked variables observe the
//! same mutations. Heap identity (the `Rc` allocation address) is the object
//! identity used everywhere downstream — object-id assignment, instance
//! tracking, ViewList slot reconciliation — exposed here as [`ObjKey`].
//!
//! Functions are opaque at this layer: [`FuncCell`] carries a payload only the
//! script runtime can interpret. Callers that need to invoke one go through
//! the resolver's call host, keeping this crate free of interpreter types.

use std::any::Any;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValueError {
    /// Functions and natives have no JSON form.
    #[error("value of kind {0} cannot be encoded as JSON")]
    NotJson(&'static str),
    /// JSON numbers outside f64/i64 range (serde_json arbitrary precision off).
    #[error("non-finite number cannot be encoded as JSON")]
    NonFiniteNumber,
}

/// Stable per-process identity of a heap value (record, list, or function).
/// Derived from the `Rc` allocation address; valid while any strong handle
/// lives. Two keys compare equal iff they denote the same allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjKey(usize);

impl ObjKey {
    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Ordered field map plus the method-dispatch link and an optional type name.
///
/// Field order is declaration order and is semantic: serialization and
/// object-definition records preserve it. Maps here are small (domain
/// objects, not bulk data), so linear scans beat hashing.
#[derive(Default)]
pub struct Record {
    fields: Vec<(Rc<str>, Value)>,
    proto: Option<RecordRef>,
    type_name: Option<Rc<str>>,
}

impl Record {
    pub fn get(&self, name: &str) -> Option<Value> {
        self.fields
            .iter()
            .find(|(k, _)| &**k == name)
            .map(|(_, v)| v.clone())
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|(k, _)| &**k == name)
    }

    /// Insert or overwrite, preserving first-insertion order.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(slot) = self.fields.iter_mut().find(|(k, _)| &**k == name) {
            slot.1 = value;
        } else {
            self.fields.push((Rc::from(name), value));
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(k, _)| &**k == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| &**k)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (&**k, v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn proto(&self) -> Option<RecordRef> {
        self.proto.clone()
    }

    pub fn set_proto(&mut self, proto: Option<RecordRef>) {
        self.proto = proto;
    }

    /// The record's own type name, ignoring the prototype chain.
    pub fn own_type_name(&self) -> Option<Rc<str>> {
        self.type_name.clone()
    }

    pub fn set_type_name(&mut self, name: Option<Rc<str>>) {
        self.type_name = name;
    }
}

/// Shared, identity-bearing handle to a [`Record`].
#[derive(Clone)]
pub struct RecordRef(Rc<RefCell<Record>>);

impl RecordRef {
    pub fn new(record: Record) -> Self {
        Self(Rc::new(RefCell::new(record)))
    }

    pub fn key(&self) -> ObjKey {
        ObjKey(Rc::as_ptr(&self.0) as usize)
    }

    pub fn borrow(&self) -> Ref<'_, Record> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Record> {
        self.0.borrow_mut()
    }

    pub fn downgrade(&self) -> WeakRecord {
        WeakRecord(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &RecordRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name)
    }

    pub fn set(&self, name: &str, value: Value) {
        self.0.borrow_mut().set(name, value);
    }

    /// Field lookup walking the prototype chain. Own fields shadow inherited
    /// ones; chains are short (instance → prototype → Object) so the walk is
    /// a couple of pointer hops.
    pub fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.0.borrow().get(name) {
            return Some(v);
        }
        let proto = self.0.borrow().proto();
        proto.and_then(|p| p.lookup(name))
    }

    /// Effective type name: the record's own, else the nearest ancestor's.
    pub fn type_name(&self) -> Option<Rc<str>> {
        if let Some(t) = self.0.borrow().own_type_name() {
            return Some(t);
        }
        let proto = self.0.borrow().proto();
        proto.and_then(|p| p.type_name())
    }
}

impl fmt::Debug for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rec = self.0.borrow();
        let mut d = f.debug_struct("Record");
        if let Some(t) = rec.own_type_name() {
            d.field("type", &&*t);
        }
        d.field("fields", &rec.len()).finish()
    }
}

/// Weak counterpart used by the prototype→instance registry.
pub struct WeakRecord(Weak<RefCell<Record>>);

impl WeakRecord {
    pub fn upgrade(&self) -> Option<RecordRef> {
        self.0.upgrade().map(RecordRef)
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

/// Shared, identity-bearing handle to an ordered sequence.
#[derive(Clone)]
pub struct ListRef(Rc<RefCell<Vec<Value>>>);

impl ListRef {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn key(&self) -> ObjKey {
        ObjKey(Rc::as_ptr(&self.0) as usize)
    }

    pub fn borrow(&self) -> Ref<'_, Vec<Value>> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Vec<Value>> {
        self.0.borrow_mut()
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub fn ptr_eq(&self, other: &ListRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ListRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "List(len={})", self.0.borrow().len())
    }
}

/// Opaque callable. `payload` is downcast by the script runtime; everything
/// else treats functions as identity-bearing leaves.
pub struct FuncCell {
    pub name: Option<Rc<str>>,
    pub payload: Box<dyn Any>,
}

#[derive(Clone)]
pub struct FuncRef(Rc<FuncCell>);

impl FuncRef {
    pub fn new(name: Option<Rc<str>>, payload: Box<dyn Any>) -> Self {
        Self(Rc::new(FuncCell { name, payload }))
    }

    pub fn key(&self) -> ObjKey {
        ObjKey(Rc::as_ptr(&self.0) as usize)
    }

    pub fn name(&self) -> Option<Rc<str>> {
        self.0.name.clone()
    }

    pub fn payload(&self) -> &dyn Any {
        self.0.payload.as_ref()
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(n) => write!(f, "Func({n})"),
            None => write!(f, "Func(<anon>)"),
        }
    }
}

/// A value in the session's object graph.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    /// Tracked-nil marker: legal only inside prototype init records, where it
    /// declares a schema key whose default is null.
    Empty,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(ListRef),
    Record(RecordRef),
    Func(FuncRef),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Value {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Empty => "empty",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
            Value::Func(_) => "function",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null | Value::Empty => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(_) | Value::Record(_) | Value::Func(_) => true,
        }
    }

    pub fn as_record(&self) -> Option<&RecordRef> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListRef> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Identity key for heap values, `None` for primitives.
    pub fn obj_key(&self) -> Option<ObjKey> {
        match self {
            Value::List(l) => Some(l.key()),
            Value::Record(r) => Some(r.key()),
            Value::Func(f) => Some(f.key()),
            _ => None,
        }
    }

    /// Script equality: structural for primitives, identity for heap values.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Empty, Value::Empty) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Record(a), Value::Record(b)) => a.ptr_eq(b),
            (Value::Func(a), Value::Func(b)) => a.key() == b.key(),
            _ => false,
        }
    }

    /// Plain structural JSON conversion. Records become JSON objects (the
    /// prototype chain is NOT flattened), lists become arrays. The tracker
    /// has its own reference-aware serializer; this one backs the script
    /// `jsonEncode` builtin and config plumbing.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        match self {
            Value::Null | Value::Empty => Ok(serde_json::Value::Null),
            Value::Bool(b) => Ok(serde_json::Value::Bool(*b)),
            Value::Int(n) => Ok(serde_json::Value::from(*n)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or(ValueError::NonFiniteNumber),
            Value::Str(s) => Ok(serde_json::Value::String(s.to_string())),
            Value::List(l) => {
                let items = l.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json()?);
                }
                Ok(serde_json::Value::Array(out))
            }
            Value::Record(r) => {
                let rec = r.borrow();
                let mut out = serde_json::Map::with_capacity(rec.len());
                for (k, v) in rec.fields() {
                    out.insert(k.to_string(), v.to_json()?);
                }
                Ok(serde_json::Value::Object(out))
            }
            Value::Func(_) => Err(ValueError::NotJson("function")),
        }
    }

    /// Inverse of [`Value::to_json`]: objects become fresh records, arrays
    /// fresh lists. Every call allocates new identities.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::str(s),
            serde_json::Value::Array(items) => {
                Value::List(ListRef::new(items.iter().map(Value::from_json).collect()))
            }
            serde_json::Value::Object(map) => {
                let mut rec = Record::default();
                for (k, v) in map {
                    rec.set(k, Value::from_json(v));
                }
                Value::Record(RecordRef::new(rec))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Empty => write!(f, "empty"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s}"),
            Value::List(l) => write!(f, "[list len={}]", l.len()),
            Value::Record(r) => match r.type_name() {
                Some(t) => write!(f, "[{t}]"),
                None => write!(f, "[record]"),
            },
            Value::Func(func) => match func.name() {
                Some(n) => write!(f, "[fn {n}]"),
                None => write!(f, "[fn]"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(name: &str) -> RecordRef {
        let mut rec = Record::default();
        rec.set("name", Value::str(name));
        RecordRef::new(rec)
    }

    #[test]
    fn record_set_preserves_insertion_order() {
        let mut rec = Record::default();
        rec.set("b", Value::Int(1));
        rec.set("a", Value::Int(2));
        rec.set("b", Value::Int(3)); // overwrite must not reorder
        let keys: Vec<&str> = rec.keys().collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert!(matches!(rec.get("b"), Some(Value::Int(3))));
    }

    #[test]
    fn handles_share_identity() {
        let a = person("alice");
        let b = a.clone();
        assert_eq!(a.key(), b.key());
        b.set("name", Value::str("bob"));
        assert_eq!(a.get("name").unwrap().as_str(), Some("bob"));

        let other = person("alice");
        assert_ne!(a.key(), other.key());
        assert!(!a.ptr_eq(&other));
    }

    #[test]
    fn weak_record_dies_with_last_strong_handle() {
        let weak = {
            let rec = person("ephemeral");
            let weak = rec.downgrade();
            assert!(weak.is_alive());
            weak
        };
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn lookup_walks_prototype_chain() {
        let proto = person("proto");
        proto.set("greet", Value::str("hello"));
        let inst = person("inst");
        inst.borrow_mut().set_proto(Some(proto.clone()));

        assert_eq!(inst.lookup("greet").unwrap().as_str(), Some("hello"));
        // Own field shadows the prototype's.
        assert_eq!(inst.lookup("name").unwrap().as_str(), Some("inst"));
        assert!(inst.lookup("absent").is_none());
    }

    #[test]
    fn type_name_resolves_through_chain() {
        let proto = person("p");
        proto.borrow_mut().set_type_name(Some(Rc::from("Person")));
        let inst = person("i");
        inst.borrow_mut().set_proto(Some(proto));
        assert_eq!(&*inst.type_name().unwrap(), "Person");
    }

    #[test]
    fn loose_eq_is_identity_for_heap_values() {
        let a = Value::Record(person("x"));
        let b = a.clone();
        assert!(a.loose_eq(&b));
        assert!(!a.loose_eq(&Value::Record(person("x"))));
        assert!(Value::Int(2).loose_eq(&Value::Float(2.0)));
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let json: serde_json::Value =
            serde_json::from_str(r#"{"title":"X","count":0,"tags":["a","b"]}"#).unwrap();
        let value = Value::from_json(&json);
        assert_eq!(value.to_json().unwrap(), json);
    }

    #[test]
    fn functions_refuse_json_encoding() {
        let f = Value::Func(FuncRef::new(None, Box::new(())));
        assert!(matches!(f.to_json(), Err(ValueError::NotJson(_))));
    }
}
