//! Reference-aware serialization for tracked values.
//!
//! Variable values serialize with object sharing intact: records become
//! `{"obj": <id>}` references and the object registry assigns ids on first
//! sight, queueing a field definition for separate transmission. Arrays stay
//! inline with their record elements replaced by references; nested arrays
//! are rejected to match the frontend data model.

use std::collections::{HashMap, HashSet, VecDeque};

use core_value::{ObjKey, RecordRef, Value};
use serde_json::{Map, Value as Json, json};

use crate::TrackError;

/// A record's field definition, transmitted once per object id.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDef {
    pub id: u32,
    pub type_name: Option<String>,
    pub fields: Map<String, Json>,
}

/// Identity → object-id map for one session. Registered values are kept
/// alive here so identity keys can never be reused by a reallocation; the
/// session is the arena and drops the registry wholesale.
#[derive(Default)]
pub struct ObjectRegistry {
    ids: HashMap<ObjKey, u32>,
    by_id: HashMap<u32, RecordRef>,
    pending_defs: VecDeque<(u32, RecordRef)>,
    seen_types: HashSet<String>,
    new_types: Vec<String>,
    next_id: u32,
}

impl ObjectRegistry {
    /// Object-id for a record, assigning one and queueing its definition on
    /// first sight.
    pub fn register(&mut self, rec: &RecordRef) -> u32 {
        let key = rec.key();
        if let Some(id) = self.ids.get(&key) {
            return *id;
        }
        self.next_id += 1;
        let id = self.next_id;
        self.ids.insert(key, id);
        self.by_id.insert(id, rec.clone());
        self.pending_defs.push_back((id, rec.clone()));
        if let Some(t) = rec.type_name() {
            if self.seen_types.insert(t.to_string()) {
                self.new_types.push(t.to_string());
            }
        }
        id
    }

    pub fn lookup_id(&self, key: ObjKey) -> Option<u32> {
        self.ids.get(&key).copied()
    }

    pub fn lookup_object(&self, id: u32) -> Option<RecordRef> {
        self.by_id.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Type names first encountered since the last drain, in encounter
    /// order. Consumed by viewdef preloading.
    pub fn take_new_types(&mut self) -> Vec<String> {
        std::mem::take(&mut self.new_types)
    }

    /// Serialize a variable's value. `{"obj": id}` for records, inline
    /// arrays for sequences, JSON primitives otherwise.
    pub fn serialize(&mut self, value: &Value) -> Result<Json, TrackError> {
        match value {
            Value::List(list) => {
                let items = list.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(self.serialize_element(item)?);
                }
                Ok(Json::Array(out))
            }
            other => self.serialize_element(other),
        }
    }

    fn serialize_element(&mut self, value: &Value) -> Result<Json, TrackError> {
        match value {
            Value::Null | Value::Empty => Ok(Json::Null),
            Value::Bool(b) => Ok(json!(b)),
            Value::Int(n) => Ok(json!(n)),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .ok_or(TrackError::NonSerializable("non-finite float")),
            Value::Str(s) => Ok(json!(&**s)),
            Value::Record(rec) => Ok(json!({ "obj": self.register(rec) })),
            Value::List(_) => Err(TrackError::NestedArray),
            Value::Func(_) => Err(TrackError::NonSerializable("function")),
        }
    }

    /// Drain queued definitions, serializing each record's data fields.
    /// Definitions can mention further unseen objects; the queue drains to a
    /// fixed point.
    pub fn take_definitions(&mut self) -> Result<Vec<ObjectDef>, TrackError> {
        let mut defs = Vec::new();
        while let Some((id, rec)) = self.pending_defs.pop_front() {
            let fields = self.define_fields(&rec)?;
            defs.push(ObjectDef {
                id,
                type_name: rec.type_name().map(|t| t.to_string()),
                fields,
            });
        }
        Ok(defs)
    }

    /// Data fields for a definition: the record's own fields plus inherited
    /// prototype defaults not shadowed by them. Methods never transmit.
    fn define_fields(&mut self, rec: &RecordRef) -> Result<Map<String, Json>, TrackError> {
        let mut fields = Map::new();
        let mut cursor = Some(rec.clone());
        while let Some(level) = cursor {
            let snapshot: Vec<(String, Value)> = level
                .borrow()
                .fields()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            for (name, value) in snapshot {
                if fields.contains_key(&name) || matches!(value, Value::Func(_)) {
                    continue;
                }
                fields.insert(name, self.serialize(&value)?);
            }
            cursor = level.borrow().proto();
        }
        Ok(fields)
    }

    /// Decode inbound JSON into a value, resolving `{"obj": id}` references
    /// against registered objects.
    pub fn decode(&self, json: &Json) -> Result<Value, TrackError> {
        if let Json::Object(map) = json
            && map.len() == 1
            && let Some(id_json) = map.get("obj")
        {
            let id = id_json
                .as_u64()
                .ok_or(TrackError::NonSerializable("object reference id"))?
                as u32;
            let rec = self
                .lookup_object(id)
                .ok_or(TrackError::UnknownObject(id))?;
            return Ok(Value::Record(rec));
        }
        if let Json::Array(items) = json {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(self.decode(item)?);
            }
            return Ok(Value::List(core_value::ListRef::new(out)));
        }
        Ok(Value::from_json(json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_value::{ListRef, Record};

    fn contact(name: &str) -> RecordRef {
        let mut rec = Record::default();
        rec.set_type_name(Some(std::rc::Rc::from("Contact")));
        rec.set("name", Value::str(name));
        RecordRef::new(rec)
    }

    #[test]
    fn ids_are_stable_and_unique() {
        let mut reg = ObjectRegistry::default();
        let a = contact("a");
        let b = contact("b");
        let id_a = reg.register(&a);
        let id_b = reg.register(&b);
        assert_ne!(id_a, id_b);
        assert_eq!(reg.register(&a), id_a);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn record_value_serializes_as_reference_with_definition() {
        let mut reg = ObjectRegistry::default();
        let rec = contact("alice");
        let json = reg.serialize(&Value::Record(rec.clone())).unwrap();
        let id = json["obj"].as_u64().unwrap() as u32;

        let defs = reg.take_definitions().unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id, id);
        assert_eq!(defs[0].type_name.as_deref(), Some("Contact"));
        assert_eq!(defs[0].fields["name"], json!("alice"));
        // Definitions transmit once.
        assert!(reg.take_definitions().unwrap().is_empty());
    }

    #[test]
    fn definitions_chase_nested_objects() {
        let mut reg = ObjectRegistry::default();
        let inner = contact("inner");
        let outer = contact("outer");
        outer.set("friend", Value::Record(inner));
        reg.serialize(&Value::Record(outer)).unwrap();
        let defs = reg.take_definitions().unwrap();
        assert_eq!(defs.len(), 2);
    }

    #[test]
    fn definition_includes_prototype_defaults() {
        let mut reg = ObjectRegistry::default();
        let proto = contact("default-name");
        proto.set("role", Value::str("user"));
        let inst = contact("alice");
        inst.borrow_mut().set_proto(Some(proto));
        reg.serialize(&Value::Record(inst)).unwrap();
        let defs = reg.take_definitions().unwrap();
        assert_eq!(defs[0].fields["name"], json!("alice")); // own shadows proto
        assert_eq!(defs[0].fields["role"], json!("user"));
    }

    #[test]
    fn lists_serialize_inline_with_object_refs() {
        let mut reg = ObjectRegistry::default();
        let list = Value::List(ListRef::new(vec![
            Value::Int(1),
            Value::Record(contact("x")),
        ]));
        let json = reg.serialize(&list).unwrap();
        assert_eq!(json[0], json!(1));
        assert!(json[1]["obj"].is_u64());
    }

    #[test]
    fn nested_arrays_are_rejected() {
        let mut reg = ObjectRegistry::default();
        let nested = Value::List(ListRef::new(vec![Value::List(ListRef::new(vec![]))]));
        assert!(matches!(
            reg.serialize(&nested),
            Err(TrackError::NestedArray)
        ));
    }

    #[test]
    fn new_types_drain_once() {
        let mut reg = ObjectRegistry::default();
        reg.register(&contact("a"));
        reg.register(&contact("b"));
        assert_eq!(reg.take_new_types(), vec!["Contact".to_string()]);
        assert!(reg.take_new_types().is_empty());
    }

    #[test]
    fn decode_resolves_object_references() {
        let mut reg = ObjectRegistry::default();
        let rec = contact("a");
        let id = reg.register(&rec);
        let decoded = reg.decode(&json!({ "obj": id })).unwrap();
        assert!(decoded.loose_eq(&Value::Record(rec)));
        assert!(matches!(
            reg.decode(&json!({ "obj": 999 })),
            Err(TrackError::UnknownObject(999))
        ));
        // Plain objects decode to fresh records.
        let fresh = reg.decode(&json!({ "a": 1, "b": 2 })).unwrap();
        assert!(fresh.as_record().is_some());
    }
}
