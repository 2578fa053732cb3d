//! Per-session variable tree and change detection.
//!
//! The tracker owns the session's variables (a tree rooted at variable 1,
//! the app variable) and the object registry that assigns per-session object
//! ids. Each sweep re-resolves every variable's path against its parent's
//! effective value, serializes the result to canonical JSON, and diffs
//! against the cached serialization; wrapped variables additionally diff the
//! wrapper's projection. Deltas accumulate until drained by the dispatcher.
//!
//! Ownership follows the arena model: the tracker, its variables, their
//! wrapper instances, and the object registry are dropped together when the
//! session ends. Object cycles are broken by reference serialization, never
//! by ownership bookkeeping.

use std::collections::BTreeMap;
use std::sync::Arc;

use core_path::{CallHost, Path, PathError, Segment};
use core_value::{ObjKey, Value};
use core_wrap::{Props, Registries, SessionRegistrations, VarView, WrapError, WrapHost, Wrapper};
use serde_json::Value as Json;
use thiserror::Error;
use tracing::{debug, trace, warn};

mod ser;

pub use ser::{ObjectDef, ObjectRegistry};

/// The session's app variable.
pub const APP_VARIABLE: u32 = 1;

#[derive(Debug, Error)]
pub enum TrackError {
    #[error("variable id {0} is already in use")]
    DuplicateId(u32),
    #[error("unknown parent variable {0}")]
    UnknownParent(u32),
    #[error("unknown variable {0}")]
    UnknownVariable(u32),
    #[error("variable has no path to write through")]
    MissingPath,
    #[error("nested arrays are not representable")]
    NestedArray,
    #[error("cannot serialize {0}")]
    NonSerializable(&'static str),
    #[error("unknown object reference {0}")]
    UnknownObject(u32),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Wrap(#[from] WrapError),
}

/// Everything the tracker needs from its session: method invocation for
/// call segments and wrapper services. Upcast per call site.
pub trait TrackHost: CallHost + WrapHost {}

impl<T: CallHost + WrapHost> TrackHost for T {}

/// Outbound ordering for a change. `High` is reserved for structural
/// updates such as the viewdef batch on variable 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// One variable's delta from the last drain: the serialized value when it
/// changed, and the properties that changed with their current values.
#[derive(Debug, Clone)]
pub struct Change {
    pub var_id: u32,
    pub value: Option<Json>,
    pub properties: Vec<(String, String)>,
    pub priority: Priority,
}

impl Change {
    fn merge(&mut self, other: Change) {
        if other.value.is_some() {
            self.value = other.value;
        }
        for (name, value) in other.properties {
            if let Some(slot) = self.properties.iter_mut().find(|(n, _)| *n == name) {
                slot.1 = value;
            } else {
                self.properties.push((name, value));
            }
        }
        if other.priority < self.priority {
            self.priority = other.priority;
        }
    }
}

/// A node in the session's variable tree.
pub struct Variable {
    id: u32,
    parent: u32,
    path: Option<Path>,
    props: Props,
    value: Value,
    wrapper: Option<Box<dyn Wrapper>>,
    value_json: Option<String>,
    wrapper_json: Option<String>,
    pending_props: Vec<String>,
}

impl Variable {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn parent(&self) -> u32 {
        self.parent
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_ref()
    }

    pub fn props(&self) -> &Props {
        &self.props
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn has_wrapper(&self) -> bool {
        self.wrapper.is_some()
    }

    /// The value children navigate through and serialization reads: the
    /// wrapper projection when a wrapper exists, the raw value otherwise.
    pub fn effective_value(&self) -> Value {
        match &self.wrapper {
            Some(w) => w.projection(),
            None => self.value.clone(),
        }
    }

    fn mark_props(&mut self, names: Vec<String>) {
        for name in names {
            if !self.pending_props.contains(&name) {
                self.pending_props.push(name);
            }
        }
    }
}

pub struct Tracker {
    registries: Arc<Registries>,
    vars: BTreeMap<u32, Variable>,
    objects: ObjectRegistry,
    changes: BTreeMap<u32, Change>,
    next_id: u32,
}

impl Tracker {
    pub fn new(registries: Arc<Registries>) -> Self {
        Self {
            registries,
            vars: BTreeMap::new(),
            objects: ObjectRegistry::default(),
            changes: BTreeMap::new(),
            next_id: APP_VARIABLE,
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn variable(&self, id: u32) -> Option<&Variable> {
        self.vars.get(&id)
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.objects
    }

    /// Variable whose raw value is the given object, if any.
    pub fn find_by_object(&self, key: ObjKey) -> Option<u32> {
        self.vars
            .iter()
            .find(|(_, v)| v.value.obj_key() == Some(key))
            .map(|(id, _)| *id)
    }

    /// Install (or replace) variable 1. The app variable has no path: its
    /// value is owned directly and never re-resolved.
    pub fn create_app_variable(&mut self, value: Value) -> u32 {
        let var = Variable {
            id: APP_VARIABLE,
            parent: 0,
            path: None,
            props: Props::new(),
            value,
            wrapper: None,
            value_json: None,
            wrapper_json: None,
            pending_props: Vec::new(),
        };
        self.vars.insert(APP_VARIABLE, var);
        trace!(target: "track", "app_variable_installed");
        APP_VARIABLE
    }

    fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id += 1;
            if !self.vars.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    /// Create and attach a variable. `explicit_id` comes from the frontend;
    /// script-created variables get a tracker-assigned id. The cached
    /// serialization starts empty, so the first sweep emits a value even
    /// when nothing "changed" by pure equality.
    pub fn create_variable(
        &mut self,
        host: &mut dyn TrackHost,
        session_regs: &SessionRegistrations,
        explicit_id: Option<u32>,
        parent: u32,
        entries: &[(&str, &str)],
    ) -> Result<u32, TrackError> {
        let id = match explicit_id {
            Some(id) => {
                if self.vars.contains_key(&id) {
                    return Err(TrackError::DuplicateId(id));
                }
                id
            }
            None => self.allocate_id(),
        };
        if !self.vars.contains_key(&parent) {
            return Err(TrackError::UnknownParent(parent));
        }

        let mut props = Props::new();
        let changed = props.apply_bulk(entries.iter().copied());
        let path = match props.get("path") {
            Some(raw) => Some(Path::parse(raw)?),
            None => None,
        };

        let mut var = Variable {
            id,
            parent,
            path,
            props,
            value: Value::Null,
            wrapper: None,
            value_json: None,
            wrapper_json: None,
            pending_props: Vec::new(),
        };
        var.mark_props(changed);
        self.vars.insert(id, var);

        // Resolve eagerly so wrapper construction sees a real value; a
        // resolution failure undoes the insert and surfaces to the caller.
        match self.resolve_raw(host, id) {
            Ok(value) => {
                if let Some(var) = self.vars.get_mut(&id) {
                    var.value = value;
                }
            }
            Err(err) => {
                self.vars.remove(&id);
                return Err(err);
            }
        }
        self.ensure_wrapper(host, session_regs, id)?;
        debug!(target: "track", var = id, parent, "variable_created");
        Ok(id)
    }

    /// Create a variable whose value is supplied directly by script rather
    /// than resolved from a path.
    pub fn create_direct_variable(
        &mut self,
        host: &mut dyn TrackHost,
        session_regs: &SessionRegistrations,
        parent: u32,
        value: Value,
        entries: &[(&str, &str)],
    ) -> Result<u32, TrackError> {
        if !self.vars.contains_key(&parent) {
            return Err(TrackError::UnknownParent(parent));
        }
        let id = self.allocate_id();
        let mut props = Props::new();
        let changed = props.apply_bulk(entries.iter().copied());
        let path = match props.get("path") {
            Some(raw) => Some(Path::parse(raw)?),
            None => None,
        };
        let mut var = Variable {
            id,
            parent,
            path,
            props,
            value,
            wrapper: None,
            value_json: None,
            wrapper_json: None,
            pending_props: Vec::new(),
        };
        var.mark_props(changed);
        self.vars.insert(id, var);
        self.ensure_wrapper(host, session_regs, id)?;
        debug!(target: "track", var = id, parent, "variable_created_direct");
        Ok(id)
    }

    /// Destroy a variable and its subtree. Absent ids are a no-op; the app
    /// variable outlives every normal operation.
    pub fn destroy_variable(&mut self, host: &mut dyn TrackHost, id: u32) -> bool {
        if id == APP_VARIABLE {
            warn!(target: "track", "app_variable_destroy_ignored");
            return false;
        }
        if !self.vars.contains_key(&id) {
            return false;
        }
        let mut doomed = vec![id];
        let mut cursor = 0;
        while cursor < doomed.len() {
            let parent = doomed[cursor];
            cursor += 1;
            doomed.extend(
                self.vars
                    .values()
                    .filter(|v| v.parent == parent)
                    .map(|v| v.id),
            );
        }
        // Children drop before their parents.
        for vid in doomed.iter().rev() {
            if let Some(mut var) = self.vars.remove(vid)
                && let Some(wrapper) = var.wrapper.as_mut()
            {
                wrapper.destroy(host);
            }
            self.changes.remove(vid);
        }
        debug!(target: "track", var = id, destroyed = doomed.len(), "variable_destroyed");
        true
    }

    /// Write a new value through the variable's path into its parent. The
    /// final segment selects the strategy: field set, index store, or
    /// setter-method dispatch. The app variable (and other path-less
    /// variables) replace their owned value.
    pub fn set_value(
        &mut self,
        host: &mut dyn TrackHost,
        id: u32,
        new: Value,
    ) -> Result<(), TrackError> {
        let (parent, segments) = {
            let var = self.vars.get(&id).ok_or(TrackError::UnknownVariable(id))?;
            match &var.path {
                Some(path) => (var.parent, Some(path.segments().to_vec())),
                None => (var.parent, None),
            }
        };
        let Some(segments) = segments else {
            let var = self.vars.get_mut(&id).expect("checked above");
            var.value = new;
            return Ok(());
        };
        let parent_var = self
            .vars
            .get(&parent)
            .ok_or(TrackError::UnknownParent(parent))?;
        let root = parent_var.effective_value();
        let call_host: &mut dyn CallHost = host;
        core_path::write_segments(call_host, &root, &segments, new)?;
        Ok(())
    }

    /// Bulk property set with priority-suffix ordering. Changed names are
    /// queued for the next sweep's delta.
    pub fn set_properties(
        &mut self,
        id: u32,
        entries: &[(&str, &str)],
    ) -> Result<Vec<String>, TrackError> {
        let var = self
            .vars
            .get_mut(&id)
            .ok_or(TrackError::UnknownVariable(id))?;
        let changed = var.props.apply_bulk(entries.iter().copied());
        if changed.iter().any(|name| name == "path") {
            var.path = match var.props.get("path") {
                Some(raw) => Some(Path::parse(raw)?),
                None => None,
            };
            var.value_json = None;
        }
        var.mark_props(changed.clone());
        Ok(changed)
    }

    /// Decode an inbound JSON value, routing through a registered create
    /// factory when the variable's `type` names one.
    pub fn decode_inbound(
        &mut self,
        host: &mut dyn TrackHost,
        json: &Json,
        type_name: Option<&str>,
    ) -> Result<Value, TrackError> {
        if let Some(name) = type_name
            && let Some(factory) = self.registries.creates.resolve(name)
        {
            let wrap_host: &mut dyn WrapHost = host;
            return Ok(factory(wrap_host, json)?);
        }
        self.objects.decode(json)
    }

    /// Resolve a variable's raw value from its parent. Path-less variables
    /// own their value.
    fn resolve_raw(&self, host: &mut dyn TrackHost, id: u32) -> Result<Value, TrackError> {
        let var = self.vars.get(&id).ok_or(TrackError::UnknownVariable(id))?;
        let Some(path) = &var.path else {
            return Ok(var.value.clone());
        };
        let parent_var = self
            .vars
            .get(&var.parent)
            .ok_or(TrackError::UnknownParent(var.parent))?;
        let segments = path.segments();

        // A first segment naming a wrapper-registered property (e.g. `items`
        // on a ViewList) starts the walk at the wrapper's live projection of
        // that property.
        let call_host: &mut dyn CallHost = host;
        if let Some(wrapper) = parent_var.wrapper.as_ref()
            && let Some(Segment::Field(name)) = segments.first()
            && let Some(start) = wrapper.wrapper_property(name)
        {
            return Ok(core_path::resolve_segments(call_host, &start, &segments[1..])?);
        }
        let root = parent_var.effective_value();
        Ok(core_path::resolve_segments(call_host, &root, segments)?)
    }

    /// Build the variable's wrapper if requested, addressable, and not yet
    /// built. Missing factories degrade to no wrapper.
    fn ensure_wrapper(
        &mut self,
        host: &mut dyn TrackHost,
        session_regs: &SessionRegistrations,
        id: u32,
    ) -> Result<(), TrackError> {
        let registries = Arc::clone(&self.registries);
        let Some(var) = self.vars.get_mut(&id) else {
            return Ok(());
        };
        if var.wrapper.is_some() {
            return Ok(());
        }
        let Some(wrapper_type) = var.props.get("wrapper").map(str::to_string) else {
            return Ok(());
        };
        let value = var.value.clone();
        let before = var.props.clone();
        let wrap_host: &mut dyn WrapHost = host;
        let built = {
            let mut view = VarView {
                id,
                value: &value,
                props: &mut var.props,
            };
            core_wrap::build_wrapper(
                wrap_host,
                session_regs,
                &registries.wrappers,
                &wrapper_type,
                &mut view,
            )?
        };
        let changed = diff_props(&before, &var.props);
        var.mark_props(changed);
        if let Some(mut wrapper) = built {
            // Initial reconcile so the projection is live before the next
            // sweep serializes it.
            let before = var.props.clone();
            let mut view = VarView {
                id,
                value: &value,
                props: &mut var.props,
            };
            if let Err(err) = wrapper.update(wrap_host, &mut view) {
                warn!(target: "track", var = id, %err, "wrapper_initial_update_failed");
            }
            let changed = diff_props(&before, &var.props);
            var.mark_props(changed);
            var.wrapper = Some(wrapper);
        }
        Ok(())
    }

    /// One sweep: re-resolve, reconcile wrappers, serialize, and diff every
    /// variable. Returns whether anything changed; deltas accumulate in the
    /// change list until [`Tracker::take_changes`].
    pub fn detect_changes(
        &mut self,
        host: &mut dyn TrackHost,
        session_regs: &SessionRegistrations,
    ) -> bool {
        let ids: Vec<u32> = self.vars.keys().copied().collect();
        let mut any = false;
        for id in ids {
            match self.sweep_one(host, session_regs, id) {
                Ok(changed) => any |= changed,
                Err(err) => {
                    warn!(target: "track.sweep", var = id, %err, "sweep_skip");
                }
            }
        }
        any
    }

    fn sweep_one(
        &mut self,
        host: &mut dyn TrackHost,
        session_regs: &SessionRegistrations,
        id: u32,
    ) -> Result<bool, TrackError> {
        if !self.vars.contains_key(&id) {
            return Ok(false); // destroyed mid-sweep by a wrapper hook
        }
        let resolved = self.resolve_raw(host, id)?;
        if let Some(var) = self.vars.get_mut(&id) {
            var.value = resolved.clone();
        }
        self.ensure_wrapper(host, session_regs, id)?;

        // Wrapper reconcile + optional sync hook. Split borrows: wrapper,
        // props, and the pending list are disjoint fields.
        if let Some(Variable {
            wrapper: Some(wrapper),
            props,
            pending_props,
            ..
        }) = self.vars.get_mut(&id)
        {
            let before = props.clone();
            let mut view = VarView {
                id,
                value: &resolved,
                props,
            };
            let wrap_host: &mut dyn WrapHost = host;
            wrapper.update(wrap_host, &mut view)?;
            wrapper.sync(wrap_host)?;
            for name in diff_props(&before, props) {
                if !pending_props.contains(&name) {
                    pending_props.push(name);
                }
            }
        }

        // Serialize raw and projection, diff against caches.
        let raw_json = serde_json::to_string(&self.objects.serialize(&resolved)?)
            .map_err(|_| TrackError::NonSerializable("json"))?;
        let projection = self
            .vars
            .get(&id)
            .and_then(|v| v.wrapper.as_ref().map(|w| w.projection()));
        let proj_json = match &projection {
            Some(p) => Some(
                serde_json::to_string(&self.objects.serialize(p)?)
                    .map_err(|_| TrackError::NonSerializable("json"))?,
            ),
            None => None,
        };

        let var = self.vars.get_mut(&id).expect("present above");
        let raw_changed = var.value_json.as_deref() != Some(raw_json.as_str());
        let proj_changed = match (&proj_json, &var.wrapper_json) {
            (Some(new), old) => old.as_deref() != Some(new.as_str()),
            (None, Some(_)) => true,
            (None, None) => false,
        };
        var.value_json = Some(raw_json.clone());
        var.wrapper_json = proj_json.clone();

        let outbound_changed = if projection.is_some() {
            proj_changed
        } else {
            raw_changed
        };
        let props_changed: Vec<(String, String)> = std::mem::take(&mut var.pending_props)
            .into_iter()
            .filter_map(|name| {
                var.props
                    .get(&name)
                    .map(|value| (name.clone(), value.to_string()))
            })
            .collect();

        let swept_dirty = raw_changed || proj_changed || !props_changed.is_empty();
        if outbound_changed || !props_changed.is_empty() {
            let outbound = proj_json.unwrap_or(raw_json);
            let priority = if props_changed.iter().any(|(n, _)| n == "viewdefs") {
                Priority::High
            } else {
                Priority::Normal
            };
            let change = Change {
                var_id: id,
                value: outbound_changed
                    .then(|| serde_json::from_str(&outbound).expect("serialized above")),
                properties: props_changed,
                priority,
            };
            match self.changes.get_mut(&id) {
                Some(existing) => existing.merge(change),
                None => {
                    self.changes.insert(id, change);
                }
            }
        }
        Ok(swept_dirty)
    }

    /// Drain accumulated deltas, ordered by priority then variable id.
    pub fn take_changes(&mut self) -> Vec<Change> {
        let mut out: Vec<Change> = std::mem::take(&mut self.changes).into_values().collect();
        out.sort_by_key(|c| (c.priority, c.var_id));
        out
    }

    /// Inject or merge a change directly (viewdef batches).
    pub fn push_change(&mut self, change: Change) {
        match self.changes.get_mut(&change.var_id) {
            Some(existing) => existing.merge(change),
            None => {
                self.changes.insert(change.var_id, change);
            }
        }
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Object definitions queued by serialization since the last drain.
    pub fn take_definitions(&mut self) -> Vec<ObjectDef> {
        match self.objects.take_definitions() {
            Ok(defs) => defs,
            Err(err) => {
                warn!(target: "track", %err, "definition_serialization_failed");
                Vec::new()
            }
        }
    }

    /// Type names first seen by serialization since the last drain.
    pub fn take_new_types(&mut self) -> Vec<String> {
        self.objects.take_new_types()
    }
}

fn diff_props(before: &Props, after: &Props) -> Vec<String> {
    after
        .iter()
        .filter(|(k, v)| before.get(k) != Some(*v))
        .map(|(k, _)| k.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_value::{FuncRef, ListRef, Record, RecordRef};
    use serde_json::json;

    #[derive(Default)]
    struct StubHost {
        resweep: bool,
    }

    impl CallHost for StubHost {
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

    impl WrapHost for StubHost {
        fn instantiate_presenter(
            &mut self,
            type_name: &str,
            base: &Value,
        ) -> Result<Value, WrapError> {
            let mut rec = Record::default();
            rec.set_type_name(Some(std::rc::Rc::from(type_name)));
            rec.set("baseItem", base.clone());
            Ok(Value::Record(RecordRef::new(rec)))
        }

        fn request_resweep(&mut self) {
            self.resweep = true;
        }

        fn script_global(&mut self, _name: &str) -> Option<Value> {
            None
        }

        fn invoke(
            &mut self,
            _recv: &Value,
            _func: &FuncRef,
            _args: Vec<Value>,
        ) -> Result<Value, WrapError> {
            Err(WrapError::Script("stub".into()))
        }
    }

    fn tracker() -> Tracker {
        Tracker::new(Arc::new(Registries::with_builtins()))
    }

    fn app_record(fields: &[(&str, Value)]) -> RecordRef {
        let mut rec = Record::default();
        for (k, v) in fields {
            rec.set(k, v.clone());
        }
        RecordRef::new(rec)
    }

    #[test]
    fn first_sweep_emits_app_value_then_goes_quiet() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let app = app_record(&[("title", Value::str("X")), ("count", Value::Int(0))]);
        t.create_app_variable(Value::Record(app));

        assert!(t.detect_changes(&mut host, &regs));
        let changes = t.take_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].var_id, APP_VARIABLE);
        let value = changes[0].value.as_ref().unwrap();
        let obj_id = value["obj"].as_u64().unwrap();
        let defs = t.take_definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].id as u64, obj_id);
        assert_eq!(defs[0].fields["title"], json!("X"));
        assert_eq!(defs[0].fields["count"], json!(0));

        // No mutation: the next sweep is clean and drains nothing.
        assert!(!t.detect_changes(&mut host, &regs));
        assert!(t.take_changes().is_empty());
    }

    #[test]
    fn frontend_variable_emits_even_without_structural_change() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let items = ListRef::new(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let app = app_record(&[("items", Value::List(items))]);
        t.create_app_variable(Value::Record(app));
        t.detect_changes(&mut host, &regs);
        t.take_changes();

        t.create_variable(&mut host, &regs, Some(7), APP_VARIABLE, &[("path", "items")])
            .unwrap();
        t.detect_changes(&mut host, &regs);
        let changes = t.take_changes();
        let change = changes.iter().find(|c| c.var_id == 7).expect("var 7 delta");
        assert_eq!(change.value, Some(json!([1, 2, 3])));
    }

    #[test]
    fn duplicate_frontend_id_is_rejected() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        t.create_app_variable(Value::Record(app_record(&[("a", Value::Int(1))])));
        t.create_variable(&mut host, &regs, Some(7), APP_VARIABLE, &[("path", "a")])
            .unwrap();
        assert!(matches!(
            t.create_variable(&mut host, &regs, Some(7), APP_VARIABLE, &[("path", "a")]),
            Err(TrackError::DuplicateId(7))
        ));
    }

    #[test]
    fn create_then_destroy_restores_count() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        t.create_app_variable(Value::Record(app_record(&[("a", Value::Int(1))])));
        let before = t.len();
        let id = t
            .create_variable(&mut host, &regs, None, APP_VARIABLE, &[("path", "a")])
            .unwrap();
        assert_eq!(t.len(), before + 1);
        assert!(t.destroy_variable(&mut host, id));
        assert_eq!(t.len(), before);
    }

    #[test]
    fn destroy_is_noop_for_absent_and_root() {
        let mut t = tracker();
        let mut host = StubHost::default();
        t.create_app_variable(Value::Null);
        assert!(!t.destroy_variable(&mut host, 99));
        assert!(!t.destroy_variable(&mut host, APP_VARIABLE));
        assert!(t.variable(APP_VARIABLE).is_some());
    }

    #[test]
    fn destroy_cascades_to_descendants() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let inner = app_record(&[("x", Value::Int(1))]);
        let app = app_record(&[("inner", Value::Record(inner))]);
        t.create_app_variable(Value::Record(app));
        let mid = t
            .create_variable(&mut host, &regs, None, APP_VARIABLE, &[("path", "inner")])
            .unwrap();
        let leaf = t
            .create_variable(&mut host, &regs, None, mid, &[("path", "x")])
            .unwrap();
        assert!(t.destroy_variable(&mut host, mid));
        assert!(t.variable(leaf).is_none());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn property_set_to_same_value_is_silent() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        t.create_app_variable(Value::Record(app_record(&[("a", Value::Int(1))])));
        t.set_properties(APP_VARIABLE, &[("type", "App")]).unwrap();
        t.detect_changes(&mut host, &regs);
        t.take_changes();

        t.set_properties(APP_VARIABLE, &[("type", "App")]).unwrap();
        assert!(!t.detect_changes(&mut host, &regs));
        assert!(t.take_changes().is_empty());
    }

    #[test]
    fn out_of_range_subscription_fails_creation() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let items = ListRef::new(vec![Value::Int(1)]);
        t.create_app_variable(Value::Record(app_record(&[("items", Value::List(items))])));
        let err = t
            .create_variable(&mut host, &regs, Some(3), APP_VARIABLE, &[("path", "items.5")])
            .unwrap_err();
        assert!(matches!(
            err,
            TrackError::Path(PathError::IndexOutOfRange { .. })
        ));
        // The failed create leaves no residue.
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn set_value_writes_through_final_segment() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let app = app_record(&[("title", Value::str("old"))]);
        t.create_app_variable(Value::Record(app.clone()));
        let id = t
            .create_variable(&mut host, &regs, None, APP_VARIABLE, &[("path", "title")])
            .unwrap();
        t.set_value(&mut host, id, Value::str("new")).unwrap();
        assert_eq!(app.get("title").unwrap().as_str(), Some("new"));
    }

    #[test]
    fn viewlist_projection_tracks_source_growth() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let a = app_record(&[("n", Value::str("a"))]);
        let b = app_record(&[("n", Value::str("b"))]);
        let source = ListRef::new(vec![Value::Record(a), Value::Record(b)]);
        let app = app_record(&[("contacts", Value::List(source.clone()))]);
        t.create_app_variable(Value::Record(app));
        t.detect_changes(&mut host, &regs);
        t.take_changes();

        let id = t
            .create_variable(
                &mut host,
                &regs,
                Some(2),
                APP_VARIABLE,
                &[("path", "contacts"), ("wrapper", "ViewList")],
            )
            .unwrap();
        t.detect_changes(&mut host, &regs);
        let changes = t.take_changes();
        let change = changes.iter().find(|c| c.var_id == id).unwrap();
        let arr = change.value.as_ref().unwrap().as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert!(arr.iter().all(|v| v["obj"].is_u64()));
        // fallbackNamespace:high lands as a plain property.
        assert!(
            change
                .properties
                .iter()
                .any(|(n, v)| n == "fallbackNamespace" && v == "list-item")
        );

        let c = app_record(&[("n", Value::str("c"))]);
        source.push(Value::Record(c));
        assert!(t.detect_changes(&mut host, &regs));
        assert!(host.resweep);
        let changes = t.take_changes();
        let change = changes.iter().find(|c| c.var_id == id).unwrap();
        let arr = change.value.as_ref().unwrap().as_array().unwrap();
        assert_eq!(arr.len(), 3);

        // Item definitions expose the slot indices 0,1,2.
        let defs = t.take_definitions();
        let mut indices: Vec<i64> = defs
            .iter()
            .filter(|d| d.type_name.as_deref() == Some("ViewListItem"))
            .filter_map(|d| d.fields.get("index").and_then(|v| v.as_i64()))
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn viewdefs_property_outranks_normal_changes() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        t.create_app_variable(Value::Record(app_record(&[("a", Value::Int(1))])));
        let id = t
            .create_variable(&mut host, &regs, None, APP_VARIABLE, &[("path", "a")])
            .unwrap();
        t.set_properties(APP_VARIABLE, &[("viewdefs", "{}")]).unwrap();
        t.detect_changes(&mut host, &regs);
        let changes = t.take_changes();
        assert!(changes.len() >= 2);
        assert_eq!(changes[0].var_id, APP_VARIABLE);
        assert_eq!(changes[0].priority, Priority::High);
        assert!(changes.iter().any(|c| c.var_id == id));
    }

    #[test]
    fn typed_inbound_values_route_through_create_factories() {
        let registries = Registries::with_builtins();
        registries.creates.register(
            "Flag",
            Arc::new(|_host, json| {
                let mut rec = Record::default();
                rec.set_type_name(Some(std::rc::Rc::from("Flag")));
                rec.set("raised", Value::Bool(json.as_bool().unwrap_or(false)));
                Ok(Value::Record(RecordRef::new(rec)))
            }),
        );
        let mut t = Tracker::new(Arc::new(registries));
        let mut host = StubHost::default();

        let coerced = t
            .decode_inbound(&mut host, &json!(true), Some("Flag"))
            .unwrap();
        let rec = coerced.as_record().unwrap();
        assert_eq!(&*rec.type_name().unwrap(), "Flag");
        assert!(matches!(rec.get("raised"), Some(Value::Bool(true))));

        // Unregistered types fall back to plain decoding.
        let plain = t
            .decode_inbound(&mut host, &json!("x"), Some("Unknown"))
            .unwrap();
        assert_eq!(plain.as_str(), Some("x"));
    }

    #[test]
    fn object_ids_stay_stable_across_sweeps() {
        let mut t = tracker();
        let mut host = StubHost::default();
        let regs = SessionRegistrations::default();
        let app = app_record(&[("t", Value::str("x"))]);
        t.create_app_variable(Value::Record(app.clone()));
        t.detect_changes(&mut host, &regs);
        let first = t.take_changes()[0].value.clone().unwrap();
        app.set("t", Value::str("y"));
        // Field mutation does not change the reference serialization...
        assert!(!t.detect_changes(&mut host, &regs));
        // ...and re-serializing yields the same object id (P1).
        let key = app.key();
        assert_eq!(
            t.objects().lookup_id(key).map(|id| json!({ "obj": id })),
            Some(first)
        );
    }
}
