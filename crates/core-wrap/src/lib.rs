//! Variable wrappers: per-variable value transformers and the factory
//! registries that produce them.
//!
//! Two registries exist, both keyed by type-name strings: [`CreateRegistry`]
//! coerces frontend-supplied JSON into typed values, [`WrapperRegistry`]
//! builds variable wrappers. Both are constructed explicitly at engine start
//! (no hidden global init) and shared process-wide behind `RwLock`; sessions
//! can layer their own registrations over the shared set.
//!
//! Wrapper instances themselves are single-session values living on the
//! session worker; only the factories cross threads.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use core_value::{FuncRef, Value};
use thiserror::Error;
use tracing::debug;

pub mod props;
pub mod viewlist;

pub use props::Props;
pub use viewlist::{ViewList, VIEW_LIST_TYPE};

#[derive(Debug, Error)]
pub enum WrapError {
    #[error("wrapper constructor for {0} returned null")]
    NullConstruction(String),
    #[error("wrapper {wrapper} expected {expected}, got {found}")]
    WrongShape {
        wrapper: &'static str,
        expected: &'static str,
        found: &'static str,
    },
    #[error("presenter type {0} is not registered")]
    UnknownPresenter(String),
    #[error("create factory for type {0} rejected the value: {1}")]
    CreateRejected(String, String),
    #[error("script call failed: {0}")]
    Script(String),
}

/// What a wrapper sees of its variable while being constructed or updated:
/// the id, the freshly resolved raw value, and the mutable property map.
pub struct VarView<'a> {
    pub id: u32,
    pub value: &'a Value,
    pub props: &'a mut Props,
}

/// Session services a wrapper may call. Implemented by the script session;
/// kept narrow so wrappers stay testable against a stub.
pub trait WrapHost {
    /// Construct a presenter instance of the named type for a base item.
    fn instantiate_presenter(&mut self, type_name: &str, base: &Value)
    -> Result<Value, WrapError>;

    /// Raise the tracker's resweep flag: the wrapper produced secondary
    /// changes the current sweep will not have seen.
    fn request_resweep(&mut self);

    /// Script global lookup for wrapper auto-discovery.
    fn script_global(&mut self, name: &str) -> Option<Value>;

    /// Constructor registered by script via `registerWrapper`, if any.
    /// Checked before both registries.
    fn session_wrapper_ctor(&mut self, _name: &str) -> Option<Value> {
        None
    }

    /// Invoke a script function with a bound receiver.
    fn invoke(&mut self, recv: &Value, func: &FuncRef, args: Vec<Value>)
    -> Result<Value, WrapError>;
}

/// Per-variable value transformer. One instance per variable, created when
/// the variable first has an addressable value and reused across value
/// changes; the runtime calls [`Wrapper::update`] and then the optional
/// [`Wrapper::sync`] hook on every sweep that touches the variable.
pub trait Wrapper {
    fn type_name(&self) -> &str;

    /// Reconcile internal state with a newly resolved raw value.
    fn update(&mut self, host: &mut dyn WrapHost, view: &mut VarView<'_>)
    -> Result<(), WrapError>;

    /// Optional post-update hook (script-defined wrappers).
    fn sync(&mut self, _host: &mut dyn WrapHost) -> Result<(), WrapError> {
        Ok(())
    }

    /// The value child navigation and serialization see in place of the raw
    /// value.
    fn projection(&self) -> Value;

    /// Resolve a wrapper-registered property by name (e.g. `items` on a
    /// ViewList). `None` defers to normal navigation over the projection.
    fn wrapper_property(&self, _name: &str) -> Option<Value> {
        None
    }

    fn destroy(&mut self, _host: &mut dyn WrapHost) {}
}

pub type WrapperCtor =
    Arc<dyn Fn(&mut dyn WrapHost, &mut VarView<'_>) -> Result<Box<dyn Wrapper>, WrapError> + Send + Sync>;

pub type CreateFn =
    Arc<dyn Fn(&mut dyn WrapHost, &serde_json::Value) -> Result<Value, WrapError> + Send + Sync>;

/// Process-wide wrapper factory table. Registrations are rare and reads are
/// hot, hence the read-write lock.
#[derive(Default)]
pub struct WrapperRegistry {
    inner: RwLock<HashMap<String, WrapperCtor>>,
}

impl WrapperRegistry {
    /// Registry with the built-in wrappers pre-registered.
    pub fn with_builtins() -> Self {
        let reg = Self::default();
        reg.register(VIEW_LIST_TYPE, viewlist::ctor());
        reg
    }

    pub fn register(&self, name: &str, ctor: WrapperCtor) {
        self.inner
            .write()
            .expect("wrapper registry poisoned")
            .insert(name.to_string(), ctor);
    }

    pub fn unregister(&self, name: &str) {
        self.inner
            .write()
            .expect("wrapper registry poisoned")
            .remove(name);
    }

    pub fn resolve(&self, name: &str) -> Option<WrapperCtor> {
        self.inner
            .read()
            .expect("wrapper registry poisoned")
            .get(name)
            .cloned()
    }
}

/// Process-wide create-factory table for frontend-initiated value creation
/// by type name.
#[derive(Default)]
pub struct CreateRegistry {
    inner: RwLock<HashMap<String, CreateFn>>,
}

impl CreateRegistry {
    pub fn register(&self, name: &str, f: CreateFn) {
        self.inner
            .write()
            .expect("create registry poisoned")
            .insert(name.to_string(), f);
    }

    pub fn unregister(&self, name: &str) {
        self.inner
            .write()
            .expect("create registry poisoned")
            .remove(name);
    }

    pub fn resolve(&self, name: &str) -> Option<CreateFn> {
        self.inner
            .read()
            .expect("create registry poisoned")
            .get(name)
            .cloned()
    }
}

/// The pair of shared registries an engine owns.
#[derive(Default)]
pub struct Registries {
    pub wrappers: WrapperRegistry,
    pub creates: CreateRegistry,
}

impl Registries {
    pub fn with_builtins() -> Self {
        Self {
            wrappers: WrapperRegistry::with_builtins(),
            creates: CreateRegistry::default(),
        }
    }
}

/// Session-local registrations consulted before the shared registries.
#[derive(Default)]
pub struct SessionRegistrations {
    wrappers: HashMap<String, WrapperCtor>,
}

impl SessionRegistrations {
    pub fn register_wrapper(&mut self, name: &str, ctor: WrapperCtor) {
        self.wrappers.insert(name.to_string(), ctor);
    }

    pub fn unregister_wrapper(&mut self, name: &str) {
        self.wrappers.remove(name);
    }

    fn resolve(&self, name: &str) -> Option<WrapperCtor> {
        self.wrappers.get(name).cloned()
    }
}

/// Resolve and construct a wrapper for `wrapper=<name>`.
///
/// Resolution order: script-registered constructors, session registrations,
/// the shared registry, then script-global auto-discovery (a global record
/// named `name` with a `new` method). A miss everywhere degrades to
/// `Ok(None)` — the variable keeps functioning on its raw value.
pub fn build_wrapper(
    host: &mut dyn WrapHost,
    session: &SessionRegistrations,
    shared: &WrapperRegistry,
    name: &str,
    view: &mut VarView<'_>,
) -> Result<Option<Box<dyn Wrapper>>, WrapError> {
    if let Some(ctor) = host.session_wrapper_ctor(name) {
        return script_wrapper_from_ctor(host, name, &ctor, view).map(Some);
    }
    if let Some(ctor) = session.resolve(name).or_else(|| shared.resolve(name)) {
        return ctor(host, view).map(Some);
    }
    if let Some(wrapper) = discover_script_wrapper(host, name, view)? {
        return Ok(Some(wrapper));
    }
    debug!(target: "wrap", wrapper = name, var = view.id, "wrapper_factory_missing");
    Ok(None)
}

/// Auto-discovery: a script global named like the wrapper type whose record
/// carries a `new` constructor. The discovered constructor is re-resolved on
/// every construction rather than cached, so a reload that replaces the
/// global takes effect for the next variable.
fn discover_script_wrapper(
    host: &mut dyn WrapHost,
    name: &str,
    view: &mut VarView<'_>,
) -> Result<Option<Box<dyn Wrapper>>, WrapError> {
    let Some(global) = host.script_global(name) else {
        return Ok(None);
    };
    if global.as_record().and_then(|r| r.lookup("new")).is_none() {
        return Ok(None);
    }
    script_wrapper_from_ctor(host, name, &global, view).map(Some)
}

/// Build a [`ScriptWrapper`] from a script constructor: either a record
/// whose `new` method constructs the wrapper, or a bare function.
fn script_wrapper_from_ctor(
    host: &mut dyn WrapHost,
    name: &str,
    ctor: &Value,
    view: &mut VarView<'_>,
) -> Result<Box<dyn Wrapper>, WrapError> {
    let handle = script_var_handle(view);
    let built = match ctor {
        Value::Record(rec) => match rec.lookup("new") {
            Some(Value::Func(new_fn)) => {
                host.invoke(&Value::Record(rec.clone()), &new_fn, vec![handle])?
            }
            _ => {
                return Err(WrapError::WrongShape {
                    wrapper: "script",
                    expected: "record with a new method",
                    found: "record",
                });
            }
        },
        Value::Func(f) => {
            let recv = Value::Null;
            host.invoke(&recv, f, vec![handle])?
        }
        other => {
            return Err(WrapError::WrongShape {
                wrapper: "script",
                expected: "constructor record or function",
                found: other.kind(),
            });
        }
    };
    match built {
        Value::Record(instance) => Ok(Box::new(ScriptWrapper {
            type_name: name.to_string(),
            instance,
        })),
        Value::Null | Value::Empty => Err(WrapError::NullConstruction(name.to_string())),
        other => Err(WrapError::WrongShape {
            wrapper: "script",
            expected: "record",
            found: other.kind(),
        }),
    }
}

/// The variable handle a script-defined wrapper receives: id plus the
/// current raw value.
fn script_var_handle(view: &VarView<'_>) -> Value {
    let mut rec = core_value::Record::default();
    rec.set("id", Value::Int(view.id as i64));
    rec.set("value", view.value.clone());
    Value::Record(core_value::RecordRef::new(rec))
}

/// A wrapper implemented by script code: the constructed record's `update`,
/// `sync`, and `destroy` methods are invoked when present, and the record
/// itself is the projection.
pub struct ScriptWrapper {
    type_name: String,
    instance: core_value::RecordRef,
}

impl ScriptWrapper {
    fn call_hook(
        &self,
        host: &mut dyn WrapHost,
        name: &str,
        args: Vec<Value>,
    ) -> Result<(), WrapError> {
        if let Some(Value::Func(f)) = self.instance.lookup(name) {
            host.invoke(&Value::Record(self.instance.clone()), &f, args)?;
        }
        Ok(())
    }
}

impl Wrapper for ScriptWrapper {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn update(
        &mut self,
        host: &mut dyn WrapHost,
        view: &mut VarView<'_>,
    ) -> Result<(), WrapError> {
        self.call_hook(host, "update", vec![view.value.clone()])
    }

    fn sync(&mut self, host: &mut dyn WrapHost) -> Result<(), WrapError> {
        self.call_hook(host, "sync", Vec::new())
    }

    fn projection(&self) -> Value {
        Value::Record(self.instance.clone())
    }

    fn destroy(&mut self, host: &mut dyn WrapHost) {
        if let Err(err) = self.call_hook(host, "destroy", Vec::new()) {
            debug!(target: "wrap", wrapper = %self.type_name, %err, "wrapper_destroy_failed");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_host::StubHost;
    use super::*;

    #[test]
    fn unknown_wrapper_degrades_to_none() {
        let shared = WrapperRegistry::with_builtins();
        let session = SessionRegistrations::default();
        let mut host = StubHost::default();
        let mut props = Props::new();
        let value = Value::Null;
        let mut view = VarView {
            id: 3,
            value: &value,
            props: &mut props,
        };
        let got = build_wrapper(&mut host, &session, &shared, "Nope", &mut view).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn session_registration_shadows_shared() {
        struct Marker(&'static str);
        impl Wrapper for Marker {
            fn type_name(&self) -> &str {
                self.0
            }
            fn update(
                &mut self,
                _host: &mut dyn WrapHost,
                _view: &mut VarView<'_>,
            ) -> Result<(), WrapError> {
                Ok(())
            }
            fn projection(&self) -> Value {
                Value::Null
            }
        }

        let shared = WrapperRegistry::default();
        shared.register(
            "T",
            Arc::new(|_, _| Ok(Box::new(Marker("shared")) as Box<dyn Wrapper>)),
        );
        let mut session = SessionRegistrations::default();
        session.register_wrapper(
            "T",
            Arc::new(|_, _| Ok(Box::new(Marker("session")) as Box<dyn Wrapper>)),
        );

        let mut host = StubHost::default();
        let mut props = Props::new();
        let value = Value::Null;
        let mut view = VarView {
            id: 1,
            value: &value,
            props: &mut props,
        };
        let wrapper = build_wrapper(&mut host, &session, &shared, "T", &mut view)
            .unwrap()
            .unwrap();
        assert_eq!(wrapper.type_name(), "session");
    }
}
