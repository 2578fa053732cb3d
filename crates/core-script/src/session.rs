//! The scripting session: prototype and instance registries, the mutation
//! queue, module tracking, and the loader.
//!
//! Everything here is single-threaded by construction (values are `Rc`
//! handles); concurrent callers go through the worker in [`crate::executor`].
//! Variable operations requested by script (`createAppVariable` and friends)
//! are queued as [`VarOp`]s and drained by the session runtime after the
//! triggering execution, which keeps this crate independent of the tracker.

use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use core_value::{FuncRef, Record, RecordRef, Value, WeakRecord};
use tracing::{debug, info, warn};

use crate::ScriptError;
use crate::interp::{Env, EnvRef, Interp, NativeImpl, native_fn};
use crate::parse::parse;

/// Script file extension.
pub const SCRIPT_EXT: &str = "wft";

/// Fallback provider for module text when the filesystem misses — the
/// embedded-archive hook. Filesystem always wins when the path resolves.
pub trait ModuleSource {
    fn read(&self, rel: &str) -> Option<String>;
}

/// A variable operation requested by script code, applied by the session
/// runtime after the current execution finishes.
#[derive(Debug)]
pub enum VarOp {
    CreateApp(Value),
    Create {
        parent: Value,
        value: Value,
        props: Vec<(String, String)>,
    },
    Destroy(VarTarget),
}

#[derive(Debug)]
pub enum VarTarget {
    Id(u32),
    Object(Value),
}

struct ProtoEntry {
    record: RecordRef,
    /// Keys of the stored init, including tracked-nil (`EMPTY`) keys.
    schema: Vec<String>,
}

struct Mutation {
    name: String,
    record: RecordRef,
    removed: Vec<String>,
}

/// Registrations made while a module load is the current mark.
#[derive(Default)]
struct ModuleMark {
    protos: Vec<String>,
    presenters: Vec<String>,
    wrappers: Vec<String>,
}

pub struct ModuleEntry {
    canonical: Option<String>,
    dir: PathBuf,
    protos: Vec<String>,
    presenters: Vec<String>,
    wrappers: Vec<String>,
    value: Value,
}

impl ModuleEntry {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

pub struct ScriptSession {
    globals: EnvRef,
    session_record: RecordRef,
    root: PathBuf,
    protos: HashMap<String, ProtoEntry>,
    /// Prototypes whose owning module unloaded. A re-declaration under the
    /// same name revives the entry — same record identity — so live
    /// instances migrate through the mutation queue instead of being
    /// stranded on an orphaned record.
    retired: HashMap<String, ProtoEntry>,
    instances: HashMap<String, Vec<WeakRecord>>,
    mutations: VecDeque<Mutation>,
    loaded: HashMap<String, ModuleEntry>,
    name_to_key: HashMap<String, String>,
    current_module: Option<ModuleMark>,
    load_depth: usize,
    module_source: Option<Box<dyn ModuleSource>>,
    var_ops: Vec<VarOp>,
    standard_vars: HashMap<String, Value>,
    presenters: HashMap<String, RecordRef>,
    script_wrappers: HashMap<String, Value>,
    on_unload: Option<Rc<dyn Fn(&str)>>,
}

impl ScriptSession {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let globals = Env::root();
        let mut rec = Record::default();
        rec.set("reloading", Value::Bool(false));
        let session_record = RecordRef::new(rec);
        let mut s = Self {
            globals,
            session_record,
            root: root.into(),
            protos: HashMap::new(),
            retired: HashMap::new(),
            instances: HashMap::new(),
            mutations: VecDeque::new(),
            loaded: HashMap::new(),
            name_to_key: HashMap::new(),
            current_module: None,
            load_depth: 0,
            module_source: None,
            var_ops: Vec::new(),
            standard_vars: HashMap::new(),
            presenters: HashMap::new(),
            script_wrappers: HashMap::new(),
            on_unload: None,
        };
        s.install_builtins();
        s
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn set_module_source(&mut self, source: Box<dyn ModuleSource>) {
        self.module_source = Some(source);
    }

    /// Cleanup callback invoked with the tracking key when a module unloads,
    /// so hot-loader state tied to the path can be released.
    pub fn set_unload_hook(&mut self, hook: Rc<dyn Fn(&str)>) {
        self.on_unload = Some(hook);
    }

    pub fn set_reloading(&mut self, reloading: bool) {
        self.session_record.set("reloading", Value::Bool(reloading));
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        Env::get(&self.globals, name)
    }

    pub fn define_global(&mut self, name: &str, value: Value) {
        Env::define(&self.globals, name, value);
    }

    pub fn session_wrapper(&self, name: &str) -> Option<Value> {
        self.script_wrappers.get(name).cloned()
    }

    pub fn standard_var(&self, name: &str) -> Option<Value> {
        self.standard_vars.get(name).cloned()
    }

    /// Setup-time registration of an `@name` standard variable.
    pub fn register_standard_var(&mut self, name: &str, value: Value) {
        self.standard_vars.insert(name.to_string(), value);
    }

    pub fn drain_var_ops(&mut self) -> Vec<VarOp> {
        std::mem::take(&mut self.var_ops)
    }

    // ---------------------------------------------------------------------
    // Prototypes and instances
    // ---------------------------------------------------------------------

    pub fn prototype(
        &mut self,
        name: &str,
        init: Option<Value>,
        base: Option<Value>,
    ) -> Result<Value, ScriptError> {
        let init_fields: Vec<(String, Value)> = match init {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Record(rec)) => rec
                .borrow()
                .fields()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            Some(other) => {
                return Err(ScriptError::Runtime(format!(
                    "prototype init must be a record, got {}",
                    other.kind()
                )));
            }
        };
        let schema: Vec<String> = init_fields.iter().map(|(k, _)| k.clone()).collect();
        let base_rec = self.resolve_base(name, base)?;

        if self.protos.contains_key(name) {
            return self.mutate_prototype(name, init_fields, schema, base_rec);
        }
        // A retired prototype revives under its old record identity: hot
        // reload then migrates its live instances like any re-declaration.
        if let Some(entry) = self.retired.remove(name) {
            self.protos.insert(name.to_string(), entry);
            let result = self.mutate_prototype(name, init_fields, schema, base_rec)?;
            if !name.contains('.')
                && let Value::Record(record) = &result
            {
                Env::define(&self.globals, name, Value::Record(record.clone()));
            }
            if let Some(mark) = &mut self.current_module {
                mark.protos.push(name.to_string());
            }
            return Ok(result);
        }

        let mut rec = Record::default();
        rec.set_type_name(Some(Rc::from(name)));
        for (k, v) in &init_fields {
            if !matches!(v, Value::Empty) {
                rec.set(k, v.clone());
            }
        }
        rec.set_proto(base_rec);
        let record = RecordRef::new(rec);
        self.protos.insert(
            name.to_string(),
            ProtoEntry {
                record: record.clone(),
                schema,
            },
        );
        if !name.contains('.') {
            Env::define(&self.globals, name, Value::Record(record.clone()));
        }
        if let Some(mark) = &mut self.current_module {
            mark.protos.push(name.to_string());
        }
        debug!(target: "script", proto = name, "prototype_registered");
        Ok(Value::Record(record))
    }

    /// Re-declaration with a changed init: update the live record in place
    /// (identity preserved, so existing instances stay valid) and queue the
    /// removed keys for the post-load instance migration.
    fn mutate_prototype(
        &mut self,
        name: &str,
        init_fields: Vec<(String, Value)>,
        schema: Vec<String>,
        base_rec: Option<RecordRef>,
    ) -> Result<Value, ScriptError> {
        let entry = self.protos.get_mut(name).expect("caller checked presence");
        let removed: Vec<String> = entry
            .schema
            .iter()
            .filter(|k| !schema.contains(k))
            .cloned()
            .collect();
        let record = entry.record.clone();
        for (k, v) in &init_fields {
            if matches!(v, Value::Empty) {
                record.borrow_mut().remove(k);
            } else {
                record.set(k, v.clone());
            }
        }
        for k in &removed {
            record.borrow_mut().remove(k);
        }
        if base_rec.is_some() {
            record.borrow_mut().set_proto(base_rec);
        }
        entry.schema = schema;
        debug!(
            target: "script",
            proto = name,
            removed = removed.len(),
            "prototype_updated"
        );
        self.mutations.push_back(Mutation {
            name: name.to_string(),
            record: record.clone(),
            removed,
        });
        Ok(Value::Record(record))
    }

    fn resolve_base(
        &self,
        name: &str,
        base: Option<Value>,
    ) -> Result<Option<RecordRef>, ScriptError> {
        match base {
            Some(Value::Record(rec)) => Ok(Some(rec)),
            Some(Value::Str(base_name)) => self
                .protos
                .get(&*base_name)
                .map(|e| Some(e.record.clone()))
                .ok_or_else(|| {
                    ScriptError::Runtime(format!("unknown base prototype {base_name:?}"))
                }),
            None | Some(Value::Null) => {
                // Implicit Object base for everything but Object itself.
                if name != "Object"
                    && let Some(entry) = self.protos.get("Object")
                {
                    Ok(Some(entry.record.clone()))
                } else {
                    Ok(None)
                }
            }
            Some(other) => Err(ScriptError::Runtime(format!(
                "prototype base must be a record or name, got {}",
                other.kind()
            ))),
        }
    }

    /// Attach a prototype to an instance (fresh when absent) and track it by
    /// weak reference.
    pub fn create(
        &mut self,
        proto: Value,
        instance: Option<Value>,
    ) -> Result<Value, ScriptError> {
        let proto_rec = match proto {
            Value::Record(rec) => rec,
            Value::Str(name) => self
                .protos
                .get(&*name)
                .map(|e| e.record.clone())
                .ok_or_else(|| ScriptError::Runtime(format!("unknown prototype {name:?}")))?,
            other => {
                return Err(ScriptError::Runtime(format!(
                    "create expects a prototype, got {}",
                    other.kind()
                )));
            }
        };
        let inst = match instance {
            None | Some(Value::Null) => RecordRef::new(Record::default()),
            Some(Value::Record(rec)) => rec,
            Some(other) => {
                return Err(ScriptError::Runtime(format!(
                    "create instance must be a record, got {}",
                    other.kind()
                )));
            }
        };
        inst.borrow_mut().set_proto(Some(proto_rec.clone()));
        if let Some(name) = proto_rec.borrow().own_type_name() {
            let entries = self.instances.entry(name.to_string()).or_default();
            compact(entries);
            entries.push(inst.downgrade());
        }
        Ok(Value::Record(inst))
    }

    /// Live instances of a prototype, compacting dead weak entries in place.
    pub fn instances_of(&mut self, name: &str) -> Vec<RecordRef> {
        let Some(entries) = self.instances.get_mut(name) else {
            return Vec::new();
        };
        compact(entries);
        entries.iter().filter_map(|w| w.upgrade()).collect()
    }

    /// Forget a prototype (and, when cascading, its dotted children). Live
    /// instances keep dispatching through the record they already hold; a
    /// later declaration under the same name starts from a fresh record.
    pub fn remove_prototype(&mut self, name: &str, cascade: bool) -> bool {
        let found = !self.each_prototype_named(name, cascade, |session, victim| {
            session.protos.remove(victim);
            session.retired.remove(victim);
            session.instances.remove(victim);
            if !victim.contains('.') {
                Env::remove(&session.globals, victim);
            }
            debug!(target: "script", proto = %victim, "prototype_removed");
        })
        .is_empty();
        found
    }

    /// Module-unload variant: the registry forgets the name but the entry is
    /// kept aside so a reload can revive it with identity intact.
    fn retire_prototype(&mut self, name: &str, cascade: bool) {
        self.each_prototype_named(name, cascade, |session, victim| {
            if let Some(entry) = session.protos.remove(victim) {
                session.retired.insert(victim.to_string(), entry);
            }
            if !victim.contains('.') {
                Env::remove(&session.globals, victim);
            }
            debug!(target: "script", proto = %victim, "prototype_retired");
        });
    }

    /// Apply `f` to `name` and, when cascading, every dotted child of it.
    /// Returns the names visited.
    fn each_prototype_named(
        &mut self,
        name: &str,
        cascade: bool,
        mut f: impl FnMut(&mut Self, &str),
    ) -> Vec<String> {
        let mut victims: Vec<String> = Vec::new();
        if self.protos.contains_key(name) || self.retired.contains_key(name) {
            victims.push(name.to_string());
        }
        if cascade {
            let prefix = format!("{name}.");
            victims.extend(
                self.protos
                    .keys()
                    .chain(self.retired.keys())
                    .filter(|k| k.starts_with(&prefix))
                    .cloned(),
            );
        }
        victims.sort_unstable();
        victims.dedup();
        for victim in &victims {
            f(self, victim);
        }
        victims
    }

    pub fn has_prototype(&self, name: &str) -> bool {
        self.protos.contains_key(name)
    }

    pub fn prototype_record(&self, name: &str) -> Option<RecordRef> {
        self.protos.get(name).map(|e| e.record.clone())
    }

    /// Drain the mutation queue in declaration order: per entry, per live
    /// instance, run the prototype's `mutate` hook (failures are isolated),
    /// then drop the removed keys from the instance.
    pub fn drain_mutations(&mut self) {
        while let Some(m) = self.mutations.pop_front() {
            let live = self.instances_of(&m.name);
            let hook = m.record.lookup("mutate");
            for inst in live {
                if let Some(hook) = &hook
                    && matches!(hook, Value::Func(_))
                    && let Err(err) = Interp::new(self).call_value(
                        hook,
                        Some(&Value::Record(inst.clone())),
                        Vec::new(),
                    )
                {
                    warn!(
                        target: "script",
                        proto = %m.name,
                        %err,
                        "mutate_hook_failed"
                    );
                }
                for key in &m.removed {
                    inst.borrow_mut().remove(key);
                }
            }
        }
    }

    pub fn pending_mutations(&self) -> usize {
        self.mutations.len()
    }

    // ---------------------------------------------------------------------
    // Presenters and wrappers
    // ---------------------------------------------------------------------

    pub fn register_presenter(&mut self, name: &str, proto: RecordRef) {
        self.presenters.insert(name.to_string(), proto);
        if let Some(mark) = &mut self.current_module {
            mark.presenters.push(name.to_string());
        }
    }

    pub fn register_wrapper_ctor(&mut self, name: &str, ctor: Value) {
        self.script_wrappers.insert(name.to_string(), ctor);
        if let Some(mark) = &mut self.current_module {
            mark.wrappers.push(name.to_string());
        }
    }

    /// Build a presenter instance for a ViewList slot: a fresh instance of
    /// the registered presenter type (or same-named prototype) with
    /// `baseItem` attached and the optional `init` hook run.
    pub fn instantiate_presenter(
        &mut self,
        type_name: &str,
        base: &Value,
    ) -> Result<Value, ScriptError> {
        let proto = self
            .presenters
            .get(type_name)
            .cloned()
            .or_else(|| self.protos.get(type_name).map(|e| e.record.clone()))
            .ok_or_else(|| {
                ScriptError::Runtime(format!("presenter type {type_name:?} is not registered"))
            })?;
        let inst = self.create(Value::Record(proto), None)?;
        if let Value::Record(rec) = &inst {
            rec.set("baseItem", base.clone());
            if let Some(hook) = rec.lookup("init")
                && matches!(hook, Value::Func(_))
            {
                Interp::new(self).call_value(&hook, Some(&inst), vec![base.clone()])?;
            }
        }
        Ok(inst)
    }

    // ---------------------------------------------------------------------
    // Calls
    // ---------------------------------------------------------------------

    /// Invoke a function value with an optional receiver. Used by the path
    /// resolver's call host and by wrapper hooks.
    pub fn call_function(
        &mut self,
        func: &FuncRef,
        recv: Option<&Value>,
        args: Vec<Value>,
    ) -> Result<Value, ScriptError> {
        let value = Value::Func(func.clone());
        Interp::new(self).call_value(&value, recv, args)
    }

    /// Evaluate source directly against the globals (tests, diagnostics).
    pub fn eval_source(&mut self, name: &str, source: &str) -> Result<Value, ScriptError> {
        let stmts = parse(name, source)?;
        let globals = Rc::clone(&self.globals);
        let result = Interp::new(self).exec_top(&stmts, &globals);
        if self.load_depth == 0 {
            self.drain_mutations();
        }
        result
    }

    // ---------------------------------------------------------------------
    // Modules
    // ---------------------------------------------------------------------

    /// Root-relative, lexically normalized identity of a script file. Reload
    /// routes events through symlink paths, so the key of a symlinked module
    /// is the symlink's own relative path.
    pub fn tracking_key(&self, path: &Path) -> String {
        let norm = normalize(path);
        let root = normalize(&self.root);
        let rel = norm.strip_prefix(&root).unwrap_or(&norm);
        rel.to_string_lossy().replace('\\', "/")
    }

    pub fn is_loaded(&self, key: &str) -> bool {
        self.loaded.contains_key(key)
    }

    pub fn loaded_keys(&self) -> Vec<String> {
        self.loaded.keys().cloned().collect()
    }

    pub fn module(&self, key: &str) -> Option<&ModuleEntry> {
        self.loaded.get(key)
    }

    /// `require(name)`: session-wide load table keyed by canonical name and
    /// tracking key; executes the module body exactly once.
    pub fn require(&mut self, name: &str) -> Result<Value, ScriptError> {
        let rel = if name.ends_with(&format!(".{SCRIPT_EXT}")) {
            name.to_string()
        } else {
            format!("{name}.{SCRIPT_EXT}")
        };
        let path = self.root.join(&rel);
        let key = self.tracking_key(&path);
        if let Some(k) = self.name_to_key.get(name)
            && let Some(entry) = self.loaded.get(k)
        {
            return Ok(entry.value.clone());
        }
        if let Some(entry) = self.loaded.get(&key) {
            return Ok(entry.value.clone());
        }
        self.load_inner(Some(name.to_string()), path, key)
    }

    /// Load a file by path (entry points, hot reload). Idempotent per
    /// tracking key.
    pub fn load_file(&mut self, path: &Path) -> Result<Value, ScriptError> {
        let key = self.tracking_key(path);
        if let Some(entry) = self.loaded.get(&key) {
            return Ok(entry.value.clone());
        }
        self.load_inner(None, path.to_path_buf(), key)
    }

    fn load_inner(
        &mut self,
        canonical: Option<String>,
        path: PathBuf,
        key: String,
    ) -> Result<Value, ScriptError> {
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(_) => self
                .module_source
                .as_ref()
                .and_then(|ms| ms.read(&key))
                .ok_or_else(|| ScriptError::ModuleNotFound(key.clone()))?,
        };
        let dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.root.clone());

        // Pre-mark as loaded so require cycles short-circuit instead of
        // recursing; a failed load un-marks below.
        self.loaded.insert(
            key.clone(),
            ModuleEntry {
                canonical: canonical.clone(),
                dir,
                protos: Vec::new(),
                presenters: Vec::new(),
                wrappers: Vec::new(),
                value: Value::Bool(true),
            },
        );
        if let Some(name) = &canonical {
            self.name_to_key.insert(name.clone(), key.clone());
        }

        let prev_mark = self.current_module.replace(ModuleMark::default());
        self.load_depth += 1;
        let result = parse(&key, &source).and_then(|stmts| {
            let scope = Env::child(&self.globals);
            Interp::new(self).exec_top(&stmts, &scope)
        });
        self.load_depth -= 1;
        let mark = self
            .current_module
            .take()
            .expect("module mark set above");
        self.current_module = prev_mark;

        match result {
            Ok(value) => {
                if let Some(entry) = self.loaded.get_mut(&key) {
                    entry.protos = mark.protos;
                    entry.presenters = mark.presenters;
                    entry.wrappers = mark.wrappers;
                    entry.value = value.clone();
                }
                if self.load_depth == 0 {
                    self.drain_mutations();
                }
                info!(target: "script", module = %key, "module_loaded");
                Ok(value)
            }
            Err(err) => {
                self.loaded.remove(&key);
                if let Some(name) = &canonical {
                    self.name_to_key.remove(name);
                }
                for proto in &mark.protos {
                    self.remove_prototype(proto, true);
                }
                for presenter in &mark.presenters {
                    self.presenters.remove(presenter);
                }
                for wrapper in &mark.wrappers {
                    self.script_wrappers.remove(wrapper);
                }
                warn!(target: "script", module = %key, %err, "module_load_failed");
                Err(err)
            }
        }
    }

    /// Reverse everything a module registered and forget it, so the next
    /// load starts clean.
    pub fn unload_module(&mut self, key: &str) -> bool {
        let Some(entry) = self.loaded.remove(key) else {
            return false;
        };
        if let Some(name) = &entry.canonical {
            self.name_to_key.remove(name);
        }
        for proto in &entry.protos {
            self.retire_prototype(proto, true);
        }
        for presenter in &entry.presenters {
            self.presenters.remove(presenter);
        }
        for wrapper in &entry.wrappers {
            self.script_wrappers.remove(wrapper);
        }
        if let Some(hook) = self.on_unload.clone() {
            hook(key);
        }
        info!(target: "script", module = key, "module_unloaded");
        true
    }

    /// Unload every module whose tracking key sits under a directory prefix.
    pub fn unload_directory(&mut self, prefix: &str) -> usize {
        let prefix = prefix.trim_end_matches('/');
        let victims: Vec<String> = self
            .loaded
            .keys()
            .filter(|k| {
                k.starts_with(prefix)
                    && (k.len() == prefix.len() || k.as_bytes()[prefix.len()] == b'/')
            })
            .cloned()
            .collect();
        let count = victims.len();
        for key in victims {
            self.unload_module(&key);
        }
        count
    }

    // ---------------------------------------------------------------------
    // Builtins
    // ---------------------------------------------------------------------

    fn install_builtins(&mut self) {
        let globals = Rc::clone(&self.globals);
        Env::define(&globals, "EMPTY", Value::Empty);
        Env::define(
            &globals,
            "session",
            Value::Record(self.session_record.clone()),
        );

        let natives: Vec<(&str, NativeImpl)> = vec![
            (
                "prototype",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let name = str_arg(args, 0, "prototype")?;
                    it.session
                        .prototype(&name, args.get(1).cloned(), args.get(2).cloned())
                }),
            ),
            (
                "create",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let proto = args
                        .first()
                        .cloned()
                        .ok_or_else(|| arity("create", 1, args.len()))?;
                    it.session.create(proto, args.get(1).cloned())
                }),
            ),
            (
                "require",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let name = str_arg(args, 0, "require")?;
                    it.session.require(&name)
                }),
            ),
            (
                "removePrototype",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let name = str_arg(args, 0, "removePrototype")?;
                    let cascade = args.get(1).map(Value::truthy).unwrap_or(false);
                    Ok(Value::Bool(it.session.remove_prototype(&name, cascade)))
                }),
            ),
            (
                "unloadModule",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let key = str_arg(args, 0, "unloadModule")?;
                    Ok(Value::Bool(it.session.unload_module(&key)))
                }),
            ),
            (
                "unloadDirectory",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let key = str_arg(args, 0, "unloadDirectory")?;
                    Ok(Value::Int(it.session.unload_directory(&key) as i64))
                }),
            ),
            (
                "createAppVariable",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let value = args
                        .first()
                        .cloned()
                        .ok_or_else(|| arity("createAppVariable", 1, args.len()))?;
                    it.session.var_ops.push(VarOp::CreateApp(value));
                    Ok(Value::Int(1))
                }),
            ),
            (
                "createVariable",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let parent = args
                        .first()
                        .cloned()
                        .ok_or_else(|| arity("createVariable", 2, args.len()))?;
                    let value = args
                        .get(1)
                        .cloned()
                        .ok_or_else(|| arity("createVariable", 2, args.len()))?;
                    let props = match args.get(2) {
                        None | Some(Value::Null) => Vec::new(),
                        Some(Value::Record(rec)) => rec
                            .borrow()
                            .fields()
                            .map(|(k, v)| (k.to_string(), format!("{v}")))
                            .collect(),
                        Some(other) => {
                            return Err(ScriptError::Runtime(format!(
                                "createVariable properties must be a record, got {}",
                                other.kind()
                            )));
                        }
                    };
                    it.session.var_ops.push(VarOp::Create {
                        parent,
                        value,
                        props,
                    });
                    Ok(Value::Null)
                }),
            ),
            (
                "destroyVariable",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let target = match args.first() {
                        Some(Value::Int(id)) => VarTarget::Id(*id as u32),
                        Some(v @ Value::Record(_)) => VarTarget::Object(v.clone()),
                        other => {
                            return Err(ScriptError::Runtime(format!(
                                "destroyVariable expects an id or object, got {:?}",
                                other.map(Value::kind)
                            )));
                        }
                    };
                    it.session.var_ops.push(VarOp::Destroy(target));
                    Ok(Value::Null)
                }),
            ),
            (
                "registerPresenter",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let name = str_arg(args, 0, "registerPresenter")?;
                    match args.get(1) {
                        Some(Value::Record(rec)) => {
                            it.session.register_presenter(&name, rec.clone());
                            Ok(Value::Null)
                        }
                        other => Err(ScriptError::Runtime(format!(
                            "registerPresenter expects a prototype record, got {:?}",
                            other.map(Value::kind)
                        ))),
                    }
                }),
            ),
            (
                "registerWrapper",
                Rc::new(|it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let name = str_arg(args, 0, "registerWrapper")?;
                    let ctor = args
                        .get(1)
                        .cloned()
                        .ok_or_else(|| arity("registerWrapper", 2, args.len()))?;
                    it.session.register_wrapper_ctor(&name, ctor);
                    Ok(Value::Null)
                }),
            ),
            (
                "log",
                Rc::new(|_it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let message = args
                        .iter()
                        .map(|v| v.to_string())
                        .collect::<Vec<_>>()
                        .join(" ");
                    info!(target: "script.user", "{message}");
                    Ok(Value::Null)
                }),
            ),
            (
                "jsonEncode",
                Rc::new(|_it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let value = args
                        .first()
                        .ok_or_else(|| arity("jsonEncode", 1, args.len()))?;
                    let json = value
                        .to_json()
                        .map_err(|e| ScriptError::Runtime(e.to_string()))?;
                    Ok(Value::str(json.to_string()))
                }),
            ),
            (
                "jsonDecode",
                Rc::new(|_it: &mut Interp<'_>, _recv, args: &[Value]| {
                    let text = str_arg(args, 0, "jsonDecode")?;
                    let json: serde_json::Value = serde_json::from_str(&text)
                        .map_err(|e| ScriptError::Runtime(format!("invalid JSON: {e}")))?;
                    Ok(Value::from_json(&json))
                }),
            ),
            (
                "len",
                Rc::new(|_it: &mut Interp<'_>, _recv, args: &[Value]| match args.first() {
                    Some(Value::List(list)) => Ok(Value::Int(list.len() as i64)),
                    Some(Value::Str(s)) => Ok(Value::Int(s.chars().count() as i64)),
                    Some(Value::Record(rec)) => Ok(Value::Int(rec.borrow().len() as i64)),
                    other => Err(ScriptError::Runtime(format!(
                        "len expects a list, string, or record, got {:?}",
                        other.map(Value::kind)
                    ))),
                }),
            ),
            (
                "push",
                Rc::new(|_it: &mut Interp<'_>, _recv, args: &[Value]| {
                    match (args.first(), args.get(1)) {
                        (Some(Value::List(list)), Some(v)) => {
                            list.push(v.clone());
                            Ok(Value::Null)
                        }
                        _ => Err(ScriptError::Runtime(
                            "push expects a list and a value".into(),
                        )),
                    }
                }),
            ),
        ];
        for (name, imp) in natives {
            Env::define(&globals, name, native_fn(name, imp));
        }
    }
}

fn str_arg(args: &[Value], idx: usize, what: &str) -> Result<String, ScriptError> {
    match args.get(idx) {
        Some(Value::Str(s)) => Ok(s.to_string()),
        other => Err(ScriptError::Runtime(format!(
            "{what} expects a string argument, got {:?}",
            other.map(Value::kind)
        ))),
    }
}

fn arity(name: &str, expected: usize, got: usize) -> ScriptError {
    ScriptError::Runtime(format!("{name} expects {expected} argument(s), got {got}"))
}

/// In-place two-finger sweep dropping dead weak entries.
fn compact(entries: &mut Vec<WeakRecord>) {
    let mut write = 0;
    for read in 0..entries.len() {
        if entries[read].is_alive() {
            entries.swap(write, read);
            write += 1;
        }
    }
    entries.truncate(write);
}

/// Lexical normalization: fold `.` and `..` components without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}
