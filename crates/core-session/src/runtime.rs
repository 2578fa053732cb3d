//! Per-session state living on the VM worker thread.

use std::path::Path;
use std::sync::Arc;

use core_path::{CallHost, PathError};
use core_script::{ScriptSession, VarOp, VarTarget};
use core_track::{APP_VARIABLE, Change, Priority, Tracker};
use core_value::{FuncRef, Value};
use core_wrap::{Registries, SessionRegistrations, WrapError, WrapHost};
use core_viewdef::ViewdefManager;
use tracing::{debug, info, warn};

use crate::{Inbound, Outbound, SessionError, props_to_entries};

/// How many change-detection rounds one sweep may run before giving the
/// frontend what we have; wrappers that keep raising the resweep flag get
/// their cascades picked up next batch.
const MAX_SWEEP_ROUNDS: usize = 4;

/// Everything one session owns. `!Send` by design — the dispatcher only
/// touches it through worker jobs.
pub struct SessionRuntime {
    id: String,
    tracker: Tracker,
    script: ScriptSession,
    session_regs: SessionRegistrations,
    viewdefs: Arc<ViewdefManager>,
    resweep: bool,
}

/// Borrow of the script runtime (plus the resweep flag) handed to the
/// tracker: method-call segments and wrapper services dispatch through it.
struct Host<'a> {
    script: &'a mut ScriptSession,
    resweep: &'a mut bool,
}

impl CallHost for Host<'_> {
    fn invoke(
        &mut self,
        recv: &Value,
        func: &FuncRef,
        args: Vec<Value>,
    ) -> Result<Value, PathError> {
        self.script
            .call_function(func, Some(recv), args)
            .map_err(|err| PathError::CallFailed {
                name: func
                    .name()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "<anon>".into()),
                message: err.to_string(),
            })
    }

    fn standard_var(&mut self, name: &str) -> Option<Value> {
        self.script.standard_var(name)
    }
}

impl WrapHost for Host<'_> {
    fn instantiate_presenter(
        &mut self,
        type_name: &str,
        base: &Value,
    ) -> Result<Value, WrapError> {
        self.script
            .instantiate_presenter(type_name, base)
            .map_err(|err| WrapError::Script(err.to_string()))
    }

    fn request_resweep(&mut self) {
        *self.resweep = true;
    }

    fn script_global(&mut self, name: &str) -> Option<Value> {
        self.script.global(name)
    }

    fn session_wrapper_ctor(&mut self, name: &str) -> Option<Value> {
        self.script.session_wrapper(name)
    }

    fn invoke(
        &mut self,
        recv: &Value,
        func: &FuncRef,
        args: Vec<Value>,
    ) -> Result<Value, WrapError> {
        self.script
            .call_function(func, Some(recv), args)
            .map_err(|err| WrapError::Script(err.to_string()))
    }
}

impl SessionRuntime {
    pub fn new(
        id: String,
        script_root: impl Into<std::path::PathBuf>,
        registries: Arc<Registries>,
        viewdefs: Arc<ViewdefManager>,
    ) -> Self {
        Self {
            id,
            tracker: Tracker::new(registries),
            script: ScriptSession::new(script_root),
            session_regs: SessionRegistrations::default(),
            viewdefs,
            resweep: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn script_mut(&mut self) -> &mut ScriptSession {
        &mut self.script
    }

    /// Register an `@name` standard variable from JSON (setup-time).
    pub fn define_standard(&mut self, name: &str, value: &serde_json::Value) {
        self.script
            .register_standard_var(name, Value::from_json(value));
    }

    /// Load the session's entry-point script and apply the variable
    /// operations it queued.
    pub fn boot(&mut self, main: &Path) -> Result<(), SessionError> {
        self.script.load_file(main)?;
        self.apply_var_ops();
        info!(target: "session", session = %self.id, main = %main.display(), "session_booted");
        Ok(())
    }

    /// Run source against the session globals (tests, diagnostics) and
    /// apply queued variable operations.
    pub fn run_source(&mut self, name: &str, source: &str) -> Result<Value, SessionError> {
        let value = self.script.eval_source(name, source)?;
        self.apply_var_ops();
        Ok(value)
    }

    /// Apply variable operations queued by script builtins.
    fn apply_var_ops(&mut self) {
        let ops = self.script.drain_var_ops();
        for op in ops {
            let SessionRuntime {
                tracker,
                script,
                session_regs,
                resweep,
                ..
            } = self;
            let mut host = Host { script, resweep };
            let result = match op {
                VarOp::CreateApp(value) => {
                    tracker.create_app_variable(value);
                    Ok(())
                }
                VarOp::Create {
                    parent,
                    value,
                    props,
                } => {
                    let parent_id = match &parent {
                        Value::Int(id) => Some(*id as u32),
                        other => other.obj_key().and_then(|k| tracker.find_by_object(k)),
                    };
                    match parent_id {
                        Some(parent_id) => {
                            let entries: Vec<(&str, &str)> = props
                                .iter()
                                .map(|(k, v)| (k.as_str(), v.as_str()))
                                .collect();
                            tracker
                                .create_direct_variable(
                                    &mut host,
                                    session_regs,
                                    parent_id,
                                    value,
                                    &entries,
                                )
                                .map(|_| ())
                        }
                        None => {
                            warn!(target: "session", session = %self.id, "create_variable_unknown_parent");
                            Ok(())
                        }
                    }
                }
                VarOp::Destroy(target) => {
                    let id = match &target {
                        VarTarget::Id(id) => Some(*id),
                        VarTarget::Object(value) => {
                            value.obj_key().and_then(|k| tracker.find_by_object(k))
                        }
                    };
                    if let Some(id) = id {
                        tracker.destroy_variable(&mut host, id);
                    }
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!(target: "session", session = %self.id, %err, "script_var_op_failed");
            }
        }
    }

    /// Handle one inbound frontend operation. Resolver and tracker errors
    /// surface to the caller; the sweep happens separately.
    pub fn handle_inbound(&mut self, op: Inbound) -> Result<(), SessionError> {
        match op {
            Inbound::Create {
                id,
                parent_id,
                properties,
            } => {
                let entries = props_to_entries(&properties);
                if !entries.iter().any(|(k, _)| k == "path" || k.starts_with("path:")) {
                    return Err(SessionError::MissingPath);
                }
                let refs: Vec<(&str, &str)> = entries
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str()))
                    .collect();
                let SessionRuntime {
                    tracker,
                    script,
                    session_regs,
                    resweep,
                    ..
                } = self;
                let mut host = Host { script, resweep };
                tracker.create_variable(&mut host, session_regs, Some(id), parent_id, &refs)?;
                Ok(())
            }
            Inbound::Update {
                var_id,
                value,
                properties,
            } => {
                if let Some(props) = &properties {
                    let entries = props_to_entries(props);
                    let refs: Vec<(&str, &str)> = entries
                        .iter()
                        .map(|(k, v)| (k.as_str(), v.as_str()))
                        .collect();
                    self.tracker.set_properties(var_id, &refs)?;
                }
                if let Some(json) = value {
                    let type_name = properties
                        .as_ref()
                        .and_then(|p| p.get("type"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .or_else(|| {
                            self.tracker
                                .variable(var_id)
                                .and_then(|v| v.props().get("type"))
                                .map(str::to_string)
                        });
                    let SessionRuntime {
                        tracker,
                        script,
                        resweep,
                        ..
                    } = self;
                    let mut host = Host { script, resweep };
                    let decoded =
                        tracker.decode_inbound(&mut host, &json, type_name.as_deref())?;
                    tracker.set_value(&mut host, var_id, decoded)?;
                }
                Ok(())
            }
            Inbound::Destroy { var_id } => {
                let SessionRuntime {
                    tracker,
                    script,
                    resweep,
                    ..
                } = self;
                let mut host = Host { script, resweep };
                tracker.destroy_variable(&mut host, var_id);
                Ok(())
            }
        }
    }

    /// One full sweep: up to [`MAX_SWEEP_ROUNDS`] change-detection rounds
    /// (stopping once a round is clean and no wrapper raised the resweep
    /// flag), viewdef delta attachment, then materialized outbound records.
    pub fn sweep(&mut self) -> Vec<Outbound> {
        for round in 0..MAX_SWEEP_ROUNDS {
            self.resweep = false;
            let changed = {
                let SessionRuntime {
                    tracker,
                    script,
                    session_regs,
                    resweep,
                    ..
                } = self;
                let mut host = Host { script, resweep };
                tracker.detect_changes(&mut host, session_regs)
            };
            // Wrapper hooks may have queued script-side variable ops.
            self.apply_var_ops();
            if !changed && !self.resweep {
                break;
            }
            debug!(target: "session", session = %self.id, round, "resweep");
        }

        let new_types = self.tracker.take_new_types();
        let deltas = self.viewdefs.deltas_for_session(&self.id, &new_types);
        if !deltas.is_empty() {
            let mut batch = serde_json::Map::new();
            for (key, content) in deltas {
                batch.insert(key, serde_json::Value::String(content));
            }
            // Rides an existing change on variable 1 when one is pending,
            // otherwise synthesizes the high-priority structural change.
            self.tracker.push_change(Change {
                var_id: APP_VARIABLE,
                value: None,
                properties: vec![(
                    "viewdefs".to_string(),
                    serde_json::Value::Object(batch).to_string(),
                )],
                priority: Priority::High,
            });
        }

        let mut records: Vec<Outbound> = self
            .tracker
            .take_definitions()
            .into_iter()
            .map(|def| Outbound::ObjectDef {
                obj_id: def.id,
                type_name: def.type_name,
                fields: def.fields,
            })
            .collect();
        for change in self.tracker.take_changes() {
            let properties = if change.properties.is_empty() {
                None
            } else {
                let mut map = serde_json::Map::new();
                for (k, v) in change.properties {
                    map.insert(k, serde_json::Value::String(v));
                }
                Some(map)
            };
            records.push(Outbound::Update {
                var_id: change.var_id,
                value: change.value,
                properties,
            });
        }
        records
    }

    /// Hot-reload one script file: unload what its previous load registered,
    /// re-execute through the normal load path, and migrate instances. A
    /// failed reload logs and leaves the session serving.
    pub fn reload_script(&mut self, path: &Path) -> bool {
        let key = self.script.tracking_key(path);
        if !self.script.is_loaded(&key) {
            return false;
        }
        info!(target: "script.reload", session = %self.id, module = %key, "module_reload");
        self.script.set_reloading(true);
        self.script.unload_module(&key);
        match self.script.load_file(path) {
            Ok(_) => {
                self.apply_var_ops();
            }
            Err(err) => {
                warn!(target: "script.reload", session = %self.id, module = %key, %err, "module_reload_failed");
            }
        }
        self.script.set_reloading(false);
        true
    }
}
