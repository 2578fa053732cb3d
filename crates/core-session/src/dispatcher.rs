//! Process-wide session dispatcher.
//!
//! Owns one VM worker per active session and routes inbound batches, hot
//! reloads, and viewdef refreshes to them. Emission order per session is
//! fixed: inbound handling, change sweep, outbound send. Across sessions
//! there are no ordering guarantees.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use core_script::Worker;
use core_viewdef::ViewdefManager;
use core_wrap::Registries;
use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use crate::runtime::SessionRuntime;
use crate::{Inbound, Outbound, SessionError};

/// One session's sweep result, delivered on the dispatcher's outbound
/// channel.
#[derive(Debug)]
pub struct SessionOutput {
    pub session_id: String,
    pub records: Vec<Outbound>,
}

pub struct Dispatcher {
    registries: Arc<Registries>,
    viewdefs: Arc<ViewdefManager>,
    outbound: Sender<SessionOutput>,
    queue_depth: usize,
    sessions: Mutex<HashMap<String, Arc<Worker<SessionRuntime>>>>,
}

impl Dispatcher {
    pub fn new(
        registries: Arc<Registries>,
        viewdefs: Arc<ViewdefManager>,
        outbound: Sender<SessionOutput>,
        queue_depth: usize,
    ) -> Self {
        Self {
            registries,
            viewdefs,
            outbound,
            queue_depth,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn viewdefs(&self) -> &Arc<ViewdefManager> {
        &self.viewdefs
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Spawn a session worker owning its runtime (tracker + script VM).
    pub fn create_session(
        &self,
        id: &str,
        script_root: impl Into<PathBuf>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().expect("session table poisoned");
        if sessions.contains_key(id) {
            return Err(SessionError::DuplicateSession(id.to_string()));
        }
        let registries = Arc::clone(&self.registries);
        let viewdefs = Arc::clone(&self.viewdefs);
        let session_id = id.to_string();
        let root = script_root.into();
        let worker = Worker::spawn(
            format!("weft-session-{id}"),
            self.queue_depth,
            move || SessionRuntime::new(session_id, root, registries, viewdefs),
        )
        .map_err(|err| SessionError::Spawn(err.to_string()))?;
        sessions.insert(id.to_string(), Arc::new(worker));
        info!(target: "session", session = id, "session_created");
        Ok(())
    }

    /// Drop a session: the worker drains in-flight jobs and its state (the
    /// arena) drops with it. Absent ids are a no-op.
    pub fn destroy_session(&self, id: &str) {
        let removed = self
            .sessions
            .lock()
            .expect("session table poisoned")
            .remove(id);
        if removed.is_some() {
            self.viewdefs.drop_session(id);
            info!(target: "session", session = id, "session_destroyed");
        }
    }

    fn worker(&self, id: &str) -> Result<Arc<Worker<SessionRuntime>>, SessionError> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownSession(id.to_string()))
    }

    /// Load the session's entry-point script, then sweep and emit.
    pub fn boot_session(&self, id: &str, main: PathBuf) -> Result<(), SessionError> {
        let worker = self.worker(id)?;
        worker.submit(move |rt| rt.boot(&main))??;
        self.sweep_and_emit(id, &worker)?;
        Ok(())
    }

    /// Register an `@name` standard variable for one session (setup-time).
    pub fn define_standard(
        &self,
        id: &str,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), SessionError> {
        let worker = self.worker(id)?;
        let name = name.to_string();
        worker.submit(move |rt| rt.define_standard(&name, &value))?;
        Ok(())
    }

    /// Apply one inbound batch, then sweep and emit. Per-op failures are
    /// logged and returned; the batch continues past them.
    pub fn handle_batch(
        &self,
        id: &str,
        ops: Vec<Inbound>,
    ) -> Result<Vec<SessionError>, SessionError> {
        let worker = self.worker(id)?;
        let failures = worker.submit(move |rt| {
            let mut failures = Vec::new();
            for op in ops {
                if let Err(err) = rt.handle_inbound(op) {
                    warn!(target: "session", %err, "inbound_op_failed");
                    failures.push(err);
                }
            }
            failures
        })?;
        self.sweep_and_emit(id, &worker)?;
        Ok(failures)
    }

    /// Run one sweep for a session and emit its records.
    pub fn sweep_session(&self, id: &str) -> Result<(), SessionError> {
        let worker = self.worker(id)?;
        self.sweep_and_emit(id, &worker)
    }

    /// Evaluate source inside the session (development transport); sweeps
    /// afterwards so script mutations reach the frontend.
    pub fn run_source(&self, id: &str, name: &str, source: &str) -> Result<String, SessionError> {
        let worker = self.worker(id)?;
        let name = name.to_string();
        let source = source.to_string();
        let shown = worker.submit(move |rt| {
            rt.run_source(&name, &source).map(|value| value.to_string())
        })??;
        self.sweep_and_emit(id, &worker)?;
        Ok(shown)
    }

    fn sweep_and_emit(
        &self,
        id: &str,
        worker: &Arc<Worker<SessionRuntime>>,
    ) -> Result<(), SessionError> {
        let records = worker.submit(|rt| rt.sweep())?;
        self.emit(id, records);
        Ok(())
    }

    fn emit(&self, id: &str, records: Vec<Outbound>) {
        if records.is_empty() {
            return;
        }
        debug!(target: "session", session = id, count = records.len(), "outbound_emit");
        if self
            .outbound
            .send(SessionOutput {
                session_id: id.to_string(),
                records,
            })
            .is_err()
        {
            debug!(target: "session", session = id, "outbound_receiver_gone");
        }
    }

    /// Script watcher entry point: reload the file in every session that has
    /// it loaded, then refresh those sessions.
    pub fn script_file_changed(&self, path: &Path) {
        for id in self.session_ids() {
            let Ok(worker) = self.worker(&id) else {
                continue;
            };
            let path = path.to_path_buf();
            match worker.submit(move |rt| rt.reload_script(&path)) {
                Ok(true) => {
                    if let Err(err) = self.sweep_and_emit(&id, &worker) {
                        warn!(target: "script.reload", session = id.as_str(), %err, "post_reload_sweep_failed");
                    }
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(target: "script.reload", session = id.as_str(), %err, "reload_dispatch_failed");
                }
            }
        }
    }

    /// Viewdef watcher entry point: refresh the template, then sweep every
    /// session so delivery watermarks decide who gets the new content.
    pub fn viewdef_file_changed(&self, path: &Path) {
        if let Err(err) = self.viewdefs.note_file_changed(path) {
            warn!(target: "viewdef", %err, "viewdef_refresh_failed");
            return;
        }
        for id in self.session_ids() {
            if let Err(err) = self.sweep_session(&id) {
                warn!(target: "viewdef", session = id.as_str(), %err, "viewdef_push_failed");
            }
        }
    }

    /// Drop every session worker (joins their threads).
    pub fn shutdown(&self) {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .clear();
        info!(target: "session", "dispatcher_shutdown");
    }
}
