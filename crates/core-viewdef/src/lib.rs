//! Viewdef store: HTML template fragments keyed by `TYPE.NAMESPACE`.
//!
//! Files named `<TYPE>.<NAMESPACE>.html` live in one directory; the filename
//! is the key and the content is the fragment — no other metadata. Delivery
//! is tracked per session against a monotonic revision (bumped whenever a
//! file's mtime or content moves), so an edited template is redelivered
//! exactly to the sessions that already received it, and a type's templates
//! are batch-loaded the first time change detection encounters the type.
//!
//! One mutex serializes the whole store; reads and writes are short and the
//! per-session state is only touched from that session's sweep and the
//! watcher's refresh.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

pub const VIEWDEF_EXT: &str = "html";

#[derive(Debug, Error)]
pub enum ViewdefError {
    #[error("failed to read viewdef {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{0:?} is not a viewdef file name")]
    BadName(PathBuf),
}

struct Template {
    content: String,
    mtime: Option<SystemTime>,
    revision: u64,
}

#[derive(Default)]
struct Inner {
    templates: HashMap<String, Template>,
    /// Per (session, template key): revision of the last send.
    sent: HashMap<(String, String), u64>,
    /// Types each session has encountered; scopes what gets delivered.
    seen_types: HashMap<String, HashSet<String>>,
    next_revision: u64,
}

/// Process-wide template store with per-session delivery state.
pub struct ViewdefManager {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

/// `contacts.Person.DEFAULT.html` → key `contacts.Person.DEFAULT`.
pub fn key_for_file(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{VIEWDEF_EXT}"))?;
    // A key needs a type and a namespace.
    stem.contains('.').then(|| stem.to_string())
}

/// Type portion of a key: everything before the final (namespace) segment.
pub fn type_of_key(key: &str) -> &str {
    key.rsplit_once('.').map(|(t, _)| t).unwrap_or(key)
}

impl ViewdefManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every template for a type by filename glob
    /// (`<TYPE>.<NAMESPACE>.html`), refreshing stale entries.
    pub fn load_type(&self, type_name: &str) {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        let prefix = format!("{type_name}.");
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(key) = key_for_file(&path) else {
                continue;
            };
            if type_of_key(&key) != type_name {
                continue;
            }
            debug_assert!(key.starts_with(&prefix));
            let mut inner = self.inner.lock().expect("viewdef store poisoned");
            if let Err(err) = refresh(&mut inner, &key, &path) {
                warn!(target: "viewdef", key = %key, %err, "viewdef_load_failed");
            }
        }
    }

    /// Re-read one file after a watcher event; sessions holding an older
    /// revision pick the change up on their next sweep.
    pub fn note_file_changed(&self, path: &Path) -> Result<(), ViewdefError> {
        let key = key_for_file(path).ok_or_else(|| ViewdefError::BadName(path.to_path_buf()))?;
        let mut inner = self.inner.lock().expect("viewdef store poisoned");
        refresh(&mut inner, &key, path)
    }

    /// Deltas for a session's sweep: register any newly encountered types
    /// (batch-loading their templates), then return every template of a seen
    /// type whose revision is past the session's send watermark.
    pub fn deltas_for_session(
        &self,
        session_id: &str,
        new_types: &[String],
    ) -> Vec<(String, String)> {
        for t in new_types {
            self.load_type(t);
        }
        let mut inner = self.inner.lock().expect("viewdef store poisoned");
        if !new_types.is_empty() {
            inner
                .seen_types
                .entry(session_id.to_string())
                .or_default()
                .extend(new_types.iter().cloned());
        }
        let Some(seen) = inner.seen_types.get(session_id).cloned() else {
            return Vec::new();
        };

        let mut due: Vec<(String, String, u64)> = Vec::new();
        for (key, template) in &inner.templates {
            if !seen.contains(type_of_key(key)) {
                continue;
            }
            let watermark = inner
                .sent
                .get(&(session_id.to_string(), key.clone()))
                .copied()
                .unwrap_or(0);
            if template.revision > watermark {
                due.push((key.clone(), template.content.clone(), template.revision));
            }
        }
        due.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, _, revision) in &due {
            inner
                .sent
                .insert((session_id.to_string(), key.clone()), *revision);
        }
        due.into_iter().map(|(k, c, _)| (k, c)).collect()
    }

    /// Whether a session has already received a template key.
    pub fn was_sent(&self, session_id: &str, key: &str) -> bool {
        self.inner
            .lock()
            .expect("viewdef store poisoned")
            .sent
            .contains_key(&(session_id.to_string(), key.to_string()))
    }

    pub fn drop_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().expect("viewdef store poisoned");
        inner.seen_types.remove(session_id);
        inner.sent.retain(|(sid, _), _| sid != session_id);
    }

    pub fn template_content(&self, key: &str) -> Option<String> {
        self.inner
            .lock()
            .expect("viewdef store poisoned")
            .templates
            .get(key)
            .map(|t| t.content.clone())
    }
}

fn refresh(inner: &mut Inner, key: &str, path: &Path) -> Result<(), ViewdefError> {
    let content = std::fs::read_to_string(path).map_err(|source| ViewdefError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
    match inner.templates.get_mut(key) {
        Some(existing) if existing.content == content && existing.mtime == mtime => {}
        Some(existing) => {
            existing.content = content;
            existing.mtime = mtime;
            inner.next_revision += 1;
            existing.revision = inner.next_revision;
            debug!(target: "viewdef", key, "viewdef_refreshed");
        }
        None => {
            inner.next_revision += 1;
            let revision = inner.next_revision;
            inner.templates.insert(
                key.to_string(),
                Template {
                    content,
                    mtime,
                    revision,
                },
            );
            debug!(target: "viewdef", key, "viewdef_loaded");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn manager() -> (tempfile::TempDir, ViewdefManager) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = ViewdefManager::new(dir.path());
        (dir, mgr)
    }

    #[test]
    fn filename_is_the_key() {
        assert_eq!(
            key_for_file(Path::new("/v/Contact.DEFAULT.html")).as_deref(),
            Some("Contact.DEFAULT")
        );
        assert_eq!(
            key_for_file(Path::new("contacts.Person.list-item.html")).as_deref(),
            Some("contacts.Person.list-item")
        );
        assert_eq!(type_of_key("contacts.Person.list-item"), "contacts.Person");
        // No namespace, or wrong extension: not a viewdef.
        assert!(key_for_file(Path::new("Contact.html")).is_none());
        assert!(key_for_file(Path::new("Contact.DEFAULT.txt")).is_none());
    }

    #[test]
    fn first_type_encounter_delivers_all_namespaces() {
        let (dir, mgr) = manager();
        fs::write(dir.path().join("Contact.DEFAULT.html"), "<div>d</div>").unwrap();
        fs::write(dir.path().join("Contact.list-item.html"), "<li>i</li>").unwrap();
        fs::write(dir.path().join("Other.DEFAULT.html"), "<p>o</p>").unwrap();

        let deltas = mgr.deltas_for_session("s1", &["Contact".into()]);
        let keys: Vec<&str> = deltas.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["Contact.DEFAULT", "Contact.list-item"]);

        // Nothing new on the next sweep.
        assert!(mgr.deltas_for_session("s1", &[]).is_empty());
    }

    #[test]
    fn edit_redelivers_only_to_sessions_that_saw_the_type() {
        let (dir, mgr) = manager();
        let path = dir.path().join("Contact.DEFAULT.html");
        fs::write(&path, "<div>v1</div>").unwrap();

        assert_eq!(mgr.deltas_for_session("s1", &["Contact".into()]).len(), 1);
        assert_eq!(mgr.deltas_for_session("s2", &["Other".into()]).len(), 0);

        fs::write(&path, "<div>v2</div>").unwrap();
        mgr.note_file_changed(&path).unwrap();

        let s1 = mgr.deltas_for_session("s1", &[]);
        assert_eq!(s1, vec![("Contact.DEFAULT".to_string(), "<div>v2</div>".to_string())]);
        assert!(mgr.deltas_for_session("s2", &[]).is_empty());
        // Exactly one push: the watermark advanced.
        assert!(mgr.deltas_for_session("s1", &[]).is_empty());
    }

    #[test]
    fn unchanged_rewrite_is_not_redelivered() {
        let (dir, mgr) = manager();
        let path = dir.path().join("Card.DEFAULT.html");
        fs::write(&path, "<b>x</b>").unwrap();
        mgr.deltas_for_session("s1", &["Card".into()]);

        // Same content and mtime: refresh is a no-op.
        mgr.note_file_changed(&path).unwrap();
        assert!(mgr.deltas_for_session("s1", &[]).is_empty());
    }

    #[test]
    fn dropped_session_forgets_delivery_state() {
        let (dir, mgr) = manager();
        fs::write(dir.path().join("Contact.DEFAULT.html"), "<div/>").unwrap();
        mgr.deltas_for_session("s1", &["Contact".into()]);
        assert!(mgr.was_sent("s1", "Contact.DEFAULT"));
        mgr.drop_session("s1");
        assert!(!mgr.was_sent("s1", "Contact.DEFAULT"));
    }

    #[test]
    fn unreadable_file_aborts_only_that_refresh() {
        let (dir, mgr) = manager();
        let path = dir.path().join("Gone.DEFAULT.html");
        assert!(mgr.note_file_changed(&path).is_err());
        fs::write(&path, "<div/>").unwrap();
        mgr.note_file_changed(&path).unwrap();
        assert_eq!(mgr.template_content("Gone.DEFAULT").as_deref(), Some("<div/>"));
    }
}
