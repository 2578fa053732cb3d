//! Module loading behavior against a real script directory: require
//! idempotence, cycle handling, unload/reload symmetry, and failed-load
//! rollback.

use std::fs;

use core_script::ScriptSession;
use core_value::Value;

fn write(dir: &std::path::Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn require_executes_once_and_caches_the_value() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "counter.wft",
        r#"
        side_effects = side_effects + 1
        { hits: side_effects }
        "#,
    );
    let mut s = ScriptSession::new(dir.path());
    s.define_global("side_effects", Value::Int(0));

    let first = s.require("counter").unwrap();
    let second = s.require("counter").unwrap();
    assert_eq!(s.global("side_effects").unwrap().as_int(), Some(1));
    // Same module value comes back, by identity.
    assert!(first.loose_eq(&second));
}

#[test]
fn require_cycle_short_circuits() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "a.wft", r#"require("b") "a-done""#);
    write(dir.path(), "b.wft", r#"require("a") "b-done""#);
    let mut s = ScriptSession::new(dir.path());
    // b's require("a") sees the pre-marked placeholder instead of recursing.
    let got = s.require("a").unwrap();
    assert_eq!(got.as_str(), Some("a-done"));
    assert!(s.is_loaded("a.wft"));
    assert!(s.is_loaded("b.wft"));
}

#[test]
fn unload_then_reload_registers_the_same_resources() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "contacts.wft",
        r#"
        let p = prototype("contacts.Person", { name: "" })
        registerPresenter("PersonPresenter", p)
        "#,
    );
    let mut s = ScriptSession::new(dir.path());
    s.require("contacts").unwrap();
    assert!(s.has_prototype("contacts.Person"));

    assert!(s.unload_module("contacts.wft"));
    assert!(!s.has_prototype("contacts.Person"));
    assert!(!s.is_loaded("contacts.wft"));

    s.require("contacts").unwrap();
    assert!(s.has_prototype("contacts.Person"));
}

#[test]
fn failed_load_unmarks_and_rolls_back_registrations() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "broken.wft",
        r#"
        prototype("Orphan", { x: 0 })
        this_is_undefined()
        "#,
    );
    let mut s = ScriptSession::new(dir.path());
    assert!(s.require("broken").is_err());
    assert!(!s.is_loaded("broken.wft"));
    assert!(!s.has_prototype("Orphan"));

    // The module can be fixed and loaded cleanly afterwards.
    write(dir.path(), "broken.wft", r#"prototype("Orphan", { x: 0 })"#);
    s.require("broken").unwrap();
    assert!(s.has_prototype("Orphan"));
}

#[test]
fn missing_module_errors_without_residue() {
    let dir = tempfile::tempdir().unwrap();
    let mut s = ScriptSession::new(dir.path());
    assert!(s.require("ghost").is_err());
    assert!(!s.is_loaded("ghost.wft"));
}

#[test]
fn unload_directory_removes_every_module_under_it() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("contacts")).unwrap();
    write(dir.path(), "contacts/people.wft", r#"prototype("A", {})"#);
    write(dir.path(), "contacts/groups.wft", r#"prototype("B", {})"#);
    write(dir.path(), "main.wft", r#"prototype("C", {})"#);
    let mut s = ScriptSession::new(dir.path());
    s.require("contacts/people").unwrap();
    s.require("contacts/groups").unwrap();
    s.require("main").unwrap();

    assert_eq!(s.unload_directory("contacts"), 2);
    assert!(!s.has_prototype("A"));
    assert!(!s.has_prototype("B"));
    assert!(s.has_prototype("C"));
}

#[test]
fn embedded_source_is_a_filesystem_fallback() {
    struct Archive;
    impl core_script::ModuleSource for Archive {
        fn read(&self, rel: &str) -> Option<String> {
            (rel == "bundled.wft").then(|| r#"prototype("Bundled", {})"#.to_string())
        }
    }
    let dir = tempfile::tempdir().unwrap();
    // On-disk file shadows the archive under the same name.
    write(dir.path(), "ondisk.wft", r#"prototype("Disk", {})"#);
    let mut s = ScriptSession::new(dir.path());
    s.set_module_source(Box::new(Archive));
    s.require("ondisk").unwrap();
    s.require("bundled").unwrap();
    assert!(s.has_prototype("Disk"));
    assert!(s.has_prototype("Bundled"));
}

#[test]
fn reload_revives_prototypes_and_migrates_instances() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "people.wft",
        r#"
        prototype("Person", { fullName: "" })
        alice = create(Person, { fullName: "Alice Smith" })
        "#,
    );
    let mut s = ScriptSession::new(dir.path());
    s.require("people").unwrap();

    // The rename ships a migration hook; the old instance is only reachable
    // through the global it was assigned to.
    write(
        dir.path(),
        "people.wft",
        r#"
        prototype("Person", {
            name: "",
            mutate: fn() { self.name = self.fullName },
        })
        "#,
    );
    assert!(s.unload_module("people.wft"));
    s.require("people").unwrap();

    let alice = s.global("alice").unwrap();
    let alice = alice.as_record().unwrap();
    assert_eq!(
        alice.lookup("name").unwrap().as_str(),
        Some("Alice Smith")
    );
    assert!(!alice.borrow().has("fullName"));
}

#[test]
fn unload_hook_fires_with_the_tracking_key() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "mod.wft", "1");
    let mut s = ScriptSession::new(dir.path());
    s.require("mod").unwrap();

    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let sink = Rc::clone(&seen);
    s.set_unload_hook(Rc::new(move |key: &str| {
        sink.borrow_mut().push(key.to_string());
    }));
    s.unload_module("mod.wft");
    assert_eq!(&*seen.borrow(), &["mod.wft".to_string()]);
}
