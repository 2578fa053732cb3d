//! Full-engine smoke tests: dispatcher wired to real watchers over an app
//! directory, exercising boot and hot reload end to end.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_session::{Dispatcher, Outbound, SessionOutput};
use core_viewdef::ViewdefManager;
use core_watch::{WatchConfig, Watcher};
use core_wrap::Registries;
use crossbeam_channel::{Receiver, unbounded};
use serde_json::json;

struct App {
    _dir: tempfile::TempDir,
    scripts: std::path::PathBuf,
    dispatcher: Arc<Dispatcher>,
    rx: Receiver<SessionOutput>,
    watchers: Vec<Watcher>,
}

fn app() -> App {
    let dir = tempfile::tempdir().unwrap();
    let scripts = dir.path().join("scripts");
    let views = dir.path().join("views");
    fs::create_dir_all(&scripts).unwrap();
    fs::create_dir_all(&views).unwrap();

    let (tx, rx) = unbounded();
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(Registries::with_builtins()),
        Arc::new(ViewdefManager::new(&views)),
        tx,
        64,
    ));
    let watch_config = WatchConfig {
        debounce: Duration::from_millis(50),
        tick: Duration::from_millis(10),
    };
    let d = Arc::clone(&dispatcher);
    let watcher = Watcher::spawn(
        scripts.clone(),
        watch_config,
        Box::new(move |path: &Path| d.script_file_changed(path)),
    )
    .unwrap();

    App {
        _dir: dir,
        scripts,
        dispatcher,
        rx,
        watchers: vec![watcher],
    }
}

/// Wait until some outbound batch satisfies the predicate.
fn await_output(rx: &Receiver<SessionOutput>, mut pred: impl FnMut(&SessionOutput) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Ok(output) = rx.recv_timeout(Duration::from_millis(200))
            && pred(&output)
        {
            return;
        }
    }
    panic!("expected outbound records did not arrive");
}

fn has_def_field(output: &SessionOutput, field: &str, expected: &serde_json::Value) -> bool {
    output.records.iter().any(|r| {
        matches!(r, Outbound::ObjectDef { fields, .. } if fields.get(field) == Some(expected))
    })
}

#[test]
fn editing_the_entry_script_refreshes_the_session() {
    let app = app();
    let main = app.scripts.join("main.wft");
    fs::write(&main, "app = { title: \"v1\" }\ncreateAppVariable(app)\n").unwrap();

    app.dispatcher.create_session("s1", &app.scripts).unwrap();
    app.dispatcher.boot_session("s1", main.clone()).unwrap();
    await_output(&app.rx, |out| has_def_field(out, "title", &json!("v1")));

    // Let the watcher settle, then edit the file on disk.
    std::thread::sleep(Duration::from_millis(200));
    fs::write(&main, "app = { title: \"v2\" }\ncreateAppVariable(app)\n").unwrap();

    await_output(&app.rx, |out| has_def_field(out, "title", &json!("v2")));
    for w in app.watchers {
        w.stop();
    }
}

#[test]
fn symlinked_module_reloads_when_its_target_changes() {
    let app = app();
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("shared.wft");
    fs::write(&target, "app = { msg: \"v1\" }\ncreateAppVariable(app)\n").unwrap();
    std::os::unix::fs::symlink(&target, app.scripts.join("shared.wft")).unwrap();
    let main = app.scripts.join("main.wft");
    fs::write(&main, "require(\"shared\")\n").unwrap();

    app.dispatcher.create_session("s1", &app.scripts).unwrap();
    app.dispatcher.boot_session("s1", main).unwrap();
    await_output(&app.rx, |out| has_def_field(out, "msg", &json!("v1")));

    std::thread::sleep(Duration::from_millis(200));
    // Edit the out-of-tree target; the reload routes through the symlink and
    // re-executes the module under its original tracking key.
    fs::write(&target, "app = { msg: \"v2\" }\ncreateAppVariable(app)\n").unwrap();

    await_output(&app.rx, |out| has_def_field(out, "msg", &json!("v2")));
    for w in app.watchers {
        w.stop();
    }
}
