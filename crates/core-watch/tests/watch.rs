//! Watcher behavior against the real filesystem: debounced reloads, symlink
//! routing, and clean shutdown. Timeouts are generous because OS event
//! latency varies.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use core_watch::{ReloadSink, WatchConfig, Watcher};
use crossbeam_channel::{Receiver, Sender, unbounded};

struct ChannelSink(Sender<PathBuf>);

impl ReloadSink for ChannelSink {
    fn reload(&self, path: &Path) {
        let _ = self.0.send(path.to_path_buf());
    }
}

fn fast_config() -> WatchConfig {
    WatchConfig {
        debounce: Duration::from_millis(50),
        tick: Duration::from_millis(10),
    }
}

fn recv_reload(rx: &Receiver<PathBuf>) -> Option<PathBuf> {
    rx.recv_timeout(Duration::from_secs(5)).ok()
}

#[test]
fn edit_under_root_reloads_that_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("main.wft");
    fs::write(&file, "# v1").unwrap();

    let (tx, rx) = unbounded();
    let watcher = Watcher::spawn(dir.path(), fast_config(), Box::new(ChannelSink(tx))).unwrap();

    // Let the watch settle before mutating.
    std::thread::sleep(Duration::from_millis(200));
    fs::write(&file, "# v2").unwrap();

    let got = recv_reload(&rx).expect("reload for edited file");
    assert_eq!(got.file_name(), file.file_name());
    watcher.stop();
}

#[test]
fn rapid_edits_debounce_into_one_reload() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("busy.wft");
    fs::write(&file, "0").unwrap();

    let (tx, rx) = unbounded();
    let watcher = Watcher::spawn(dir.path(), fast_config(), Box::new(ChannelSink(tx))).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    for i in 0..5 {
        fs::write(&file, format!("{i}")).unwrap();
        std::thread::sleep(Duration::from_millis(5));
    }

    let first = recv_reload(&rx).expect("one reload after burst");
    assert_eq!(first.file_name(), file.file_name());
    // The burst collapsed: nothing further arrives promptly.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    watcher.stop();
}

#[test]
fn symlinked_file_reloads_through_the_symlink_path() {
    let root = tempfile::tempdir().unwrap();
    let outside = tempfile::tempdir().unwrap();
    let target = outside.path().join("shared.wft");
    fs::write(&target, "# shared v1").unwrap();
    let link = root.path().join("shared.wft");
    std::os::unix::fs::symlink(&target, &link).unwrap();

    let (tx, rx) = unbounded();
    let watcher = Watcher::spawn(root.path(), fast_config(), Box::new(ChannelSink(tx))).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    // Edit the out-of-tree target; the reload must carry the symlink path.
    fs::write(&target, "# shared v2").unwrap();

    let got = recv_reload(&rx).expect("reload routed through symlink");
    assert_eq!(got, link);
    watcher.stop();
}

#[test]
fn stop_terminates_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = unbounded();
    let watcher = Watcher::spawn(dir.path(), fast_config(), Box::new(ChannelSink(tx))).unwrap();
    watcher.stop();
    // Post-stop edits go nowhere.
    fs::write(dir.path().join("late.wft"), "x").unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}
