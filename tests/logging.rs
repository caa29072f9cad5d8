use std::{fs, thread::sleep, time::Duration};

use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn writes_log_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("logs").join("retouch.log");

    retouch::logging::init(true, Some(&path)).unwrap();
    tracing::info!("session log line");
    // a second call must not replace the installed subscriber
    retouch::logging::init(false, None).unwrap();

    sleep(Duration::from_millis(200));

    assert!(path.exists(), "log file was not created");
    let contents = fs::read_to_string(path).unwrap();
    assert!(contents.contains("session log line"));
}
