//! The `vshell` binary's exit path.

use std::process::Command;

use vshell::logging::LOG_FILE_NAME;

#[test]
fn failing_command_exits_nonzero_and_flushes_the_log_file() {
    let home = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_vshell"))
        .args(["config", "set-port", "http", "8080"])
        .env("HOME", home.path())
        .env("VSHELL_LOG", "1")
        .env_remove("RUST_LOG")
        .env_remove("XDG_CONFIG_HOME")
        .env_remove("XDG_DATA_HOME")
        .env_remove("XDG_CACHE_HOME")
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("vshell: unknown service \"http\""), "{stderr}");

    let log_dir = if cfg!(target_os = "macos") {
        home.path().join("Library/Logs/vshell")
    } else {
        home.path().join(".local/share/vshell/logs")
    };
    let log = std::fs::read_to_string(log_dir.join(LOG_FILE_NAME)).unwrap();
    assert!(log.contains("command failed"), "{log}");
    assert!(log.contains("unknown service"), "{log}");
}
