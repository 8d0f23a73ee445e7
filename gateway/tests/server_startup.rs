//! Server Startup Tests
//!
//! Startup must fail fast, before binding, when the upstream API key is
//! missing.

use std::net::TcpListener;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

/// Find an available port for testing
fn find_available_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[test]
fn test_missing_api_key_aborts_startup() {
    // Empty working directory so no .env file is picked up
    let work_dir = TempDir::new().unwrap();
    let port = find_available_port();

    let mut child = Command::new(env!("CARGO_BIN_EXE_waav-relay"))
        .current_dir(work_dir.path())
        .env_clear()
        .env("HOST", "127.0.0.1")
        .env("PORT", port.to_string())
        .env("RUST_LOG", "error")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to start relay binary");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("relay kept running without an API key");
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    assert!(!status.success());
    let output = child.wait_with_output().unwrap();
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stderr.contains("OPENAI_API_KEY") || stdout.contains("OPENAI_API_KEY"),
        "error should name the missing variable, got: {stderr}"
    );

    // The listener was never bound
    assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[test]
fn test_invalid_config_file_aborts_startup() {
    let work_dir = TempDir::new().unwrap();
    let config_path = work_dir.path().join("config.yaml");
    std::fs::write(&config_path, "relay:\n  routing_mode: \"nobody\"\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_waav-relay"))
        .current_dir(work_dir.path())
        .env_clear()
        .env("OPENAI_API_KEY", "sk-test")
        .arg("-c")
        .arg(&config_path)
        .output()
        .expect("Failed to run relay binary");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ROUTING_MODE"), "got: {stderr}");
}
