//! Integration tests for config files and the in-process transport

use elohim_link::{
    LinkClient, LinkConfig, LinkError, MemoryTransport, OperationConfig, OperationKind, Transport,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Test that a saved config loads back with the same operations
#[test]
fn test_config_save_and_load() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("config.toml");

    let mut config = LinkConfig {
        endpoint: "wss://node.example/events".to_string(),
        session_cookie: Some("sid=xyz".to_string()),
        ..Default::default()
    };
    config.reconnect.max_attempts = 5;
    config.operations.push(OperationConfig {
        name: "export".to_string(),
        channel: Some("exportStatus".to_string()),
        stages: ["rows".to_string(), "blobs".to_string()],
    });
    assert_ok!(config.save(&path));

    let loaded = assert_ok!(LinkConfig::load(&path));
    assert_eq!(loaded.endpoint, "wss://node.example/events");
    assert_eq!(loaded.session_cookie.as_deref(), Some("sid=xyz"));
    assert_eq!(loaded.reconnect.max_attempts, 5);

    let kinds = loaded.operation_kinds();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[2].channel(), "exportStatus");
}

/// Test that invalid files are rejected at load time
#[test]
fn test_config_load_rejects_invalid() {
    let temp = TempDir::new().unwrap();

    let bad_endpoint = temp.path().join("endpoint.toml");
    std::fs::write(&bad_endpoint, r#"endpoint = "http://node.example""#).unwrap();
    assert!(matches!(
        LinkConfig::load(&bad_endpoint),
        Err(LinkError::Config(_))
    ));

    let bad_toml = temp.path().join("broken.toml");
    std::fs::write(&bad_toml, "endpoint = ").unwrap();
    assert!(matches!(LinkConfig::load(&bad_toml), Err(LinkError::Toml(_))));

    assert_err!(LinkConfig::load(temp.path().join("missing.toml")));
}

/// Test a configured kind flowing through a client on the memory transport
#[test]
fn test_configured_kind_on_memory_transport() {
    let config: LinkConfig = toml::from_str(
        r#"
        [[operations]]
        name = "export"
        channel = "exportStatus"
        stages = ["rows", "blobs"]
        "#,
    )
    .unwrap();

    let transport = Arc::new(MemoryTransport::new());
    let client = assert_ok!(LinkClient::with_transport(
        transport.clone(),
        config.operation_kinds()
    ));
    assert!(matches!(client.backup(), Err(LinkError::UnknownOperation(_))));

    client.start();
    transport.establish();
    transport.emit("exportStatus", json!({"rows": 100}));
    transport.emit("exportStatus", json!({"blobs": 100}));

    let export = assert_ok!(client.progress("export"));
    assert!(export.current_progress().is_complete);

    client.shutdown();
    assert!(transport.bound_events().is_empty());
    assert!(transport.reconnection());
}

/// Test a full backup lifecycle driven through the raw frame decoder
#[test]
fn test_backup_lifecycle_through_frames() {
    let transport = Arc::new(MemoryTransport::new());
    let client =
        LinkClient::with_transport(transport.clone(), vec![OperationKind::backup()]).unwrap();
    client.start();
    transport.establish();

    let backup = client.backup().unwrap();
    backup.start("2026-10-16.tar.gz");
    for frame in [
        r#"["backupProgress",{"database":25}]"#,
        r#"["backupProgress",{"database":100}]"#,
        r#"{"event":"backupProgress","data":{"files":60}}"#,
        r#"{"event":"backupProgress","data":{"files":100}}"#,
    ] {
        assert!(transport.deliver_frame(frame).unwrap());
    }

    let record = backup.record();
    assert!(record.is_complete());
    assert_eq!(record.aux.as_deref(), Some("2026-10-16.tar.gz"));

    // A new run starts from zero
    backup.reset_progress();
    assert!(!backup.current_progress().is_complete);

    // A network drop followed by the reconnect timer restores the connection
    transport.drop_connection("transport close");
    assert!(!client.connection().is_connected());
    assert!(transport.fire_reconnect_timer());
    assert!(client.connection().is_connected());
    assert_eq!(transport.state(), elohim_link::ConnectionState::Connected);
}
