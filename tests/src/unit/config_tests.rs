use super::paused_runtime;
use askline_core::{
    ClientSettings, ConfigError, InMemoryCredentialProvider, ReplayTransport, SessionRuntime,
};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn settings_from_disk_drive_the_runtime() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("askline.yaml");
    fs::write(
        &path,
        "refresh_lead_secs: 60\nheartbeat:\n  interval_secs: 5\n  reconnect_max_attempts: 2\n",
    )
    .expect("write config");

    let settings = ClientSettings::from_path(&path).expect("settings");
    assert_eq!(settings.refresh_lead, chrono::Duration::seconds(60));
    assert_eq!(settings.heartbeat.interval, Duration::from_secs(5));

    let runtime = paused_runtime();
    let provider = InMemoryCredentialProvider::signed_in();
    let app = SessionRuntime::new(
        settings,
        Arc::new(provider.clone()),
        Arc::new(ReplayTransport::default()),
    );
    assert_eq!(app.session().refresh_lead(), chrono::Duration::seconds(60));

    runtime.block_on(async {
        assert!(app.sign_in("user-1", None).await);
        tokio::time::sleep(Duration::from_secs(12)).await;
    });
    // initialize plus ticks at 5s and 10s
    assert_eq!(provider.session_reads(), 3);
    app.sign_out();
}

#[test]
fn malformed_file_is_reported_as_invalid() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("askline.yaml");
    fs::write(&path, "heartbeat:\n  interval_secs: -3\n").expect("write config");

    let err = ClientSettings::from_path(&path).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(err.user_message().contains("askline.yaml"));
}
