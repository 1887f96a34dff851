use std::time::Duration;
use std::{env, fs};

use octofhir_bulk_client::config::loader::load_config;
use octofhir_bulk_client::{BulkExportClient, KeyKind};

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let key_path = dir.path().join("client.pem");
    fs::write(&key_path, include_str!("fixtures/ec_p384.pem")).expect("write key");

    let path = dir.path().join("octofhir-bulk.toml");
    let toml_content = format!(
        r#"
fhir_url = "https://fhir.example.com/fhir"

[auth]
token_url = "https://fhir.example.com/auth/token"
client_id = "bulk-client"
private_key_path = "{}"
key_id = "key-1"
scope = "system/*.read"

[poll]
retry_after_default = "10s"
max_attempts = 720

[http]
request_timeout = "30s"
"#,
        key_path.display()
    );
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.fhir_url, "https://fhir.example.com/fhir");
    assert_eq!(cfg.auth.client_id, "bulk-client");
    assert_eq!(cfg.auth.key_id.as_deref(), Some("key-1"));
    assert_eq!(cfg.poll.retry_after_default, Duration::from_secs(10));
    assert_eq!(cfg.poll.max_attempts, Some(720));
    assert_eq!(cfg.http.request_timeout, Duration::from_secs(30));

    let client = BulkExportClient::new(cfg.clone()).expect("client from loaded config");
    assert!(format!("{client:?}").contains("authenticated: true"));
    let key = octofhir_bulk_client::ClientKey::from_pem(
        &cfg.auth.private_key().expect("key file"),
        None,
    )
    .expect("valid key");
    assert_eq!(key.kind(), KeyKind::EcP384);

    // 2) Env override should win over file
    unsafe {
        env::set_var("OCTOFHIR_BULK__POLL__RETRY_AFTER_DEFAULT", "45s");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.poll.retry_after_default, Duration::from_secs(45));
    unsafe {
        env::remove_var("OCTOFHIR_BULK__POLL__RETRY_AFTER_DEFAULT");
    }

    // 3) Invalid config should error
    let invalid_path = dir.path().join("invalid.toml");
    let invalid_toml = r#"
fhir_url = "https://fhir.example.com/fhir"

[auth]
token_url = "https://fhir.example.com/auth/token"

[poll]
max_attempts = 0
"#;
    fs::write(&invalid_path, invalid_toml).expect("write invalid toml");
    let err = load_config(invalid_path.to_str()).expect_err("expected validation error");
    assert!(err.to_string().contains("auth.client_id is required"));
}
