use std::io::Write;

use flowmeta::cli::FlowMetaConfig;
use tempfile::NamedTempFile;

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 9090
database_url: "sqlite://custom/meta.db?mode=rwc"
max_connections: 4
acquire_timeout_s: 2
max_body: 2097152
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = FlowMetaConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(9090));
    assert_eq!(
        cfg.database_url.as_deref(),
        Some("sqlite://custom/meta.db?mode=rwc")
    );
    assert_eq!(cfg.max_connections, Some(4));
    assert_eq!(cfg.acquire_timeout_s, Some(2));
    assert_eq!(cfg.max_body, Some(2097152));
}

#[test]
fn load_partial_config() {
    let yaml = "port: 8181\n";

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = FlowMetaConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(8181));
    assert!(cfg.host.is_none());
    assert!(cfg.database_url.is_none());
}

#[test]
fn load_empty_config() {
    let f = NamedTempFile::new().unwrap();
    let cfg = FlowMetaConfig::load(Some(f.path())).unwrap();
    assert!(cfg.port.is_none());
    assert!(cfg.max_connections.is_none());
}

#[test]
fn load_missing_explicit_path_errors() {
    let result = FlowMetaConfig::load(Some(std::path::Path::new("/nonexistent/flowmeta.yaml")));
    let err = result.unwrap_err().to_string();
    assert!(err.contains("Config file not found"));
}

#[test]
fn load_invalid_yaml_errors() {
    let mut f = NamedTempFile::new().unwrap();
    f.write_all(b"port: [not, a, number]\n").unwrap();

    let result = FlowMetaConfig::load(Some(f.path()));
    assert!(result.is_err());
}
