use super::*;
use std::time::Duration;

fn valid_config() -> ProxyConfig {
    ProxyConfig {
        instances: vec!["p:r:i".into()],
        api: ApiConfig {
            endpoint: "https://dbadmin.internal/v1".into(),
            ..ApiConfig::default()
        },
        ..ProxyConfig::default()
    }
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "instances": ["proj:region:db=tcp:5432"],
        "max_connections": 50,
        "api": { "endpoint": "https://dbadmin.internal/v1" },
        "certs": { "cert_duration_secs": 7200 }
    }"#;
    let tmp = std::env::temp_dir().join("sqltunnel_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert_eq!(cfg.instances, vec!["proj:region:db=tcp:5432".to_string()]);
    assert_eq!(cfg.max_connections, 50);
    assert_eq!(cfg.certs.cert_duration_secs, 7200);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_load_toml_config() {
    let toml_str = r#"
instances = ["p:r:i"]

[api]
endpoint = "https://dbadmin.internal/v1"
check_region = true
"#;
    let tmp = std::env::temp_dir().join("sqltunnel_test_config.toml");
    std::fs::write(&tmp, toml_str).unwrap();
    let cfg = ProxyConfig::load(&tmp).unwrap();
    assert!(cfg.api.check_region);
    assert_eq!(cfg.remote_port, 3307);
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_unsupported_format() {
    let tmp = std::env::temp_dir().join("sqltunnel_test.yml");
    std::fs::write(&tmp, "key: value").unwrap();
    assert!(ProxyConfig::load(&tmp).is_err());
    std::fs::remove_file(&tmp).ok();
}

#[test]
fn test_deserialize_defaults() {
    let cfg: ProxyConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.remote_port, 3307);
    assert_eq!(cfg.certs.cert_duration_secs, 3600);
    assert_eq!(cfg.certs.refresh_throttle_secs, 30);
    assert_eq!(cfg.certs.refresh_buffer_secs, 300);
    assert_eq!(cfg.api.ip_address_types, vec!["PUBLIC", "PRIVATE"]);
    assert_eq!(cfg.max_connections, 0);
}

#[test]
fn test_validate_requires_instance_or_discovery() {
    let mut cfg = valid_config();
    cfg.instances.clear();
    assert!(cfg.validate().is_err());

    cfg.instances_metadata = Some("http://metadata.internal/instances".into());
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_requires_endpoint() {
    let mut cfg = valid_config();
    cfg.api.endpoint = String::new();
    assert!(cfg.validate().is_err());

    cfg.api.endpoint = "not-a-url".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_quiet_and_verbose() {
    let mut cfg = valid_config();
    cfg.log.quiet = true;
    cfg.log.verbose = true;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_unknown_ip_type() {
    let mut cfg = valid_config();
    cfg.api.ip_address_types = vec!["CARRIER_PIGEON".into()];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_cert_duration_clamped() {
    let mut cfg = valid_config();

    cfg.certs.cert_duration_secs = 0;
    cfg.normalize();
    assert_eq!(cfg.cert_duration(), Duration::from_secs(3600));

    cfg.certs.cert_duration_secs = 60;
    cfg.normalize();
    assert_eq!(cfg.cert_duration(), Duration::from_secs(3600));

    cfg.certs.cert_duration_secs = 200_000;
    cfg.normalize();
    assert_eq!(cfg.cert_duration(), Duration::from_secs(86_400));

    cfg.certs.cert_duration_secs = 7200;
    cfg.normalize();
    assert_eq!(cfg.cert_duration(), Duration::from_secs(7200));
}

#[test]
fn test_refresh_throttle_floored() {
    let mut cfg = valid_config();
    cfg.certs.refresh_throttle_secs = 0;
    cfg.normalize();
    assert_eq!(cfg.refresh_throttle(), Duration::from_secs(1));

    cfg.certs.refresh_throttle_secs = 5;
    cfg.normalize();
    assert_eq!(cfg.refresh_throttle(), Duration::from_secs(5));
}
