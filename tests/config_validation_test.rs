use std::io::Write;
use std::time::Duration;

use tempfile::NamedTempFile;
use vecmem::config::{
    AppConfig, CacheSection, CircuitBreakerSection, LogFormat, TrainingSection,
};

fn toml_file() -> NamedTempFile {
    tempfile::Builder::new().suffix(".toml").tempfile().unwrap()
}

#[test]
fn defaults_are_valid() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    let settings = config.cache.settings();
    assert!(settings.weight_limited);
    assert_eq!(settings.max_weight_kb, 4 * 1024 * 1024);
    assert_eq!(settings.expiry, None);

    let maintenance = config.maintenance_config();
    assert_eq!(maintenance.cache_interval, Duration::from_secs(60));
    assert_eq!(maintenance.breaker_interval, Duration::from_secs(120));
}

#[test]
fn weight_limit_requires_positive_max() {
    let config = AppConfig {
        cache: CacheSection {
            max_weight_kb: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());

    // Unlimited caches ignore the max
    let config = AppConfig {
        cache: CacheSection {
            weight_limit_enabled: false,
            max_weight_kb: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn expiry_converts_minutes() {
    let section = CacheSection {
        expiry_enabled: true,
        expiry_minutes: 2,
        ..Default::default()
    };
    assert_eq!(section.settings().expiry, Some(Duration::from_secs(120)));

    let config = AppConfig {
        cache: CacheSection {
            expiry_enabled: true,
            expiry_minutes: 0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn unset_percentage_must_be_in_range() {
    for bad in [0.0, -5.0, 100.5] {
        let config = AppConfig {
            circuit_breaker: CircuitBreakerSection {
                unset_percentage: bad,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err(), "{bad} should be rejected");
    }

    let config = AppConfig {
        circuit_breaker: CircuitBreakerSection {
            unset_percentage: 100.0,
            ..Default::default()
        },
        ..Default::default()
    };
    assert!(config.validate().is_ok());
}

#[test]
fn training_pool_must_not_be_empty() {
    let config = AppConfig {
        training: TrainingSection {
            pool_size: 0,
            queue_depth: 1,
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());

    let config = AppConfig {
        training: TrainingSection {
            pool_size: 1,
            queue_depth: 0,
        },
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn node_id_falls_back_to_hostname() {
    let mut config = AppConfig::default();
    config.node.node_id = Some("node-a".to_string());
    assert_eq!(config.resolve_node_id(), "node-a");

    config.node.node_id = Some("   ".to_string());
    assert!(!config.resolve_node_id().trim().is_empty());
}

#[test]
fn load_from_toml_file() {
    let mut file = toml_file();
    writeln!(
        file,
        r#"
[node]
node_id = "node-from-file"

[cache]
max_weight_kb = 2048
expiry_enabled = true
expiry_minutes = 5

[circuit_breaker]
unset_percentage = 60.0

[training]
pool_size = 2

[logging]
format = "text"
"#
    )
    .unwrap();

    let config = AppConfig::load_from(file.path()).unwrap();
    assert_eq!(config.node.node_id.as_deref(), Some("node-from-file"));
    assert_eq!(config.cache.max_weight_kb, 2048);
    assert!(config.cache.weight_limit_enabled);
    assert_eq!(config.cache.settings().expiry, Some(Duration::from_secs(300)));
    assert_eq!(config.circuit_breaker.unset_percentage, 60.0);
    assert_eq!(config.training.pool_size, 2);
    assert_eq!(config.training.queue_depth, 1);
    assert!(matches!(config.logging.format, LogFormat::Text));
}

#[test]
fn load_from_rejects_invalid_file() {
    let mut file = toml_file();
    writeln!(file, "[training]\npool_size = 0").unwrap();

    assert!(AppConfig::load_from(file.path()).is_err());
}
