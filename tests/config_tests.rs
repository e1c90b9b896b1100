//! Tests for daemon configuration.
//!
//! Covers defaults, JSON files, flag/environment overrides, and validation.

use std::io::Write;
use std::time::Duration;

use magikcell::constants::{DEFAULT_STOP_WAIT, HANDSHAKE_TIMEOUT};
use magikcell::config::Overrides;
use magikcell::{Config, Error};

// =============================================================================
// Defaults
// =============================================================================

#[test]
fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.default_stop_wait(), DEFAULT_STOP_WAIT);
    assert_eq!(config.handshake_timeout(), HANDSHAKE_TIMEOUT);
    assert!(!config.debug);
}

// =============================================================================
// File Loading
// =============================================================================

#[test]
fn test_from_file_overrides_subset() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{ "attach_addr": "0.0.0.0:4000", "default_stop_wait_secs": 3 }}"#
    )
    .unwrap();

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.attach_addr, "0.0.0.0:4000");
    assert_eq!(config.default_stop_wait(), Duration::from_secs(3));
    assert_eq!(config.log_level, "info", "unset fields keep defaults");
}

#[test]
fn test_from_file_missing() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::from_file(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_from_file_malformed() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{ not json").unwrap();
    assert!(matches!(
        Config::from_file(file.path()),
        Err(Error::Serialization(_))
    ));
}

// =============================================================================
// Overrides
// =============================================================================

#[test]
fn test_overrides_layer_over_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "max_pending_handles": 9, "debug": false }}"#).unwrap();

    let overrides = Overrides {
        debug: true,
        handshake_timeout_ms: Some(75),
        max_pending_handles: Some(5),
        ..Overrides::default()
    };
    let config = Config::from_file(file.path()).unwrap().apply(&overrides);
    assert!(config.debug);
    assert_eq!(config.handshake_timeout(), Duration::from_millis(75));
    assert_eq!(config.max_pending_handles, 5);
}

#[test]
fn test_empty_overrides_keep_config() {
    let config = Config {
        log_level: "warn".into(),
        ..Config::default()
    };
    assert_eq!(config.clone().apply(&Overrides::default()), config);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_validate_rejects_out_of_range() {
    let cases = [
        Config {
            attach_addr: "not-an-address".into(),
            ..Config::default()
        },
        Config {
            log_level: "loud".into(),
            ..Config::default()
        },
        Config {
            max_pending_handles: 0,
            ..Config::default()
        },
        Config {
            default_stop_wait_secs: 0,
            ..Config::default()
        },
        Config {
            handshake_timeout_ms: 0,
            ..Config::default()
        },
    ];
    for config in cases {
        assert!(
            matches!(config.validate(), Err(Error::Config(_))),
            "{config:?} should be rejected"
        );
    }
}
