//! Tests for error types.
//!
//! Validates display formatting and the conflict / not-found / timeout
//! categories the API layer maps errors into.

use magikcell::backend::{Fault, FaultMessage, PowerState};
use magikcell::{Cause, Error};

// =============================================================================
// Container Lifecycle Error Tests
// =============================================================================

#[test]
fn test_not_yet_exist_display() {
    let err = Error::NotYetExist { id: "c1".into() };
    assert_eq!(err.to_string(), "c1 is not completely created");
}

#[test]
fn test_concurrent_access_is_conflict() {
    let err = Error::ConcurrentAccess {
        id: "c1".into(),
        detail: "expected version 3 but found 5".into(),
    };
    let msg = err.to_string();
    assert!(msg.contains("c1"), "should include container ID");
    assert!(msg.contains("expected version 3"), "should include detail");
    assert!(err.is_conflict());
    assert!(!err.is_not_found());
}

#[test]
fn test_remove_power_is_conflict() {
    let err = Error::RemovePower { id: "c1".into() };
    assert!(err.is_conflict());
    assert!(err.to_string().contains("powered on"));
}

#[test]
fn test_shutdown_failed_lists_signals() {
    let err = Error::ShutdownFailed {
        id: "c1".into(),
        signals: vec!["TERM".into(), "KILL".into()],
    };
    let msg = err.to_string();
    assert!(msg.contains("TERM") && msg.contains("KILL"), "got: {msg}");
}

#[test]
fn test_invalid_transition_display() {
    let err = Error::InvalidTransition {
        id: "c1".into(),
        from: "RUNNING".into(),
        to: "CREATED".into(),
    };
    assert_eq!(
        err.to_string(),
        "container 'c1' cannot transition from RUNNING to CREATED"
    );
}

// =============================================================================
// Backend Error Tests
// =============================================================================

#[test]
fn test_backend_fault_display() {
    let err = Error::backend(
        "power off",
        Fault::InvalidPowerState {
            existing: PowerState::PoweredOff,
        },
    );
    let msg = err.to_string();
    assert!(msg.starts_with("power off failed"), "got: {msg}");
    assert!(msg.contains("poweredOff"), "got: {msg}");
}

#[test]
fn test_generic_fault_lists_keys() {
    let fault = Fault::GenericVmConfig {
        messages: vec![FaultMessage {
            key: "msg.example".into(),
            message: "example failure".into(),
        }],
    };
    assert_eq!(fault.to_string(), "generic vm config fault: example failure (msg.example)");
}

#[test]
fn test_backend_timeout_is_timeout() {
    assert!(Error::backend("wait", Fault::Timeout).is_timeout());
    assert!(!Error::backend("wait", Fault::ConcurrentAccess).is_timeout());
}

// =============================================================================
// Attach Error Tests
// =============================================================================

#[test]
fn test_connection_errors_are_not_found() {
    assert!(Error::NoSuchConnection("c1".into()).is_not_found());

    let err = Error::ConnectionNotFound {
        id: "c1".into(),
        cause: Cause::DeadlineExceeded,
    };
    assert!(err.is_not_found());
    assert!(err.is_timeout());
    assert!(err.to_string().contains("id:c1"));
}

#[test]
fn test_cancelled_is_not_timeout() {
    let err = Error::Cancelled {
        operation: "power on".into(),
        cause: Cause::Cancelled,
    };
    assert!(!err.is_timeout());
    assert!(err.to_string().starts_with("power on"));
}

#[test]
fn test_expired_deadline_is_timeout() {
    let err = Error::Cancelled {
        operation: "wait for key".into(),
        cause: Cause::DeadlineExceeded,
    };
    assert!(err.is_timeout(), "deadline expiry is the only timeout form");
    assert!(err.to_string().starts_with("wait for key"));
}

// =============================================================================
// Conversion Tests
// =============================================================================

#[test]
fn test_io_error_conversion() {
    let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe").into();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn test_serde_error_conversion() {
    let err: Error = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}
