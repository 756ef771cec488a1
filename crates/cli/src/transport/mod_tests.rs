// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::ErrorKind;
use crate::test_support::{
    fake_transport, fake_transport_with, test_settings, FakeController, Reply,
};

fn no_args() -> IndexMap<String, ScalarValue> {
    IndexMap::new()
}

// ===== Connection establishment ==============================================

#[test]
fn connect_probes_the_first_healthy_port() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    transport.connect().unwrap();
    assert_eq!(transport.endpoint(), Some("127.0.0.1:6501".to_owned()));
    assert_eq!(controller.calls_for("Bias_Get").len(), 1);
}

#[test]
fn connect_walks_ports_in_order() {
    let controller = FakeController::new();
    controller.refuse_port(6501);
    controller.refuse_port(6502);
    let mut settings = test_settings();
    settings.ports = vec![6501, 6502, 6503];
    let transport = fake_transport_with(&controller, settings);
    transport.connect().unwrap();
    assert_eq!(transport.endpoint(), Some("127.0.0.1:6503".to_owned()));
}

#[test]
fn probe_timeout_moves_to_the_next_port() {
    let controller = FakeController::new();
    // First session answers the probe with a timeout; retry then next port.
    controller.push("Bias_Get", Reply::Fail(crate::error::BridgeError::timeout("probe")));
    controller.push("Bias_Get", Reply::Fail(crate::error::BridgeError::timeout("probe")));
    let mut settings = test_settings();
    settings.ports = vec![6501, 6502];
    settings.retry_count = 1;
    let transport = fake_transport_with(&controller, settings);
    transport.connect().unwrap();
    assert_eq!(transport.endpoint(), Some("127.0.0.1:6502".to_owned()));
    assert_eq!(controller.sessions_opened(), 3);
}

#[test]
fn all_ports_failing_summarizes_the_last_five_failures() {
    let controller = FakeController::new();
    for port in [6501, 6502, 6503, 6504, 6505, 6506] {
        controller.refuse_port(port);
    }
    let mut settings = test_settings();
    settings.ports = vec![6501, 6502, 6503, 6504, 6505, 6506];
    settings.retry_count = 0;
    let transport = fake_transport_with(&controller, settings);
    let err = transport.connect().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    let message = err.to_string();
    // Six attempts failed; only the last five are reported.
    assert!(!message.contains("6501 attempt"), "oldest failure should be dropped: {message}");
    for port in [6502, 6503, 6504, 6505, 6506] {
        assert!(message.contains(&format!("{port} attempt")), "missing {port}: {message}");
    }
}

#[test]
fn close_is_idempotent_and_resets_endpoint() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    transport.connect().unwrap();
    transport.close();
    assert_eq!(transport.endpoint(), None);
    transport.close();
    assert!(!transport.health().connected);
}

#[test]
fn repeated_open_close_leaks_no_session() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    for _ in 0..5 {
        transport.connect().unwrap();
        transport.close();
    }
    assert_eq!(controller.sessions_opened(), 5);
}

// ===== Command dispatch ======================================================

#[test]
fn call_connects_implicitly() {
    let controller = FakeController::new();
    controller.on_value("Current_Get", WireValue::Float(1.0e-9));
    let transport = fake_transport(&controller);
    let response = transport.call("Current_Get", &no_args()).unwrap();
    assert_eq!(response.command, "Current_Get");
    assert_eq!(response.value, Some(WireValue::Float(1.0e-9)));
    assert!(transport.health().connected);
}

#[test]
fn single_scalar_payload_sets_value() {
    let controller = FakeController::new();
    controller.on("Scan_StatusGet", Reply::Payload(vec![WireValue::Int(2)]));
    let transport = fake_transport(&controller);
    let response = transport.call("Scan_StatusGet", &no_args()).unwrap();
    assert_eq!(response.value, Some(WireValue::Int(2)));
}

#[test]
fn multi_element_payload_leaves_value_unset() {
    let controller = FakeController::new();
    controller.on(
        "Scan_FrameGet",
        Reply::Payload(vec![
            WireValue::Float(0.0),
            WireValue::Float(0.0),
            WireValue::Float(1.0e-7),
            WireValue::Float(1.0e-7),
            WireValue::Float(0.0),
        ]),
    );
    let transport = fake_transport(&controller);
    let response = transport.call("Scan_FrameGet", &no_args()).unwrap();
    assert_eq!(response.payload.len(), 5);
    assert_eq!(response.value, None);
}

#[test]
fn controller_error_string_becomes_controller_error() {
    let controller = FakeController::new();
    controller.on("Bias_Set", Reply::Refuse("Bias out of range".to_owned()));
    let transport = fake_transport(&controller);
    let args: IndexMap<String, ScalarValue> =
        IndexMap::from([("Bias_value_V".to_owned(), ScalarValue::Float(11.0))]);
    let err = transport.call("Bias_Set", &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ControllerError);
    assert!(err.to_string().contains("Bias out of range"));
}

#[test]
fn invalid_arguments_fail_before_any_session_work() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    let args: IndexMap<String, ScalarValue> =
        IndexMap::from([("Nope".to_owned(), ScalarValue::Int(1))]);
    let err = transport.call("Bias_Set", &args).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(controller.sessions_opened(), 0);
}

#[test]
fn unknown_command_fails_without_a_connection() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    let err = transport.call("Nope_Get", &no_args()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CommandUnavailable);
    assert_eq!(controller.sessions_opened(), 0);
}

// ===== Per-call retry ========================================================

#[test]
fn connection_drop_reconnects_and_retries_transparently() {
    let controller = FakeController::new();
    controller.push("Current_Get", Reply::Fail(crate::error::BridgeError::connection("reset")));
    controller.on_value("Current_Get", WireValue::Float(2.5e-10));
    let transport = fake_transport(&controller);
    transport.connect().unwrap();

    let response = transport.call("Current_Get", &no_args()).unwrap();
    assert_eq!(response.value, Some(WireValue::Float(2.5e-10)));
    // First session plus the reconnect.
    assert_eq!(controller.sessions_opened(), 2);
}

#[test]
fn timeout_is_retried_then_surfaces() {
    let controller = FakeController::new();
    controller.on("Current_Get", Reply::Fail(crate::error::BridgeError::timeout("slow")));
    let mut settings = test_settings();
    settings.retry_count = 1;
    let transport = fake_transport_with(&controller, settings);
    transport.connect().unwrap();

    let err = transport.call("Current_Get", &no_args()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimeoutError);
    // Two call attempts were made.
    assert_eq!(controller.calls_for("Current_Get").len(), 2);
}

#[test]
fn controller_errors_are_never_retried() {
    let controller = FakeController::new();
    controller.on("Current_Get", Reply::Refuse("no".to_owned()));
    let transport = fake_transport(&controller);
    transport.connect().unwrap();
    let _ = transport.call("Current_Get", &no_args()).unwrap_err();
    assert_eq!(controller.calls_for("Current_Get").len(), 1);
}

// ===== Health ================================================================

#[test]
fn health_reports_connection_details() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);

    let health = transport.health();
    assert!(!health.connected);
    assert_eq!(health.endpoint, None);

    transport.connect().unwrap();
    let health = transport.health();
    assert!(health.connected);
    assert_eq!(health.endpoint, Some("127.0.0.1:6501".to_owned()));
    assert!(health.last_latency_ms.is_some());
    assert_eq!(health.details["backend"], "fake");
    assert_eq!(health.details["active_port"], 6501);
    assert_eq!(health.details["retry_count"], 1);
}

#[test]
fn health_records_the_last_error() {
    let controller = FakeController::new();
    controller.on("Current_Get", Reply::Refuse("beam off".to_owned()));
    let transport = fake_transport(&controller);
    transport.connect().unwrap();
    let _ = transport.call("Current_Get", &no_args());
    let health = transport.health();
    assert!(health.details["last_error"].as_str().unwrap().contains("beam off"));
}

#[test]
fn available_commands_come_from_the_manifest() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    let commands = transport.available_commands();
    assert!(commands.contains(&"Bias_Set".to_owned()));
    assert!(commands.contains(&"Motor_StartMove".to_owned()));
}

#[test]
fn version_names_the_backend() {
    let controller = FakeController::new();
    let transport = fake_transport(&controller);
    assert_eq!(transport.version(), "fake/0");
}
