// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport session behaviour over real sockets: port walking, probe
//! validation, reconnect-and-retry, clean close.

use indexmap::IndexMap;
use spmbridge::error::ErrorKind;
use spmbridge::value::{ScalarValue, WireValue};
use spmbridge_specs::{tcp_transport, Handle, WireController};

fn no_args() -> IndexMap<String, ScalarValue> {
    IndexMap::new()
}

#[test]
fn connect_skips_dead_ports() {
    let controller = WireController::start();
    // Find a port that is almost certainly closed.
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let transport = tcp_transport(vec![dead_port, controller.port()]);
    transport.connect().expect("connect");
    let health = transport.health();
    assert!(health.connected);
    assert_eq!(
        health.details["active_port"],
        serde_json::json!(controller.port())
    );
    transport.close();
}

#[test]
fn no_listening_port_yields_a_connection_error_summary() {
    let dead_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let transport = tcp_transport(vec![dead_port]);
    let err = transport.connect().expect_err("should fail");
    assert_eq!(err.kind(), ErrorKind::ConnectionError);
    assert!(err.to_string().contains("attempt"));
}

#[test]
fn calls_flow_end_to_end_through_the_codec() {
    let controller = WireController::start();
    controller.reply(
        "Scan_FrameGet",
        vec![
            WireValue::Float(1.0e-8),
            WireValue::Float(2.0e-8),
            WireValue::Float(1.0e-7),
            WireValue::Float(1.0e-7),
            WireValue::Float(45.0),
        ],
    );

    let transport = tcp_transport(vec![controller.port()]);
    let response = transport.call("Scan_FrameGet", &no_args()).expect("call");
    assert_eq!(response.payload.len(), 5);
    assert_eq!(response.payload[4], WireValue::Float(45.0));
    assert_eq!(response.value, None);
    transport.close();
}

#[test]
fn arguments_arrive_in_declared_order_with_coerced_types() {
    let controller = WireController::start();
    controller.reply("Scan_Action", vec![]);

    let transport = tcp_transport(vec![controller.port()]);
    // Keys intentionally lowercased and out of order; values as strings.
    let args = IndexMap::from([
        ("scan_direction".to_owned(), ScalarValue::Str("1".to_owned())),
        ("scan_action".to_owned(), ScalarValue::Str("0".to_owned())),
    ]);
    transport.call("Scan_Action", &args).expect("call");

    let calls = controller.calls_for("Scan_Action");
    assert_eq!(
        calls[0],
        vec![
            ("Scan_action".to_owned(), ScalarValue::Int(0)),
            ("Scan_direction".to_owned(), ScalarValue::Int(1)),
        ]
    );
    transport.close();
}

#[test]
fn hangup_mid_session_reconnects_transparently() {
    let controller = WireController::start();
    let mut current_reads = 0u32;
    controller.handle("Current_Get", move |_| {
        current_reads += 1;
        if current_reads == 1 {
            Handle::Hangup
        } else {
            Handle::Reply(vec![WireValue::Float(3.5e-10)])
        }
    });

    let transport = tcp_transport(vec![controller.port()]);
    transport.connect().expect("connect");
    let before = controller.connections();

    let response = transport.call("Current_Get", &no_args()).expect("retried call");
    assert_eq!(response.value, Some(WireValue::Float(3.5e-10)));
    assert!(controller.connections() > before, "expected a reconnect");
    transport.close();
}

#[test]
fn controller_refusals_pass_through_without_retry() {
    let controller = WireController::start();
    controller.handle("Current_Get", |_| Handle::Refuse("sensor disabled".to_owned()));

    let transport = tcp_transport(vec![controller.port()]);
    let err = transport.call("Current_Get", &no_args()).expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::ControllerError);
    assert!(err.to_string().contains("sensor disabled"));
    assert_eq!(controller.calls_for("Current_Get").len(), 1);
    transport.close();
}

#[test]
fn repeated_connect_close_cycles_are_clean() {
    let controller = WireController::start();
    let transport = tcp_transport(vec![controller.port()]);
    for _ in 0..5 {
        transport.connect().expect("connect");
        assert!(transport.health().connected);
        transport.close();
        assert!(!transport.health().connected);
    }
    assert_eq!(controller.connections(), 5);
}
