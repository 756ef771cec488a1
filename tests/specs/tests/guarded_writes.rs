// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end guarded write scenarios over a real TCP session.

use parking_lot::Mutex;
use std::sync::Arc;

use spmbridge::error::ErrorKind;
use spmbridge::value::{ScalarValue, WireValue};
use spmbridge_specs::{tcp_instrument, Handle, WireController};

/// Scenario: bias sits at 2.0 V, the operator nudges it to 2.05 V under a
/// 0.1 V max step. One command reaches the controller and the report says
/// so.
#[test]
fn single_step_accept() {
    let controller = WireController::start();
    let bias = Arc::new(Mutex::new(2.0_f64));

    let read_bias = Arc::clone(&bias);
    controller.handle("Bias_Get", move |_| {
        Handle::Reply(vec![WireValue::Float(*read_bias.lock())])
    });
    let write_bias = Arc::clone(&bias);
    controller.handle("Bias_Set", move |args| {
        if let Some((_, ScalarValue::Float(value))) =
            args.iter().find(|(name, _)| name == "Bias_value_V")
        {
            *write_bias.lock() = *value;
        }
        Handle::Reply(vec![])
    });

    let instrument = tcp_instrument(controller.port(), true, false);
    let report = instrument.set_single_step("bias_v", 2.05, None).expect("write");

    assert!(!report.dry_run);
    assert_eq!(report.attempted_steps, 1);
    assert_eq!(report.applied_steps, 1);
    assert_eq!(report.initial_value, 2.0);
    assert_eq!(report.final_value, 2.05);
    assert_eq!(*bias.lock(), 2.05);
    assert_eq!(controller.calls_for("Bias_Set").len(), 1);
    instrument.close();
}

/// Scenario: the same limit rejects a 0.2 V jump before anything reaches
/// the controller.
#[test]
fn single_step_reject_step_too_large() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(2.0)]);

    let instrument = tcp_instrument(controller.port(), true, false);
    let err = instrument.set_single_step("bias_v", 2.2, None).expect_err("should reject");

    assert_eq!(err.kind(), ErrorKind::PolicyViolation);
    let message = err.to_string();
    assert!(message.contains("bias_v"), "{message}");
    assert!(message.contains("max_step 0.1"), "{message}");
    assert!(controller.calls_for("Bias_Set").is_empty());
    instrument.close();
}

/// Scenario: a dry-run ramp plans the full staircase but never sends a
/// single write command.
#[test]
fn dry_run_ramp_never_touches_the_controller() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(2.0)]);

    let instrument = tcp_instrument(controller.port(), true, true);
    let plan = instrument.plan_ramp("bias_v", 2.0, 2.4, 0.1, None).expect("plan");
    assert!(plan.dry_run);
    assert_eq!(*plan.steps.last().expect("steps"), 2.4);

    let report = instrument.ramp("bias_v", 2.0, 2.4, 0.1, Some(0.0)).expect("ramp");
    assert_eq!(report.applied_steps, 0);
    assert!(controller.calls_for("Bias_Set").is_empty());
    instrument.close();
}

/// Scenario: a live ramp walks the staircase and lands exactly on the end
/// value.
#[test]
fn live_ramp_staircases_to_the_target() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(2.0)]);
    let writes: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&writes);
    controller.handle("Bias_Set", move |args| {
        if let Some((_, ScalarValue::Float(value))) =
            args.iter().find(|(name, _)| name == "Bias_value_V")
        {
            sink.lock().push(*value);
        }
        Handle::Reply(vec![])
    });

    let instrument = tcp_instrument(controller.port(), true, false);
    let report = instrument.ramp("bias_v", 2.0, 2.4, 0.1, Some(0.0)).expect("ramp");

    let sent = writes.lock().clone();
    assert_eq!(report.applied_steps, sent.len());
    assert_eq!(sent.last().copied(), Some(2.4));
    for pair in sent.windows(2) {
        assert!((pair[1] - pair[0]).abs() <= 0.1 + 1e-12);
    }
    instrument.close();
}

/// A controller refusal mid-ramp surfaces as a controller error and the
/// audit log records how far the staircase got.
#[test]
fn controller_refusal_mid_ramp_is_audited() {
    let controller = WireController::start();
    controller.reply("Bias_Get", vec![WireValue::Float(0.0)]);
    let mut sends = 0;
    controller.handle("Bias_Set", move |_| {
        sends += 1;
        if sends >= 2 {
            Handle::Refuse("safety interlock".to_owned())
        } else {
            Handle::Reply(vec![])
        }
    });

    let instrument = tcp_instrument(controller.port(), true, false);
    let err = instrument.ramp("bias_v", 0.0, 0.3, 0.1, Some(0.0)).expect_err("refused");
    assert_eq!(err.kind(), ErrorKind::ControllerError);

    let audit = instrument.audit_log();
    let entry = audit.last().expect("audit entry");
    assert_eq!(entry.status, spmbridge::instrument::WriteStatus::Failed);
    assert_eq!(entry.metadata["applied_steps"], 1);
    instrument.close();
}
