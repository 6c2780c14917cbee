// Channel lifecycle against the scripted gateway: create, readiness, QR and
// phone login, status reconciliation, teardown, identifier repair.

use groupcast::atoms::types::{ChannelStatus, LoginMethod, PlanStatus};
use groupcast::engine::gateway::{ChannelSummary, ErrorKind, PhoneLoginOutcome, QrOutcome};
use groupcast::engine::lifecycle::{PhoneLoginResult, QrResult, ReadyOutcome, RecoveryAction};
use groupcast::engine::plan::PlanEnforcement;
use groupcast::{ChannelMode, EngineConfig, EngineError, ErrorClass};

use super::support::{gateway_err, harness, harness_with, health, Harness};

fn status_of(h: &Harness, user_id: &str) -> ChannelStatus {
    h.store.require_channel(user_id).unwrap().status
}

/// Channel stored with a non-canonical identifier, as older rows were.
fn seed_malformed(h: &Harness, user_id: &str, stored_id: &str) {
    h.store.insert_channel(user_id, stored_id, "tok-legacy", false).unwrap();
    h.store.force_status(user_id, ChannelStatus::Unauthorized).unwrap();
}

// ── Create and readiness ───────────────────────────────────────────────────

#[tokio::test]
async fn integration_create_poll_qr_connect() {
    let h = harness();

    let created = h.service.create_channel("u1", false).await.unwrap();
    assert_eq!(created.status, ChannelStatus::Created);
    assert_eq!(created.channel_id.as_deref(), Some("CHANNL-00001"));
    assert_eq!(h.gateway.calls_to("create_channel"), vec!["create_channel groupcast_u1"]);

    h.gateway.script_status(&["loading", "loading", "LAUNCHED"]);
    let outcome = h.service.controller.poll_ready("u1").await.unwrap();
    assert_eq!(outcome, ReadyOutcome::Ready);
    assert_eq!(h.gateway.calls_to("get_status").len(), 3);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Unauthorized);

    let qr = h.service.get_qr("u1").await.unwrap();
    let QrResult::Displayed { qr } = qr else { panic!("expected a QR image") };
    assert!(qr.data_uri().starts_with("data:image/png;base64,"));
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::QrDisplayed);
    assert_eq!(channel.login_method, Some(LoginMethod::Qr));

    h.gateway.script_status(&["authenticated"]);
    let check = h.service.controller.check_status("u1").await.unwrap();
    assert!(check.changed);
    assert_eq!(check.upstream.as_deref(), Some("authenticated"));
    assert_eq!(check.channel.status, ChannelStatus::Connected);

    // A second check with nothing new is a no-op.
    h.gateway.script_status(&["authenticated"]);
    let again = h.service.controller.check_status("u1").await.unwrap();
    assert!(!again.changed);
}

#[tokio::test]
async fn integration_create_refuses_active_channel_without_force() {
    let h = harness();
    h.service.create_channel("u1", false).await.unwrap();

    let err = h.service.create_channel("u1", false).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyExists { .. }));
    assert_eq!(err.class(), ErrorClass::Conflict);
    assert_eq!(h.gateway.calls_to("create_channel").len(), 1);
}

#[tokio::test]
async fn integration_forced_create_replaces_channel_and_drops_groups() {
    let h = harness();
    h.service.create_channel("u1", false).await.unwrap();
    h.seed_groups("u1", 0, 3);

    let replaced = h.service.create_channel("u1", true).await.unwrap();
    assert_eq!(replaced.channel_id.as_deref(), Some("CHANNL-00002"));
    assert_eq!(replaced.status, ChannelStatus::Created);
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel CHANNL-00001"]);
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_concurrent_creates_have_one_winner() {
    let h = harness();
    let (a, b) = tokio::join!(h.service.create_channel("u1", false), h.service.create_channel("u1", false));

    let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(loser, EngineError::AlreadyExists { .. }));

    // The loser's upstream channel is deleted; the stored one survives.
    let stored = h.store.require_channel("u1").unwrap().channel_id.unwrap();
    let deletes = h.gateway.calls_to("delete_channel");
    assert_eq!(deletes.len(), 1);
    assert_ne!(deletes[0], format!("delete_channel {}", stored));
}

#[tokio::test]
async fn integration_create_allowed_after_delete() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.service.delete_channel("u1").await.unwrap();

    let created = h.service.create_channel("u1", false).await.unwrap();
    assert_eq!(created.status, ChannelStatus::Created);
}

#[tokio::test]
async fn integration_poll_ready_failure_clears_channel() {
    let h = harness();
    h.service.create_channel("u1", false).await.unwrap();
    h.gateway.script_status(&["loading", "banned"]);

    let outcome = h.service.controller.poll_ready("u1").await.unwrap();
    assert_eq!(outcome, ReadyOutcome::Failed);
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Disconnected);
    assert!(channel.channel_id.is_none());
    assert!(channel.secret_token.is_none());
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel CHANNL-00001"]);
}

#[tokio::test]
async fn integration_poll_ready_timeout_leaves_channel_initializing() {
    let mut config = EngineConfig::immediate();
    config.lifecycle.ready_max_attempts = 4;
    let h = harness_with(config);
    h.service.create_channel("u1", false).await.unwrap();
    h.gateway.set_default_status(Ok(health("loading")));

    let outcome = h.service.controller.poll_ready("u1").await.unwrap();
    assert_eq!(outcome, ReadyOutcome::TimedOut);
    assert_eq!(h.gateway.calls_to("get_status").len(), 4);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Initializing);
}

#[tokio::test]
async fn integration_poll_ready_survives_transient_errors() {
    let h = harness();
    h.service.create_channel("u1", false).await.unwrap();
    h.gateway.status.lock().push_back(Err(gateway_err(ErrorKind::Timeout)));
    h.gateway.status.lock().push_back(Err(gateway_err(ErrorKind::RateLimited)));
    h.gateway.script_status(&["qr"]);

    let outcome = h.service.controller.wait_until_ready("u1", 5).await.unwrap();
    assert_eq!(outcome, ReadyOutcome::Ready);
    assert_eq!(h.gateway.calls_to("get_status").len(), 3);
}

#[tokio::test]
async fn integration_poll_ready_settles_already_authenticated_channel() {
    let h = harness();
    h.service.create_channel("u1", false).await.unwrap();
    h.gateway.script_status(&["authenticated"]);

    let outcome = h.service.controller.poll_ready("u1").await.unwrap();
    assert_eq!(outcome, ReadyOutcome::Ready);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Connected);
}

// ── Authentication ─────────────────────────────────────────────────────────

#[tokio::test]
async fn integration_qr_request_on_authenticated_account_connects() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.gateway.qr.lock().push_back(Ok(QrOutcome::AlreadyAuthenticated));

    let result = h.service.get_qr("u1").await.unwrap();
    assert_eq!(result, QrResult::AlreadyConnected);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Connected);

    // Connected channels never ask the gateway for another QR.
    let again = h.service.get_qr("u1").await.unwrap();
    assert_eq!(again, QrResult::AlreadyConnected);
    assert_eq!(h.gateway.calls_to("get_qr").len(), 1);
}

#[tokio::test]
async fn integration_qr_request_rejected_before_launch() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Created);
    h.gateway.script_status(&["loading"]);

    let err = h.service.get_qr("u1").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidState { .. }));
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Initializing);
    assert!(h.gateway.calls_to("get_qr").is_empty());
}

#[tokio::test]
async fn integration_qr_on_vanished_channel_clears_locally() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.gateway.qr.lock().push_back(Err(gateway_err(ErrorKind::NotFound)));

    let err = h.service.get_qr("u1").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::NotFoundUpstream);
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Disconnected);
    assert!(channel.channel_id.is_none());
}

#[tokio::test]
async fn integration_phone_login_with_pairing_code() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.gateway
        .phone
        .lock()
        .push_back(Ok(PhoneLoginOutcome::CodeRequired { code: "WXYZ-1234".into() }));

    let result = h.service.login_with_phone("u1", "+972 50-000-0001").await.unwrap();
    assert_eq!(result, PhoneLoginResult::CodeRequired { pairing_code: "WXYZ-1234".into() });
    assert_eq!(h.gateway.calls_to("login_with_phone"), vec!["login_with_phone tok-u1 972500000001"]);

    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::QrDisplayed);
    assert_eq!(channel.login_method, Some(LoginMethod::PhoneCode));
    assert_eq!(channel.pairing_code.as_deref(), Some("WXYZ-1234"));

    // The user typed the code; the next check picks up the login.
    h.gateway.script_status(&["ready"]);
    let check = h.service.controller.check_status("u1").await.unwrap();
    assert_eq!(check.channel.status, ChannelStatus::Connected);
    assert!(check.channel.pairing_code.is_none());
}

#[tokio::test]
async fn integration_phone_login_connects_directly() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);

    let result = h.service.login_with_phone("u1", "15550109999").await.unwrap();
    assert_eq!(result, PhoneLoginResult::Connected);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Connected);
}

#[tokio::test]
async fn integration_phone_login_without_digits_is_rejected() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);

    let err = h.service.login_with_phone("u1", "call me").await.unwrap_err();
    assert!(matches!(err, EngineError::Other(_)));
    assert!(h.gateway.calls_to("login_with_phone").is_empty());
}

// ── Status reconciliation ──────────────────────────────────────────────────

#[tokio::test]
async fn integration_upstream_logout_demotes_and_drops_groups() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 4);
    h.gateway.script_status(&["QR"]);

    let view = h.service.get_channel_status("u1", true).await.unwrap();
    assert_eq!(view.status, ChannelStatus::Unauthorized);
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_displayed_qr_is_not_downgraded() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::QrDisplayed);
    h.gateway.script_status(&["qr"]);

    let check = h.service.controller.check_status("u1").await.unwrap();
    assert!(!check.changed);
    assert_eq!(check.channel.status, ChannelStatus::QrDisplayed);
}

#[tokio::test]
async fn integration_vanished_channel_is_cleared_on_status_check() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 2);
    h.gateway.status.lock().push_back(Err(gateway_err(ErrorKind::NotFound)));

    let check = h.service.controller.check_status("u1").await.unwrap();
    assert!(check.changed);
    assert_eq!(check.channel.status, ChannelStatus::Disconnected);
    assert!(check.channel.channel_id.is_none());
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_status_without_channel_reads_none() {
    let h = harness();
    let view = h.service.get_channel_status("nobody", true).await.unwrap();
    assert_eq!(view.status, ChannelStatus::None);
    assert!(view.channel_id.is_none());
    assert!(h.gateway.calls.lock().is_empty());

    let json = serde_json::to_value(&view).unwrap();
    assert!(json.get("secret_token").is_none());
}

// ── Teardown ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn integration_hard_disconnect_keeps_token_and_drops_groups() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 5);
    *h.gateway.logout_error.lock() = Some(gateway_err(ErrorKind::Timeout));

    let view = h.service.hard_disconnect("u1").await.unwrap();
    assert_eq!(view.status, ChannelStatus::Unauthorized);
    assert_eq!(view.channel_id.as_deref(), Some("SEEDED-00001"));
    assert_eq!(h.gateway.calls_to("logout"), vec!["logout tok-u1"]);

    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.secret_token.as_deref(), Some("tok-u1"));
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_delete_channel_tolerates_missing_upstream() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 2);
    h.gateway.delete_errors.lock().push_back(gateway_err(ErrorKind::NotFound));

    let view = h.service.delete_channel("u1").await.unwrap();
    assert_eq!(view.status, ChannelStatus::None);
    assert!(view.channel_id.is_none());
    let row = h.store.get_channel("u1").unwrap().expect("row kept");
    assert_eq!(row.status, ChannelStatus::None);
    assert!(row.secret_token.is_none());
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_delete_channel_keeps_row_on_upstream_failure() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.gateway.delete_errors.lock().push_back(gateway_err(ErrorKind::RateLimited));

    let err = h.service.delete_channel("u1").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Connected);
}

#[tokio::test]
async fn integration_malformed_identifier_is_never_sent_upstream() {
    let h = harness();
    seed_malformed(&h, "u1", "groupcast_u1");

    let err = h.service.delete_channel("u1").await.unwrap_err();
    assert!(matches!(err, EngineError::MalformedIdentifier(_)));
    assert_eq!(err.class(), ErrorClass::MalformedIdentifier);
    assert!(h.gateway.calls_to("delete_channel").is_empty());
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Unauthorized);
}

#[tokio::test]
async fn integration_destructive_operations_refused_during_sync() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.store.start_progress("u1", "run-held").unwrap();

    assert!(matches!(h.service.hard_disconnect("u1").await, Err(EngineError::Busy(_))));
    assert!(matches!(h.service.delete_channel("u1").await, Err(EngineError::Busy(_))));
    assert!(matches!(h.service.create_channel("u1", true).await, Err(EngineError::Busy(_))));
    assert!(matches!(h.service.enforce_plan("u1").await, Err(EngineError::Busy(_))));
    assert_eq!(status_of(&h, "u1"), ChannelStatus::Connected);
    assert!(h.gateway.calls.lock().is_empty());
}

// ── Identifier repair and recovery ─────────────────────────────────────────

#[tokio::test]
async fn integration_repair_uses_the_single_confirmed_match() {
    let h = harness();
    seed_malformed(&h, "u1", "groupcast_u1");
    h.gateway.channels.lock().extend([
        ChannelSummary { channel_id: "REPAIR-00001".into(), name: "groupcast_u1".into() },
        ChannelSummary { channel_id: "OTHERS-00002".into(), name: "groupcast_u2".into() },
        ChannelSummary { channel_id: "not canonical".into(), name: "groupcast_u1".into() },
    ]);

    let repaired = h.service.controller.repair_identifier("u1").await.unwrap();
    assert_eq!(repaired.channel_id.as_deref(), Some("REPAIR-00001"));

    h.service.delete_channel("u1").await.unwrap();
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel REPAIR-00001"]);
}

#[tokio::test]
async fn integration_repair_refuses_ambiguous_or_missing_matches() {
    let h = harness();
    seed_malformed(&h, "u1", "groupcast_u1");

    let err = h.service.controller.repair_identifier("u1").await.unwrap_err();
    assert!(matches!(err, EngineError::RepairFailed(_)));

    h.gateway.channels.lock().extend([
        ChannelSummary { channel_id: "REPAIR-00001".into(), name: "groupcast_u1".into() },
        ChannelSummary { channel_id: "REPAIR-00002".into(), name: "groupcast_u1".into() },
    ]);
    let err = h.service.controller.repair_identifier("u1").await.unwrap_err();
    assert!(matches!(err, EngineError::RepairFailed(_)));
    let stored = h.store.require_channel("u1").unwrap().channel_id;
    assert_eq!(stored.as_deref(), Some("groupcast_u1"));
}

#[tokio::test]
async fn integration_recover_repairs_then_recreates() {
    let h = harness();
    seed_malformed(&h, "u1", "groupcast_u1");
    h.gateway
        .channels
        .lock()
        .push(ChannelSummary { channel_id: "REPAIR-00001".into(), name: "groupcast_u1".into() });
    h.gateway.script_status(&["qr"]);

    let report = h.service.recover("u1", true).await.unwrap();
    let actions: Vec<_> = report.steps.iter().map(|s| (s.action, s.ok)).collect();
    assert_eq!(
        actions,
        vec![
            (RecoveryAction::CheckStatus, true),
            (RecoveryAction::RepairIdentifier, true),
            (RecoveryAction::Recreate, true),
        ]
    );
    assert_eq!(report.final_status, ChannelStatus::Created);
    // The repaired channel is replaced and removed upstream.
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel REPAIR-00001"]);
}

#[tokio::test]
async fn integration_recover_reports_failed_steps_with_hints() {
    let h = harness();
    seed_malformed(&h, "u1", "groupcast_u1");
    h.gateway.script_status(&["qr"]);

    let report = h.service.recover("u1", false).await.unwrap();
    let repair = report
        .steps
        .iter()
        .find(|s| s.action == RecoveryAction::RepairIdentifier)
        .unwrap();
    assert!(!repair.ok);
    assert_eq!(repair.error_class, Some(ErrorClass::MalformedIdentifier));
    assert_eq!(repair.detail, "identifier could not be repaired, recreate channel");
    assert_eq!(report.final_status, ChannelStatus::Unauthorized);
}

// ── Plan gate ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn integration_live_mode_requires_paid_plan() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);

    let err = h.service.upgrade_to_live("u1").await.unwrap_err();
    assert!(matches!(err, EngineError::PlanRequired(_)));
    assert!(!h.service.is_live_eligible("u1").await.unwrap());

    h.set_plan("u1", PlanStatus::Paid);
    let view = h.service.upgrade_to_live("u1").await.unwrap();
    assert_eq!(view.mode, ChannelMode::Live);
    assert_eq!(h.gateway.calls_to("set_channel_mode"), vec!["set_channel_mode SEEDED-00001 live"]);
}

#[tokio::test]
async fn integration_expired_plan_tears_channel_down_once() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 3);

    assert_eq!(h.service.enforce_plan("u1").await.unwrap(), PlanEnforcement::Unchanged);

    h.set_plan("u1", PlanStatus::Expired);
    assert_eq!(h.service.enforce_plan("u1").await.unwrap(), PlanEnforcement::Expired);
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Expired);
    assert!(channel.secret_token.is_none());
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel SEEDED-00001"]);

    assert_eq!(h.service.enforce_plan("u1").await.unwrap(), PlanEnforcement::Unchanged);
    assert_eq!(h.gateway.calls_to("delete_channel").len(), 1);

    // An expired row does not block a new trial channel.
    let created = h.service.create_channel("u1", false).await.unwrap();
    assert_eq!(created.status, ChannelStatus::Created);
}
