// Reaper sweeps: stuck transient channels, token revalidation, drift
// correction, abandoned sync runs.

use chrono::{Duration, Utc};

use groupcast::atoms::types::{ChannelStatus, SyncStatus};
use groupcast::engine::gateway::ErrorKind;

use super::support::{gateway_err, harness, health};

const LONG_AGO: &str = "2020-01-01T00:00:00.000Z";

#[tokio::test]
async fn integration_reaper_clears_stuck_transient_channels() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Created);
    h.seed_channel("u2", ChannelStatus::Initializing);
    h.seed_channel("u3", ChannelStatus::Created);
    h.age_channel("u1", LONG_AGO);
    h.age_channel("u2", LONG_AGO);

    let report = h.service.reap().await.unwrap();
    let mut cleared = report.cleared_stuck.clone();
    cleared.sort();
    assert_eq!(cleared, vec!["u1", "u2"]);
    assert_eq!(h.gateway.calls_to("delete_channel").len(), 2);

    for user in ["u1", "u2"] {
        let channel = h.store.require_channel(user).unwrap();
        assert_eq!(channel.status, ChannelStatus::Disconnected);
        assert!(channel.channel_id.is_none());
        assert!(channel.secret_token.is_none());
    }
    assert_eq!(h.store.require_channel("u3").unwrap().status, ChannelStatus::Created);
}

#[tokio::test]
async fn integration_reaper_skips_users_with_an_active_sync() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Created);
    h.age_channel("u1", LONG_AGO);
    h.store.start_progress("u1", "run-live").unwrap();

    let report = h.service.reap().await.unwrap();
    assert!(report.cleared_stuck.is_empty());
    assert_eq!(h.store.require_channel("u1").unwrap().status, ChannelStatus::Created);
}

#[tokio::test]
async fn integration_reaper_confirms_consistent_channel() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.age_channel("u1", LONG_AGO);

    let report = h.service.reap().await.unwrap();
    assert_eq!(report.confirmed, vec!["u1"]);
    assert!(report.corrected.is_empty());
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Connected);
    assert_ne!(channel.updated_at, LONG_AGO);
}

#[tokio::test]
async fn integration_reaper_demotes_logged_out_channel() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 4);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Ok(health("LOGOUT")));

    let report = h.service.reap().await.unwrap();
    assert_eq!(
        report.corrected,
        vec![("u1".to_string(), ChannelStatus::Connected, ChannelStatus::Unauthorized)]
    );
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Unauthorized);
    assert_eq!(channel.secret_token.as_deref(), Some("tok-u1"));
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_reaper_promotes_silently_authenticated_channel() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.age_channel("u1", LONG_AGO);

    let report = h.service.reap().await.unwrap();
    assert_eq!(
        report.corrected,
        vec![("u1".to_string(), ChannelStatus::Unauthorized, ChannelStatus::Connected)]
    );
    assert_eq!(h.store.require_channel("u1").unwrap().status, ChannelStatus::Connected);
}

#[tokio::test]
async fn integration_reaper_clears_dead_tokens() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 2);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Err(gateway_err(ErrorKind::Unauthorized)));

    let report = h.service.reap().await.unwrap();
    assert_eq!(report.cleared_invalid, vec!["u1"]);
    assert_eq!(h.gateway.calls_to("delete_channel"), vec!["delete_channel SEEDED-00001"]);
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Disconnected);
    assert!(channel.secret_token.is_none());
    assert!(h.service.list_groups("u1", false).unwrap().is_empty());
}

#[tokio::test]
async fn integration_reaper_clears_channels_gone_upstream_without_delete() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Unauthorized);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Err(gateway_err(ErrorKind::NotFound)));

    let report = h.service.reap().await.unwrap();
    assert_eq!(report.cleared_invalid, vec!["u1"]);
    assert!(h.gateway.calls_to("delete_channel").is_empty());
    assert_eq!(h.store.require_channel("u1").unwrap().status, ChannelStatus::Disconnected);
}

#[tokio::test]
async fn integration_reaper_retries_inconclusive_checks_next_sweep() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Err(gateway_err(ErrorKind::Timeout)));

    let report = h.service.reap().await.unwrap();
    assert!(report.cleared_invalid.is_empty());
    assert!(report.corrected.is_empty());
    assert!(report.confirmed.is_empty());
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Connected);
    assert_eq!(channel.updated_at, LONG_AGO);
}

#[tokio::test]
async fn integration_reaper_fails_abandoned_runs_before_channel_checks() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_channel("u2", ChannelStatus::Created);
    h.store.start_progress("u1", "run-a").unwrap();
    h.store.start_progress("u2", "run-b").unwrap();

    let report = h.service.reaper.sweep_at(Utc::now() + Duration::hours(1)).await.unwrap();
    let mut failed = report.failed_runs.clone();
    failed.sort();
    assert_eq!(failed, vec!["u1", "u2"]);
    // With its run gone, u2's stuck channel is cleared in the same pass.
    assert_eq!(report.cleared_stuck, vec!["u2"]);

    let row = h.store.get_progress("u1").unwrap().unwrap();
    assert_eq!(row.status, SyncStatus::Failed);
    assert_eq!(row.error.as_deref(), Some("no progress reported; run presumed dead"));

    // The lock is released: destructive operations work again.
    h.service.hard_disconnect("u1").await.unwrap();
}

#[tokio::test]
async fn integration_reaper_leaves_channel_reconnected_during_the_check() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.seed_groups("u1", 0, 4);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Ok(health("LOGOUT")));
    // The user re-authenticates while the sweep waits on the gateway.
    let store = h.store.clone();
    h.gateway.set_on_status(move |_| {
        store.force_status("u1", ChannelStatus::Connected).unwrap();
    });

    let report = h.service.reap().await.unwrap();
    assert!(report.corrected.is_empty());
    assert!(report.confirmed.is_empty());
    assert_eq!(h.store.require_channel("u1").unwrap().status, ChannelStatus::Connected);
    assert_eq!(h.service.list_groups("u1", false).unwrap().len(), 4);
}

#[tokio::test]
async fn integration_reaper_keeps_channel_recreated_during_the_check() {
    let h = harness();
    h.seed_channel("u1", ChannelStatus::Connected);
    h.age_channel("u1", LONG_AGO);
    h.gateway.set_default_status(Err(gateway_err(ErrorKind::Unauthorized)));
    let store = h.store.clone();
    h.gateway.set_on_status(move |_| {
        store.insert_channel("u1", "NEWCHN-00001", "tok-new", true).unwrap();
    });

    let report = h.service.reap().await.unwrap();
    assert!(report.cleared_invalid.is_empty());
    let channel = h.store.require_channel("u1").unwrap();
    assert_eq!(channel.status, ChannelStatus::Created);
    assert_eq!(channel.channel_id.as_deref(), Some("NEWCHN-00001"));
    assert_eq!(channel.secret_token.as_deref(), Some("tok-new"));
}
