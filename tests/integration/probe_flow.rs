//! End-to-end probe runs against the mock API and the simulated provider.

use std::time::{Duration, Instant};

use account_probe::config::{AppConfig, Provider};
use account_probe::engine::{AccountProbe, ProbeSettings};
use account_probe::platforms;
use account_probe::types::ProbeError;

use crate::mock_api::{CallCounts, MockApi, SyncBehaviour};

fn settings(sync_timeout: Option<Duration>) -> ProbeSettings {
    ProbeSettings {
        sync_timeout,
        ..ProbeSettings::default()
    }
}

/// Run the probe to completion, returning the result and everything written.
async fn run_probe(
    api: &MockApi,
    account_id: &str,
    settings: ProbeSettings,
) -> (Result<(), ProbeError>, String) {
    let probe = AccountProbe::new(account_id, settings);
    let mut out = Vec::new();
    let result = probe
        .execute(api, &mut out, std::future::pending())
        .await
        .map(|_| ());
    (result, String::from_utf8(out).unwrap())
}

#[tokio::test]
async fn test_prints_balance_and_position_count() {
    let api = MockApi::new("acc-1", 1000.0, 2);
    let (result, out) = run_probe(&api, "acc-1", settings(Some(Duration::from_secs(5)))).await;

    assert!(result.is_ok());
    assert_eq!(out, "Balance: 1000.0\nOpen positions: 2\n");
    assert_eq!(
        api.calls(),
        CallCounts {
            get_account: 1,
            connect: 1,
            wait_synchronized: 1,
            get_account_information: 1,
            get_positions: 1,
            get_deals: 0,
            close: 1,
        }
    );
}

#[tokio::test]
async fn test_unknown_account_prints_nothing() {
    let api = MockApi::new("acc-1", 1000.0, 2);
    let (result, out) = run_probe(&api, "nope", settings(Some(Duration::from_secs(5)))).await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProbeError::AccountNotFound { .. }));
    assert_ne!(err.exit_code(), 0);
    assert!(out.is_empty());
    assert_eq!(api.calls().connect, 0);
}

#[tokio::test]
async fn test_hanging_sync_times_out() {
    let api = MockApi::with_sync("acc-1", 1000.0, SyncBehaviour::Hang);
    let deadline = Duration::from_millis(50);

    let started = Instant::now();
    let (result, out) = run_probe(&api, "acc-1", settings(Some(deadline))).await;

    match result {
        Err(ProbeError::SynchronizationTimeout(limit)) => assert_eq!(limit, deadline),
        other => panic!("expected synchronization timeout, got {other:?}"),
    }
    assert!(started.elapsed() >= deadline);
    assert!(out.is_empty());

    let calls = api.calls();
    assert_eq!(calls.get_account_information, 0);
    assert_eq!(calls.get_positions, 0);
    assert_eq!(calls.close, 1);
}

#[tokio::test]
async fn test_connect_failure_stops_the_sequence() {
    let api = MockApi::failing_connect("acc-1", "TLS handshake failed");
    let (result, out) = run_probe(&api, "acc-1", settings(Some(Duration::from_secs(5)))).await;

    let err = result.unwrap_err();
    assert!(matches!(err, ProbeError::Connection(ref m) if m.contains("TLS handshake failed")));
    assert!(out.is_empty());

    let calls = api.calls();
    assert_eq!(calls.connect, 1);
    assert_eq!(calls.wait_synchronized, 0);
    assert_eq!(calls.get_account_information, 0);
    assert_eq!(calls.get_positions, 0);
    // Nothing was opened, so nothing is closed.
    assert_eq!(calls.close, 0);
}

#[tokio::test]
async fn test_sync_failure_is_connection_error() {
    let api = MockApi::with_sync(
        "acc-1",
        10.0,
        SyncBehaviour::Fail("DISCONNECTED_FROM_BROKER".to_string()),
    );
    let (result, out) = run_probe(&api, "acc-1", settings(None)).await;

    assert!(matches!(result, Err(ProbeError::Connection(_))));
    assert!(out.is_empty());
    assert_eq!(api.calls().close, 1);
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let api = MockApi::new("acc-1", 2500.75, 3);

    let (first_result, first) = run_probe(&api, "acc-1", settings(None)).await;
    let (second_result, second) = run_probe(&api, "acc-1", settings(None)).await;

    assert!(first_result.is_ok() && second_result.is_ok());
    assert_eq!(first, "Balance: 2500.75\nOpen positions: 3\n");
    assert_eq!(first, second);
    assert_eq!(api.calls().get_account, 2);
    assert_eq!(api.calls().close, 2);
}

#[tokio::test]
async fn test_cancel_during_sync_closes_connection() {
    let api = MockApi::with_sync("acc-1", 1000.0, SyncBehaviour::Hang);
    let probe = AccountProbe::new("acc-1", settings(None));

    let mut out = Vec::new();
    let shutdown = tokio::time::sleep(Duration::from_millis(30));
    let result = probe.execute(&api, &mut out, shutdown).await;

    assert!(matches!(result, Err(ProbeError::Cancelled)));
    assert_eq!(ProbeError::Cancelled.exit_code(), 130);
    assert!(out.is_empty());
    assert_eq!(api.calls().close, 1);
}

#[tokio::test]
async fn test_history_requested() {
    let api = MockApi::new("acc-1", 1.0, 0);
    let probe = AccountProbe::new(
        "acc-1",
        ProbeSettings {
            history_days: 30,
            details: true,
            ..settings(None)
        },
    );
    let mut out = Vec::new();
    let report = probe
        .execute(&api, &mut out, std::future::pending())
        .await
        .unwrap();

    assert_eq!(report.history_days, Some(30));
    assert_eq!(api.calls().get_deals, 1);
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("Balance: 1.0\nOpen positions: 0\n"));
    assert!(text.ends_with("Deals (last 30 days): 0\n"));
}

#[tokio::test]
async fn test_simulated_provider_end_to_end() {
    let mut cfg = AppConfig::default();
    cfg.metaapi.provider = Provider::Simulated;
    cfg.simulated.account_ids = vec!["demo".to_string()];

    let api = platforms::build_api(&cfg).unwrap();
    let probe = AccountProbe::new("demo", ProbeSettings::from_config(&cfg));

    let mut out = Vec::new();
    probe
        .execute(api.as_ref(), &mut out, std::future::pending())
        .await
        .unwrap();
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "Balance: 10000.0\nOpen positions: 2\n"
    );

    let missing = AccountProbe::new("other", ProbeSettings::from_config(&cfg));
    let err = missing.probe(api.as_ref()).await.unwrap_err();
    assert!(matches!(err, ProbeError::AccountNotFound { .. }));
}

#[tokio::test]
async fn test_simulated_oversized_history_fails_cleanly() {
    let mut cfg = AppConfig::default();
    cfg.metaapi.provider = Provider::Simulated;
    cfg.probe.history_days = u32::MAX;

    let api = platforms::build_api(&cfg).unwrap();
    let probe = AccountProbe::new("demo", ProbeSettings::from_config(&cfg));

    let mut out = Vec::new();
    let err = probe
        .execute(api.as_ref(), &mut out, std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, ProbeError::Config(_)));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_metaapi_provider_requires_token() {
    let mut cfg = AppConfig::default();
    cfg.credentials.token_env = "ACCOUNT_PROBE_IT_TOKEN_UNSET".to_string();

    let err = platforms::build_api(&cfg).err().unwrap();
    assert!(matches!(err, ProbeError::Authentication(_)));
    assert_eq!(err.exit_code(), 3);
}
