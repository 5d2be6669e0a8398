mod common;

use common::{test_config, Behaviour, ScriptedController, SCRIPTED_STDERR};
use plugin_reload_conformance::harness::NOTIFICATION_LABEL;
use plugin_reload_conformance::{
    ExitState, HarnessConfig, HarnessError, MatchFailure, ScenarioRunner, ScenarioState,
    SubprocessController,
};
use std::time::Duration;

fn runner(behaviour: Behaviour, config: HarnessConfig) -> ScenarioRunner<ScriptedController> {
    let controller = ScriptedController::new(behaviour, &config);
    ScenarioRunner::new(controller, config).unwrap()
}

fn assert_torn_down(runner: &ScenarioRunner<ScriptedController>, runs: u32) {
    let stats = runner.controller().stats.lock().unwrap();
    assert_eq!(stats.starts, runs);
    assert_eq!(stats.terminates, runs);
    assert_eq!(stats.waits, runs);
    for path in &stats.config_paths {
        assert!(!path.exists(), "{} was left behind", path.display());
    }
}

#[tokio::test]
async fn test_both_variants_pass_against_conformant_broker() {
    let mut runner = runner(Behaviour::Conformant, test_config());
    let report = runner.run_all().await;

    assert!(report.passed(), "{}", report.generate_text());
    assert_eq!(report.outcomes.len(), 2);
    assert!(!report.outcomes[0].per_listener_settings);
    assert!(report.outcomes[1].per_listener_settings);
    for outcome in &report.outcomes {
        assert_eq!(outcome.reached, ScenarioState::LivenessVerified);
    }

    let first = report.outcomes[0].scenario.unwrap();
    let second = report.outcomes[1].scenario.unwrap();
    assert_ne!(first.port, second.port);
    assert_eq!(first.keepalive, 10);

    let stats = runner.controller().stats.lock().unwrap();
    assert_eq!(stats.reloads, 2);
    assert!(stats.config_contents[0].starts_with("per_listener_settings false\n"));
    assert!(stats.config_contents[1].starts_with("per_listener_settings true\n"));
    assert!(stats.config_contents[0].contains(&format!("listener {}\n", first.port)));
    drop(stats);
    assert_torn_down(&runner, 2);
}

#[tokio::test]
async fn test_single_wrong_byte_fails_with_unexpected_message() {
    let mut runner = runner(Behaviour::CorruptNotification, test_config());
    let report = runner.run_all().await;

    assert!(!report.passed());
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(report.skipped, vec![true]);

    let outcome = &report.outcomes[0];
    assert_eq!(outcome.reached, ScenarioState::ReloadTriggered);
    match &outcome.result {
        Err(HarnessError::UnexpectedMessage { label, reason, diff }) => {
            assert_eq!(label, NOTIFICATION_LABEL);
            assert_eq!(*reason, MatchFailure::Mismatch);
            assert_eq!(diff.first_difference(), Some(diff.expected.len() - 1));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_missing_notification_times_out() {
    let mut runner = runner(Behaviour::SilentOnReload, test_config());
    let outcome = runner.run(false).await;

    let err = outcome.result.as_ref().unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert!(outcome.elapsed < Duration::from_secs(5));
    assert_eq!(outcome.reached, ScenarioState::ReloadTriggered);
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_crash_after_notification_is_caught_by_ping() {
    let mut runner = runner(Behaviour::CrashAfterNotification, test_config());
    let outcome = runner.run(false).await;

    assert_eq!(outcome.reached, ScenarioState::NotificationVerified);
    assert!(matches!(
        outcome.result,
        Err(HarnessError::ProcessExitedEarly { status }) if status == ExitState::signal(11)
    ));
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_wrong_bytes_before_crash_keep_the_diff() {
    let mut runner = runner(Behaviour::CorruptThenCrash, test_config());
    let outcome = runner.run(false).await;

    assert_eq!(outcome.reached, ScenarioState::ReloadTriggered);
    match &outcome.result {
        Err(HarnessError::UnexpectedMessage { label, reason, diff }) => {
            assert_eq!(label, NOTIFICATION_LABEL);
            assert_eq!(*reason, MatchFailure::Mismatch);
            assert_eq!(diff.first_difference(), Some(diff.expected.len() - 1));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    let output = outcome.broker_output.as_ref().unwrap();
    assert_eq!(output.exit, Some(ExitState::signal(11)));
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_exit_before_listening_is_not_a_timeout() {
    let mut runner = runner(Behaviour::ExitBeforeListening, test_config());
    let outcome = runner.run(true).await;

    assert_eq!(outcome.reached, ScenarioState::ProcessStarted);
    let err = outcome.result.as_ref().unwrap_err();
    assert!(!err.is_timeout());
    assert!(matches!(
        err,
        HarnessError::ProcessExitedEarly { status } if *status == ExitState::code(1)
    ));
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_wrong_connack_is_handshake_mismatch() {
    let mut runner = runner(Behaviour::WrongConnAck, test_config());
    let outcome = runner.run(false).await;

    assert_eq!(outcome.reached, ScenarioState::ProcessStarted);
    match &outcome.result {
        Err(HarnessError::HandshakeMismatch { reason, diff }) => {
            assert_eq!(*reason, MatchFailure::Mismatch);
            assert_eq!(diff.first_difference(), Some(3));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_slow_startup_is_retried() {
    let mut runner = runner(
        Behaviour::DelayedListen(Duration::from_millis(150)),
        test_config(),
    );
    let outcome = runner.run(false).await;
    assert!(outcome.passed(), "{:?}", outcome.result);
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_startup_retry_is_bounded() {
    let mut config = test_config();
    config.startup.attempts = 3;
    let mut runner = runner(Behaviour::DelayedListen(Duration::from_secs(5)), config);
    let outcome = runner.run(false).await;

    assert!(matches!(
        outcome.result,
        Err(HarnessError::ConnectionRefused { attempts: 3, .. })
    ));
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_duplicate_notification_fails_liveness_check() {
    let mut runner = runner(Behaviour::DuplicateNotification, test_config());
    let outcome = runner.run(false).await;

    assert_eq!(outcome.reached, ScenarioState::NotificationVerified);
    match &outcome.result {
        Err(HarnessError::UnexpectedMessage { label, reason, .. }) => {
            assert_eq!(label, "pingresp");
            assert_eq!(*reason, MatchFailure::Mismatch);
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_torn_down(&runner, 1);
}

#[tokio::test]
async fn test_repeated_reload_cycles() {
    let mut config = test_config();
    config.reload_cycles = 3;
    let mut runner = runner(Behaviour::Conformant, config);
    let outcome = runner.run(true).await;

    assert!(outcome.passed(), "{:?}", outcome.result);
    assert_eq!(runner.controller().stats.lock().unwrap().reloads, 3);
}

#[tokio::test]
async fn test_without_fail_fast_every_variant_runs() {
    let mut config = test_config();
    config.fail_fast = false;
    let mut runner = runner(Behaviour::SilentOnReload, config);
    let report = runner.run_all().await;

    assert_eq!(report.outcomes.len(), 2);
    assert!(report.skipped.is_empty());
    assert_eq!(report.failed_count(), 2);
    assert_torn_down(&runner, 2);
}

#[tokio::test]
async fn test_failure_report_carries_broker_stderr() {
    let mut runner = runner(Behaviour::CorruptNotification, test_config());
    let report = runner.run_all().await;

    let output = report.outcomes[0].broker_output.as_ref().unwrap();
    assert_eq!(output.stderr, SCRIPTED_STDERR);
    let text = report.generate_text();
    assert!(text.contains("[FAIL] per_listener_settings=false"));
    assert!(text.contains("scripted broker: plugin loaded"));
    assert!(text.contains("[SKIP] per_listener_settings=true"));
}

#[tokio::test]
async fn test_config_write_failure_never_starts_broker() {
    let mut config = test_config();
    config.config_dir = Some(std::env::temp_dir().join("plugin-reload-missing-dir/nested"));
    let mut runner = runner(Behaviour::Conformant, config);
    let outcome = runner.run(false).await;

    assert!(matches!(outcome.result, Err(HarnessError::ConfigWrite { .. })));
    assert_eq!(outcome.reached, ScenarioState::Init);
    assert!(outcome.broker_output.is_none());
    assert_eq!(runner.controller().stats.lock().unwrap().starts, 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_broker_binary_fails_at_spawn() {
    let mut config = test_config();
    config.broker.program = "/nonexistent/mosquitto".to_string();
    let controller =
        SubprocessController::new(config.broker.clone(), config.timeouts.shutdown_grace);
    let mut runner = ScenarioRunner::new(controller, config).unwrap();
    let outcome = runner.run(false).await;

    assert!(matches!(outcome.result, Err(HarnessError::ProcessSpawn { .. })));
    assert_eq!(outcome.reached, ScenarioState::ConfigWritten);
    assert!(outcome.broker_output.is_none());
}

#[cfg(unix)]
#[tokio::test]
#[ignore = "requires mosquitto and the reload plugin (c/plugin_evt_reload.so)"]
async fn test_against_mosquitto() {
    let config = HarnessConfig::default();
    let controller =
        SubprocessController::new(config.broker.clone(), config.timeouts.shutdown_grace);
    let mut runner = ScenarioRunner::new(controller, config).unwrap();
    let report = runner.run_all().await;
    assert!(report.passed(), "{}", report.generate_text());
}
