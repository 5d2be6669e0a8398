//! Suite results for humans and machines.

use crate::harness::{ScenarioOutcome, ScenarioState};
use crate::process::{ExitState, ProcessOutput};
use serde::Serialize;
use std::fmt::Write;

/// Outcomes of every variant that ran, plus the variants `fail_fast` skipped.
#[derive(Debug, Default)]
pub struct SuiteReport {
    pub outcomes: Vec<ScenarioOutcome>,
    pub skipped: Vec<bool>,
}

impl SuiteReport {
    /// True when at least one variant ran and none failed or was skipped.
    #[must_use]
    pub fn passed(&self) -> bool {
        !self.outcomes.is_empty()
            && self.skipped.is_empty()
            && self.outcomes.iter().all(ScenarioOutcome::passed)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.passed()).count()
    }

    /// Per-variant PASS/FAIL lines. Failures carry the error, the state the
    /// run reached and the broker's stderr.
    #[must_use]
    pub fn generate_text(&self) -> String {
        let mut out = String::new();
        let failed = self.failed_count();
        let _ = writeln!(
            out,
            "Plugin reload conformance: {} passed, {failed} failed, {} skipped",
            self.outcomes.len() - failed,
            self.skipped.len()
        );

        for outcome in &self.outcomes {
            let marker = if outcome.passed() { "PASS" } else { "FAIL" };
            let port = outcome
                .scenario
                .map_or_else(|| "-".to_string(), |s| s.port.to_string());
            let _ = writeln!(
                out,
                "[{marker}] per_listener_settings={} port={port} ({:.2}s) run={}",
                outcome.per_listener_settings,
                outcome.elapsed.as_secs_f64(),
                outcome.run_id
            );

            let Err(err) = &outcome.result else {
                continue;
            };
            let _ = writeln!(out, "  reached: {}", outcome.reached);
            let _ = writeln!(out, "  error [{}]: {err}", err.kind());
            if let Some(output) = &outcome.broker_output {
                if let Some(exit) = output.exit {
                    let _ = writeln!(out, "  broker: {exit}");
                }
                let stderr = output.stderr_lossy();
                if stderr.trim().is_empty() {
                    out.push_str("  broker stderr: (empty)\n");
                } else {
                    out.push_str("  broker stderr:\n");
                    for line in stderr.lines() {
                        let _ = writeln!(out, "    {line}");
                    }
                }
            }
        }

        for per_listener_settings in &self.skipped {
            let _ = writeln!(out, "[SKIP] per_listener_settings={per_listener_settings}");
        }
        out
    }

    pub fn generate_json(&self) -> serde_json::Result<String> {
        let summary = JsonReport {
            passed: self.passed(),
            failed: self.failed_count(),
            skipped: &self.skipped,
            scenarios: self.outcomes.iter().map(JsonScenario::from).collect(),
        };
        serde_json::to_string_pretty(&summary)
    }
}

#[derive(Serialize)]
struct JsonReport<'a> {
    passed: bool,
    failed: usize,
    skipped: &'a [bool],
    scenarios: Vec<JsonScenario>,
}

#[derive(Serialize)]
struct JsonScenario {
    run_id: String,
    per_listener_settings: bool,
    port: Option<u16>,
    protocol_version: Option<u8>,
    passed: bool,
    reached: ScenarioState,
    elapsed_ms: u64,
    error_kind: Option<&'static str>,
    error: Option<String>,
    broker_exit: Option<ExitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    broker_stderr: Option<String>,
}

impl From<&ScenarioOutcome> for JsonScenario {
    fn from(outcome: &ScenarioOutcome) -> Self {
        let error = outcome.result.as_ref().err();
        Self {
            run_id: outcome.run_id.to_string(),
            per_listener_settings: outcome.per_listener_settings,
            port: outcome.scenario.map(|s| s.port),
            protocol_version: outcome.scenario.map(|s| s.protocol_version.level()),
            passed: outcome.passed(),
            reached: outcome.reached,
            elapsed_ms: u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            error_kind: error.map(|e| e.kind()),
            error: error.map(ToString::to_string),
            broker_exit: outcome.broker_output.as_ref().and_then(|o| o.exit),
            broker_stderr: error
                .and(outcome.broker_output.as_ref())
                .map(ProcessOutput::stderr_lossy),
        }
    }
}
