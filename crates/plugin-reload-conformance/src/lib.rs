//! Black-box conformance harness for broker plugin reload notifications.
//!
//! A scenario writes a broker configuration that loads the plugin under test,
//! starts the broker as a subprocess, opens a raw MQTT session, sends the
//! broker `SIGHUP` and requires the plugin's reload notification to arrive on
//! that session byte for byte. A trailing PINGREQ/PINGRESP confirms the
//! broker survived. The scenario runs once per `per_listener_settings` value.
//!
//! [`harness::ScenarioRunner`] is generic over [`process::ProcessController`],
//! so the same scenario logic drives a real broker binary or an in-process
//! stand-in.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod broker_config;
pub mod config;
pub mod error;
pub mod harness;
pub mod ports;
pub mod process;
pub mod raw_client;
pub mod report;

pub use config::HarnessConfig;
pub use error::{HarnessError, MatchFailure, Result, WireDiff};
pub use harness::{ScenarioOutcome, ScenarioRunner, ScenarioState, TestScenario};
pub use process::{
    BrokerProcess, BrokerSignal, ExitState, ProcessController, ProcessOutput, SubprocessController,
};
pub use raw_client::RawMqttClient;
pub use report::SuiteReport;
