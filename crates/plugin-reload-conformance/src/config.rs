//! Harness configuration.
//!
//! Every field has a default matching the reference scenario, so an empty
//! TOML file (or no file at all) describes a complete run against
//! `mosquitto` on port 1888 and up.

use crate::error::{HarnessError, Result};
use mqtt_wire::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    pub broker: BrokerCommand,
    pub plugin_path: PathBuf,
    pub base_port: u16,
    /// Directory for generated broker configuration files. System temp dir
    /// when unset.
    pub config_dir: Option<PathBuf>,
    pub client: ClientSettings,
    pub handshake: HandshakeSettings,
    pub notification: NotificationSettings,
    pub timeouts: Timeouts,
    pub startup: StartupRetry,
    /// Reload signal / notification cycles per run.
    pub reload_cycles: u32,
    /// Stop after the first failing variant.
    pub fail_fast: bool,
    /// `per_listener_settings` values to run, in order.
    pub variants: Vec<bool>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            broker: BrokerCommand::default(),
            plugin_path: PathBuf::from("c/plugin_evt_reload.so"),
            base_port: 1888,
            config_dir: None,
            client: ClientSettings::default(),
            handshake: HandshakeSettings::default(),
            notification: NotificationSettings::default(),
            timeouts: Timeouts::default(),
            startup: StartupRetry::default(),
            reload_cycles: 1,
            fail_fast: true,
            variants: vec![false, true],
        }
    }
}

impl HarnessConfig {
    /// Loads a TOML configuration file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| HarnessError::ConfigLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<&Self> {
        if self.broker.program.trim().is_empty() {
            return Err(HarnessError::InvalidConfig(
                "broker.program must not be empty".to_string(),
            ));
        }
        if self.startup.attempts == 0 {
            return Err(HarnessError::InvalidConfig(
                "startup.attempts must be greater than 0".to_string(),
            ));
        }
        if self.reload_cycles == 0 {
            return Err(HarnessError::InvalidConfig(
                "reload_cycles must be greater than 0".to_string(),
            ));
        }
        if self.notification.qos > 2 {
            return Err(HarnessError::InvalidConfig(
                "notification.qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.variants.is_empty() {
            return Err(HarnessError::InvalidConfig(
                "variants must name at least one per_listener_settings value".to_string(),
            ));
        }
        self.protocol_version()?;
        Ok(self)
    }

    pub fn protocol_version(&self) -> Result<ProtocolVersion> {
        ProtocolVersion::try_from(self.client.protocol_version).map_err(|_| {
            HarnessError::InvalidConfig(format!(
                "client.protocol_version {} is not 3, 4 or 5",
                self.client.protocol_version
            ))
        })
    }
}

/// How to launch the broker under test.
///
/// `{config}` and `{port}` in `args` are replaced with the generated
/// configuration path and the allocated listener port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for BrokerCommand {
    fn default() -> Self {
        Self {
            program: "mosquitto".to_string(),
            args: vec!["-c".to_string(), "{config}".to_string()],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }
}

impl BrokerCommand {
    #[must_use]
    pub fn render_args(&self, config_path: &Path, port: u16) -> Vec<String> {
        let config = config_path.display().to_string();
        let port = port.to_string();
        self.args
            .iter()
            .map(|arg| arg.replace("{config}", &config).replace("{port}", &port))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    pub client_id: String,
    pub keepalive: u16,
    pub protocol_version: u8,
    pub clean_session: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            client_id: "plugin-reload-test".to_string(),
            keepalive: 10,
            protocol_version: 5,
            clean_session: false,
        }
    }
}

/// The CONNACK the broker is expected to answer with.
///
/// The v5 properties are emitted in broker order: topic alias maximum first,
/// then receive maximum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HandshakeSettings {
    pub reason_code: u8,
    pub session_present: bool,
    pub topic_alias_maximum: Option<u16>,
    pub receive_maximum: Option<u16>,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            reason_code: 0,
            session_present: false,
            topic_alias_maximum: Some(10),
            receive_maximum: Some(20),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NotificationSettings {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            topic: "topic/reload".to_string(),
            payload: "test-message".to_string(),
            qos: 0,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    #[serde(with = "humantime_serde")]
    pub handshake: Duration,
    #[serde(with = "humantime_serde")]
    pub notification: Duration,
    #[serde(with = "humantime_serde")]
    pub ping: Duration,
    /// How long a terminated broker gets to exit before it is killed.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(20),
            notification: Duration::from_secs(10),
            ping: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Bounded retry of refused connections while the broker starts up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StartupRetry {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            attempts: 50,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl StartupRetry {
    /// Delay before retry number `attempt` (zero based), doubling up to
    /// `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_backoff)
    }
}
