//! Scenario orchestration.
//!
//! [`ScenarioRunner`] drives one broker through
//! `Init → ConfigWritten → ProcessStarted → Connected → ReloadTriggered →
//! NotificationVerified → LivenessVerified` and always finishes with teardown,
//! whichever step failed.

use crate::broker_config::{self, BrokerConfigFile};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, MatchFailure, Result};
use crate::ports::PortAllocator;
use crate::process::{BrokerProcess, BrokerSignal, ProcessController, ProcessOutput};
use crate::raw_client::RawMqttClient;
use crate::report::SuiteReport;
use mqtt_wire::{ConnAckPacket, ConnectPacket, Property, ProtocolVersion, PublishPacket, QoS};
use serde::Serialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument, Span};
use ulid::Ulid;

/// Time given to the OS to reap a broker that just dropped the connection,
/// before its exit status is checked.
const EXIT_SETTLE: Duration = Duration::from_millis(100);

/// Label of the reload notification in failure reports.
pub const NOTIFICATION_LABEL: &str = "reload notification";

/// Parameters of one run. Fixed once the port is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TestScenario {
    pub per_listener_settings: bool,
    #[serde(serialize_with = "serialize_version")]
    pub protocol_version: ProtocolVersion,
    pub keepalive: u16,
    pub port: u16,
}

impl TestScenario {
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn serialize_version<S: serde::Serializer>(
    version: &ProtocolVersion,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_u8(version.level())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ScenarioState {
    Init,
    ConfigWritten,
    ProcessStarted,
    Connected,
    ReloadTriggered,
    NotificationVerified,
    LivenessVerified,
    TornDown,
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The exact byte sequences one run sends and expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioPackets {
    pub connect: Vec<u8>,
    pub connack: Vec<u8>,
    pub notification: Vec<u8>,
}

impl ScenarioPackets {
    pub fn build(config: &HarnessConfig) -> Result<Self> {
        let version = config.protocol_version()?;

        let connect = ConnectPacket::new(config.client.client_id.clone(), version)
            .with_keep_alive(config.client.keepalive)
            .with_clean_start(config.client.clean_session)
            .encode()?;

        let handshake = &config.handshake;
        let mut connack = ConnAckPacket::new(handshake.reason_code, version)
            .with_session_present(handshake.session_present);
        if version.has_properties() {
            if let Some(max) = handshake.topic_alias_maximum {
                connack = connack.with_property(Property::TopicAliasMaximum(max));
            }
            if let Some(max) = handshake.receive_maximum {
                connack = connack.with_property(Property::ReceiveMaximum(max));
            }
        }
        let connack = connack.encode()?;

        let notification = &config.notification;
        let qos = QoS::try_from(notification.qos)?;
        let mut publish = PublishPacket::new(
            notification.topic.clone(),
            notification.payload.as_bytes(),
            version,
        )
        .with_qos(qos)
        .with_retain(notification.retain);
        // First message id the broker assigns on a fresh session.
        if qos != QoS::AtMostOnce {
            publish = publish.with_packet_id(1);
        }
        let notification = publish.encode()?;

        Ok(Self {
            connect,
            connack,
            notification,
        })
    }
}

/// Result of one scenario run.
#[derive(Debug)]
pub struct ScenarioOutcome {
    pub run_id: Ulid,
    pub per_listener_settings: bool,
    /// `None` when the run failed before a port was allocated.
    pub scenario: Option<TestScenario>,
    /// Furthest state reached before teardown.
    pub reached: ScenarioState,
    pub result: Result<()>,
    pub broker_output: Option<ProcessOutput>,
    pub elapsed: Duration,
}

impl ScenarioOutcome {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs reload scenarios against brokers started by `C`.
pub struct ScenarioRunner<C: ProcessController> {
    controller: C,
    ports: PortAllocator,
    config: HarnessConfig,
    protocol_version: ProtocolVersion,
    packets: ScenarioPackets,
}

impl<C: ProcessController> ScenarioRunner<C> {
    pub fn new(controller: C, config: HarnessConfig) -> Result<Self> {
        config.validate()?;
        let protocol_version = config.protocol_version()?;
        let packets = ScenarioPackets::build(&config)?;
        Ok(Self {
            controller,
            ports: PortAllocator::new(config.base_port),
            config,
            protocol_version,
            packets,
        })
    }

    #[must_use]
    pub fn controller(&self) -> &C {
        &self.controller
    }

    /// Runs every configured variant in order. With `fail_fast` the remaining
    /// variants are skipped after the first failure.
    pub async fn run_all(&mut self) -> SuiteReport {
        let mut report = SuiteReport::default();
        let variants = self.config.variants.clone();
        let mut remaining = variants.into_iter();
        for per_listener_settings in remaining.by_ref() {
            let outcome = self.run(per_listener_settings).await;
            let failed = !outcome.passed();
            report.outcomes.push(outcome);
            if failed && self.config.fail_fast {
                break;
            }
        }
        report.skipped = remaining.collect();
        report
    }

    /// Runs one scenario variant. Never leaves the broker or the connection
    /// behind, whatever the outcome.
    pub async fn run(&mut self, per_listener_settings: bool) -> ScenarioOutcome {
        let run_id = Ulid::new();
        let span = info_span!(
            "scenario",
            %run_id,
            per_listener_settings,
            port = tracing::field::Empty
        );
        self.run_inner(run_id, per_listener_settings)
            .instrument(span)
            .await
    }

    async fn run_inner(&mut self, run_id: Ulid, per_listener_settings: bool) -> ScenarioOutcome {
        let started = Instant::now();
        let mut run = Run::new(run_id, per_listener_settings);

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(err) => return run.finish(Err(err), None, started),
        };
        Span::current().record("port", port);
        let scenario = TestScenario {
            per_listener_settings,
            protocol_version: self.protocol_version,
            keepalive: self.config.client.keepalive,
            port,
        };
        run.scenario = Some(scenario);

        let contents =
            broker_config::render(per_listener_settings, port, &self.config.plugin_path);
        let mut config_file =
            match BrokerConfigFile::write(&contents, self.config.config_dir.as_deref()) {
                Ok(file) => file,
                Err(err) => return run.finish(Err(err), None, started),
            };
        run.advance(ScenarioState::ConfigWritten);

        let mut broker = None;
        let mut client = None;
        let result = self
            .drive(&scenario, &config_file, &mut run, &mut broker, &mut client)
            .await;
        let result = match (result, broker.as_mut()) {
            (Err(err), Some(broker)) => Err(classify_failure(err, broker).await),
            (result, _) => result,
        };

        let output = teardown(client, broker, &mut config_file).await;
        run.finish(result, output, started)
    }

    async fn drive(
        &mut self,
        scenario: &TestScenario,
        config_file: &BrokerConfigFile,
        run: &mut Run,
        broker: &mut Option<C::Process>,
        client: &mut Option<RawMqttClient>,
    ) -> Result<()> {
        let process = broker.insert(
            self.controller
                .start(config_file.path(), scenario.port)
                .await?,
        );
        run.advance(ScenarioState::ProcessStarted);

        let connection = client.insert(self.connect_with_retry(scenario, process).await?);
        run.advance(ScenarioState::Connected);

        let timeouts = self.config.timeouts;
        for cycle in 1..=self.config.reload_cycles {
            process.signal(BrokerSignal::Reload)?;
            run.advance(ScenarioState::ReloadTriggered);
            debug!(cycle, "reload signal sent");

            connection
                .expect(&self.packets.notification, timeouts.notification, NOTIFICATION_LABEL)
                .await?;
            run.advance(ScenarioState::NotificationVerified);
        }

        connection.ping(timeouts.ping).await?;
        run.advance(ScenarioState::LivenessVerified);
        Ok(())
    }

    /// Connects once the broker listens. Refusals are retried with backoff;
    /// a broker that exits meanwhile ends the attempt immediately.
    async fn connect_with_retry(
        &self,
        scenario: &TestScenario,
        process: &mut C::Process,
    ) -> Result<RawMqttClient> {
        let retry = self.config.startup;
        let addr = scenario.addr();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = RawMqttClient::connect(
                addr,
                scenario.protocol_version,
                &self.packets.connect,
                &self.packets.connack,
                self.config.timeouts.handshake,
            )
            .await;
            match result {
                Err(HarnessError::ConnectionRefused { .. }) => {
                    if let Some(status) = process.exit_state()? {
                        return Err(HarnessError::ProcessExitedEarly { status });
                    }
                    if attempt >= retry.attempts {
                        return Err(HarnessError::ConnectionRefused {
                            addr,
                            attempts: attempt,
                        });
                    }
                    let delay = retry.backoff(attempt - 1);
                    debug!(attempt, ?delay, "broker not accepting connections yet");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

/// Progress of one run.
struct Run {
    run_id: Ulid,
    per_listener_settings: bool,
    scenario: Option<TestScenario>,
    state: ScenarioState,
}

impl Run {
    fn new(run_id: Ulid, per_listener_settings: bool) -> Self {
        Self {
            run_id,
            per_listener_settings,
            scenario: None,
            state: ScenarioState::Init,
        }
    }

    fn advance(&mut self, state: ScenarioState) {
        debug!(from = %self.state, to = %state, "state transition");
        self.state = state;
    }

    fn finish(
        self,
        result: Result<()>,
        broker_output: Option<ProcessOutput>,
        started: Instant,
    ) -> ScenarioOutcome {
        match &result {
            Ok(()) => info!(reached = %self.state, "scenario passed"),
            Err(err) => warn!(reached = %self.state, error = %err, "scenario failed"),
        }
        debug!(from = %self.state, to = %ScenarioState::TornDown, "state transition");
        ScenarioOutcome {
            run_id: self.run_id,
            per_listener_settings: self.per_listener_settings,
            scenario: self.scenario,
            reached: self.state,
            result,
            broker_output,
            elapsed: started.elapsed(),
        }
    }
}

/// Reports a dead broker as such instead of the symptom the client saw.
async fn classify_failure<P: BrokerProcess>(err: HarnessError, broker: &mut P) -> HarnessError {
    if !err.may_hide_process_exit() {
        return err;
    }
    let lost_connection = matches!(
        err,
        HarnessError::ConnectionIo { .. }
            | HarnessError::ProcessNotRunning
            | HarnessError::HandshakeMismatch {
                reason: MatchFailure::Closed,
                ..
            }
            | HarnessError::UnexpectedMessage {
                reason: MatchFailure::Closed,
                ..
            }
    );
    if lost_connection {
        tokio::time::sleep(EXIT_SETTLE).await;
    }
    match broker.exit_state() {
        Ok(Some(status)) => {
            warn!(%status, original = %err, "broker exited during the run");
            HarnessError::ProcessExitedEarly { status }
        }
        Ok(None) => err,
        Err(status_err) => {
            warn!(error = %status_err, "could not query broker status");
            err
        }
    }
}

/// Closes the connection, stops the broker and removes the config file.
/// Failures are logged, never returned.
async fn teardown<P: BrokerProcess>(
    client: Option<RawMqttClient>,
    broker: Option<P>,
    config_file: &mut BrokerConfigFile,
) -> Option<ProcessOutput> {
    if let Some(mut client) = client {
        client.close().await;
    }

    let output = match broker {
        Some(mut broker) => {
            broker.terminate();
            Some(broker.wait().await)
        }
        None => None,
    };

    match config_file.remove() {
        Ok(true) => debug!(path = %config_file.path().display(), "broker config removed"),
        Ok(false) => {}
        Err(err) => warn!(
            path = %config_file.path().display(),
            error = %err,
            "failed to remove broker config"
        ),
    }
    output
}
