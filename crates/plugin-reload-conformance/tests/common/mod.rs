#![allow(dead_code, clippy::manual_async_fn)]

use plugin_reload_conformance::harness::ScenarioPackets;
use plugin_reload_conformance::{
    BrokerProcess, BrokerSignal, ExitState, HarnessConfig, HarnessError, ProcessController,
    ProcessOutput,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const SCRIPTED_STDERR: &[u8] = b"scripted broker: plugin loaded\n";

/// How the in-process stand-in broker misbehaves, if at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Conformant,
    CorruptNotification,
    SilentOnReload,
    CrashAfterNotification,
    CorruptThenCrash,
    ExitBeforeListening,
    WrongConnAck,
    DelayedListen(Duration),
    DuplicateNotification,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub starts: u32,
    pub reloads: u32,
    pub terminates: u32,
    pub waits: u32,
    pub config_paths: Vec<PathBuf>,
    pub config_contents: Vec<String>,
}

/// Starts a scripted broker on the allocated port instead of a subprocess.
pub struct ScriptedController {
    behaviour: Behaviour,
    packets: ScenarioPackets,
    pub stats: Arc<Mutex<Stats>>,
}

impl ScriptedController {
    pub fn new(behaviour: Behaviour, config: &HarnessConfig) -> Self {
        Self {
            behaviour,
            packets: ScenarioPackets::build(config).unwrap(),
            stats: Arc::default(),
        }
    }
}

impl ProcessController for ScriptedController {
    type Process = ScriptedBroker;

    fn start<'a>(
        &'a mut self,
        config_path: &'a Path,
        port: u16,
    ) -> impl Future<Output = plugin_reload_conformance::Result<Self::Process>> + Send + 'a {
        async move {
            let contents = std::fs::read_to_string(config_path).unwrap();
            {
                let mut stats = self.stats.lock().unwrap();
                stats.starts += 1;
                stats.config_paths.push(config_path.to_path_buf());
                stats.config_contents.push(contents);
            }

            let (reload_tx, reload_rx) = mpsc::unbounded_channel();
            let exit = Arc::new(Mutex::new(None));
            let task = tokio::spawn(serve(
                self.behaviour,
                port,
                self.packets.clone(),
                reload_rx,
                Arc::clone(&exit),
            ));
            Ok(ScriptedBroker {
                reload_tx,
                exit,
                task: Some(task),
                stats: Arc::clone(&self.stats),
            })
        }
    }
}

pub struct ScriptedBroker {
    reload_tx: mpsc::UnboundedSender<()>,
    exit: Arc<Mutex<Option<ExitState>>>,
    task: Option<JoinHandle<()>>,
    stats: Arc<Mutex<Stats>>,
}

impl BrokerProcess for ScriptedBroker {
    fn id(&self) -> Option<u32> {
        None
    }

    fn signal(&mut self, signal: BrokerSignal) -> plugin_reload_conformance::Result<()> {
        if self.exit.lock().unwrap().is_some() {
            return Err(HarnessError::ProcessNotRunning);
        }
        assert_eq!(signal, BrokerSignal::Reload);
        self.stats.lock().unwrap().reloads += 1;
        self.reload_tx
            .send(())
            .map_err(|_| HarnessError::ProcessNotRunning)
    }

    fn exit_state(&mut self) -> plugin_reload_conformance::Result<Option<ExitState>> {
        Ok(*self.exit.lock().unwrap())
    }

    fn terminate(&mut self) {
        self.stats.lock().unwrap().terminates += 1;
        if let Some(task) = &self.task {
            task.abort();
        }
        self.exit
            .lock()
            .unwrap()
            .get_or_insert(ExitState::code(0));
    }

    fn wait(&mut self) -> impl Future<Output = ProcessOutput> + Send + '_ {
        async move {
            self.stats.lock().unwrap().waits += 1;
            if let Some(task) = self.task.take() {
                task.abort();
                let _ = task.await;
            }
            ProcessOutput {
                exit: *self.exit.lock().unwrap(),
                stdout: Vec::new(),
                stderr: SCRIPTED_STDERR.to_vec(),
            }
        }
    }
}

async fn serve(
    behaviour: Behaviour,
    port: u16,
    packets: ScenarioPackets,
    mut reloads: mpsc::UnboundedReceiver<()>,
    exit: Arc<Mutex<Option<ExitState>>>,
) {
    match behaviour {
        Behaviour::ExitBeforeListening => {
            *exit.lock().unwrap() = Some(ExitState::code(1));
            return;
        }
        Behaviour::DelayedListen(delay) => tokio::time::sleep(delay).await,
        _ => {}
    }

    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let (mut socket, _) = listener.accept().await.unwrap();

    let mut connect = vec![0u8; packets.connect.len()];
    socket.read_exact(&mut connect).await.unwrap();
    assert_eq!(connect, packets.connect);

    let mut connack = packets.connack.clone();
    if behaviour == Behaviour::WrongConnAck {
        connack[3] = 0x87;
    }
    socket.write_all(&connack).await.unwrap();

    let mut buf = [0u8; 64];
    loop {
        tokio::select! {
            reload = reloads.recv() => {
                if reload.is_none() {
                    return;
                }
                match behaviour {
                    Behaviour::SilentOnReload => {}
                    Behaviour::CorruptNotification => {
                        let mut corrupted = packets.notification.clone();
                        let last = corrupted.len() - 1;
                        corrupted[last] ^= 0x20;
                        socket.write_all(&corrupted).await.unwrap();
                    }
                    Behaviour::DuplicateNotification => {
                        socket.write_all(&packets.notification).await.unwrap();
                        socket.write_all(&packets.notification).await.unwrap();
                    }
                    Behaviour::CorruptThenCrash => {
                        let mut corrupted = packets.notification.clone();
                        let last = corrupted.len() - 1;
                        corrupted[last] ^= 0x20;
                        *exit.lock().unwrap() = Some(ExitState::signal(11));
                        socket.write_all(&corrupted).await.unwrap();
                        return;
                    }
                    Behaviour::CrashAfterNotification => {
                        socket.write_all(&packets.notification).await.unwrap();
                        *exit.lock().unwrap() = Some(ExitState::signal(11));
                        return;
                    }
                    _ => socket.write_all(&packets.notification).await.unwrap(),
                }
            }
            read = socket.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                for chunk in buf[..n].chunks(2) {
                    if chunk == [0xC0, 0x00] {
                        socket.write_all(&[0xD0, 0x00]).await.unwrap();
                    }
                }
            }
        }
    }
}

/// A config whose ports start at a currently free ephemeral port and whose
/// timeouts suit an in-process broker.
pub fn test_config() -> HarnessConfig {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let base_port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut config = HarnessConfig {
        base_port,
        config_dir: Some(std::env::temp_dir()),
        ..HarnessConfig::default()
    };
    config.timeouts.handshake = Duration::from_secs(2);
    config.timeouts.notification = Duration::from_millis(300);
    config.timeouts.ping = Duration::from_secs(1);
    config.startup.initial_backoff = Duration::from_millis(10);
    config.startup.max_backoff = Duration::from_millis(50);
    config
}
