//! Daemon event loop
//!
//! A dedicated thread reads the netlink notification socket and forwards
//! decoded batches over an mpsc channel; the async loop multiplexes them
//! with signals (SIGUSR1 store reload, SIGHUP config reload, SIGTERM/SIGINT
//! shutdown) and the periodic resync timer. Every engine call happens on
//! the loop while holding the engine lock.

use crate::channel::RouteChannel;
use crate::config::DaemonConfig;
use crate::engine::{Engine, SharedEngine};
use crate::error::{DefaultconfError, Result};
use crate::netlink::{EventStream, NetlinkChannel};
use crate::reconciler::{ActionStatus, ReconcileReport};
use crate::registration::Registrar;
use crate::store::{RegistrationStore, StoreSync};
use crate::types::KernelEvent;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Maximum number of undelivered event batches
const EVENT_QUEUE_DEPTH: usize = 256;

/// Delay between attempts to reopen a failed notification socket
const REOPEN_DELAY: Duration = Duration::from_secs(1);

type EventBatch = Result<Vec<KernelEvent>>;

/// Tracks a netlink channel that could not be reopened after a transport
/// failure. While pending, the resync timer retries recovery instead of a
/// plain resync.
#[derive(Debug, Default)]
pub struct Recovery {
    pending: bool,
}

impl Recovery {
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Periodic resync, or another recovery attempt if one is pending.
    pub fn tick<C: RouteChannel>(&mut self, engine: &SharedEngine<C>) -> Result<()> {
        let mut engine = engine.lock();
        let result = if self.pending { engine.recover() } else { engine.resync() };
        result.map(|r| log_reports(&r))
    }

    /// Handles the outcome of one loop iteration. Transport failures reopen
    /// the channel and resync; a failed reopen is left pending.
    pub fn settle<C: RouteChannel>(&mut self, engine: &SharedEngine<C>, outcome: Result<()>) {
        match outcome {
            Ok(()) => self.pending = false,
            Err(e) if e.is_transport() => {
                warn!(error = %e, "Netlink channel failed, reopening");
                match engine.lock().recover() {
                    Ok(reports) => {
                        log_reports(&reports);
                        self.pending = false;
                    }
                    Err(e) => {
                        error!(error = %e, "Recovery failed, retrying at next resync");
                        self.pending = true;
                    }
                }
            }
            Err(e) => error!(error = %e, "defaultconf: Operation failed"),
        }
    }
}

/// Removes the PID file when dropped.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(path: &Path) -> Result<Self> {
        fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

/// Runs the daemon until SIGTERM/SIGINT.
pub async fn run(config_path: PathBuf, config: DaemonConfig) -> Result<()> {
    let _pid_file = PidFile::create(&config.pid_path)?;

    let channel = NetlinkChannel::open(config.request_timeout())?;
    let engine = Engine::new(channel, config.engine_settings(), config.priority_policy()).into_shared();
    let mut store_sync = StoreSync::new(Registrar::new(engine.clone()));

    // Subscribe before the initial dump so no change falls between the two.
    let stream = EventStream::open()?;
    let stop = Arc::new(AtomicBool::new(false));
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let reader = spawn_event_reader(stream, tx, stop.clone())?;

    log_reports(&engine.lock().seed()?);
    store_sync.apply(&RegistrationStore::load(&config.state_path)?)?;
    info!(table = config.table, "defaultconf: Listening to kernel events");

    let mut sigusr1 = signal(SignalKind::user_defined1())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut resync = tokio::time::interval(config.resync_interval());
    resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    resync.tick().await;

    let mut config = config;
    let mut recovery = Recovery::default();
    let mut exit = Ok(());
    loop {
        let outcome = tokio::select! {
            batch = rx.recv() => match batch {
                Some(Ok(events)) => engine.lock().handle_events(&events).map(|r| log_reports(&r)),
                Some(Err(e)) => {
                    warn!(error = %e, "Kernel notifications may have been lost, resyncing");
                    engine.lock().resync().map(|r| log_reports(&r))
                }
                None => {
                    error!("Event reader stopped");
                    exit = Err(DefaultconfError::ChannelClosed);
                    break;
                }
            },
            _ = sigusr1.recv() => {
                info!("SIGUSR1: reloading registration store");
                RegistrationStore::load(&config.state_path)
                    .and_then(|store| store_sync.apply(&store))
                    .map(|_| ())
            }
            _ = sighup.recv() => {
                info!("SIGHUP: reloading configuration");
                reload_config(&config_path, &mut config, &engine)
            }
            _ = resync.tick() => recovery.tick(&engine),
            _ = sigterm.recv() => {
                info!("defaultconf: Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("defaultconf: Received SIGINT");
                break;
            }
        };

        recovery.settle(&engine, outcome);
    }

    stop.store(true, Ordering::Relaxed);
    drop(rx);
    if reader.join().is_err() {
        warn!("Event reader thread panicked");
    }
    info!("defaultconf: Graceful shutdown complete, installed routes left in place");
    exit
}

fn spawn_event_reader(
    mut stream: EventStream,
    tx: mpsc::Sender<EventBatch>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name("netlink-events".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                let batch = match stream.next_events() {
                    Ok(events) if events.is_empty() => continue,
                    Ok(events) => Ok(events),
                    Err(e) => {
                        // Reopen first so nothing is missed after the resync.
                        while !stop.load(Ordering::Relaxed) {
                            match EventStream::open() {
                                Ok(fresh) => {
                                    stream = fresh;
                                    break;
                                }
                                Err(open_err) => {
                                    warn!(error = %open_err, "Failed to reopen notification socket");
                                    std::thread::sleep(REOPEN_DELAY);
                                }
                            }
                        }
                        Err(e)
                    }
                };
                if tx.blocking_send(batch).is_err() {
                    break;
                }
            }
            debug!("Event reader exiting");
        })?;
    Ok(handle)
}

/// Reloads the priority policy from disk. The file must exist and validate;
/// otherwise the previous policy stays. Table and metric changes need a
/// restart since routes already installed would be orphaned.
pub fn reload_config<C: RouteChannel>(
    path: &Path,
    current: &mut DaemonConfig,
    engine: &SharedEngine<C>,
) -> Result<()> {
    let fresh = match DaemonConfig::load(path) {
        Ok(fresh) => fresh,
        Err(e) => {
            error!(error = %e, "Keeping previous configuration");
            return Ok(());
        }
    };
    if fresh.table != current.table || fresh.route_metric != current.route_metric {
        warn!("table/route_metric changes take effect after a restart");
    }
    let reports = engine.lock().reload_policy(fresh.priority_policy())?;
    log_reports(&reports);
    current.priority = fresh.priority;
    Ok(())
}

fn log_reports(reports: &[ReconcileReport]) {
    for report in reports {
        match report.status {
            ActionStatus::Skipped => {}
            ActionStatus::Completed => {
                info!(family = %report.family, action = %report.action, "Default route updated")
            }
            ActionStatus::Resynced(e) => {
                info!(family = %report.family, error = %e, "Default route state resynced")
            }
            ActionStatus::FailedPending(e) => error!(
                family = %report.family,
                action = %report.action,
                error = %e,
                "Default route change failed, pending next re-evaluation"
            ),
        }
    }
}

/// Sends SIGUSR1 to a running daemon, failing if none can be signalled.
pub fn signal_running_daemon(config: &DaemonConfig) -> Result<()> {
    crate::store::signal_daemon(&config.pid_path).map_err(|e| match e {
        DefaultconfError::Io(io) => DefaultconfError::Store(format!(
            "Cannot read pid file {}: {}",
            config.pid_path.display(),
            io
        )),
        other => other,
    })
}
