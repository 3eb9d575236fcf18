//! The devices facade.
//!
//! Consumes monitor events, connects to cards as they appear and hands the
//! application live [`Card`] handles over a typed event bus. All event
//! work runs on one serial consumer, so transitions for a flapping reader
//! can never interleave.

// ───── Std Lib ─────
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ───── Crates ─────
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;

// ───── Local Modules ─────
use crate::binding::{Binding, PcscBinding};
use crate::card::Card;
use crate::context::Context;
use crate::error::Error;
use crate::monitor::{MonitorEvent, ReaderMonitor};
use crate::types::{Disposition, Protocols, ShareMode, StateFlags};

/// Tuning for the facade and its monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    /// Share mode used when connecting on insert.
    pub share_mode: ShareMode,
    /// Protocols offered on the first connect attempt.
    pub preferred_protocols: Protocols,
    /// Monitor sleep after a recoverable error.
    pub monitor_backoff: Duration,
    /// Ignore virtual/remote readers the way the desktop OSes surface them.
    pub skip_virtual_readers: bool,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        DevicesConfig {
            share_mode: ShareMode::Shared,
            preferred_protocols: Protocols::ANY,
            monitor_backoff: Duration::from_secs(3),
            skip_virtual_readers: true,
        }
    }
}

/// An event on the facade's public bus.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    ReaderAttached { reader: String },
    ReaderDetached { reader: String },
    /// A card appeared and was connected.
    CardInserted { reader: String, card: Card },
    /// A card went away; carries the handle that was held, if any.
    CardRemoved { reader: String, card: Option<Card> },
    Error { error: Error },
}

/// Point-in-time view of one tracked reader.
#[derive(Debug, Clone)]
pub struct ReaderSnapshot {
    pub name: String,
    /// Last event-state bits the facade folded in.
    pub state: StateFlags,
    /// ATR reported with the last insertion; empty while no card is held.
    pub atr: Vec<u8>,
    pub has_card: bool,
}

// Name markers of TPM-, Hello- and RDP-backed pseudo readers, which
// Windows lists next to the physical ones.
const VIRTUAL_READER_MARKERS: &[&str] = &["microsoft", "virtual", "remote"];

/// Heuristic for pseudo readers that carry no insertable card.
pub fn is_virtual_reader(reader_name: &str) -> bool {
    let name = reader_name.to_lowercase();
    VIRTUAL_READER_MARKERS
        .iter()
        .any(|marker| name.contains(marker))
}

struct TrackedReader {
    state: StateFlags,
    atr: Vec<u8>,
    card: Option<Card>,
}

struct Running {
    ctx: Arc<Context>,
    monitor: ReaderMonitor,
    pump: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    running: Option<Running>,
    readers: HashMap<String, TrackedReader>,
}

/// The high-level entry point: start it, consume its event stream, ask it
/// for live cards by reader name.
pub struct Devices {
    binding: Arc<dyn Binding>,
    config: DevicesConfig,
    inner: Arc<Mutex<Inner>>,
}

impl Devices {
    /// Facade over the platform PC/SC service.
    pub fn new(config: DevicesConfig) -> Devices {
        Devices::with_binding(Arc::new(PcscBinding::new()), config)
    }

    /// Facade over an arbitrary binding.
    pub fn with_binding(binding: Arc<dyn Binding>, config: DevicesConfig) -> Devices {
        Devices {
            binding,
            config,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Spins up the monitor and returns the event stream.
    ///
    /// Fails with `Busy` when already started.
    pub async fn start(&self) -> Result<UnboundedReceiver<DeviceEvent>, Error> {
        let mut inner = self.inner.lock().await;
        if inner.running.is_some() {
            return Err(Error::Busy);
        }

        let ctx = Arc::new(Context::establish(Arc::clone(&self.binding))?);
        let (monitor, monitor_rx) =
            ReaderMonitor::start(Arc::clone(&self.binding), self.config.monitor_backoff)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(pump_events(
            monitor_rx,
            tx,
            Arc::clone(&ctx),
            Arc::clone(&self.inner),
            self.config.clone(),
        ));

        inner.running = Some(Running { ctx, monitor, pump });
        log::info!("devices facade started");
        Ok(rx)
    }

    /// Stops the monitor, disconnects every tracked card (best effort) and
    /// clears state. Idempotent.
    pub async fn stop(&self) {
        let running = {
            let mut inner = self.inner.lock().await;
            inner.running.take()
        };
        let Some(mut running) = running else {
            return;
        };

        running.monitor.stop();
        running.monitor.join().await;
        if let Err(e) = running.pump.await {
            log::error!("event pump failed to join: {}", e);
        }

        let mut inner = self.inner.lock().await;
        for (name, tracked) in inner.readers.drain() {
            if let Some(card) = tracked.card {
                if let Err(e) = card.disconnect(Disposition::Leave) {
                    log::warn!("disconnect of card in {:?} on stop: {}", name, e);
                }
            }
        }
        drop(inner);

        running.ctx.close();
        log::info!("devices facade stopped");
    }

    /// Snapshot of the readers currently tracked, ordered by name.
    pub async fn list_readers(&self) -> Vec<ReaderSnapshot> {
        let inner = self.inner.lock().await;
        let mut snapshots: Vec<ReaderSnapshot> = inner
            .readers
            .iter()
            .map(|(name, tracked)| ReaderSnapshot {
                name: name.clone(),
                state: tracked.state,
                atr: tracked.atr.clone(),
                has_card: tracked.card.is_some(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// The live card in `reader`, when one is connected.
    pub async fn card(&self, reader: &str) -> Option<Card> {
        let inner = self.inner.lock().await;
        inner.readers.get(reader).and_then(|r| r.card.clone())
    }

    /// Read-only snapshot of every live card, keyed by reader name.
    pub async fn cards(&self) -> HashMap<String, Card> {
        let inner = self.inner.lock().await;
        inner
            .readers
            .iter()
            .filter_map(|(name, tracked)| {
                tracked.card.clone().map(|card| (name.clone(), card))
            })
            .collect()
    }
}

/// The single serial consumer of monitor events. Processing one event at a
/// time is what keeps double-connects off flapping readers.
async fn pump_events(
    mut monitor_rx: UnboundedReceiver<MonitorEvent>,
    tx: UnboundedSender<DeviceEvent>,
    ctx: Arc<Context>,
    inner: Arc<Mutex<Inner>>,
    config: DevicesConfig,
) {
    while let Some(event) = monitor_rx.recv().await {
        handle_event(event, &tx, &ctx, &inner, &config).await;
    }
    log::debug!("event pump drained");
}

async fn handle_event(
    event: MonitorEvent,
    tx: &UnboundedSender<DeviceEvent>,
    ctx: &Arc<Context>,
    inner: &Arc<Mutex<Inner>>,
    config: &DevicesConfig,
) {
    match event {
        MonitorEvent::ReaderAttached { name, state } => {
            if config.skip_virtual_readers && is_virtual_reader(&name) {
                log::warn!("Virtual reader {:?} detected. Skipping...", name);
                return;
            }
            let mut guard = inner.lock().await;
            guard.readers.insert(
                name.clone(),
                TrackedReader {
                    state,
                    atr: Vec::new(),
                    card: None,
                },
            );
            drop(guard);
            let _ = tx.send(DeviceEvent::ReaderAttached { reader: name });
        }

        MonitorEvent::ReaderDetached { name } => {
            let mut guard = inner.lock().await;
            let Some(tracked) = guard.readers.remove(&name) else {
                return;
            };
            drop(guard);
            // The monitor reports the card removal first, so this is
            // normally empty already.
            if let Some(card) = tracked.card {
                if let Err(e) = card.disconnect(Disposition::Leave) {
                    log::warn!("disconnect on detach of {:?}: {}", name, e);
                }
                let _ = tx.send(DeviceEvent::CardRemoved {
                    reader: name.clone(),
                    card: Some(card),
                });
            }
            let _ = tx.send(DeviceEvent::ReaderDetached { reader: name });
        }

        MonitorEvent::CardInserted { reader, atr } => {
            {
                let guard = inner.lock().await;
                match guard.readers.get(&reader) {
                    // Untracked (virtual or raced-away) readers get no card
                    // handling.
                    None => return,
                    // Debounce: a connection is already held.
                    Some(tracked) if tracked.card.is_some() => return,
                    Some(_) => {}
                }
            }

            match connect_with_fallback(ctx, &reader, config).await {
                Ok(card) => {
                    let mut guard = inner.lock().await;
                    if let Some(tracked) = guard.readers.get_mut(&reader) {
                        tracked.card = Some(card.clone());
                        tracked.atr = atr;
                        tracked.state |= StateFlags::PRESENT;
                    }
                    drop(guard);
                    let _ = tx.send(DeviceEvent::CardInserted { reader, card });
                }
                Err(error) => {
                    log::error!("connect to card in {:?} failed: {}", reader, error);
                    let _ = tx.send(DeviceEvent::Error { error });
                }
            }
        }

        MonitorEvent::CardRemoved { reader } => {
            let mut guard = inner.lock().await;
            let Some(tracked) = guard.readers.get_mut(&reader) else {
                return;
            };
            let card = tracked.card.take();
            tracked.atr.clear();
            tracked.state.remove(StateFlags::PRESENT);
            drop(guard);

            if let Some(card) = &card {
                if let Err(e) = card.disconnect(Disposition::Leave) {
                    log::warn!("disconnect of removed card in {:?}: {}", reader, e);
                }
            }
            let _ = tx.send(DeviceEvent::CardRemoved { reader, card });
        }

        MonitorEvent::MonitorError { error, fatal } => {
            if fatal {
                log::error!("monitor terminated: {}", error);
            }
            let _ = tx.send(DeviceEvent::Error { error });
        }
    }
}

/// Connect on insert. An unresponsive card gets one more chance with T=0
/// alone; anything else is the caller's problem.
async fn connect_with_fallback(
    ctx: &Arc<Context>,
    reader: &str,
    config: &DevicesConfig,
) -> Result<Card, Error> {
    let handle = ctx.reader(reader);
    match handle
        .connect(config.share_mode, config.preferred_protocols)
        .await
    {
        Ok(card) => Ok(card),
        Err(Error::Unresponsive) => {
            log::warn!(
                "card in {:?} unresponsive with {:?}; retrying with T=0",
                reader,
                config.preferred_protocols
            );
            handle.connect(config.share_mode, Protocols::T0).await
        }
        Err(e) => Err(e),
    }
}
