//! The reader monitor.
//!
//! A long-running loop around `get_status_change` on a dedicated context.
//! It tracks reader presence through the plug-and-play pseudo reader and
//! per-reader card presence through the event-state bits, and streams
//! discrete transitions over a channel. It knows nothing about consumers;
//! the devices facade subscribes like anyone else.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ───── Crates ─────
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// ───── Local Modules ─────
use crate::binding::{Binding, RawContext, ReaderStateEntry};
use crate::error::Error;
use crate::types::{StateFlags, PNP_NOTIFICATION_NAME};

/// A discrete transition observed by the monitor.
///
/// Per reader, the emission order always satisfies
/// `attached (inserted removed)* detached?`.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    ReaderAttached { name: String, state: StateFlags },
    ReaderDetached { name: String },
    CardInserted { reader: String, atr: Vec<u8> },
    CardRemoved { reader: String },
    MonitorError { error: Error, fatal: bool },
}

/// Handle to a running monitor loop.
///
/// The loop owns a private context used only for status-change waits;
/// `stop` is the single host-side operation ever applied to it, by way of
/// `cancel`.
pub struct ReaderMonitor {
    binding: Arc<dyn Binding>,
    ctx: RawContext,
    stop: Arc<AtomicBool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl ReaderMonitor {
    /// Establishes the monitor context and spins up the loop.
    ///
    /// `backoff` is how long the loop sleeps after a recoverable error
    /// before re-entering the wait.
    pub fn start(
        binding: Arc<dyn Binding>,
        backoff: Duration,
    ) -> Result<(ReaderMonitor, UnboundedReceiver<MonitorEvent>), Error> {
        let ctx = binding.establish()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = tokio::task::spawn_blocking({
            let binding = Arc::clone(&binding);
            let stop = Arc::clone(&stop);
            move || run_loop(binding, ctx, stop, tx, backoff)
        });

        Ok((
            ReaderMonitor {
                binding,
                ctx,
                stop,
                worker: Some(worker),
            },
            rx,
        ))
    }

    /// Asks the loop to exit. Idempotent; the pending wait resolves with
    /// `Cancelled` and the loop releases its context on the way out.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.binding.cancel(self.ctx) {
                log::debug!("monitor cancel: {}", e);
            }
        }
    }

    /// Waits for the loop to finish. Call after `stop`.
    pub async fn join(&mut self) {
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                log::error!("monitor worker failed to join: {}", e);
            }
        }
    }
}

impl Drop for ReaderMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MonitorEntry {
    name: String,
    state: StateFlags,
    /// Event counter that came with `state`; fed back so the service sees
    /// the change as acknowledged instead of reporting it again.
    count: u32,
    has_card: bool,
    atr: Vec<u8>,
}

fn emit(tx: &UnboundedSender<MonitorEvent>, event: MonitorEvent) -> bool {
    log::debug!("monitor event: {:?}", event);
    tx.send(event).is_ok()
}

fn run_loop(
    binding: Arc<dyn Binding>,
    ctx: RawContext,
    stop: Arc<AtomicBool>,
    tx: UnboundedSender<MonitorEvent>,
    backoff: Duration,
) {
    log::debug!("reader monitor started");
    let mut entries: Vec<MonitorEntry> = Vec::new();
    let mut pnp_state = StateFlags::UNAWARE;
    let mut pnp_count: u32 = 0;

    'outer: loop {
        if stop.load(Ordering::Acquire) || tx.is_closed() {
            break;
        }

        let mut states = Vec::with_capacity(entries.len() + 1);
        states.push(ReaderStateEntry::new(
            PNP_NOTIFICATION_NAME,
            pnp_state,
            pnp_count,
        ));
        for entry in &entries {
            states.push(ReaderStateEntry::new(
                entry.name.clone(),
                entry.state,
                entry.count,
            ));
        }

        match binding.get_status_change(ctx, None, &mut states) {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                log::debug!("monitor wait cancelled");
                break;
            }
            Err(error) if error.is_fatal_for_monitor() => {
                log::error!("monitor terminating: {}", error);
                emit(&tx, MonitorEvent::MonitorError { error, fatal: true });
                break;
            }
            Err(error) => {
                log::warn!("monitor wait failed: {}. Backing off.", error);
                if !emit(&tx, MonitorEvent::MonitorError { error, fatal: false }) {
                    break;
                }
                std::thread::sleep(backoff);
                continue;
            }
        }

        // Reader hot-plug: the pnp pseudo entry changed, so re-list and
        // diff by name. Removals go out before any attach.
        if states[0].changed() {
            pnp_state = states[0].event_state | StateFlags::CHANGED;
            pnp_count = states[0].event_count;

            let names = match binding.list_readers(ctx) {
                Ok(names) => names,
                // A machine with zero readers is a normal monitor state.
                Err(Error::NoReaders) => Vec::new(),
                Err(error) if error.is_fatal_for_monitor() => {
                    log::error!("monitor terminating: {}", error);
                    emit(&tx, MonitorEvent::MonitorError { error, fatal: true });
                    break;
                }
                Err(error) => {
                    log::warn!("failed to list readers: {}. Backing off.", error);
                    if !emit(&tx, MonitorEvent::MonitorError { error, fatal: false }) {
                        break;
                    }
                    std::thread::sleep(backoff);
                    continue;
                }
            };

            let mut removed = Vec::new();
            entries.retain(|entry| {
                if names.iter().any(|n| n == &entry.name) {
                    true
                } else {
                    removed.push((entry.name.clone(), entry.has_card));
                    false
                }
            });
            for (name, had_card) in removed {
                log::info!("reader {:?} detached", name);
                if had_card && !emit(&tx, MonitorEvent::CardRemoved { reader: name.clone() }) {
                    break 'outer;
                }
                if !emit(&tx, MonitorEvent::ReaderDetached { name }) {
                    break 'outer;
                }
            }

            for name in names {
                if name == PNP_NOTIFICATION_NAME || entries.iter().any(|e| e.name == name) {
                    continue;
                }
                log::info!("reader {:?} attached", name);
                if !emit(
                    &tx,
                    MonitorEvent::ReaderAttached {
                        name: name.clone(),
                        state: StateFlags::UNAWARE,
                    },
                ) {
                    break 'outer;
                }
                // The fresh entry starts unaware; the next wait reports its
                // real state immediately, so an already-populated reader
                // gets its insert right after the attach.
                entries.push(MonitorEntry {
                    name,
                    state: StateFlags::UNAWARE,
                    count: 0,
                    has_card: false,
                    atr: Vec::new(),
                });
            }
        }

        // Per-reader card transitions.
        for state in &states[1..] {
            if !state.changed() {
                continue;
            }
            let Some(position) = entries.iter().position(|e| e.name == state.name) else {
                // Already dropped by the re-list above.
                continue;
            };

            let new_bits = state.event_state;

            // The service no longer knows this reader; it vanished without
            // a pnp round trip.
            if new_bits.intersects(StateFlags::UNKNOWN | StateFlags::IGNORE) {
                let entry = entries.remove(position);
                log::info!("reader {:?} is gone ({:?})", entry.name, new_bits);
                if entry.has_card
                    && !emit(
                        &tx,
                        MonitorEvent::CardRemoved {
                            reader: entry.name.clone(),
                        },
                    )
                {
                    break 'outer;
                }
                if !emit(&tx, MonitorEvent::ReaderDetached { name: entry.name }) {
                    break 'outer;
                }
                continue;
            }

            let entry = &mut entries[position];
            let was_present = entry.has_card;
            let now_present = new_bits.has_card();

            if !was_present && now_present {
                log::info!(
                    "card inserted in {:?}, atr {}",
                    entry.name,
                    hex::encode(&state.atr)
                );
                if !emit(
                    &tx,
                    MonitorEvent::CardInserted {
                        reader: entry.name.clone(),
                        atr: state.atr.clone(),
                    },
                ) {
                    break 'outer;
                }
            } else if was_present && !now_present {
                log::info!("card removed from {:?}", entry.name);
                if !emit(
                    &tx,
                    MonitorEvent::CardRemoved {
                        reader: entry.name.clone(),
                    },
                ) {
                    break 'outer;
                }
            } else if was_present
                && now_present
                && !state.atr.is_empty()
                && entry.atr != state.atr
            {
                // A different card without an observed gap: report the swap
                // as removal then insertion.
                log::info!("card swapped in {:?}", entry.name);
                if !emit(
                    &tx,
                    MonitorEvent::CardRemoved {
                        reader: entry.name.clone(),
                    },
                ) {
                    break 'outer;
                }
                if !emit(
                    &tx,
                    MonitorEvent::CardInserted {
                        reader: entry.name.clone(),
                        atr: state.atr.clone(),
                    },
                ) {
                    break 'outer;
                }
            }

            // Acknowledged baseline for the next wait: the event bits with
            // the ack flag, plus the event counter the service compares on.
            entry.state = new_bits | StateFlags::CHANGED;
            entry.count = state.event_count;
            entry.has_card = now_present;
            entry.atr = state.atr.clone();
        }
    }

    if let Err(e) = binding.release(ctx) {
        log::debug!("monitor context release: {}", e);
    }
    log::debug!("reader monitor stopped");
}
