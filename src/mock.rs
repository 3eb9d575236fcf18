//! In-memory binding used by the test suite.
//!
//! Replaces the native binding wholesale: readers, cards and APDU
//! exchanges are scripted by the tests, and `get_status_change` blocks on
//! a condvar so cancel and timeout behave like the real service.

// ───── Std Lib ─────
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Condvar, Mutex, Once};
use std::time::{Duration, Instant};

// ───── Local Modules ─────
use crate::binding::{Binding, CardStatus, ConnectOutcome, RawCard, RawContext, ReaderStateEntry};
use crate::error::Error;
use crate::types::{
    CardStatusFlags, Disposition, Initialization, Protocol, Protocols, ShareMode, StateFlags,
    PNP_NOTIFICATION_NAME,
};

/// Sends test logs to stderr with the usual dispatch chain. Safe to call
/// any number of times.
pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}[{}][{}] {}",
                    chrono::Local::now().format("[%Y-%m-%d][%H:%M:%S%.3f]"),
                    record.target(),
                    record.level(),
                    message
                ))
            })
            .level(log::LevelFilter::Debug)
            .chain(std::io::stderr())
            .apply();
    });
}

struct MockContext {
    cancelled: bool,
}

struct MockReader {
    present: bool,
    atr: Vec<u8>,
    in_use: bool,
    /// The service-side event counter, bumped on every observable change.
    /// Reported in `event_count`; a caller whose baseline count is stale
    /// keeps getting the change re-reported, exactly like pcsclite.
    counter: u64,
}

struct MockCard {
    reader: String,
    protocol: Option<Protocol>,
    atr: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    contexts: HashMap<u64, MockContext>,
    readers: BTreeMap<String, MockReader>,
    cards: HashMap<u64, MockCard>,
    reader_generation: u64,
    connect_script: VecDeque<Result<Protocol, Error>>,
    connect_attempts: Vec<(String, ShareMode, Protocols)>,
    exchanges: Vec<(Vec<u8>, Vec<u8>)>,
    transmit_queue: VecDeque<Vec<u8>>,
    transmit_count: usize,
    control_script: VecDeque<Vec<u8>>,
    control_count: usize,
    status_change_calls: usize,
    wait_failures: VecDeque<Error>,
}

pub struct MockBinding {
    state: Mutex<MockState>,
    cv: Condvar,
}

// Bits a baseline is compared on; CHANGED and the like are bookkeeping.
const SIGNIFICANT: StateFlags = StateFlags::PRESENT
    .union(StateFlags::EMPTY)
    .union(StateFlags::UNKNOWN)
    .union(StateFlags::UNAVAILABLE)
    .union(StateFlags::INUSE)
    .union(StateFlags::MUTE);

impl MockBinding {
    pub fn new() -> Self {
        init_test_logging();
        MockBinding {
            state: Mutex::new(MockState::default()),
            cv: Condvar::new(),
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let result = f(&mut state);
        drop(state);
        self.cv.notify_all();
        result
    }

    // ───── Scenario scripting ─────

    pub fn attach_reader(&self, name: &str) {
        self.mutate(|s| {
            s.readers.insert(
                name.to_string(),
                MockReader {
                    present: false,
                    atr: Vec::new(),
                    in_use: false,
                    counter: 1,
                },
            );
            s.reader_generation += 1;
        });
    }

    pub fn detach_reader(&self, name: &str) {
        self.mutate(|s| {
            s.readers.remove(name);
            s.reader_generation += 1;
        });
    }

    pub fn insert_card(&self, name: &str, atr: &[u8]) {
        self.mutate(|s| {
            if let Some(reader) = s.readers.get_mut(name) {
                reader.present = true;
                reader.atr = atr.to_vec();
                reader.counter += 1;
            }
        });
    }

    pub fn remove_card(&self, name: &str) {
        self.mutate(|s| {
            if let Some(reader) = s.readers.get_mut(name) {
                reader.present = false;
                reader.atr.clear();
                reader.counter += 1;
            }
        });
    }

    /// A different card, with no observed empty gap in between.
    pub fn swap_card(&self, name: &str, atr: &[u8]) {
        self.mutate(|s| {
            if let Some(reader) = s.readers.get_mut(name) {
                reader.present = true;
                reader.atr = atr.to_vec();
                reader.counter += 1;
            }
        });
    }

    pub fn mark_in_use(&self, name: &str, in_use: bool) {
        self.mutate(|s| {
            if let Some(reader) = s.readers.get_mut(name) {
                reader.in_use = in_use;
                reader.counter += 1;
            }
        });
    }

    /// Outcome of the next `connect` call; scripted calls are consumed in
    /// order, after which connects revert to default behavior.
    pub fn script_connect(&self, outcome: Result<Protocol, Error>) {
        self.mutate(|s| s.connect_script.push_back(outcome));
    }

    /// Fixed request → response pair, reusable any number of times.
    pub fn script_exchange(&self, request: &[u8], response: &[u8]) {
        self.mutate(|s| s.exchanges.push((request.to_vec(), response.to_vec())));
    }

    /// Ordered transmit responses consumed before the exchange table.
    pub fn script_transmit(&self, response: &[u8]) {
        self.mutate(|s| s.transmit_queue.push_back(response.to_vec()));
    }

    pub fn script_control(&self, response: &[u8]) {
        self.mutate(|s| s.control_script.push_back(response.to_vec()));
    }

    /// The next `get_status_change` returns this error instead.
    pub fn fail_next_wait(&self, error: Error) {
        self.mutate(|s| s.wait_failures.push_back(error));
    }

    // ───── Assertion helpers ─────

    pub fn transmit_count(&self) -> usize {
        self.state.lock().unwrap().transmit_count
    }

    pub fn control_count(&self) -> usize {
        self.state.lock().unwrap().control_count
    }

    pub fn connect_attempts(&self) -> Vec<(String, ShareMode, Protocols)> {
        self.state.lock().unwrap().connect_attempts.clone()
    }

    pub fn open_card_count(&self) -> usize {
        self.state.lock().unwrap().cards.len()
    }

    /// How many times `get_status_change` was entered. A caller that fails
    /// to acknowledge the event counter re-calls in a hot loop, which this
    /// makes visible.
    pub fn status_change_calls(&self) -> usize {
        self.state.lock().unwrap().status_change_calls
    }
}

fn reader_actual_state(reader: &MockReader) -> StateFlags {
    let mut state = if reader.present {
        StateFlags::PRESENT
    } else {
        StateFlags::EMPTY
    };
    if reader.in_use {
        state |= StateFlags::INUSE;
    }
    state
}

fn default_protocol(protocols: Protocols) -> Option<Protocol> {
    if protocols.contains(Protocols::T1) {
        Some(Protocol::T1)
    } else if protocols.contains(Protocols::T0) {
        Some(Protocol::T0)
    } else if protocols.contains(Protocols::RAW) {
        Some(Protocol::Raw)
    } else {
        None
    }
}

impl Binding for MockBinding {
    fn establish(&self) -> Result<RawContext, Error> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.contexts.insert(id, MockContext { cancelled: false });
        Ok(RawContext(id))
    }

    fn release(&self, ctx: RawContext) -> Result<(), Error> {
        let removed = self.mutate(|s| s.contexts.remove(&ctx.0));
        match removed {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle),
        }
    }

    fn list_readers(&self, ctx: RawContext) -> Result<Vec<String>, Error> {
        let state = self.state.lock().unwrap();
        if !state.contexts.contains_key(&ctx.0) {
            return Err(Error::InvalidHandle);
        }
        if state.readers.is_empty() {
            return Err(Error::NoReaders);
        }
        Ok(state.readers.keys().cloned().collect())
    }

    fn get_status_change(
        &self,
        ctx: RawContext,
        timeout: Option<Duration>,
        states: &mut [ReaderStateEntry],
    ) -> Result<(), Error> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.state.lock().unwrap();
        guard.status_change_calls += 1;

        loop {
            {
                let mock_ctx = guard.contexts.get_mut(&ctx.0).ok_or(Error::InvalidHandle)?;
                if mock_ctx.cancelled {
                    mock_ctx.cancelled = false;
                    return Err(Error::Cancelled);
                }
            }
            if let Some(error) = guard.wait_failures.pop_front() {
                return Err(error);
            }

            // A change is reported whenever the caller's baseline flags or
            // its event counter disagree with the service side; the only
            // acknowledgment is handing both back on the next call.
            let pnp_counter = (guard.reader_generation & 0xFFFF) as u32;
            let mut changed_any = false;
            let mut changes = Vec::with_capacity(states.len());
            for entry in states.iter() {
                let changed = if entry.name == PNP_NOTIFICATION_NAME {
                    entry.current_count != pnp_counter
                } else {
                    match guard.readers.get(&entry.name) {
                        Some(reader) => {
                            let actual = reader_actual_state(reader);
                            (entry.current_state & SIGNIFICANT) != actual
                                || entry.current_count != (reader.counter & 0xFFFF) as u32
                        }
                        None => (entry.current_state & SIGNIFICANT) != StateFlags::UNKNOWN,
                    }
                };
                changes.push(changed);
                changed_any |= changed;
            }

            if changed_any {
                for (entry, changed) in states.iter_mut().zip(&changes) {
                    if entry.name == PNP_NOTIFICATION_NAME {
                        entry.event_state = if *changed {
                            StateFlags::CHANGED
                        } else {
                            StateFlags::UNAWARE
                        };
                        entry.event_count = pnp_counter;
                        entry.atr.clear();
                        continue;
                    }
                    match guard.readers.get(&entry.name) {
                        Some(reader) => {
                            let mut bits = reader_actual_state(reader);
                            if *changed {
                                bits |= StateFlags::CHANGED;
                            }
                            entry.event_state = bits;
                            entry.event_count = (reader.counter & 0xFFFF) as u32;
                            entry.atr = reader.atr.clone();
                        }
                        None => {
                            entry.event_state = if *changed {
                                StateFlags::UNKNOWN | StateFlags::CHANGED
                            } else {
                                StateFlags::UNKNOWN
                            };
                            entry.event_count = 0;
                            entry.atr.clear();
                        }
                    }
                }
                return Ok(());
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    let (g, _) = self.cv.wait_timeout(guard, deadline - now).unwrap();
                    guard = g;
                }
                None => {
                    guard = self.cv.wait(guard).unwrap();
                }
            }
        }
    }

    fn cancel(&self, ctx: RawContext) -> Result<(), Error> {
        self.mutate(|s| match s.contexts.get_mut(&ctx.0) {
            Some(mock_ctx) => {
                mock_ctx.cancelled = true;
                Ok(())
            }
            None => Err(Error::InvalidHandle),
        })
    }

    fn connect(
        &self,
        ctx: RawContext,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<ConnectOutcome, Error> {
        self.mutate(|s| {
            if !s.contexts.contains_key(&ctx.0) {
                return Err(Error::InvalidHandle);
            }
            s.connect_attempts
                .push((reader.to_string(), share_mode, protocols));

            let scripted = s.connect_script.pop_front();
            let mock_reader = s.readers.get(reader).ok_or(Error::ReaderUnavailable)?;
            if !mock_reader.present && share_mode != ShareMode::Direct {
                return Err(Error::CardRemoved);
            }
            let atr = mock_reader.atr.clone();

            let protocol = match scripted {
                Some(Err(error)) => return Err(error),
                Some(Ok(protocol)) => Some(protocol),
                None => default_protocol(protocols),
            };

            s.next_id += 1;
            let id = s.next_id;
            s.cards.insert(
                id,
                MockCard {
                    reader: reader.to_string(),
                    protocol,
                    atr: atr.clone(),
                },
            );
            Ok(ConnectOutcome {
                card: RawCard(id),
                protocol,
                atr,
            })
        })
    }

    fn reconnect(
        &self,
        card: RawCard,
        _share_mode: ShareMode,
        protocols: Protocols,
        _initialization: Initialization,
    ) -> Result<Option<Protocol>, Error> {
        self.mutate(|s| {
            let mock_card = s.cards.get_mut(&card.0).ok_or(Error::InvalidHandle)?;
            mock_card.protocol = default_protocol(protocols);
            Ok(mock_card.protocol)
        })
    }

    fn disconnect(&self, card: RawCard, _disposition: Disposition) -> Result<(), Error> {
        self.mutate(|s| match s.cards.remove(&card.0) {
            Some(_) => Ok(()),
            None => Err(Error::InvalidHandle),
        })
    }

    fn transmit(&self, card: RawCard, apdu: &[u8], _recv_len: usize) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        let reader = match state.cards.get(&card.0) {
            Some(mock_card) => mock_card.reader.clone(),
            None => return Err(Error::InvalidHandle),
        };
        if !state.readers.get(&reader).map(|r| r.present).unwrap_or(false) {
            return Err(Error::CardRemoved);
        }
        state.transmit_count += 1;
        if let Some(response) = state.transmit_queue.pop_front() {
            return Ok(response);
        }
        let scripted = state
            .exchanges
            .iter()
            .find(|(request, _)| request.as_slice() == apdu)
            .map(|(_, response)| response.clone());
        // Unscripted commands answer like a card that does not know them.
        Ok(scripted.unwrap_or_else(|| vec![0x6F, 0x00]))
    }

    fn control(&self, card: RawCard, _code: u32, _input: &[u8]) -> Result<Vec<u8>, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.cards.contains_key(&card.0) {
            return Err(Error::InvalidHandle);
        }
        state.control_count += 1;
        Ok(state.control_script.pop_front().unwrap_or_default())
    }

    fn status(&self, card: RawCard) -> Result<CardStatus, Error> {
        let state = self.state.lock().unwrap();
        let mock_card = state.cards.get(&card.0).ok_or(Error::InvalidHandle)?;
        let present = state
            .readers
            .get(&mock_card.reader)
            .map(|r| r.present)
            .unwrap_or(false);
        let flags = if present {
            CardStatusFlags::PRESENT | CardStatusFlags::POWERED
        } else {
            CardStatusFlags::ABSENT
        };
        Ok(CardStatus {
            state: flags,
            protocol: mock_card.protocol,
            atr: mock_card.atr.clone(),
        })
    }
}
