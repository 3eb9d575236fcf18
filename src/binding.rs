//! The binding seam over the platform PC/SC service.
//!
//! Everything above this module talks to a [`Binding`] trait object, never
//! to FFI. [`PcscBinding`] is the native implementation over the `pcsc`
//! crate (winscard on Windows, the PCSC framework on macOS, pcsclite on
//! Linux); the test double in `mock` replaces it wholesale.

// ───── Std Lib ─────
use std::collections::HashMap;
use std::ffi::CString;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ───── Local Modules ─────
use crate::error::Error;
use crate::types::{
    CardStatusFlags, Disposition, Initialization, Protocol, Protocols, ShareMode, StateFlags,
};

/// Opaque id of an established resource-manager session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawContext(pub(crate) u64);

/// Opaque id of a connected card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawCard(pub(crate) u64);

/// One reader's slot in a `get_status_change` call.
///
/// `current_state` and `current_count` together are what the caller already
/// knows: the named state bits plus the event counter the platform packs
/// into the upper word of the state value. The service compares both
/// against its own bookkeeping, so the acknowledged baseline a caller hands
/// back must carry the exact counter of the previous report; a baseline
/// with a stale counter makes pcsclite report the same change forever. The
/// binding fills `event_state`, `event_count` and `atr` on return.
#[derive(Debug, Clone)]
pub struct ReaderStateEntry {
    pub name: String,
    pub current_state: StateFlags,
    pub current_count: u32,
    pub event_state: StateFlags,
    pub event_count: u32,
    pub atr: Vec<u8>,
}

impl ReaderStateEntry {
    pub fn new(name: impl Into<String>, current_state: StateFlags, current_count: u32) -> Self {
        ReaderStateEntry {
            name: name.into(),
            current_state,
            current_count,
            event_state: StateFlags::UNAWARE,
            event_count: 0,
            atr: Vec::new(),
        }
    }

    /// True when the service flagged this entry as changed.
    pub fn changed(&self) -> bool {
        self.event_state.contains(StateFlags::CHANGED)
    }
}

/// Result of a successful `connect`.
#[derive(Debug, Clone)]
pub struct ConnectOutcome {
    pub card: RawCard,
    /// Negotiated protocol; `None` means undefined (direct share mode).
    pub protocol: Option<Protocol>,
    /// ATR snapshot taken right after the connection was established.
    pub atr: Vec<u8>,
}

/// Card status as reported by the service.
#[derive(Debug, Clone)]
pub struct CardStatus {
    pub state: CardStatusFlags,
    pub protocol: Option<Protocol>,
    pub atr: Vec<u8>,
}

/// The synchronous PC/SC primitive set.
///
/// All operations block the calling thread the way the underlying service
/// does; the dispatch layer moves them off the host loop. Implementations
/// must be callable from any thread, and `cancel` in particular must be
/// safe to invoke while `get_status_change` is blocked on the same context.
pub trait Binding: Send + Sync {
    fn establish(&self) -> Result<RawContext, Error>;
    fn release(&self, ctx: RawContext) -> Result<(), Error>;
    fn list_readers(&self, ctx: RawContext) -> Result<Vec<String>, Error>;
    /// Blocks until one of `states` changes, the timeout lapses
    /// (`Err(Timeout)`) or the wait is cancelled (`Err(Cancelled)`).
    /// `None` blocks forever; `Some(0)` polls.
    fn get_status_change(
        &self,
        ctx: RawContext,
        timeout: Option<Duration>,
        states: &mut [ReaderStateEntry],
    ) -> Result<(), Error>;
    fn cancel(&self, ctx: RawContext) -> Result<(), Error>;
    fn connect(
        &self,
        ctx: RawContext,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<ConnectOutcome, Error>;
    fn reconnect(
        &self,
        card: RawCard,
        share_mode: ShareMode,
        protocols: Protocols,
        initialization: Initialization,
    ) -> Result<Option<Protocol>, Error>;
    fn disconnect(&self, card: RawCard, disposition: Disposition) -> Result<(), Error>;
    /// Sends `apdu` and returns the raw response, status word included.
    fn transmit(&self, card: RawCard, apdu: &[u8], recv_len: usize) -> Result<Vec<u8>, Error>;
    fn control(&self, card: RawCard, code: u32, input: &[u8]) -> Result<Vec<u8>, Error>;
    fn status(&self, card: RawCard) -> Result<CardStatus, Error>;
}

// Upper bound for control responses; feature TLVs and the usual escape
// replies fit with a wide margin.
const CONTROL_RECV_SIZE: usize = 1024;

/// The native binding over the `pcsc` crate.
///
/// Handles are dealt out as opaque ids backed by internal tables. A released
/// context or disconnected card leaves the table, so every later call on its
/// id observes `InvalidHandle` instead of touching freed state; an in-flight
/// call keeps the underlying handle alive through its own clone or slot lock
/// until it returns.
pub struct PcscBinding {
    contexts: Mutex<HashMap<u64, pcsc::Context>>,
    cards: Mutex<HashMap<u64, Arc<Mutex<Option<pcsc::Card>>>>>,
    next_id: AtomicU64,
}

impl PcscBinding {
    pub fn new() -> Self {
        PcscBinding {
            contexts: Mutex::new(HashMap::new()),
            cards: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Clones the context out of the table; the clone keeps the native
    /// handle alive for the duration of one call even if `release` races.
    fn context(&self, ctx: RawContext) -> Result<pcsc::Context, Error> {
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ctx.0)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }

    fn card_slot(&self, card: RawCard) -> Result<Arc<Mutex<Option<pcsc::Card>>>, Error> {
        self.cards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&card.0)
            .cloned()
            .ok_or(Error::InvalidHandle)
    }
}

impl Default for PcscBinding {
    fn default() -> Self {
        PcscBinding::new()
    }
}

fn share_mode_to_pcsc(share_mode: ShareMode) -> pcsc::ShareMode {
    match share_mode {
        ShareMode::Exclusive => pcsc::ShareMode::Exclusive,
        ShareMode::Shared => pcsc::ShareMode::Shared,
        ShareMode::Direct => pcsc::ShareMode::Direct,
    }
}

fn disposition_to_pcsc(disposition: Disposition) -> pcsc::Disposition {
    match disposition {
        Disposition::Leave => pcsc::Disposition::LeaveCard,
        Disposition::Reset => pcsc::Disposition::ResetCard,
        Disposition::Unpower => pcsc::Disposition::UnpowerCard,
        Disposition::Eject => pcsc::Disposition::EjectCard,
    }
}

fn initialization_to_pcsc(initialization: Initialization) -> pcsc::Disposition {
    match initialization {
        Initialization::Leave => pcsc::Disposition::LeaveCard,
        Initialization::Reset => pcsc::Disposition::ResetCard,
        Initialization::Unpower => pcsc::Disposition::UnpowerCard,
    }
}

// The protocol masks differ between winscard and pcsclite (RAW in
// particular), so the conversion goes flag by flag rather than by bits.
fn protocols_to_pcsc(protocols: Protocols) -> pcsc::Protocols {
    let mut out = pcsc::Protocols::empty();
    if protocols.contains(Protocols::T0) {
        out |= pcsc::Protocols::T0;
    }
    if protocols.contains(Protocols::T1) {
        out |= pcsc::Protocols::T1;
    }
    if protocols.contains(Protocols::RAW) {
        out |= pcsc::Protocols::RAW;
    }
    out
}

fn protocol_from_pcsc(protocol: Option<pcsc::Protocol>) -> Option<Protocol> {
    match protocol {
        Some(pcsc::Protocol::T0) => Some(Protocol::T0),
        Some(pcsc::Protocol::T1) => Some(Protocol::T1),
        Some(pcsc::Protocol::RAW) => Some(Protocol::Raw),
        None => None,
    }
}

fn state_to_pcsc(state: StateFlags) -> pcsc::State {
    let mut out = pcsc::State::UNAWARE;
    for (ours, theirs) in [
        (StateFlags::IGNORE, pcsc::State::IGNORE),
        (StateFlags::CHANGED, pcsc::State::CHANGED),
        (StateFlags::UNKNOWN, pcsc::State::UNKNOWN),
        (StateFlags::UNAVAILABLE, pcsc::State::UNAVAILABLE),
        (StateFlags::EMPTY, pcsc::State::EMPTY),
        (StateFlags::PRESENT, pcsc::State::PRESENT),
        (StateFlags::ATRMATCH, pcsc::State::ATRMATCH),
        (StateFlags::EXCLUSIVE, pcsc::State::EXCLUSIVE),
        (StateFlags::INUSE, pcsc::State::INUSE),
        (StateFlags::MUTE, pcsc::State::MUTE),
        (StateFlags::UNPOWERED, pcsc::State::UNPOWERED),
    ] {
        if state.contains(ours) {
            out |= theirs;
        }
    }
    out
}

// The upper word of the state value is the platform's event counter. It is
// invisible in the named flags, but pcsclite compares it against its
// internal count, so the acknowledgment must hand back the exact value of
// the previous report next to the flag bits.
fn current_state_to_pcsc(flags: StateFlags, count: u32) -> pcsc::State {
    let raw = (state_to_pcsc(flags).bits() as u64) | (((count & 0xFFFF) as u64) << 16);
    pcsc::State::from_bits_retain(raw as _)
}

fn state_from_pcsc(state: pcsc::State) -> StateFlags {
    let mut out = StateFlags::UNAWARE;
    for (theirs, ours) in [
        (pcsc::State::IGNORE, StateFlags::IGNORE),
        (pcsc::State::CHANGED, StateFlags::CHANGED),
        (pcsc::State::UNKNOWN, StateFlags::UNKNOWN),
        (pcsc::State::UNAVAILABLE, StateFlags::UNAVAILABLE),
        (pcsc::State::EMPTY, StateFlags::EMPTY),
        (pcsc::State::PRESENT, StateFlags::PRESENT),
        (pcsc::State::ATRMATCH, StateFlags::ATRMATCH),
        (pcsc::State::EXCLUSIVE, StateFlags::EXCLUSIVE),
        (pcsc::State::INUSE, StateFlags::INUSE),
        (pcsc::State::MUTE, StateFlags::MUTE),
        (pcsc::State::UNPOWERED, StateFlags::UNPOWERED),
    ] {
        if state.contains(theirs) {
            out |= ours;
        }
    }
    out
}

fn card_status_from_pcsc(status: pcsc::Status) -> CardStatusFlags {
    let mut out = CardStatusFlags::empty();
    for (theirs, ours) in [
        (pcsc::Status::UNKNOWN, CardStatusFlags::UNKNOWN),
        (pcsc::Status::ABSENT, CardStatusFlags::ABSENT),
        (pcsc::Status::PRESENT, CardStatusFlags::PRESENT),
        (pcsc::Status::SWALLOWED, CardStatusFlags::SWALLOWED),
        (pcsc::Status::POWERED, CardStatusFlags::POWERED),
        (pcsc::Status::NEGOTIABLE, CardStatusFlags::NEGOTIABLE),
        (pcsc::Status::SPECIFIC, CardStatusFlags::SPECIFIC),
    ] {
        if status.contains(theirs) {
            out |= ours;
        }
    }
    out
}

fn reader_cstring(name: &str) -> Result<CString, Error> {
    CString::new(name).map_err(|_| Error::InvalidParameter)
}

/// Queries status for protocol and ATR; tolerates the direct-mode case
/// where no card answers.
fn snapshot_status(card: &pcsc::Card) -> (Option<Protocol>, Vec<u8>) {
    match card.status2_owned() {
        Ok(status) => (
            protocol_from_pcsc(status.protocol2()),
            status.atr().to_vec(),
        ),
        Err(e) => {
            log::debug!("status snapshot after connect failed: {:?}", e);
            (None, Vec::new())
        }
    }
}

impl Binding for PcscBinding {
    fn establish(&self) -> Result<RawContext, Error> {
        let ctx = pcsc::Context::establish(pcsc::Scope::User)?;
        let id = self.next_id();
        self.contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ctx);
        log::debug!("established context #{}", id);
        Ok(RawContext(id))
    }

    fn release(&self, ctx: RawContext) -> Result<(), Error> {
        let removed = self
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ctx.0);
        match removed {
            // The native handle is freed when the last clone drops; a
            // worker still inside a blocking call holds one until then.
            Some(_) => {
                log::debug!("released context #{}", ctx.0);
                Ok(())
            }
            None => Err(Error::InvalidHandle),
        }
    }

    fn list_readers(&self, ctx: RawContext) -> Result<Vec<String>, Error> {
        let ctx = self.context(ctx)?;
        let names = ctx.list_readers_owned()?;
        Ok(names
            .into_iter()
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn get_status_change(
        &self,
        ctx: RawContext,
        timeout: Option<Duration>,
        states: &mut [ReaderStateEntry],
    ) -> Result<(), Error> {
        let ctx = self.context(ctx)?;

        let mut reader_states = Vec::with_capacity(states.len());
        for entry in states.iter() {
            let name = reader_cstring(&entry.name)?;
            reader_states.push(pcsc::ReaderState::new(
                name,
                current_state_to_pcsc(entry.current_state, entry.current_count),
            ));
        }

        ctx.get_status_change(timeout, &mut reader_states)?;

        for (entry, rs) in states.iter_mut().zip(reader_states.iter()) {
            entry.event_state = state_from_pcsc(rs.event_state());
            entry.event_count = rs.event_count() as u32;
            entry.atr = rs.atr().to_vec();
        }
        Ok(())
    }

    fn cancel(&self, ctx: RawContext) -> Result<(), Error> {
        let ctx = self.context(ctx)?;
        ctx.cancel()?;
        Ok(())
    }

    fn connect(
        &self,
        ctx: RawContext,
        reader: &str,
        share_mode: ShareMode,
        protocols: Protocols,
    ) -> Result<ConnectOutcome, Error> {
        let ctx = self.context(ctx)?;
        let name = reader_cstring(reader)?;
        let card = ctx.connect(
            &name,
            share_mode_to_pcsc(share_mode),
            protocols_to_pcsc(protocols),
        )?;
        let (protocol, atr) = snapshot_status(&card);

        let id = self.next_id();
        self.cards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Mutex::new(Some(card))));
        log::debug!(
            "connected card #{} on {:?}, protocol {:?}",
            id,
            reader,
            protocol
        );
        Ok(ConnectOutcome {
            card: RawCard(id),
            protocol,
            atr,
        })
    }

    fn reconnect(
        &self,
        card: RawCard,
        share_mode: ShareMode,
        protocols: Protocols,
        initialization: Initialization,
    ) -> Result<Option<Protocol>, Error> {
        let slot = self.card_slot(card)?;
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let native = guard.as_mut().ok_or(Error::InvalidHandle)?;
        native.reconnect(
            share_mode_to_pcsc(share_mode),
            protocols_to_pcsc(protocols),
            initialization_to_pcsc(initialization),
        )?;
        let (protocol, _) = snapshot_status(native);
        Ok(protocol)
    }

    fn disconnect(&self, card: RawCard, disposition: Disposition) -> Result<(), Error> {
        let slot = self.card_slot(card)?;
        // Taking the slot lock waits out any in-flight transmit/control.
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let native = guard.take().ok_or(Error::InvalidHandle)?;
        self.cards
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&card.0);
        native
            .disconnect(disposition_to_pcsc(disposition))
            .map_err(|(_, e)| Error::from(e))?;
        log::debug!("disconnected card #{}", card.0);
        Ok(())
    }

    fn transmit(&self, card: RawCard, apdu: &[u8], recv_len: usize) -> Result<Vec<u8>, Error> {
        let slot = self.card_slot(card)?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let native = guard.as_ref().ok_or(Error::InvalidHandle)?;
        let mut recv_buf = vec![0u8; recv_len.max(2)];
        let response = native.transmit(apdu, &mut recv_buf)?;
        Ok(response.to_vec())
    }

    fn control(&self, card: RawCard, code: u32, input: &[u8]) -> Result<Vec<u8>, Error> {
        let slot = self.card_slot(card)?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let native = guard.as_ref().ok_or(Error::InvalidHandle)?;
        let mut recv_buf = vec![0u8; CONTROL_RECV_SIZE];
        let response = native.control(code.into(), input, &mut recv_buf)?;
        Ok(response.to_vec())
    }

    fn status(&self, card: RawCard) -> Result<CardStatus, Error> {
        let slot = self.card_slot(card)?;
        let guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        let native = guard.as_ref().ok_or(Error::InvalidHandle)?;
        let status = native.status2_owned()?;
        Ok(CardStatus {
            state: card_status_from_pcsc(status.status()),
            protocol: protocol_from_pcsc(status.protocol2()),
            atr: status.atr().to_vec(),
        })
    }
}
