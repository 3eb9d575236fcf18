//! Card handles.
//!
//! A [`Card`] owns one connected card session. I/O goes through the
//! dispatch layer; `get_status` and `disconnect` stay synchronous, matching
//! the service's own bookkeeping-only calls.

// ───── Std Lib ─────
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// ───── Crates ─────
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

// ───── Local Modules ─────
use crate::binding::{CardStatus, ConnectOutcome, RawCard};
use crate::context::ContextInner;
use crate::dispatch::blocking;
use crate::error::Error;
use crate::features::{decode_feature_tlv, CM_IOCTL_GET_FEATURE_REQUEST};
use crate::types::{Disposition, Initialization, Protocol, Protocols, ShareMode};

/// Default receive buffer: a short APDU response plus the status word.
pub const DEFAULT_RECV_LENGTH: usize = 258;

/// Cap on data accumulated by the automatic GET-RESPONSE loop.
const MAX_AUTO_RESPONSE: usize = 65_536;

/// Cap on follow-up exchanges in one GET-RESPONSE chain. A card stuck
/// answering 6C (or 61 with no data) never reaches a terminal status word
/// and would loop forever on the data cap alone.
const MAX_GET_RESPONSE_EXCHANGES: usize = 1024;

/// Options for [`Card::transmit`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransmitOptions {
    /// Receive buffer size for each exchange.
    pub max_recv: usize,
    /// Resolve SW1=61/6C replies transparently (T=0 convenience).
    pub auto_get_response: bool,
}

impl Default for TransmitOptions {
    fn default() -> Self {
        TransmitOptions {
            max_recv: DEFAULT_RECV_LENGTH,
            auto_get_response: false,
        }
    }
}

/// Decodes an APDU given as a hex string.
///
/// Hex is a boundary convenience only; everything past this point works on
/// byte slices.
pub fn apdu_from_hex(apdu_hex: &str) -> Result<Vec<u8>, Error> {
    hex::decode(apdu_hex).map_err(|_| Error::InvalidParameter)
}

struct CardInner {
    ctx: Arc<ContextInner>,
    raw: RawCard,
    atr: Vec<u8>,
    protocol: Mutex<Option<Protocol>>,
    connected: AtomicBool,
    features: OnceCell<HashMap<u8, u32>>,
}

impl CardInner {
    fn ensure_usable(&self) -> Result<(), Error> {
        self.ctx.ensure_valid()?;
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// One raw exchange. A success shorter than a status word violates the
    /// PC/SC contract and is reported as such.
    fn exchange(&self, apdu: &[u8], recv_len: usize) -> Result<Vec<u8>, Error> {
        let response = self.ctx.binding.transmit(self.raw, apdu, recv_len)?;
        if response.len() < 2 {
            log::error!(
                "transmit returned {} byte(s), no status word",
                response.len()
            );
            return Err(Error::InvalidResponse);
        }
        Ok(response)
    }

    /// Resolves 61xx/6Cxx chains until a terminal status word.
    fn resolve_get_response(
        &self,
        original: &[u8],
        mut response: Vec<u8>,
        recv_len: usize,
    ) -> Result<Vec<u8>, Error> {
        let mut data: Vec<u8> = Vec::new();
        let mut exchanges = 0usize;
        loop {
            let sw1 = response[response.len() - 2];
            let sw2 = response[response.len() - 1];
            let follow_up = match sw1 {
                // More data waiting: fetch it with GET RESPONSE. Le of 0
                // asks for 256 bytes.
                0x61 => {
                    data.extend_from_slice(&response[..response.len() - 2]);
                    if data.len() > MAX_AUTO_RESPONSE {
                        log::error!("GET-RESPONSE chain exceeded {} bytes", MAX_AUTO_RESPONSE);
                        return Err(Error::InvalidResponse);
                    }
                    vec![0x00, 0xC0, 0x00, 0x00, sw2]
                }
                // Wrong Le: reissue the original command with the length
                // the card asked for.
                0x6C => {
                    let mut retry = original.to_vec();
                    if retry.len() <= 4 {
                        retry.push(sw2);
                    } else {
                        let last = retry.len() - 1;
                        retry[last] = sw2;
                    }
                    retry
                }
                _ => {
                    data.extend_from_slice(&response[..response.len() - 2]);
                    if data.len() > MAX_AUTO_RESPONSE {
                        log::error!("GET-RESPONSE chain exceeded {} bytes", MAX_AUTO_RESPONSE);
                        return Err(Error::InvalidResponse);
                    }
                    data.push(sw1);
                    data.push(sw2);
                    return Ok(data);
                }
            };
            exchanges += 1;
            if exchanges > MAX_GET_RESPONSE_EXCHANGES {
                log::error!(
                    "GET-RESPONSE chain did not terminate after {} exchanges",
                    MAX_GET_RESPONSE_EXCHANGES
                );
                return Err(Error::InvalidResponse);
            }
            response = self.exchange(&follow_up, recv_len)?;
        }
    }
}

impl Drop for CardInner {
    fn drop(&mut self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.ctx.binding.disconnect(self.raw, Disposition::Leave) {
                log::warn!("disconnect on drop failed: {}", e);
            }
        }
    }
}

/// A connected card session.
///
/// Created by [`crate::Reader::connect`]; destroyed by [`Card::disconnect`]
/// or implicitly when the owning context closes. After disconnect every
/// operation fails with `NotConnected`.
#[derive(Clone)]
pub struct Card {
    inner: Arc<CardInner>,
}

impl Card {
    pub(crate) fn from_outcome(ctx: Arc<ContextInner>, outcome: ConnectOutcome) -> Card {
        Card {
            inner: Arc::new(CardInner {
                ctx,
                raw: outcome.card,
                atr: outcome.atr,
                protocol: Mutex::new(outcome.protocol),
                connected: AtomicBool::new(true),
                features: OnceCell::new(),
            }),
        }
    }

    /// ATR snapshot taken when the connection was established.
    pub fn atr(&self) -> &[u8] {
        &self.inner.atr
    }

    /// Negotiated protocol; `None` when undefined (direct share mode).
    pub fn protocol(&self) -> Option<Protocol> {
        *self
            .inner
            .protocol
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Sends an APDU and returns the raw response.
    ///
    /// The response always carries the trailing two-byte status word. With
    /// `auto_get_response`, SW1=0x61 replies are chased with
    /// `00 C0 00 00 xx` and SW1=0x6C replies reissue the command with the
    /// corrected Le, until a terminal status word; the accumulated data is
    /// capped at 64 KiB.
    pub async fn transmit(
        &self,
        apdu: &[u8],
        options: TransmitOptions,
    ) -> Result<Vec<u8>, Error> {
        if apdu.is_empty() {
            return Err(Error::InvalidParameter);
        }
        self.inner.ensure_usable()?;
        log::debug!("transmit {}", hex::encode(apdu));

        let inner = Arc::clone(&self.inner);
        let apdu = apdu.to_vec();
        blocking(move || {
            inner.ensure_usable()?;
            let response = inner.exchange(&apdu, options.max_recv)?;
            if options.auto_get_response {
                inner.resolve_get_response(&apdu, response, options.max_recv)
            } else {
                Ok(response)
            }
        })
        .await
    }

    /// Issues an IOCTL to the reader, returning the raw response bytes.
    pub async fn control(&self, code: u32, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.inner.ensure_usable()?;
        let inner = Arc::clone(&self.inner);
        let data = data.to_vec();
        blocking(move || {
            inner.ensure_usable()?;
            inner.ctx.binding.control(inner.raw, code, &data)
        })
        .await
    }

    /// Current card status: state bits, protocol and ATR.
    pub fn get_status(&self) -> Result<CardStatus, Error> {
        self.inner.ensure_usable()?;
        self.inner.ctx.binding.status(self.inner.raw)
    }

    /// Re-negotiates the session and returns the new active protocol.
    pub async fn reconnect(
        &self,
        share_mode: ShareMode,
        preferred_protocols: Protocols,
        initialization: Initialization,
    ) -> Result<Option<Protocol>, Error> {
        self.inner.ensure_usable()?;
        let inner = Arc::clone(&self.inner);
        let protocol = blocking(move || {
            inner.ensure_usable()?;
            inner
                .ctx
                .binding
                .reconnect(inner.raw, share_mode, preferred_protocols, initialization)
        })
        .await?;
        *self
            .inner
            .protocol
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = protocol;
        Ok(protocol)
    }

    /// Ends the session. Idempotent; later operations fail `NotConnected`.
    pub fn disconnect(&self, disposition: Disposition) -> Result<(), Error> {
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.ctx.binding.disconnect(self.inner.raw, disposition)
    }

    /// The reader's CCID feature map (`feature tag → control code`),
    /// fetched once and cached for the life of the card object.
    pub async fn features(&self) -> Result<HashMap<u8, u32>, Error> {
        if let Some(cached) = self.inner.features.get() {
            return Ok(cached.clone());
        }
        let response = self.control(CM_IOCTL_GET_FEATURE_REQUEST, &[]).await?;
        let features = decode_feature_tlv(&response)?;
        // A concurrent first call may have won the race; the cached value
        // decodes from the same reader either way.
        let _ = self.inner.features.set(features.clone());
        Ok(features)
    }
}

impl std::fmt::Debug for Card {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Card")
            .field("atr", &hex::encode(&self.inner.atr))
            .field("protocol", &self.protocol())
            .field("connected", &self.is_connected())
            .finish()
    }
}
