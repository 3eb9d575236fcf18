//! Context and Reader handles.
//!
//! A [`Context`] owns one resource-manager session. Readers are values
//! produced by listings; they hold no OS resources of their own and are
//! re-identified across listings by name.

// ───── Std Lib ─────
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ───── Local Modules ─────
use crate::binding::{Binding, RawContext, ReaderStateEntry};
use crate::card::Card;
use crate::dispatch::blocking;
use crate::error::Error;
use crate::types::{Protocols, ShareMode, StateFlags};

pub(crate) struct ContextInner {
    pub(crate) binding: Arc<dyn Binding>,
    pub(crate) raw: RawContext,
    valid: AtomicBool,
    wait_pending: AtomicBool,
}

impl ContextInner {
    pub(crate) fn ensure_valid(&self) -> Result<(), Error> {
        if self.valid.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::InvalidHandle)
        }
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.valid.swap(false, Ordering::AcqRel) {
            let _ = self.binding.cancel(self.raw);
            if let Err(e) = self.binding.release(self.raw) {
                log::warn!("releasing context on drop failed: {}", e);
            }
        }
    }
}

/// A handle to a PC/SC resource manager session.
///
/// Everything else descends from a context: reader listings, status-change
/// waits and card connections. Closing the context makes every reader and
/// card obtained from it inert; their operations fail with `InvalidHandle`.
pub struct Context {
    inner: Arc<ContextInner>,
}

/// One reader's updated slot from [`Context::wait_for_change`].
#[derive(Debug, Clone)]
pub struct ReaderChange {
    pub name: String,
    pub changed: bool,
    pub state: StateFlags,
    /// Platform event counter that came with `state`. Feed it back through
    /// [`Reader::apply_change`]; a snapshot without it re-reports the same
    /// change on every wait.
    pub event_count: u32,
    /// ATR of the card now present, when the new state carries one.
    pub atr: Option<Vec<u8>>,
}

impl Context {
    /// Establishes a session against the given binding.
    pub fn establish(binding: Arc<dyn Binding>) -> Result<Context, Error> {
        let raw = binding.establish()?;
        Ok(Context {
            inner: Arc::new(ContextInner {
                binding,
                raw,
                valid: AtomicBool::new(true),
                wait_pending: AtomicBool::new(false),
            }),
        })
    }

    /// Whether the context is still open.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Lists the readers currently visible to this context.
    pub async fn list_readers(&self) -> Result<Vec<Reader>, Error> {
        self.inner.ensure_valid()?;
        let inner = Arc::clone(&self.inner);
        let names = blocking(move || {
            inner.ensure_valid()?;
            inner.binding.list_readers(inner.raw)
        })
        .await?;
        Ok(names
            .into_iter()
            .map(|name| Reader::new(Arc::clone(&self.inner), name))
            .collect())
    }

    /// A reader value for `name`, without listing.
    ///
    /// Useful when the name arrives out of band (monitor events).
    pub fn reader(&self, name: impl Into<String>) -> Reader {
        Reader::new(Arc::clone(&self.inner), name.into())
    }

    /// Waits until the state of one of `readers` changes.
    ///
    /// Each snapshot's last known state is the baseline; a reader the
    /// platform does not recognize comes back flagged `UNKNOWN`. Timeout
    /// semantics: `None` blocks indefinitely, `Some(0)` returns promptly.
    /// Expiry yields the snapshots with every `changed == false`;
    /// cancellation yields `None`. Only one wait may be outstanding per
    /// context; a second one fails with `Busy`.
    pub async fn wait_for_change(
        &self,
        readers: &[Reader],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<ReaderChange>>, Error> {
        self.inner.ensure_valid()?;
        if self
            .inner
            .wait_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }

        let mut entries: Vec<ReaderStateEntry> = readers
            .iter()
            .map(|r| ReaderStateEntry::new(r.name.clone(), r.state, r.count))
            .collect();
        let prior: Vec<(StateFlags, u32)> =
            readers.iter().map(|r| (r.state, r.count)).collect();

        let inner = Arc::clone(&self.inner);
        let outcome = blocking(move || {
            let result = inner
                .ensure_valid()
                .and_then(|_| inner.binding.get_status_change(inner.raw, timeout, &mut entries));
            // The wait slot frees exactly when the native call is over.
            inner.wait_pending.store(false, Ordering::Release);
            result.map(|_| entries)
        })
        .await;

        match outcome {
            Ok(entries) => Ok(Some(
                entries
                    .into_iter()
                    .map(|entry| {
                        let changed = entry.changed();
                        let atr = if entry.atr.is_empty() {
                            None
                        } else {
                            Some(entry.atr)
                        };
                        ReaderChange {
                            name: entry.name,
                            changed,
                            state: entry.event_state,
                            event_count: entry.event_count,
                            atr,
                        }
                    })
                    .collect(),
            )),
            // Expiry is not an error: nothing changed.
            Err(Error::Timeout) => Ok(Some(
                readers
                    .iter()
                    .zip(prior)
                    .map(|(reader, (state, count))| ReaderChange {
                        name: reader.name.clone(),
                        changed: false,
                        state,
                        event_count: count,
                        atr: None,
                    })
                    .collect(),
            )),
            Err(Error::Cancelled) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Interrupts a pending `wait_for_change`.
    ///
    /// Safe to call from any thread; idempotent.
    pub fn cancel(&self) -> Result<(), Error> {
        self.inner.ensure_valid()?;
        self.inner.binding.cancel(self.inner.raw)
    }

    /// Closes the session. Idempotent; a pending wait is cancelled first.
    pub fn close(&self) {
        if self.inner.valid.swap(false, Ordering::AcqRel) {
            let _ = self.inner.binding.cancel(self.inner.raw);
            if let Err(e) = self.inner.binding.release(self.inner.raw) {
                log::warn!("releasing context failed: {}", e);
            }
        }
    }
}

/// A named reader visible to a context.
///
/// Carries the last observed event-state bits and ATR. The value owns
/// nothing releasable; dropping it has no effect on the OS.
#[derive(Clone)]
pub struct Reader {
    pub(crate) ctx: Arc<ContextInner>,
    name: String,
    state: StateFlags,
    count: u32,
    atr: Vec<u8>,
}

impl Reader {
    pub(crate) fn new(ctx: Arc<ContextInner>, name: String) -> Self {
        Reader {
            ctx,
            name,
            state: StateFlags::UNAWARE,
            count: 0,
            atr: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last observed event-state bits.
    pub fn state(&self) -> StateFlags {
        self.state
    }

    /// Last observed ATR; empty when no card was seen.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Folds a `wait_for_change` result back into the snapshot so the next
    /// wait uses the acknowledged state, event counter included, as its
    /// baseline.
    pub fn apply_change(&mut self, change: &ReaderChange) {
        if change.name != self.name {
            return;
        }
        self.state = change.state;
        self.count = change.event_count;
        match &change.atr {
            Some(atr) => self.atr = atr.clone(),
            None => self.atr.clear(),
        }
    }

    /// Connects to the card currently in this reader.
    pub async fn connect(
        &self,
        share_mode: ShareMode,
        preferred_protocols: Protocols,
    ) -> Result<Card, Error> {
        self.ctx.ensure_valid()?;
        let ctx = Arc::clone(&self.ctx);
        let name = self.name.clone();
        let outcome = blocking(move || {
            ctx.ensure_valid()?;
            ctx.binding
                .connect(ctx.raw, &name, share_mode, preferred_protocols)
        })
        .await?;
        log::debug!(
            "connected to {:?}, atr {}",
            self.name,
            hex::encode(&outcome.atr)
        );
        Ok(Card::from_outcome(Arc::clone(&self.ctx), outcome))
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("atr", &hex::encode(&self.atr))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBinding;
    use std::time::Instant;

    fn context_with(binding: &Arc<MockBinding>) -> Context {
        let dyn_binding: Arc<dyn Binding> = Arc::clone(binding) as Arc<dyn Binding>;
        Context::establish(dyn_binding).expect("establish")
    }

    #[tokio::test]
    async fn closed_context_rejects_everything() {
        let binding = Arc::new(MockBinding::new());
        binding.attach_reader("R1");
        let ctx = context_with(&binding);
        let readers = ctx.list_readers().await.expect("list");
        assert_eq!(readers.len(), 1);

        ctx.close();
        assert!(!ctx.is_valid());

        assert_eq!(ctx.list_readers().await.unwrap_err(), Error::InvalidHandle);
        assert_eq!(
            ctx.wait_for_change(&readers, Some(Duration::ZERO))
                .await
                .unwrap_err(),
            Error::InvalidHandle
        );
        assert_eq!(ctx.cancel().unwrap_err(), Error::InvalidHandle);
        assert_eq!(
            readers[0]
                .connect(ShareMode::Shared, Protocols::ANY)
                .await
                .unwrap_err(),
            Error::InvalidHandle
        );
        // Closing again is a no-op.
        ctx.close();
    }

    #[tokio::test]
    async fn zero_timeout_wait_never_returns_none() {
        let binding = Arc::new(MockBinding::new());
        let ctx = context_with(&binding);

        let empty = ctx
            .wait_for_change(&[], Some(Duration::ZERO))
            .await
            .expect("wait");
        assert_eq!(empty.expect("not cancelled").len(), 0);

        binding.attach_reader("R1");
        let mut readers = ctx.list_readers().await.expect("list");

        // First poll reports the initial state as a change.
        let changes = ctx
            .wait_for_change(&readers, Some(Duration::ZERO))
            .await
            .expect("wait")
            .expect("not cancelled");
        assert!(changes[0].changed);
        readers[0].apply_change(&changes[0]);

        // Acknowledged baseline: the next poll reports no changes.
        let changes = ctx
            .wait_for_change(&readers, Some(Duration::ZERO))
            .await
            .expect("wait")
            .expect("not cancelled");
        assert_eq!(changes.len(), 1);
        assert!(!changes[0].changed);
    }

    #[tokio::test]
    async fn cancel_resolves_pending_wait_to_none_exactly_once() {
        let binding = Arc::new(MockBinding::new());
        binding.attach_reader("R1");
        let ctx = context_with(&binding);
        let mut readers = ctx.list_readers().await.expect("list");
        let changes = ctx
            .wait_for_change(&readers, Some(Duration::ZERO))
            .await
            .expect("wait")
            .expect("not cancelled");
        readers[0].apply_change(&changes[0]);

        // Spawn the infinite wait, cancel it after 50 ms.
        let started = Instant::now();
        let wait = {
            let readers = readers.clone();
            let ctx_inner = Arc::clone(&ctx.inner);
            let ctx2 = Context { inner: ctx_inner };
            tokio::spawn(async move { ctx2.wait_for_change(&readers, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel().expect("cancel");
        let resolved = wait.await.expect("join").expect("wait");
        assert!(resolved.is_none());
        assert!(started.elapsed() < Duration::from_millis(1000));

        // Subsequent waits behave normally.
        let changes = ctx
            .wait_for_change(&readers, Some(Duration::ZERO))
            .await
            .expect("wait")
            .expect("not cancelled");
        assert!(!changes[0].changed);
    }

    #[tokio::test]
    async fn second_concurrent_wait_is_busy() {
        let binding = Arc::new(MockBinding::new());
        binding.attach_reader("R1");
        let ctx = context_with(&binding);
        let mut readers = ctx.list_readers().await.expect("list");
        let changes = ctx
            .wait_for_change(&readers, Some(Duration::ZERO))
            .await
            .expect("wait")
            .expect("not cancelled");
        readers[0].apply_change(&changes[0]);

        let blocked = {
            let readers = readers.clone();
            let ctx2 = Context {
                inner: Arc::clone(&ctx.inner),
            };
            tokio::spawn(async move { ctx2.wait_for_change(&readers, None).await })
        };
        // Give the first wait time to take the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            ctx.wait_for_change(&readers, None).await.unwrap_err(),
            Error::Busy
        );

        ctx.cancel().expect("cancel");
        let resolved = blocked.await.expect("join").expect("wait");
        assert!(resolved.is_none());
    }
}
