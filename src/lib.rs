//! Event-driven access to PC/SC smart card readers and cards.
//!
//! Two layers, both backed by the platform PC/SC service (winscard on
//! Windows, the PCSC framework on macOS, pcsclite on Linux):
//!
//! * A low-level surface mirroring the PC/SC primitives: [`Context`],
//!   [`Reader`] and [`Card`] with explicit ownership, blocking calls
//!   offloaded so the host loop never stalls, and cancellation that
//!   actually interrupts a blocked wait.
//! * A high-level [`Devices`] facade that watches reader attach/detach and
//!   card insert/remove across all readers and hands the application
//!   already-connected [`Card`] handles over a typed event stream.
//!
//! ```no_run
//! use smartcard_bridge::{DeviceEvent, Devices, DevicesConfig};
//!
//! # async fn run() -> Result<(), smartcard_bridge::Error> {
//! let devices = Devices::new(DevicesConfig::default());
//! let mut events = devices.start().await?;
//! while let Some(event) = events.recv().await {
//!     if let DeviceEvent::CardInserted { reader, card } = event {
//!         let atr = hex::encode(card.atr());
//!         println!("card in {reader}: {atr}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

// ───── Modules ─────
mod binding; // Typed seam over the platform PC/SC service.
mod card; // Connected card sessions.
mod context; // Resource-manager sessions and reader values.
mod devices; // High-level facade: monitor plus live card map.
mod dispatch; // Blocking-call offload onto the runtime pool.
mod error; // Crate-wide error taxonomy.
mod features; // CCID feature TLV and control codes.
mod monitor; // Reader and card presence monitor.
mod types; // PC/SC constants and flag types.

#[cfg(test)]
mod mock; // In-memory binding for the test suite.

// ───── Public Surface ─────
pub use binding::{
    Binding, CardStatus, ConnectOutcome, PcscBinding, RawCard, RawContext, ReaderStateEntry,
};
pub use card::{apdu_from_hex, Card, TransmitOptions, DEFAULT_RECV_LENGTH};
pub use context::{Context, Reader, ReaderChange};
pub use devices::{is_virtual_reader, DeviceEvent, Devices, DevicesConfig, ReaderSnapshot};
pub use error::{code, Error};
pub use features::*;
pub use monitor::{MonitorEvent, ReaderMonitor};
pub use types::*;

use std::sync::Arc;

/// Opens a context against the platform PC/SC service.
pub fn open_context() -> Result<Context, Error> {
    Context::establish(Arc::new(PcscBinding::new()))
}
