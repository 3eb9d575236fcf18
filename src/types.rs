//! PC/SC constants and flag types.
//!
//! Plain data only: the numeric values are the bit-exact PC/SC workgroup
//! values, independent of the platform bindings, so the rest of the crate
//! (and the test double) can be built without touching FFI.

// ───── Crates ─────
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Reader name of the plug-and-play pseudo reader used to observe reader
/// attach/detach through `get_status_change`.
pub const PNP_NOTIFICATION_NAME: &str = "\\\\?PnP?\\Notification";

/// How a connection to a card is shared with other applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShareMode {
    /// No other application may connect while this connection is open.
    Exclusive = 1,
    /// Other applications may connect to the same card.
    Shared = 2,
    /// Direct control of the reader, even with no card present.
    Direct = 3,
}

/// A negotiated card transmission protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// ISO-7816 T=0, byte-oriented.
    T0,
    /// ISO-7816 T=1, block-oriented.
    T1,
    /// Raw exchanges, no protocol framing.
    Raw,
}

bitflags! {
    /// A mask of acceptable protocols when connecting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protocols: u32 {
        const T0 = 0x0001;
        const T1 = 0x0002;
        const RAW = 0x0004;
    }
}

impl Protocols {
    /// No protocol; only meaningful together with `ShareMode::Direct`.
    pub const UNDEFINED: Protocols = Protocols::empty();
    /// Either of the ISO transmission protocols.
    pub const ANY: Protocols = Protocols::T0.union(Protocols::T1);
}

impl Protocol {
    /// The single-bit mask for this protocol.
    pub fn mask(self) -> Protocols {
        match self {
            Protocol::T0 => Protocols::T0,
            Protocol::T1 => Protocols::T1,
            Protocol::Raw => Protocols::RAW,
        }
    }
}

/// What happens to the card when a connection is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    /// Leave the card as is.
    Leave = 0,
    /// Warm reset.
    Reset = 1,
    /// Power the card down.
    Unpower = 2,
    /// Eject the card, where the reader supports it.
    Eject = 3,
}

/// How the card is initialized on `reconnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Initialization {
    /// Keep the current card state.
    Leave,
    /// Warm reset.
    Reset,
    /// Cold reset (power down, then up).
    Unpower,
}

bitflags! {
    /// Reader event-state bits reported by `get_status_change`.
    ///
    /// `UNAWARE` is the zero mask: "I know nothing about this reader yet".
    /// `CHANGED` doubles as the acknowledgement bit; the monitor folds it
    /// into the baseline it hands back to the next wait.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        const IGNORE = 0x0001;
        const CHANGED = 0x0002;
        const UNKNOWN = 0x0004;
        const UNAVAILABLE = 0x0008;
        const EMPTY = 0x0010;
        const PRESENT = 0x0020;
        const ATRMATCH = 0x0040;
        const EXCLUSIVE = 0x0080;
        const INUSE = 0x0100;
        const MUTE = 0x0200;
        const UNPOWERED = 0x0400;
    }
}

impl StateFlags {
    pub const UNAWARE: StateFlags = StateFlags::empty();

    /// True when the bits say a card is physically in the reader.
    pub fn has_card(self) -> bool {
        self.contains(StateFlags::PRESENT)
    }
}

bitflags! {
    /// Card status bits as reported by a connected card's `status` call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CardStatusFlags: u32 {
        const UNKNOWN = 0x0001;
        const ABSENT = 0x0002;
        const PRESENT = 0x0004;
        const SWALLOWED = 0x0008;
        const POWERED = 0x0010;
        const NEGOTIABLE = 0x0020;
        const SPECIFIC = 0x0040;
    }
}

// The flag types travel through host config files as their raw masks.
macro_rules! serde_as_bits {
    ($($flags:ident),+) => {
        $(
            impl Serialize for $flags {
                fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.serialize_u32(self.bits())
                }
            }

            impl<'de> Deserialize<'de> for $flags {
                fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    u32::deserialize(deserializer).map($flags::from_bits_truncate)
                }
            }
        )+
    };
}

serde_as_bits!(Protocols, StateFlags, CardStatusFlags);
