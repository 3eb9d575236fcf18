//! The crate-wide error taxonomy.
//!
//! Every platform return code collapses into one variant of [`Error`]; the
//! raw `SCARD_*` code stays reachable through [`Error::raw_code`] so callers
//! can match on the family or fall through to the number.

/// PC/SC error codes the taxonomy maps from, as defined by pcsclite and
/// winscard. Only the codes this crate names; everything else travels
/// through `Error::Other`.
pub mod code {
    pub const INTERNAL_ERROR: u32 = 0x8010_0001;
    pub const CANCELLED: u32 = 0x8010_0002;
    pub const INVALID_HANDLE: u32 = 0x8010_0003;
    pub const INVALID_PARAMETER: u32 = 0x8010_0004;
    pub const INSUFFICIENT_BUFFER: u32 = 0x8010_0008;
    pub const UNKNOWN_READER: u32 = 0x8010_0009;
    pub const TIMEOUT: u32 = 0x8010_000A;
    pub const SHARING_VIOLATION: u32 = 0x8010_000B;
    pub const NO_SMARTCARD: u32 = 0x8010_000C;
    pub const PROTO_MISMATCH: u32 = 0x8010_000F;
    pub const NOT_READY: u32 = 0x8010_0010;
    pub const INVALID_VALUE: u32 = 0x8010_0011;
    pub const READER_UNAVAILABLE: u32 = 0x8010_0017;
    pub const NO_SERVICE: u32 = 0x8010_001D;
    pub const SERVICE_STOPPED: u32 = 0x8010_001E;
    pub const NO_READERS_AVAILABLE: u32 = 0x8010_002E;
    pub const UNSUPPORTED_CARD: u32 = 0x8010_0065;
    pub const UNRESPONSIVE_CARD: u32 = 0x8010_0066;
    pub const UNPOWERED_CARD: u32 = 0x8010_0067;
    pub const RESET_CARD: u32 = 0x8010_0068;
    pub const REMOVED_CARD: u32 = 0x8010_0069;
    pub const UNKNOWN_ERROR: u32 = 0x8010_0014;
}

/// Represents errors that can occur while talking to readers and cards.
///
/// The set is closed: platform codes with no dedicated variant surface as
/// `Other` with the numeric code preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The PC/SC daemon or smart card service is absent or stopped.
    ServiceNotRunning,
    /// A listing produced no readers.
    NoReaders,
    /// The named reader is no longer available or not recognized.
    ReaderUnavailable,
    /// The card was withdrawn mid-operation.
    CardRemoved,
    /// The card did not answer; connect fallback material.
    Unresponsive,
    /// Another process holds exclusive access.
    SharingViolation,
    /// The requested protocol is not supported by the card.
    ProtocolMismatch,
    /// The operation timed out at the platform level.
    Timeout,
    /// A blocked wait was interrupted by `cancel`.
    Cancelled,
    /// The context or card handle was already closed.
    InvalidHandle,
    /// Malformed APDU, bad length or an otherwise rejected argument.
    InvalidParameter,
    /// A response violated an invariant (TLV, GET-RESPONSE, short reply).
    InvalidResponse,
    /// A card operation after disconnect.
    NotConnected,
    /// A second concurrent wait on the same context.
    Busy,
    /// Any unmapped platform code, preserved verbatim.
    Other(u32),
}

impl Error {
    /// The raw platform code behind this error, when one exists.
    ///
    /// `NotConnected`, `Busy` and `InvalidResponse` are produced by this
    /// library rather than the platform and have no code.
    pub fn raw_code(&self) -> Option<u32> {
        match self {
            Error::ServiceNotRunning => Some(code::NO_SERVICE),
            Error::NoReaders => Some(code::NO_READERS_AVAILABLE),
            Error::ReaderUnavailable => Some(code::READER_UNAVAILABLE),
            Error::CardRemoved => Some(code::REMOVED_CARD),
            Error::Unresponsive => Some(code::UNRESPONSIVE_CARD),
            Error::SharingViolation => Some(code::SHARING_VIOLATION),
            Error::ProtocolMismatch => Some(code::PROTO_MISMATCH),
            Error::Timeout => Some(code::TIMEOUT),
            Error::Cancelled => Some(code::CANCELLED),
            Error::InvalidHandle => Some(code::INVALID_HANDLE),
            Error::InvalidParameter => Some(code::INVALID_PARAMETER),
            Error::InvalidResponse => None,
            Error::NotConnected => None,
            Error::Busy => None,
            Error::Other(raw) => Some(*raw),
        }
    }

    /// True for errors after which the monitor loop cannot continue.
    pub fn is_fatal_for_monitor(&self) -> bool {
        matches!(self, Error::ServiceNotRunning | Error::InvalidHandle)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Error::ServiceNotRunning => "ServiceNotRunning",
            Error::NoReaders => "NoReaders",
            Error::ReaderUnavailable => "ReaderUnavailable",
            Error::CardRemoved => "CardRemoved",
            Error::Unresponsive => "Unresponsive",
            Error::SharingViolation => "SharingViolation",
            Error::ProtocolMismatch => "ProtocolMismatch",
            Error::Timeout => "Timeout",
            Error::Cancelled => "Cancelled",
            Error::InvalidHandle => "InvalidHandle",
            Error::InvalidParameter => "InvalidParameter",
            Error::InvalidResponse => "InvalidResponse",
            Error::NotConnected => "NotConnected",
            Error::Busy => "Busy",
            Error::Other(_) => "Other",
        };
        match self.raw_code() {
            Some(raw) => write!(f, "{} (0x{:08X})", name, raw),
            None => write!(f, "{}", name),
        }
    }
}

impl std::error::Error for Error {
    // Interoperability with `?`, logging and the wider error ecosystem.
}

impl From<pcsc::Error> for Error {
    /// Converts a `pcsc::Error` into the crate taxonomy.
    ///
    /// The pcsc crate already collapses codes it does not know, so the
    /// catch-all arm can only carry codes pcsc itself names.
    fn from(err: pcsc::Error) -> Self {
        use pcsc::Error as P;
        match err {
            P::NoService | P::ServiceStopped => Error::ServiceNotRunning,
            P::NoReadersAvailable => Error::NoReaders,
            P::ReaderUnavailable | P::UnknownReader => Error::ReaderUnavailable,
            P::RemovedCard => Error::CardRemoved,
            P::NoSmartcard => Error::CardRemoved,
            P::UnresponsiveCard => Error::Unresponsive,
            P::SharingViolation => Error::SharingViolation,
            P::ProtoMismatch => Error::ProtocolMismatch,
            P::Timeout => Error::Timeout,
            P::Cancelled => Error::Cancelled,
            P::InvalidHandle => Error::InvalidHandle,
            P::InvalidParameter | P::InvalidValue | P::InsufficientBuffer => {
                Error::InvalidParameter
            }
            P::InternalError => Error::Other(code::INTERNAL_ERROR),
            P::NotReady => Error::Other(code::NOT_READY),
            P::UnsupportedCard => Error::Other(code::UNSUPPORTED_CARD),
            P::UnpoweredCard => Error::Other(code::UNPOWERED_CARD),
            P::ResetCard => Error::Other(code::RESET_CARD),
            _ => Error::Other(code::UNKNOWN_ERROR),
        }
    }
}
