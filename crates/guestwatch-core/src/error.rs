use crate::{event::Sentinel, Va};

/// An opaque failure reported by an introspection or control primitive.
///
/// Concrete backends wrap whatever error their hypervisor bindings produce;
/// the core attaches typed context on top of this.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DriverError(Box<dyn std::error::Error + Send + Sync>);

impl DriverError {
    /// Wraps a backend error.
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }

    /// Creates a driver error from a plain message.
    pub fn msg(msg: impl Into<String>) -> Self {
        Self(msg.into().into())
    }
}

/// The memory read primitive a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccess {
    /// Variable-length read.
    Bytes,
    /// 8-bit read.
    U8,
    /// 16-bit read.
    U16,
    /// 32-bit read.
    U32,
    /// 64-bit read.
    U64,
    /// Pointer-sized read.
    Addr,
    /// NUL-terminated string read.
    Str,
}

/// The memory write primitive a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAccess {
    /// Variable-length write.
    Bytes,
    /// 8-bit write.
    U8,
    /// 16-bit write.
    U16,
    /// 32-bit write.
    U32,
    /// 64-bit write.
    U64,
}

/// The translation a failure was observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Translation {
    /// Kernel virtual address to guest physical address.
    KvaToGpa,
    /// Kernel virtual address to guest frame number.
    KvaToGfn,
    /// Kernel symbol to kernel virtual address.
    SymToKva,
    /// Kernel symbol to guest physical address.
    SymToGpa,
    /// Kernel symbol to guest frame number.
    SymToGfn,
}

/// An error produced by the core primitives.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reading guest memory failed.
    #[error("failed to read guest memory at {addr} ({kind:?})")]
    MemoryRead {
        /// Address the read targeted.
        addr: Va,
        /// Which read primitive failed.
        kind: ReadAccess,
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// Writing guest memory failed.
    #[error("failed to write guest memory at {addr} ({kind:?})")]
    MemoryWrite {
        /// Address the write targeted.
        addr: Va,
        /// Which write primitive failed.
        kind: WriteAccess,
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// Address translation failed (unmapped page, not-present PTE, ...).
    #[error("failed to translate {va:?} / {symbol:?} ({kind:?})")]
    Translation {
        /// Which translation failed.
        kind: Translation,
        /// The virtual address being translated, if any.
        va: Option<Va>,
        /// The symbol being translated, if any.
        symbol: Option<String>,
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// A kernel symbol could not be resolved.
    #[error("failed to resolve kernel symbol `{name}`")]
    SymbolLookup {
        /// The symbol name.
        name: String,
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// A named structure-field offset could not be resolved.
    #[error("failed to resolve field offset `{name}`")]
    OffsetLookup {
        /// The offset name.
        name: String,
        /// The underlying primitive failure.
        source: DriverError,
    },

    /// An event carried no envelope.
    #[error("event carries no data envelope")]
    EventDataNull,

    /// An event's envelope sentinel did not match the expected payload type.
    #[error("unexpected event data sentinel (expected {expected:?}, found {found:?})")]
    EventDataSentinel {
        /// The sentinel the recipient expected.
        expected: Sentinel,
        /// The sentinel found on the event.
        found: Sentinel,
    },

    /// A temporary patch was applied to the NULL address.
    #[error("patch address must not be null")]
    PatchNullAddress,

    /// A temporary patch was applied twice without an intervening undo.
    #[error("patch is already applied")]
    PatchAlreadyApplied,
}
