// ABOUTME: Single discriminated error enum covering connection, super/stack transaction,
// ABOUTME: readout parser, and ETH-specific failure kinds for the whole crate.

use thiserror::Error;

/// Every failure kind the core can surface, replacing the source's deep
/// error-category inheritance with one flat enum.
#[derive(Debug, Error)]
pub enum Error {
    // -- connection --
    #[error("already connected")]
    IsConnected,

    #[error("not connected")]
    IsDisconnected,

    #[error("connection error: {0}")]
    ConnectionError(#[source] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    // -- super layer --
    #[error("super frame shorter than a reference word")]
    ShortSuperFrame,

    #[error("first word of super response is not a reference word")]
    SuperFormatError,

    #[error("super response reference {actual:#06x} does not match request {expected:#06x}")]
    SuperReferenceMismatch { expected: u16, actual: u16 },

    #[error("super command timed out awaiting mirror response")]
    SuperCommandTimeout,

    // -- stack layer --
    #[error("stack response does not start with the expected marker word")]
    StackFormatError,

    #[error("stack response reference {actual:#010x} does not match request {expected:#010x}")]
    StackReferenceMismatch { expected: u32, actual: u32 },

    #[error("stack command timed out awaiting result frame")]
    StackCommandTimeout,

    #[error("stack exec request appears to have been lost before execution")]
    StackExecRequestLost,

    #[error("stack executed but the result frame was lost")]
    StackExecResponseLost,

    #[error("no VME response: the controller's stack timeout flag was set")]
    NoVMEResponse,

    #[error("VME bus error while executing the stack")]
    VMEBusError,

    #[error("syntax error in the uploaded stack")]
    StackSyntaxError,

    #[error("stack memory exceeded")]
    StackMemoryExceeded,

    #[error("stack count exceeded")]
    StackCountExceeded,

    // -- parser --
    #[error("expected a stack frame header, found none")]
    NotAStackFrame,

    #[error("expected a BlockRead frame header")]
    NotABlockFrame,

    #[error("expected a StackContinuation frame")]
    NotAStackContinuation,

    #[error("stack id changed mid-event (was {expected}, saw {actual})")]
    StackIndexChanged { expected: u8, actual: u8 },

    #[error("stack id {0} is out of range for the configured readout structure")]
    StackIndexOutOfRange(u8),

    #[error("group index {0} is out of range for the stack's readout structure")]
    GroupIndexOutOfRange(usize),

    #[error("stack frame is empty but the event has configured groups")]
    EmptyStackFrame,

    #[error("no stack frame header found in the input")]
    NoStackFrameFound,

    #[error("no frame header present at the expected position")]
    NoHeaderPresent,

    #[error("input ended mid-frame with no continuation expected")]
    UnexpectedEndOfBuffer,

    // -- ETH specific --
    #[error("UDP packet's dataWordCount exceeds the packet size actually received")]
    UDPDataWordCountExceedsPacketSize,

    #[error("UDP packet channel out of range")]
    UDPPacketChannelOutOfRange,

    #[error("short read: fewer bytes than expected")]
    ShortRead,

    #[error("short write: fewer bytes written than requested")]
    ShortWrite,

    #[error("socket read timed out")]
    SocketReadTimeout,

    #[error("socket write timed out")]
    SocketWriteTimeout,

    // -- readout worker --
    #[error("readout worker is not idle")]
    ReadoutNotIdle,

    #[error("readout worker is not running")]
    ReadoutNotRunning,

    #[error("readout worker is not paused")]
    ReadoutNotPaused,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ConnectionError(e)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
