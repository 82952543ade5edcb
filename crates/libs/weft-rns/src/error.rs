/// Failure kinds surfaced by the stack.
///
/// Parse and crypto failures are normally recovered by dropping the
/// offending input; the remaining kinds surface to callers through
/// results or concluded-callbacks and can be branched on without
/// unwinding.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum RnsError {
    OutOfMemory,
    InvalidArgument,
    IncorrectSignature,
    IncorrectHash,
    CryptoError,
    PacketError,
    ConnectionError,
    /// A deadline elapsed while waiting for a proof or handshake.
    Timeout,
    /// The operation was cut short by a link teardown.
    Cancelled,
    /// Channel send refused because the tx window is full.
    WindowFull,
    /// Channel message type is unknown, reserved, or already taken.
    Unregistered,
    /// The link is not ACTIVE yet.
    NotReady,
    /// Payload exceeds the MTU-derived budget.
    Overflow,
    /// Retries exhausted.
    Exhausted,
}

impl core::fmt::Display for RnsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for RnsError {}
