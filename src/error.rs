use thiserror::Error;

/// Failures surfaced by allocation paths.
///
/// Transient CAS races are always retried internally; the only terminal
/// failures a caller can observe are the two allocation errors below.
/// Duplicate keys and missing keys are ordinary outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The system allocator returned null while allocating a node, a
    /// directory segment, or a pin record segment. No shared state was
    /// left half-mutated.
    #[error("system memory exhausted")]
    OutOfMemory,

    /// Every pin record index is in use. Unlike [`Error::OutOfMemory`] this
    /// signals a design-time limit on the number of concurrent accessors,
    /// not a transient shortage.
    #[error("pin record space exhausted")]
    PinsExhausted,
}
