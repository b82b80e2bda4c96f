//! Error taxonomy for the partition translation layer.
//!
//! Every error carries enough context (offsets, the violated unit or limit)
//! for the caller to produce its own diagnostic; the core never prints.

use thiserror::Error;

/// Alias used throughout the crate for partition-level results.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// No flash device is present behind the driver, its initialization
    /// failed, or it reported a geometry the translation layer cannot work
    /// with (non-power-of-two units).
    #[error("no usable flash device available")]
    NoDevice,

    /// An offset or length violates the granularity required by the
    /// operation: erase-block size for open/erase, page size for write/read.
    #[error("{op}: offset {offset:#x} or length {length:#x} not aligned to {unit:#x}")]
    Unaligned {
        op: &'static str,
        offset: u64,
        length: u64,
        unit: u64,
    },

    /// A logical or physical bound was exceeded, including overflow of
    /// `offset + length` itself.
    #[error("{op}: offset {offset:#x} + length {length:#x} exceeds limit {limit:#x}")]
    OutOfRange {
        op: &'static str,
        offset: u64,
        length: u64,
        limit: u64,
    },

    /// Allocation of a partition handle failed. Reserved for builds with
    /// fallible allocation; the default allocator aborts instead.
    #[error("no memory available for a partition handle")]
    ResourceExhausted,

    /// The driver reported a hardware/media failure. Not retried here;
    /// retry policy, if any, belongs to the physical driver.
    #[error("flash I/O error at physical address {addr:#x}")]
    Io {
        addr: u64,
        #[source]
        source: std::io::Error,
    },

    /// A block failed erase *and* could not be marked bad. It is now in an
    /// indeterminate state and the whole operation was aborted.
    #[error("block at {addr:#x} failed erase and could not be marked bad")]
    Fatal {
        addr: u64,
        #[source]
        source: std::io::Error,
    },
}
