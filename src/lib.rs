//! Logical partition translation layer for raw NAND flash.
//!
//! NAND-class devices ship with, and develop, unusable erase-blocks. This
//! crate presents a contiguous logical address space over a physical range
//! of such a device: [`Partition`] translates logical offsets through a
//! bad-block-skipping mapping before anything reaches the physical driver,
//! and recovers from blocks discovered bad mid-erase by marking them and
//! carrying on.
//!
//! The physical side is the [`FlashDriver`] trait: per-block bad/good
//! status, erase, bulk page I/O, and raw page access including the spare
//! (out-of-band) area. Two implementations are provided: [`nand::SimNand`],
//! an in-memory simulator with fault injection for tests, and (on Linux)
//! [`nand::mtd::MtdNand`] over `/dev/mtdX`.
//!
//! Wear-leveling, garbage collection, and error correction are not this
//! layer's business; they belong below the driver boundary.

pub mod error;
pub mod nand;
pub mod partition;

pub use error::{Error, Result};
pub use nand::{FlashDriver, Geometry};
pub use partition::{Partition, Watchdog};
