//! The logical partition view over a physical flash device.
//!
//! A [`Partition`] binds a contiguous physical range of a [`FlashDriver`] to
//! a logical address space with no holes: erase-blocks marked bad are
//! transparently skipped during address translation, so callers can treat
//! the partition as ordinary storage of `logical_len` good bytes.
//!
//! ```text
//! physical: | blk 0 | blk 1 |  BAD  | blk 3 | blk 4 |  BAD  | blk 6 | ...
//!               |       |       ________|        |      _________|
//!               v       v      v                 v     v
//! logical:  | blk 0 | blk 1 | blk 2          | blk 3 | blk 4 | ...
//! ```
//!
//! The mapping is not a stored table; it is recomputed on demand from the
//! partition base and the current bad-block status of each block. A block
//! newly marked bad (e.g. after a failed erase) therefore shifts the mapping
//! of every logical offset at or beyond it.
//!
//! All operations are synchronous and run on the caller's thread. A handle
//! must not be shared between threads; handles over disjoint physical ranges
//! are independent.

use crate::error::{Error, Result};
use crate::nand::{FlashDriver, Geometry};

/// Liveness callback kicked between per-block steps of long-running
/// operations, so that a system watchdog is not starved by a large erase.
/// A scheduling courtesy, not a concurrency primitive.
pub trait Watchdog {
    fn kick(&mut self);
}

impl<F: FnMut()> Watchdog for F {
    fn kick(&mut self) {
        self()
    }
}

/// One open logical view over a physical flash range.
///
/// Created by [`Partition::open`], destroyed by [`Partition::close`] (or
/// drop). Closing consumes the handle and gives the driver back; it never
/// touches flash state, and a closed handle cannot be used again.
pub struct Partition<D> {
    driver: D,
    base: u64,
    length: u64,
    geometry: Geometry,
    watchdog: Option<Box<dyn Watchdog>>,
}

impl<D: FlashDriver> Partition<D> {
    /// Open a partition covering `logical_length` good bytes starting at
    /// physical byte `physical_base`.
    ///
    /// Both arguments must be erase-block aligned and the range must lie
    /// within the device. Device geometry is queried and cached here; a
    /// driver that fails the query, or reports units the bit-trick
    /// alignment checks cannot handle, yields [`Error::NoDevice`].
    pub fn open(driver: D, physical_base: u64, logical_length: u64) -> Result<Self> {
        let geometry = driver.geometry().map_err(|_| Error::NoDevice)?;
        if !geometry.validate() {
            return Err(Error::NoDevice);
        }

        if !geometry.is_block_aligned(physical_base) || !geometry.is_block_aligned(logical_length) {
            return Err(Error::Unaligned {
                op: "open",
                offset: physical_base,
                length: logical_length,
                unit: u64::from(geometry.erase_size),
            });
        }

        let out_of_range = Error::OutOfRange {
            op: "open",
            offset: physical_base,
            length: logical_length,
            limit: geometry.capacity,
        };
        // Individual checks guard overflow of the addition itself.
        if physical_base > geometry.capacity || logical_length > geometry.capacity {
            return Err(out_of_range);
        }
        match physical_base.checked_add(logical_length) {
            Some(end) if end <= geometry.capacity => (),
            _ => return Err(out_of_range),
        }

        Ok(Self {
            driver,
            base: physical_base,
            length: logical_length,
            geometry,
            watchdog: None,
        })
    }

    /// Release the handle, giving the underlying driver back.
    ///
    /// Flash state is untouched. Use-after-close is unrepresentable: the
    /// handle is consumed.
    pub fn close(self) -> D {
        self.driver
    }

    /// Number of good bytes addressable through this handle.
    pub fn logical_len(&self) -> u64 {
        self.length
    }

    /// Device geometry as cached at open time.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Install a watchdog to be kicked between per-block steps.
    pub fn set_watchdog(&mut self, watchdog: impl Watchdog + 'static) {
        self.watchdog = Some(Box::new(watchdog));
    }

    fn kick(&mut self) {
        if let Some(watchdog) = self.watchdog.as_mut() {
            watchdog.kick();
        }
    }

    /// Physical bytes (bad blocks included) consumed by the first
    /// `logical_len` good bytes of the partition.
    pub fn physical_span(&mut self, logical_len: u64) -> Result<u64> {
        self.span_for("translate", logical_len)
    }

    /// Map a logical offset within the partition to a physical address.
    ///
    /// The logical space is walked in whole erase-blocks from the partition
    /// base; a sub-block offset maps to the same remainder within its
    /// (good) enclosing block.
    pub fn translate(&mut self, logical: u64) -> Result<u64> {
        self.translate_for("translate", logical)
    }

    fn span_for(&mut self, op: &'static str, logical_len: u64) -> Result<u64> {
        let block = u64::from(self.geometry.erase_size);
        let end = self.base + self.length;

        let mut good = 0;
        let mut span = 0;
        while good < logical_len {
            let addr = self.base + span;
            if addr >= end {
                // Bad blocks consumed the partition's physical extent before
                // the requested logical distance was reached.
                return Err(Error::OutOfRange {
                    op,
                    offset: logical_len,
                    length: 0,
                    limit: self.length,
                });
            }
            if !self.block_bad(addr)? {
                good += block;
            }
            span += block;
        }
        Ok(span)
    }

    fn translate_for(&mut self, op: &'static str, logical: u64) -> Result<u64> {
        if logical > self.length {
            return Err(Error::OutOfRange {
                op,
                offset: logical,
                length: 0,
                limit: self.length,
            });
        }

        let block = u64::from(self.geometry.erase_size);
        let rem = logical & (block - 1);
        if rem != 0 {
            // Walk through the end of the enclosing block, then back off to
            // the requested remainder. The enclosing block was counted as
            // good by the walk, so the result never lands in a bad block,
            // and skips already charged to earlier blocks are not recounted.
            let span = self.span_for(op, logical - rem + block)?;
            return Ok(self.base + span - block + rem);
        }

        // The walk stops at the first byte past the consumed good span,
        // which may land on a bad block holding no logical data. Settle on
        // the next good block.
        let span = self.span_for(op, logical)?;
        let end = self.base + self.length;
        let mut addr = self.base + span;
        while addr < end && self.block_bad(addr)? {
            addr += block;
        }
        if addr == end && logical != self.length {
            return Err(Error::OutOfRange {
                op,
                offset: logical,
                length: 0,
                limit: self.length,
            });
        }
        Ok(addr)
    }

    fn block_bad(&mut self, addr: u64) -> Result<bool> {
        self.driver
            .is_block_bad(addr)
            .map_err(|source| Error::Io { addr, source })
    }

    /// Erase `length` logical bytes starting at logical `offset`.
    ///
    /// Both arguments must be erase-block aligned. Blocks already marked bad
    /// are skipped. A block that fails erase is marked bad and the operation
    /// continues; only a failure to mark it bad aborts with
    /// [`Error::Fatal`], since such a block is in an unknown state.
    pub fn erase(&mut self, offset: u64, length: u64) -> Result<()> {
        let block = u64::from(self.geometry.erase_size);
        if !self.geometry.is_block_aligned(offset) || !self.geometry.is_block_aligned(length) {
            return Err(Error::Unaligned {
                op: "erase",
                offset,
                length,
                unit: block,
            });
        }
        self.check_bounds("erase", offset, length)?;
        if length == 0 {
            return Ok(());
        }

        let mut addr = self.translate_for("erase", offset)?;
        let end = self.base + self.length;
        let mut remaining = length;

        // The loop is bounded by the partition's physical extent, not by the
        // logical count alone: skipped bad blocks consume physical space
        // without satisfying any of the requested span.
        while remaining > 0 {
            self.kick();

            if addr >= end {
                break;
            }

            if self.block_bad(addr)? {
                log::warn!("skipping bad block at {addr:#x}");
                addr += block;
                continue;
            }

            log::trace!("erasing block at {addr:#x}");
            if let Err(err) = self.driver.erase_block(addr) {
                log::warn!("erase failed at {addr:#x} ({err}), marking block bad");
                self.driver
                    .mark_block_bad(addr)
                    .map_err(|source| Error::Fatal { addr, source })?;
            }

            remaining -= block;
            addr += block;
        }

        Ok(())
    }

    /// Write `buf` at logical `offset`.
    ///
    /// With `with_spare = false`, `buf` is plain page data and both `offset`
    /// and `buf.len()` must be page-aligned. With `with_spare = true`,
    /// `buf` interleaves `page_size` payload bytes and `spare_size` spare
    /// bytes per page (the layout used by block-mapping filesystems), and
    /// only the payload bytes count toward the logical span.
    pub fn write(&mut self, offset: u64, buf: &[u8], with_spare: bool) -> Result<()> {
        let length = self.payload_len("write", offset, buf.len(), with_spare)?;
        let addr = self.start_of_io("write", offset, length)?;

        let written = if with_spare {
            self.driver.write_pages_raw(addr, buf)
        } else {
            self.driver.write_pages(addr, buf)
        }
        .map_err(|source| Error::Io { addr, source })?;

        if written != buf.len() {
            // The driver ran off the device before completing the request;
            // partial success is never reported.
            return Err(Error::OutOfRange {
                op: "write",
                offset,
                length,
                limit: self.length,
            });
        }
        Ok(())
    }

    /// Read into `buf` from logical `offset`; counterpart of
    /// [`Partition::write`], with the same alignment and layout rules.
    ///
    /// On any error the buffer contents must not be trusted.
    pub fn read(&mut self, offset: u64, buf: &mut [u8], with_spare: bool) -> Result<()> {
        let length = self.payload_len("read", offset, buf.len(), with_spare)?;
        let addr = self.start_of_io("read", offset, length)?;

        if with_spare {
            return self.read_with_spare(addr, length, buf);
        }

        let read = self
            .driver
            .read_pages(addr, buf)
            .map_err(|source| Error::Io { addr, source })?;
        if read != buf.len() {
            return Err(Error::OutOfRange {
                op: "read",
                offset,
                length,
                limit: self.length,
            });
        }
        Ok(())
    }

    /// Logical payload length of an I/O request, derived from the buffer
    /// size and mode.
    fn payload_len(
        &self,
        op: &'static str,
        offset: u64,
        buf_len: usize,
        with_spare: bool,
    ) -> Result<u64> {
        let buf_len = buf_len as u64;
        if !with_spare {
            return Ok(buf_len);
        }

        let page = u64::from(self.geometry.page_size);
        let unit = page + u64::from(self.geometry.spare_size);
        if buf_len % unit != 0 {
            return Err(Error::Unaligned {
                op,
                offset,
                length: buf_len,
                unit,
            });
        }
        Ok(buf_len / unit * page)
    }

    /// Common validation for write/read, returning the physical start.
    ///
    /// This is deliberately two separate walks: first the span through the
    /// end of the last touched erase-block is charged against the partition
    /// bound, then the start address is resolved from a second translation.
    /// Collapsing them into one pass changes which blocks are charged on
    /// partition-boundary edge cases.
    fn start_of_io(&mut self, op: &'static str, offset: u64, length: u64) -> Result<u64> {
        let page = u64::from(self.geometry.page_size);
        if !self.geometry.is_page_aligned(offset) || length % page != 0 {
            return Err(Error::Unaligned {
                op,
                offset,
                length,
                unit: page,
            });
        }
        self.check_bounds(op, offset, length)?;

        let block = u64::from(self.geometry.erase_size);
        let end_rounded = (offset + length + block - 1) & !(block - 1);
        self.span_for(op, end_rounded)?;

        self.translate_for(op, offset)
    }

    fn check_bounds(&self, op: &'static str, offset: u64, length: u64) -> Result<()> {
        match offset.checked_add(length) {
            Some(end) if offset <= self.length && length <= self.length && end <= self.length => {
                Ok(())
            }
            _ => Err(Error::OutOfRange {
                op,
                offset,
                length,
                limit: self.length,
            }),
        }
    }

    /// Spare-mode read: no bad-block-skipping bulk primitive exists for
    /// this layout, so walk erase-blocks and pages explicitly.
    fn read_with_spare(&mut self, mut addr: u64, length: u64, buf: &mut [u8]) -> Result<()> {
        let geo = self.geometry;
        let page = geo.page_size as usize;
        let spare = geo.spare_size as usize;
        let block = u64::from(geo.erase_size);
        let end = self.base + self.length;

        let mut remaining = length;
        let mut out: &mut [u8] = buf;
        while remaining > 0 {
            self.kick();

            if addr >= end {
                // A block can go bad between validation and this walk.
                return Err(Error::OutOfRange {
                    op: "read",
                    offset: addr - self.base,
                    length: remaining,
                    limit: self.length,
                });
            }

            let block_off = addr & (block - 1);
            let block_addr = geo.block_base(addr);
            if self.block_bad(block_addr)? {
                // Bad blocks hold no logical data: advance the physical
                // cursor without touching the caller's buffer.
                log::warn!("skipping bad block at {block_addr:#x}");
                addr += block - block_off;
                continue;
            }

            // Read page by page to the end of this block, or of the request.
            let mut chunk = remaining.min(block - block_off);
            while chunk > 0 {
                let (piece, rest) = std::mem::take(&mut out).split_at_mut(page + spare);
                let (payload, oob) = piece.split_at_mut(page);
                self.driver
                    .read_page_raw(addr, payload, oob)
                    .map_err(|source| Error::Io { addr, source })?;
                out = rest;
                addr += page as u64;
                chunk -= page as u64;
                remaining -= page as u64;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::nand::{PageUtil, SimNand};

    use std::cell::Cell;
    use std::rc::Rc;

    const TEST_GEOMETRY: Geometry = Geometry {
        page_size: 128,
        erase_size: 512,
        spare_size: 16,
        capacity: 4096,
    };

    const PAGE: u64 = 128;
    const BLOCK: u64 = 512;

    fn test_nand() -> SimNand {
        SimNand::new(TEST_GEOMETRY)
    }

    #[test]
    fn test_open_rejects_unaligned() {
        let mut nand = test_nand();
        assert!(matches!(
            Partition::open(&mut nand, 100, BLOCK),
            Err(Error::Unaligned { op: "open", .. })
        ));
        assert!(matches!(
            Partition::open(&mut nand, BLOCK, BLOCK + 1),
            Err(Error::Unaligned { op: "open", .. })
        ));
    }

    #[test]
    fn test_open_rejects_out_of_range() {
        let mut nand = test_nand();
        // One block too long, and base at the very end of the device.
        assert!(matches!(
            Partition::open(&mut nand, 0, TEST_GEOMETRY.capacity + BLOCK),
            Err(Error::OutOfRange { op: "open", .. })
        ));
        assert!(matches!(
            Partition::open(&mut nand, TEST_GEOMETRY.capacity, BLOCK),
            Err(Error::OutOfRange { op: "open", .. })
        ));
        // base + length overflows u64; both summands are block-aligned.
        assert!(matches!(
            Partition::open(&mut nand, u64::MAX - BLOCK + 1, 2 * BLOCK),
            Err(Error::OutOfRange { op: "open", .. })
        ));
    }

    #[test]
    fn test_open_rejects_invalid_geometry() {
        let mut nand = SimNand::new(Geometry {
            page_size: 96,
            ..TEST_GEOMETRY
        });
        assert!(matches!(
            Partition::open(&mut nand, 0, BLOCK),
            Err(Error::NoDevice)
        ));
    }

    #[test]
    fn test_open_close() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let part = Partition::open(&mut nand, BLOCK, 2 * BLOCK)?;
        assert_eq!(part.logical_len(), 2 * BLOCK);
        assert_eq!(part.geometry(), TEST_GEOMETRY);
        part.close();
        Ok(())
    }

    #[test]
    fn test_translate_monotonic_excludes_bad() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        let mut last = None;
        for logical in (0..=2 * BLOCK).step_by(PAGE as usize) {
            let phys = part.translate(logical)?;
            // Never map into the bad block.
            assert_ne!(TEST_GEOMETRY.block_base(phys), BLOCK);
            if let Some(last) = last {
                assert!(phys >= last);
            }
            last = Some(phys);
        }

        // Offsets in different good blocks map strictly apart.
        assert!(part.translate(0)? < part.translate(BLOCK)?);
        Ok(())
    }

    #[test]
    fn test_translate_skips_bad_blocks() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        assert_eq!(part.translate(0)?, 0);
        assert_eq!(part.translate(PAGE)?, PAGE);
        // Logical block 1 lands past the bad physical block 1.
        assert_eq!(part.translate(BLOCK)?, 2 * BLOCK);
        assert_eq!(part.translate(BLOCK + PAGE)?, 2 * BLOCK + PAGE);
        assert_eq!(part.translate(2 * BLOCK)?, 3 * BLOCK);
        Ok(())
    }

    #[test]
    fn test_translate_out_of_range() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        // Beyond the logical length.
        assert!(matches!(
            part.translate(4 * BLOCK + PAGE),
            Err(Error::OutOfRange { .. })
        ));
        // The bad block ate the physical extent: the last logical block of
        // the partition no longer fits.
        assert!(matches!(
            part.translate(3 * BLOCK),
            Err(Error::OutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_physical_span() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        assert_eq!(part.physical_span(0)?, 0);
        assert_eq!(part.physical_span(BLOCK)?, BLOCK);
        assert_eq!(part.physical_span(2 * BLOCK)?, 3 * BLOCK);
        assert!(matches!(
            part.physical_span(4 * BLOCK),
            Err(Error::OutOfRange { .. })
        ));
        Ok(())
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_erase_marks_failed_block_bad() -> anyhow::Result<()> {
        init_logging();
        let mut nand = test_nand();
        for block in 0..4 {
            nand.write_pages(block * BLOCK, &vec![0xABu8; BLOCK as usize])?;
        }
        nand.fail_next_erase(2);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        part.erase(0, 4 * BLOCK)?;
        part.close();

        for block in [0, 1, 3] {
            assert!(!nand.is_bad(block));
            assert!(nand.block_data(block).is_erased());
        }
        assert!(nand.is_bad(2));
        Ok(())
    }

    #[test]
    fn test_erase_fatal_when_mark_bad_fails() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.fail_next_erase(1);
        nand.fail_mark_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        assert!(matches!(
            part.erase(0, 4 * BLOCK),
            Err(Error::Fatal { addr, .. }) if addr == BLOCK
        ));
        Ok(())
    }

    #[test]
    fn test_erase_skips_existing_bad_blocks() -> anyhow::Result<()> {
        init_logging();
        let mut nand = test_nand();
        nand.set_bad(1);
        for block in [0, 2, 3, 4] {
            nand.write_pages(block * BLOCK, &vec![0xCDu8; BLOCK as usize])?;
        }

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        part.erase(0, 4 * BLOCK)?;
        part.close();

        for block in [0, 2, 3] {
            assert!(nand.block_data(block).is_erased());
        }
        // Still bad, and the block past the partition is untouched.
        assert!(nand.is_bad(1));
        assert_eq!(nand.block_data(4), &[0xCDu8; BLOCK as usize][..]);
        Ok(())
    }

    #[test]
    fn test_erase_rejects_bad_arguments() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        assert!(matches!(
            part.erase(PAGE, BLOCK),
            Err(Error::Unaligned { op: "erase", .. })
        ));
        assert!(matches!(
            part.erase(0, 5 * BLOCK),
            Err(Error::OutOfRange { op: "erase", .. })
        ));
        assert!(matches!(
            part.erase(4 * BLOCK, BLOCK),
            Err(Error::OutOfRange { op: "erase", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_write_read_roundtrip() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let mut part = Partition::open(&mut nand, 0, 8 * BLOCK)?;

        let data_in: Vec<u8> = (0..2 * PAGE).map(|x| x as u8).collect();
        part.write(0, &data_in, false)?;

        let mut data_out = vec![0u8; data_in.len()];
        part.read(0, &mut data_out, false)?;
        assert_eq!(data_in, data_out);

        part.close();
        assert_eq!(&nand.block_data(0)[..data_in.len()], &data_in[..]);
        Ok(())
    }

    #[test]
    fn test_write_read_skip_bad_block() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 8 * BLOCK)?;
        let data_in: Vec<u8> = (0..2 * BLOCK).map(|x| x as u8).collect();
        part.write(0, &data_in, false)?;

        let mut data_out = vec![0u8; data_in.len()];
        part.read(0, &mut data_out, false)?;
        assert_eq!(data_in, data_out);

        part.close();
        assert_eq!(nand.block_data(0), &data_in[..BLOCK as usize]);
        assert!(nand.block_data(1).is_erased());
        assert_eq!(nand.block_data(2), &data_in[BLOCK as usize..]);
        Ok(())
    }

    #[test]
    fn test_write_at_sub_block_offset() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(0);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        let data_in = vec![0xEEu8; PAGE as usize];
        // Page 1 of logical block 0, which physically is block 1.
        part.write(PAGE, &data_in, false)?;

        let mut data_out = vec![0u8; PAGE as usize];
        part.read(PAGE, &mut data_out, false)?;
        assert_eq!(data_in, data_out);

        part.close();
        assert_eq!(
            &nand.block_data(1)[PAGE as usize..2 * PAGE as usize],
            &data_in[..]
        );
        assert!(nand.block_data(1)[..PAGE as usize].is_erased());
        Ok(())
    }

    #[test]
    fn test_write_rejects_bad_arguments() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        let page_buf = vec![0u8; PAGE as usize];
        assert!(matches!(
            part.write(64, &page_buf, false),
            Err(Error::Unaligned { op: "write", .. })
        ));
        assert!(matches!(
            part.write(0, &page_buf[..100], false),
            Err(Error::Unaligned { op: "write", .. })
        ));
        // More than the partition holds.
        assert!(matches!(
            part.write(0, &vec![0u8; 5 * BLOCK as usize], false),
            Err(Error::OutOfRange { op: "write", .. })
        ));
        // Fits the logical length on paper, but the bad block consumed the
        // physical extent.
        assert!(matches!(
            part.write(0, &vec![0u8; 4 * BLOCK as usize], false),
            Err(Error::OutOfRange { op: "write", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_spare_roundtrip_with_bad_block() -> anyhow::Result<()> {
        let mut nand = test_nand();
        nand.set_bad(1);

        let pages = 6;
        let unit = (PAGE + u64::from(TEST_GEOMETRY.spare_size)) as usize;
        let mut data_in = Vec::new();
        for page in 0..pages {
            data_in.extend(std::iter::repeat(0xA0 + page as u8).take(PAGE as usize));
            data_in.extend(
                std::iter::repeat(0xB0 + page as u8).take(TEST_GEOMETRY.spare_size as usize),
            );
        }
        assert_eq!(data_in.len(), pages * unit);

        let mut part = Partition::open(&mut nand, 0, 8 * BLOCK)?;
        part.write(0, &data_in, true)?;

        let mut data_out = vec![0u8; data_in.len()];
        part.read(0, &mut data_out, true)?;
        assert_eq!(data_in, data_out);

        // Pages 0..4 fill physical block 0, pages 4..6 land in block 2.
        part.close();
        assert_eq!(
            &nand.block_data(0)[..PAGE as usize],
            &data_in[..PAGE as usize]
        );
        assert_eq!(
            &nand.block_spare(0)[..TEST_GEOMETRY.spare_size as usize],
            &data_in[PAGE as usize..unit]
        );
        assert!(nand.block_data(1).is_erased());
        assert_eq!(
            &nand.block_data(2)[..PAGE as usize],
            &data_in[4 * unit..4 * unit + PAGE as usize]
        );
        Ok(())
    }

    #[test]
    fn test_spare_rejects_partial_unit_buffer() -> anyhow::Result<()> {
        let mut nand = test_nand();
        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        let buf = vec![0u8; PAGE as usize]; // payload only, no spare bytes
        assert!(matches!(
            part.write(0, &buf, true),
            Err(Error::Unaligned { op: "write", .. })
        ));
        Ok(())
    }

    #[test]
    fn test_watchdog_kicked_between_blocks() -> anyhow::Result<()> {
        let kicks = Rc::new(Cell::new(0u32));
        let counter = Rc::clone(&kicks);

        let mut nand = test_nand();
        let mut part = Partition::open(&mut nand, 0, 4 * BLOCK)?;
        part.set_watchdog(move || counter.set(counter.get() + 1));
        part.erase(0, 4 * BLOCK)?;

        assert_eq!(kicks.get(), 4);
        Ok(())
    }
}
