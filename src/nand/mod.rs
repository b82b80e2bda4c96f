//! Abstractions and code to access raw NAND flash.
//!
//! Everything here speaks *physical* byte addresses on the device. The
//! bad-block-hiding logical view lives in [`crate::partition`].

use std::io;

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Geometry {
    /// Bytes per programmable page
    pub page_size: u32,

    /// Bytes per erase-block
    pub erase_size: u32,

    /// Spare (out-of-band) bytes attached to each page
    pub spare_size: u32,

    /// Total device capacity in bytes
    pub capacity: u64,
}

impl Geometry {
    /// Check the invariants the rest of the crate relies on. Alignment is
    /// computed with `x & (unit - 1)`, so both units must be powers of two,
    /// the erase-block a whole number of pages, and the capacity a whole
    /// number of erase-blocks.
    pub fn validate(&self) -> bool {
        self.page_size.is_power_of_two()
            && self.erase_size.is_power_of_two()
            && self.erase_size >= self.page_size
            && self.capacity > 0
            && self.capacity % u64::from(self.erase_size) == 0
    }

    /// How many pages fit in one erase-block?
    pub fn pages_per_block(&self) -> u32 {
        self.erase_size / self.page_size
    }

    /// How many erase-blocks on the whole device?
    pub fn block_count(&self) -> u64 {
        self.capacity / u64::from(self.erase_size)
    }

    pub fn is_page_aligned(&self, value: u64) -> bool {
        value & u64::from(self.page_size - 1) == 0
    }

    pub fn is_block_aligned(&self, value: u64) -> bool {
        value & u64::from(self.erase_size - 1) == 0
    }

    /// Physical address of the first byte of the erase-block containing `addr`
    pub fn block_base(&self, addr: u64) -> u64 {
        addr & !u64::from(self.erase_size - 1)
    }
}

/// Represents a physical NAND flash device.
///
/// All addresses are absolute byte offsets on the device; block-granular
/// operations require them to be erase-block aligned, page-granular ones
/// page-aligned. Hardware and media failures surface as [`io::Error`]s.
pub trait FlashDriver {
    /// Report the device geometry.
    ///
    /// An `Err` means no device is present or its initialization failed.
    fn geometry(&self) -> io::Result<Geometry>;

    /// Is the erase-block at `addr` marked bad?
    fn is_block_bad(&mut self, addr: u64) -> io::Result<bool>;

    /// Mark the erase-block at `addr` bad.
    ///
    /// This should be called when an erase of the block fails; the block is
    /// then excluded from every future logical mapping.
    fn mark_block_bad(&mut self, addr: u64) -> io::Result<()>;

    /// Erase the block at `addr`, making all of its pages writable again.
    fn erase_block(&mut self, addr: u64) -> io::Result<()>;

    /// Bulk page write that skips bad blocks.
    ///
    /// Pages are programmed starting at `addr`; whenever the cursor reaches
    /// the start of a bad block, the whole block is skipped. Returns the
    /// number of bytes consumed from `buf`, which is short only when the
    /// device ends before the buffer is exhausted.
    fn write_pages(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize>;

    /// Bulk page read that skips bad blocks; counterpart of
    /// [`FlashDriver::write_pages`].
    fn read_pages(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Spare-aware bulk write that skips bad blocks.
    ///
    /// `buf` interleaves `page_size` payload bytes and `spare_size` spare
    /// bytes for each page. Returns the number of bytes consumed from `buf`.
    fn write_pages_raw(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize>;

    /// Program a single page together with its spare area. No bad-block
    /// handling; `addr` must be page-aligned.
    fn write_page_raw(&mut self, addr: u64, payload: &[u8], spare: &[u8]) -> io::Result<()>;

    /// Read a single page and its spare area into separate buffers. No
    /// bad-block handling; `addr` must be page-aligned.
    fn read_page_raw(&mut self, addr: u64, payload: &mut [u8], spare: &mut [u8]) -> io::Result<()>;
}

impl<D: FlashDriver + ?Sized> FlashDriver for &mut D {
    fn geometry(&self) -> io::Result<Geometry> {
        (**self).geometry()
    }
    fn is_block_bad(&mut self, addr: u64) -> io::Result<bool> {
        (**self).is_block_bad(addr)
    }
    fn mark_block_bad(&mut self, addr: u64) -> io::Result<()> {
        (**self).mark_block_bad(addr)
    }
    fn erase_block(&mut self, addr: u64) -> io::Result<()> {
        (**self).erase_block(addr)
    }
    fn write_pages(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_pages(addr, buf)
    }
    fn read_pages(&mut self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_pages(addr, buf)
    }
    fn write_pages_raw(&mut self, addr: u64, buf: &[u8]) -> io::Result<usize> {
        (**self).write_pages_raw(addr, buf)
    }
    fn write_page_raw(&mut self, addr: u64, payload: &[u8], spare: &[u8]) -> io::Result<()> {
        (**self).write_page_raw(addr, payload, spare)
    }
    fn read_page_raw(&mut self, addr: u64, payload: &mut [u8], spare: &mut [u8]) -> io::Result<()> {
        (**self).read_page_raw(addr, payload, spare)
    }
}

fn einval(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Besides the [`FlashDriver`] contract (including the bad-block-skipping
/// bulk primitives), it can inject faults: factory-bad blocks, one-shot
/// erase failures, and mark-bad failures.
#[derive(Debug, Clone)]
pub struct SimNand {
    geometry: Geometry,
    blocks: Box<[SimBlock]>,
}

#[derive(Debug, Clone)]
struct SimBlock {
    /// Payload bytes of all pages in the block
    data: Vec<u8>,

    /// Spare bytes of all pages in the block, `spare_size` per page
    spare: Vec<u8>,

    /// Is this block marked bad?
    bad: bool,

    /// The next erase of this block fails (then the flag clears)
    fail_next_erase: bool,

    /// Attempts to mark this block bad fail
    fail_mark_bad: bool,
}

impl SimBlock {
    fn new(geometry: Geometry) -> Self {
        let spare_len = geometry.spare_size as usize * geometry.pages_per_block() as usize;
        Self {
            data: vec![0xFF; geometry.erase_size as usize],
            spare: vec![0xFF; spare_len],
            bad: false,
            fail_next_erase: false,
            fail_mark_bad: false,
        }
    }
}

impl SimNand {
    /// Create an erased SimNand with the specified geometry.
    ///
    /// The geometry is not validated here, so that tests can present a
    /// nonsensical device to `Partition::open`.
    pub fn new(geometry: Geometry) -> Self {
        let count = if geometry.erase_size == 0 {
            0
        } else {
            (geometry.capacity / u64::from(geometry.erase_size)) as usize
        };
        let blocks = vec![SimBlock::new(geometry); count].into_boxed_slice();

        Self { geometry, blocks }
    }

    /// Mark a block factory-bad.
    pub fn set_bad(&mut self, index: u64) {
        self.blocks[index as usize].bad = true;
    }

    /// Make the next erase of the given block fail with an I/O error.
    pub fn fail_next_erase(&mut self, index: u64) {
        self.blocks[index as usize].fail_next_erase = true;
    }

    /// Make mark-bad of the given block fail with an I/O error.
    pub fn fail_mark_bad(&mut self, index: u64) {
        self.blocks[index as usize].fail_mark_bad = true;
    }

    pub fn is_bad(&self, index: u64) -> bool {
        self.blocks[index as usize].bad
    }

    /// Payload bytes of a whole block, for test inspection.
    pub fn block_data(&self, index: u64) -> &[u8] {
        &self.blocks[index as usize].data
    }

    /// Spare bytes of a whole block, `spare_size` per page, for test
    /// inspection.
    pub fn block_spare(&self, index: u64) -> &[u8] {
        &self.blocks[index as usize].spare
    }

    /// Block index for a physical address, bounds-checked.
    fn index_of(&self, addr: u64) -> io::Result<usize> {
        if addr >= self.geometry.capacity {
            return Err(einval("address beyond device capacity"));
        }
        Ok((addr / u64::from(self.geometry.erase_size)) as usize)
    }

    /// Mutable payload and spare slices for the page at `addr`.
    fn page_slices(&mut self, addr: u64) -> io::Result<(&mut [u8], &mut [u8])> {
        let geo = self.geometry;
        if !geo.is_page_aligned(addr) {
            return Err(einval("page address not page-aligned"));
        }
        let index = self.index_of(addr)?;
        let block = &mut self.blocks[index];

        let data_off = (addr % u64::from(geo.erase_size)) as usize;
        let page_index = data_off / geo.page_size as usize;
        let spare_off = page_index * geo.spare_size as usize;

        let data = &mut block.data[data_off..data_off + geo.page_size as usize];
        let spare = &mut block.spare[spare_off..spare_off + geo.spare_size as usize];
        Ok((data, spare))
    }
}

impl FlashDriver for SimNand {
    fn geometry(&self) -> io::Result<Geometry> {
        Ok(self.geometry)
    }

    fn is_block_bad(&mut self, addr: u64) -> io::Result<bool> {
        let index = self.index_of(addr)?;
        Ok(self.blocks[index].bad)
    }

    fn mark_block_bad(&mut self, addr: u64) -> io::Result<()> {
        let index = self.index_of(addr)?;
        let block = &mut self.blocks[index];
        if block.fail_mark_bad {
            return Err(io::Error::other("simulated mark-bad failure"));
        }
        block.bad = true;
        Ok(())
    }

    fn erase_block(&mut self, addr: u64) -> io::Result<()> {
        if !self.geometry.is_block_aligned(addr) {
            return Err(einval("erase address not block-aligned"));
        }
        let index = self.index_of(addr)?;
        let block = &mut self.blocks[index];
        if block.fail_next_erase {
            block.fail_next_erase = false;
            return Err(io::Error::other("simulated erase failure"));
        }
        block.data.fill(0xFF);
        block.spare.fill(0xFF);
        Ok(())
    }

    fn write_pages(&mut self, mut addr: u64, buf: &[u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let page = geo.page_size as usize;
        if !geo.is_page_aligned(addr) || buf.len() % page != 0 {
            return Err(einval("bulk write not page-aligned"));
        }

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            let (data, _) = self.page_slices(addr)?;
            data.copy_from_slice(&buf[done..done + page]);
            done += page;
            addr += page as u64;
        }
        Ok(done)
    }

    fn read_pages(&mut self, mut addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let page = geo.page_size as usize;
        if !geo.is_page_aligned(addr) || buf.len() % page != 0 {
            return Err(einval("bulk read not page-aligned"));
        }

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            let (data, _) = self.page_slices(addr)?;
            buf[done..done + page].copy_from_slice(data);
            done += page;
            addr += page as u64;
        }
        Ok(done)
    }

    fn write_pages_raw(&mut self, mut addr: u64, buf: &[u8]) -> io::Result<usize> {
        let geo = self.geometry;
        let unit = (geo.page_size + geo.spare_size) as usize;
        if !geo.is_page_aligned(addr) || buf.len() % unit != 0 {
            return Err(einval("raw bulk write not page+spare-sized"));
        }

        let mut done = 0;
        while done < buf.len() {
            if addr >= geo.capacity {
                break;
            }
            if geo.is_block_aligned(addr) && self.is_block_bad(addr)? {
                addr += u64::from(geo.erase_size);
                continue;
            }
            let chunk = &buf[done..done + unit];
            let (payload, spare) = chunk.split_at(geo.page_size as usize);
            self.write_page_raw(addr, payload, spare)?;
            done += unit;
            addr += u64::from(geo.page_size);
        }
        Ok(done)
    }

    fn write_page_raw(&mut self, addr: u64, payload: &[u8], spare: &[u8]) -> io::Result<()> {
        let geo = self.geometry;
        if payload.len() != geo.page_size as usize || spare.len() > geo.spare_size as usize {
            return Err(einval("raw write buffers do not match geometry"));
        }
        let (data, oob) = self.page_slices(addr)?;
        data.copy_from_slice(payload);
        oob[..spare.len()].copy_from_slice(spare);
        Ok(())
    }

    fn read_page_raw(&mut self, addr: u64, payload: &mut [u8], spare: &mut [u8]) -> io::Result<()> {
        let geo = self.geometry;
        if payload.len() != geo.page_size as usize || spare.len() > geo.spare_size as usize {
            return Err(einval("raw read buffers do not match geometry"));
        }
        let spare_len = spare.len();
        let (data, oob) = self.page_slices(addr)?;
        payload.copy_from_slice(data);
        spare.copy_from_slice(&oob[..spare_len]);
        Ok(())
    }
}

#[cfg(test)]
const TEST_GEOMETRY: Geometry = Geometry {
    page_size: 128,
    erase_size: 512,
    spare_size: 16,
    capacity: 4096,
};

#[test]
fn test_geometry_validate() {
    assert!(TEST_GEOMETRY.validate());
    assert!(!Geometry {
        page_size: 96,
        ..TEST_GEOMETRY
    }
    .validate());
    assert!(!Geometry {
        erase_size: 768,
        ..TEST_GEOMETRY
    }
    .validate());
    assert!(!Geometry {
        capacity: 4100,
        ..TEST_GEOMETRY
    }
    .validate());
    assert!(!Geometry {
        capacity: 0,
        ..TEST_GEOMETRY
    }
    .validate());
}

#[test]
fn test_sim_page_roundtrip() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    let data_in = vec![0xA5u8; 256];
    let mut data_out = vec![0u8; 256];

    assert_eq!(nand.write_pages(512, &data_in)?, 256);
    assert_eq!(nand.read_pages(512, &mut data_out)?, 256);
    assert_eq!(data_in, data_out);
    assert!(nand.block_data(0).is_erased());

    Ok(())
}

#[test]
fn test_sim_bulk_skips_bad_blocks() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);
    nand.set_bad(1);

    // Two blocks worth of data written at block 0 must land in blocks 0 and 2.
    let data_in: Vec<u8> = (0..1024u32).map(|x| x as u8).collect();
    assert_eq!(nand.write_pages(0, &data_in)?, 1024);
    assert_eq!(nand.block_data(0), &data_in[..512]);
    assert!(nand.block_data(1).is_erased());
    assert_eq!(nand.block_data(2), &data_in[512..]);

    let mut data_out = vec![0u8; 1024];
    assert_eq!(nand.read_pages(0, &mut data_out)?, 1024);
    assert_eq!(data_in, data_out);

    Ok(())
}

#[test]
fn test_sim_bulk_short_at_device_end() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    let data_in = vec![0x5Au8; 1024];
    assert_eq!(nand.write_pages(3584, &data_in)?, 512);

    Ok(())
}

#[test]
fn test_sim_raw_page_spare() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    let payload_in = vec![0x11u8; 128];
    let spare_in = vec![0x22u8; 16];
    nand.write_page_raw(128, &payload_in, &spare_in)?;

    let mut payload_out = vec![0u8; 128];
    let mut spare_out = vec![0u8; 16];
    nand.read_page_raw(128, &mut payload_out, &mut spare_out)?;
    assert_eq!(payload_in, payload_out);
    assert_eq!(spare_in, spare_out);

    // Page 0 of the block is untouched.
    nand.read_page_raw(0, &mut payload_out, &mut spare_out)?;
    assert!(payload_out.is_erased());
    assert!(spare_out.is_erased());

    Ok(())
}

#[test]
fn test_sim_fault_injection() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_GEOMETRY);

    nand.fail_next_erase(2);
    assert!(nand.erase_block(1024).is_err());
    // One-shot: the retry succeeds.
    nand.erase_block(1024)?;

    nand.fail_mark_bad(3);
    assert!(nand.mark_block_bad(1536).is_err());
    assert!(!nand.is_bad(3));

    nand.mark_block_bad(1024)?;
    assert!(nand.is_block_bad(1024)?);

    Ok(())
}
