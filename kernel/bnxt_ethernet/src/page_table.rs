//! Page tables through which firmware reaches multi-page rings and context memory.
//!
//! Memory is described to firmware at one of three depths:
//! * [`PageTableDepth::Level0`]: a single page, given directly.
//! * [`PageTableDepth::Level1`]: a contiguous run of pages, listed in one table page.
//! * [`PageTableDepth::Level2`]: a directory page listing leaf table pages, each of which
//!   lists a contiguous run of up to `fanout` pages.

use alloc::vec::Vec;
use nic_hal::{pages_for, DmaAllocator, DmaMemory, PhysicalAddress, PAGE_SIZE};

use crate::error::ContextMemError;

/// Page table entries that fit in one page: the default and maximum fan-out.
pub const MAX_CTX_PAGES: usize = PAGE_SIZE / 8;
/// The most pages a two-level table can describe at the maximum fan-out.
pub const MAX_CTX_TOTAL_PAGES: usize = MAX_CTX_PAGES * MAX_CTX_PAGES;

pub const PTU_PTE_VALID: u64 = 0x1;
pub const PTU_PTE_LAST: u64 = 0x2;
pub const PTU_PTE_NEXT_TO_LAST: u64 = 0x4;

/// Page size code placed in the upper nibble of a `pg_attr` field; 0 means 4 KiB.
pub const PAGE_SIZE_CODE_4K: u8 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PageTableDepth {
    Level0 = 0,
    Level1 = 1,
    Level2 = 2,
}

/// The shape of a page table, computed before anything is allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableLayout {
    pub depth: PageTableDepth,
    /// Pages holding the described memory.
    pub data_pages: usize,
    /// Leaf tables below the directory; zero unless the depth is [`PageTableDepth::Level2`].
    pub leaf_tables: usize,
    pub fanout: usize,
}

impl PageTableLayout {
    /// Computes the layout for `mem_size` bytes.
    ///
    /// A single level is used while the page count fits in `fanout` entries;
    /// beyond that a two-level table is built. `min_depth` forces at least that many levels.
    /// The result depends on nothing but the arguments.
    pub fn compute(mem_size: usize, fanout: usize, min_depth: PageTableDepth) -> Result<PageTableLayout, ContextMemError> {
        if fanout == 0 || fanout > MAX_CTX_PAGES {
            return Err(ContextMemError::InvalidFanout);
        }
        let data_pages = pages_for(mem_size);
        if data_pages == 0 || data_pages > fanout * fanout {
            return Err(ContextMemError::TooLarge);
        }
        let layout = if data_pages > fanout || min_depth == PageTableDepth::Level2 {
            PageTableLayout {
                depth: PageTableDepth::Level2,
                data_pages,
                leaf_tables: (data_pages + fanout - 1) / fanout,
                fanout,
            }
        } else if data_pages > 1 || min_depth == PageTableDepth::Level1 {
            PageTableLayout { depth: PageTableDepth::Level1, data_pages, leaf_tables: 0, fanout }
        } else {
            PageTableLayout { depth: PageTableDepth::Level0, data_pages, leaf_tables: 0, fanout }
        };
        Ok(layout)
    }

    /// Pages of data plus pages of tables.
    pub fn total_pages(&self) -> usize {
        match self.depth {
            PageTableDepth::Level0 => self.data_pages,
            PageTableDepth::Level1 => self.data_pages + 1,
            PageTableDepth::Level2 => self.data_pages + self.leaf_tables + 1,
        }
    }

    /// The number of contiguous runs the data pages are split into.
    fn runs(&self) -> usize {
        match self.depth {
            PageTableDepth::Level2 => self.leaf_tables,
            _ => 1,
        }
    }

    fn pages_in_run(&self, run: usize) -> usize {
        match self.depth {
            PageTableDepth::Level2 => (self.data_pages - run * self.fanout).min(self.fanout),
            _ => self.data_pages,
        }
    }
}

/// A byte that firmware expects at a fixed offset of every entry of fresh context memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageInitializer {
    pub value: u8,
    /// Offset within each entry; `None` means every byte of the page.
    pub offset: Option<usize>,
    pub entry_size: usize,
}

impl PageInitializer {
    fn apply(&self, run: &mut DmaMemory) {
        match self.offset {
            None => run.fill(self.value),
            Some(offset) if self.entry_size > offset => {
                let mut entry = 0;
                while entry + self.entry_size <= run.len() {
                    run.write_u8(entry + offset, self.value);
                    entry += self.entry_size;
                }
            }
            Some(offset) => warn!("context initializer offset {} is outside entries of {} bytes", offset, self.entry_size),
        }
    }
}

/// Memory described to firmware through a page table.
pub struct PageTable {
    layout: PageTableLayout,
    /// Contiguous runs of data pages, one per leaf table (or a single run).
    runs: Vec<DmaMemory>,
    /// The Level1 table, or the Level2 leaf tables.
    tables: Vec<DmaMemory>,
    directory: Option<DmaMemory>,
}

impl PageTable {
    /// Allocates the pages and tables for `layout`, pre-filling data pages with `init`.
    ///
    /// With `tag_last`, the last two entries of the top-level table are tagged
    /// next-to-last and last so that firmware can validate the end of the chain.
    /// The directory of a two-level table is always tagged.
    /// On failure everything allocated so far is released.
    pub fn allocate(
        dma: &dyn DmaAllocator,
        layout: PageTableLayout,
        tag_last: bool,
        init: Option<&PageInitializer>,
    ) -> Result<PageTable, ContextMemError> {
        let mut runs = Vec::with_capacity(layout.runs());
        for run in 0..layout.runs() {
            let mut mem = dma.allocate_pages(layout.pages_in_run(run)).map_err(|_e| ContextMemError::DmaAllocationFailed)?;
            if let Some(init) = init {
                init.apply(&mut mem);
            }
            runs.push(mem);
        }

        let mut tables = Vec::new();
        let mut directory = None;
        match layout.depth {
            PageTableDepth::Level0 => {}
            PageTableDepth::Level1 => {
                let mut table = dma.allocate(PAGE_SIZE).map_err(|_e| ContextMemError::DmaAllocationFailed)?;
                write_ptes(&mut table, runs[0].phys_addr(), layout.data_pages, tag_last);
                tables.push(table);
            }
            PageTableDepth::Level2 => {
                let mut dir = dma.allocate(PAGE_SIZE).map_err(|_e| ContextMemError::DmaAllocationFailed)?;
                for (i, run) in runs.iter().enumerate() {
                    let mut leaf = dma.allocate(PAGE_SIZE).map_err(|_e| ContextMemError::DmaAllocationFailed)?;
                    write_ptes(&mut leaf, run.phys_addr(), layout.pages_in_run(i), false);
                    dir.write_u64_le(i * 8, leaf.phys_addr().value() | pte_tag(i, layout.leaf_tables, true));
                    tables.push(leaf);
                }
                directory = Some(dir);
            }
        }

        Ok(PageTable { layout, runs, tables, directory })
    }

    pub fn layout(&self) -> &PageTableLayout {
        &self.layout
    }

    pub fn depth(&self) -> PageTableDepth {
        self.layout.depth
    }

    /// The address handed to firmware: the page itself, the table, or the directory.
    pub fn base_addr(&self) -> PhysicalAddress {
        match self.layout.depth {
            PageTableDepth::Level0 => self.runs[0].phys_addr(),
            PageTableDepth::Level1 => self.tables[0].phys_addr(),
            PageTableDepth::Level2 => self.directory.as_ref().map(|d| d.phys_addr()).unwrap_or_default(),
        }
    }

    /// `pg_attr`-style byte: depth in the low nibble, page size code in the high nibble.
    pub fn pg_attr(&self) -> u8 {
        (PAGE_SIZE_CODE_4K << 4) | self.layout.depth as u8
    }

    /// Total bytes of data memory.
    pub fn data_len(&self) -> usize {
        self.layout.data_pages * PAGE_SIZE
    }

    fn locate(&self, offset: usize) -> (usize, usize) {
        let run_len = self.layout.fanout * PAGE_SIZE;
        match self.layout.depth {
            PageTableDepth::Level2 => (offset / run_len, offset % run_len),
            _ => (0, offset),
        }
    }

    /// Reads `buf.len()` bytes at `offset` into the data memory; the range must not cross a run.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        let (run, off) = self.locate(offset);
        self.runs[run].read_bytes(off, buf);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        let (run, off) = self.locate(offset);
        self.runs[run].read_u8(off)
    }

    /// Writes `data` at `offset` into the data memory; the range must not cross a run.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        let (run, off) = self.locate(offset);
        self.runs[run].write_bytes(off, data);
    }

    /// Zeroes all data memory.
    pub fn clear(&mut self) {
        for run in self.runs.iter_mut() {
            run.fill(0);
        }
    }
}

fn pte_tag(index: usize, count: usize, tag_last: bool) -> u64 {
    let mut pte = PTU_PTE_VALID;
    if tag_last {
        if index + 1 == count {
            pte |= PTU_PTE_LAST;
        } else if index + 2 == count {
            pte |= PTU_PTE_NEXT_TO_LAST;
        }
    }
    pte
}

fn write_ptes(table: &mut DmaMemory, first_page: PhysicalAddress, count: usize, tag_last: bool) {
    for i in 0..count {
        let page = first_page.offset(i * PAGE_SIZE).value();
        table.write_u64_le(i * 8, page | pte_tag(i, count, tag_last));
    }
}
