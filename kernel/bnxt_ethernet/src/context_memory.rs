//! Context memory ("backing store"): host memory in which P5+ firmware keeps per-queue state.
//!
//! Firmware first reports, per context type, how large an entry is and how many entries it
//! accepts. The driver then provisions page tables for the types it needs and commits their
//! addresses back to firmware, either in one legacy command or in one V2 command per
//! type instance.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use num_enum::TryFromPrimitive;

use crate::error::ContextMemError;
use crate::messages::*;
use crate::page_table::{PageInitializer, PageTable, PageTableDepth, PageTableLayout};
use nic_hal::DmaAllocator;
use zerocopy::FromZeroes;

/// Context types, valued as firmware's backing store type ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive)]
#[repr(u16)]
pub enum ContextType {
    Qp            = 0x00,
    Srq           = 0x01,
    Cq            = 0x02,
    Vnic          = 0x03,
    Stat          = 0x04,
    /// Slow-path TQM ring.
    Stqm          = 0x05,
    /// Fast-path TQM rings, one instance per ring.
    Ftqm          = 0x06,
    Mrav          = 0x0E,
    Tim           = 0x0F,
    SrtTrace      = 0x1E,
    Srt2Trace     = 0x1F,
    CrtTrace      = 0x20,
    Crt2Trace     = 0x21,
    RigpTrace     = 0x22,
    L2HwrmTrace   = 0x23,
    RoceHwrmTrace = 0x24,
}

impl ContextType {
    pub fn from_fw(type_: u16) -> Result<ContextType, ContextMemError> {
        ContextType::try_from(type_).map_err(|_e| ContextMemError::UnknownType(type_))
    }

    pub fn is_trace(&self) -> bool {
        *self >= ContextType::SrtTrace
    }

    /// The page table depth used at minimum for this type.
    /// TQM rings are always described through a directory.
    pub fn min_depth(&self) -> PageTableDepth {
        match self {
            ContextType::Stqm | ContextType::Ftqm | ContextType::Mrav => PageTableDepth::Level2,
            _ => PageTableDepth::Level1,
        }
    }
}

/// Firmware requirements for one context type, plus the memory provisioned for it.
pub struct ContextMemType {
    pub ctx_type: ContextType,
    pub entry_size: u16,
    pub min_entries: u32,
    pub max_entries: u32,
    /// Entry counts must be a multiple of this; 0 means no constraint.
    pub entry_multiple: u8,
    /// One page table per set bit; 0 means a single instance.
    pub instance_bmap: u32,
    pub init_value: u8,
    /// Byte offset of the initializer within each entry; `None` fills whole pages.
    pub init_offset: Option<usize>,
    /// Per-subtype entry counts (for example L2 versus QP1 queue pairs).
    pub split: [u32; 4],
    pub split_count: u8,
    entries: u32,
    pages: Vec<PageTable>,
}

impl ContextMemType {
    fn new(ctx_type: ContextType, entry_size: u16, min_entries: u32, max_entries: u32) -> ContextMemType {
        ContextMemType {
            ctx_type,
            entry_size,
            min_entries,
            max_entries,
            entry_multiple: 0,
            instance_bmap: 0,
            init_value: 0,
            init_offset: None,
            split: [0; 4],
            split_count: 0,
            entries: 0,
            pages: Vec::new(),
        }
    }

    fn set_initializer(&mut self, value: u8, offset: u8) {
        self.init_value = value;
        self.init_offset = match offset {
            BS_CTX_INIT_OFFSET_INVALID => None,
            units => Some(units as usize * 4),
        };
    }

    /// Parses one answer of `FUNC_BACKING_STORE_QCAPS_V2`; `None` if firmware marked the type invalid.
    pub fn from_v2_qcaps(resp: &FuncBackingStoreQcapsV2Output) -> Result<Option<ContextMemType>, ContextMemError> {
        let flags = resp.flags.get();
        if flags & BS_QCAPS_V2_FLAGS_TYPE_VALID == 0 {
            return Ok(None);
        }
        let ctx_type = ContextType::from_fw(resp.type_.get())?;
        let mut ctxm = ContextMemType::new(
            ctx_type,
            resp.entry_size.get(),
            resp.min_num_entries.get(),
            resp.max_num_entries.get(),
        );
        ctxm.entry_multiple = resp.entry_multiple;
        ctxm.instance_bmap = resp.instance_bit_map.get();
        if flags & BS_QCAPS_V2_FLAGS_ENABLE_CTX_KIND_INIT != 0 {
            ctxm.set_initializer(resp.ctx_init_value, resp.ctx_init_offset);
        }
        ctxm.split_count = resp.subtype_valid_cnt.min(4);
        for i in 0..ctxm.split_count as usize {
            ctxm.split[i] = resp.split_entry[i].get();
        }
        Ok(Some(ctxm))
    }

    /// The number of page tables this type needs.
    pub fn instances(&self) -> usize {
        match self.instance_bmap {
            0 => 1,
            bmap => bmap.count_ones() as usize,
        }
    }

    /// Rounds `entries` up to the required multiple and clamps it to the firmware limits.
    pub fn clamp_entries(&self, entries: u32) -> u32 {
        let entries = match self.entry_multiple {
            0 => entries,
            m => {
                let m = m as u32;
                entries.div_ceil(m).saturating_mul(m)
            }
        };
        entries.clamp(self.min_entries, self.max_entries.max(self.min_entries))
    }

    /// Allocates page tables holding `entries` entries for every instance of this type.
    ///
    /// Any previous provisioning is released first. On failure nothing stays allocated.
    pub fn provision(&mut self, dma: &dyn DmaAllocator, entries: u32, fanout: usize) -> Result<(), ContextMemError> {
        self.release();
        if self.entry_size == 0 {
            return Err(ContextMemError::TooLarge);
        }
        let entries = self.clamp_entries(entries);
        let mem_size = entries as usize * self.entry_size as usize;
        let layout = PageTableLayout::compute(mem_size, fanout, self.ctx_type.min_depth())?;
        let init = match self.init_value {
            0 => None,
            value => Some(PageInitializer { value, offset: self.init_offset, entry_size: self.entry_size as usize }),
        };

        let mut pages = Vec::with_capacity(self.instances());
        for _ in 0..self.instances() {
            pages.push(PageTable::allocate(dma, layout, false, init.as_ref())?);
        }
        trace!("context memory {:?}: {} entries of {} bytes in {} instance(s), {:?}",
            self.ctx_type, entries, self.entry_size, pages.len(), layout.depth);
        self.entries = entries;
        self.pages = pages;
        Ok(())
    }

    pub fn is_provisioned(&self) -> bool {
        !self.pages.is_empty()
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn page_tables(&self) -> &[PageTable] {
        &self.pages
    }

    pub fn release(&mut self) {
        self.pages.clear();
        self.entries = 0;
    }

    fn legacy_entry(&self, instance: usize) -> BackingStoreCfgEntry {
        match self.pages.get(instance) {
            Some(table) => BackingStoreCfgEntry {
                num_entries: Le32::new(self.entries),
                entry_size: Le16::new(self.entry_size),
                pg_attr: table.pg_attr(),
                unused: 0,
                page_dir: Le64::new(table.base_addr().value()),
            },
            None => BackingStoreCfgEntry::default(),
        }
    }

    /// The instance ids of this type, in ascending order.
    fn instance_ids(&self) -> Vec<u16> {
        match self.instance_bmap {
            0 => alloc::vec![0],
            bmap => (0..32u16).filter(|i| bmap & (1 << i) != 0).collect(),
        }
    }
}

/// All context types reported by firmware, keyed by type.
#[derive(Default)]
pub struct ContextTable {
    types: BTreeMap<ContextType, ContextMemType>,
    tqm_fp_rings: usize,
    committed: bool,
}

impl ContextTable {
    pub fn new() -> ContextTable {
        ContextTable::default()
    }

    /// Builds the table from the fixed-layout `FUNC_BACKING_STORE_QCAPS` answer.
    pub fn from_legacy_qcaps(resp: &FuncBackingStoreQcapsOutput) -> ContextTable {
        let init_value = resp.ctx_kind_initializer;
        let init_mask = resp.ctx_init_mask;
        let mut table = ContextTable::new();

        let mut qp = ContextMemType::new(ContextType::Qp, resp.qp_entry_size.get(), 0, resp.qp_max_entries.get());
        qp.split = [resp.qp_max_l2_entries.get() as u32, resp.qp_min_qp1_entries.get() as u32, 0, 0];
        qp.split_count = 2;
        if init_mask & BS_QCAPS_INIT_MASK_QP != 0 {
            qp.set_initializer(init_value, resp.qp_init_offset);
        }
        table.insert(qp);

        let mut srq = ContextMemType::new(ContextType::Srq, resp.srq_entry_size.get(), 0, resp.srq_max_entries.get());
        srq.split[0] = resp.srq_max_l2_entries.get() as u32;
        srq.split_count = 1;
        if init_mask & BS_QCAPS_INIT_MASK_SRQ != 0 {
            srq.set_initializer(init_value, resp.srq_init_offset);
        }
        table.insert(srq);

        let mut cq = ContextMemType::new(ContextType::Cq, resp.cq_entry_size.get(), 0, resp.cq_max_entries.get());
        cq.split[0] = resp.cq_max_l2_entries.get() as u32;
        cq.split_count = 1;
        if init_mask & BS_QCAPS_INIT_MASK_CQ != 0 {
            cq.set_initializer(init_value, resp.cq_init_offset);
        }
        table.insert(cq);

        let vnics = resp.vnic_max_vnic_entries.get() as u32;
        let ring_tables = resp.vnic_max_ring_table_entries.get() as u32;
        let mut vnic = ContextMemType::new(ContextType::Vnic, resp.vnic_entry_size.get(), 0, vnics + ring_tables);
        vnic.split = [vnics, ring_tables, 0, 0];
        vnic.split_count = 2;
        if init_mask & BS_QCAPS_INIT_MASK_VNIC != 0 {
            vnic.set_initializer(init_value, resp.vnic_init_offset);
        }
        table.insert(vnic);

        let mut stat = ContextMemType::new(ContextType::Stat, resp.stat_entry_size.get(), 0, resp.stat_max_entries.get());
        if init_mask & BS_QCAPS_INIT_MASK_STAT != 0 {
            stat.set_initializer(init_value, resp.stat_init_offset);
        }
        table.insert(stat);

        let tqm_entry_size = resp.tqm_entry_size.get();
        let tqm_min = resp.tqm_min_entries_per_ring.get();
        let tqm_max = resp.tqm_max_entries_per_ring.get();
        let mut stqm = ContextMemType::new(ContextType::Stqm, tqm_entry_size, tqm_min, tqm_max);
        stqm.entry_multiple = resp.tqm_entries_multiple;
        table.insert(stqm);

        let fp_rings = (resp.tqm_fp_rings_count as usize).clamp(1, BS_CFG_MAX_TQM_RINGS);
        let mut ftqm = ContextMemType::new(ContextType::Ftqm, tqm_entry_size, tqm_min, tqm_max);
        ftqm.entry_multiple = resp.tqm_entries_multiple;
        ftqm.instance_bmap = (1u32 << fp_rings) - 1;
        table.tqm_fp_rings = fp_rings;
        table.insert(ftqm);

        let mut mrav = ContextMemType::new(ContextType::Mrav, resp.mrav_entry_size.get(), 0, resp.mrav_max_entries.get());
        if init_mask & BS_QCAPS_INIT_MASK_MRAV != 0 {
            mrav.set_initializer(init_value, resp.mrav_init_offset);
        }
        table.insert(mrav);

        table.insert(ContextMemType::new(ContextType::Tim, resp.tim_entry_size.get(), 0, resp.tim_max_entries.get()));
        table
    }

    pub fn insert(&mut self, ctxm: ContextMemType) {
        if ctxm.ctx_type == ContextType::Ftqm {
            self.tqm_fp_rings = ctxm.instances();
        }
        self.types.insert(ctxm.ctx_type, ctxm);
    }

    pub fn get(&self, ctx_type: ContextType) -> Option<&ContextMemType> {
        self.types.get(&ctx_type)
    }

    pub fn get_mut(&mut self, ctx_type: ContextType) -> Option<&mut ContextMemType> {
        self.types.get_mut(&ctx_type)
    }

    pub fn types(&self) -> impl Iterator<Item = &ContextMemType> {
        self.types.values()
    }

    pub fn tqm_fp_rings(&self) -> usize {
        self.tqm_fp_rings
    }

    /// Provisions `entries` entries of `ctx_type`. Unknown types are an error.
    pub fn provision(&mut self, dma: &dyn DmaAllocator, ctx_type: ContextType, entries: u32, fanout: usize) -> Result<(), ContextMemError> {
        let ctxm = self.types.get_mut(&ctx_type).ok_or(ContextMemError::UnknownType(ctx_type as u16))?;
        ctxm.provision(dma, entries, fanout)
    }

    /// Records that firmware accepted the provisioned memory.
    pub fn mark_committed(&mut self) {
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Whether firmware has been given memory for `ctx_type`.
    pub fn is_type_committed(&self, ctx_type: ContextType) -> bool {
        self.committed && self.types.get(&ctx_type).map_or(false, |c| c.is_provisioned())
    }

    /// Releases all provisioned memory. Firmware must no longer be using it.
    pub fn release_all(&mut self) {
        for ctxm in self.types.values_mut() {
            ctxm.release();
        }
        self.committed = false;
    }

    /// The single `FUNC_BACKING_STORE_CFG` request describing every provisioned legacy type.
    pub fn legacy_cfg_request(&self) -> FuncBackingStoreCfgInput {
        let mut req = FuncBackingStoreCfgInput::new_zeroed();
        let mut enables = 0;

        let provisioned = |t| self.types.get(&t).filter(|c: &&ContextMemType| c.is_provisioned());
        if let Some(qp) = provisioned(ContextType::Qp) {
            enables |= BS_CFG_ENABLES_QP;
            req.qp = qp.legacy_entry(0);
            req.qp_num_l2_entries = Le16::new(qp.split[0] as u16);
            req.qp_num_qp1_entries = Le16::new(qp.split[1] as u16);
        }
        if let Some(srq) = provisioned(ContextType::Srq) {
            enables |= BS_CFG_ENABLES_SRQ;
            req.srq = srq.legacy_entry(0);
            req.srq_num_l2_entries = Le16::new(srq.split[0] as u16);
        }
        if let Some(cq) = provisioned(ContextType::Cq) {
            enables |= BS_CFG_ENABLES_CQ;
            req.cq = cq.legacy_entry(0);
            req.cq_num_l2_entries = Le16::new(cq.split[0] as u16);
        }
        if let Some(vnic) = provisioned(ContextType::Vnic) {
            enables |= BS_CFG_ENABLES_VNIC;
            req.vnic = vnic.legacy_entry(0);
            req.vnic_num_vnic_entries = Le16::new(vnic.split[0] as u16);
            req.vnic_num_ring_table_entries = Le16::new(vnic.split[1] as u16);
        }
        if let Some(stat) = provisioned(ContextType::Stat) {
            enables |= BS_CFG_ENABLES_STAT;
            req.stat = stat.legacy_entry(0);
        }
        if let Some(stqm) = provisioned(ContextType::Stqm) {
            enables |= BS_CFG_ENABLES_TQM_SP;
            req.tqm_sp = stqm.legacy_entry(0);
        }
        if let Some(ftqm) = provisioned(ContextType::Ftqm) {
            for i in 0..ftqm.page_tables().len().min(BS_CFG_MAX_TQM_RINGS) {
                enables |= BS_CFG_ENABLES_TQM_RING0 << i;
                req.tqm_ring[i] = ftqm.legacy_entry(i);
            }
        }
        if let Some(mrav) = provisioned(ContextType::Mrav) {
            enables |= BS_CFG_ENABLES_MRAV;
            req.mrav = mrav.legacy_entry(0);
        }
        if let Some(tim) = provisioned(ContextType::Tim) {
            enables |= BS_CFG_ENABLES_TIM;
            req.tim = tim.legacy_entry(0);
        }
        req.enables = Le32::new(enables);
        req
    }

    /// One `FUNC_BACKING_STORE_CFG_V2` request per provisioned type instance, in type order.
    /// The last request carries `ALL_DONE`.
    pub fn v2_cfg_requests(&self) -> Vec<FuncBackingStoreCfgV2Input> {
        let mut reqs = Vec::new();
        for ctxm in self.types.values().filter(|c| c.is_provisioned()) {
            for (table, instance) in ctxm.pages.iter().zip(ctxm.instance_ids()) {
                let mut req = FuncBackingStoreCfgV2Input::new_zeroed();
                req.type_ = Le16::new(ctxm.ctx_type as u16);
                req.instance = Le16::new(instance);
                req.page_dir = Le64::new(table.base_addr().value());
                req.num_entries = Le32::new(ctxm.entries);
                req.entry_size = Le16::new(ctxm.entry_size);
                req.page_size_pbl_level = table.pg_attr();
                req.subtype_valid_cnt = ctxm.split_count;
                for i in 0..4 {
                    req.split_entry[i] = Le32::new(ctxm.split[i]);
                }
                reqs.push(req);
            }
        }
        if let Some(last) = reqs.last_mut() {
            last.flags = Le32::new(BS_CFG_V2_FLAGS_BS_CFG_ALL_DONE);
        }
        reqs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nic_hal::sim::HeapDmaAllocator;
    use nic_hal::PAGE_SIZE;
    use crate::page_table::MAX_CTX_PAGES;

    fn legacy_caps() -> FuncBackingStoreQcapsOutput {
        let mut r = FuncBackingStoreQcapsOutput::new_zeroed();
        r.qp_max_entries = Le32::new(4096);
        r.qp_min_qp1_entries = Le16::new(64);
        r.qp_max_l2_entries = Le16::new(1024);
        r.qp_entry_size = Le16::new(352);
        r.srq_max_l2_entries = Le16::new(1024);
        r.srq_max_entries = Le32::new(2048);
        r.srq_entry_size = Le16::new(192);
        r.cq_max_l2_entries = Le16::new(2048);
        r.cq_max_entries = Le32::new(4096);
        r.cq_entry_size = Le16::new(64);
        r.vnic_max_vnic_entries = Le16::new(128);
        r.vnic_max_ring_table_entries = Le16::new(128);
        r.vnic_entry_size = Le16::new(128);
        r.stat_max_entries = Le32::new(1024);
        r.stat_entry_size = Le16::new(224);
        r.tqm_entry_size = Le16::new(128);
        r.tqm_min_entries_per_ring = Le32::new(1024);
        r.tqm_max_entries_per_ring = Le32::new(8192);
        r.tqm_entries_multiple = 32;
        r.tqm_fp_rings_count = 8;
        r.ctx_kind_initializer = 0x11;
        r.ctx_init_mask = BS_QCAPS_INIT_MASK_QP | BS_QCAPS_INIT_MASK_STAT;
        r.qp_init_offset = 2;
        r.stat_init_offset = BS_CTX_INIT_OFFSET_INVALID;
        r
    }

    #[test]
    fn test_legacy_qcaps_parsing() {
        let table = ContextTable::from_legacy_qcaps(&legacy_caps());
        let qp = table.get(ContextType::Qp).unwrap();
        assert_eq!((qp.entry_size, qp.max_entries, qp.split[0], qp.split[1]), (352, 4096, 1024, 64));
        assert_eq!((qp.init_value, qp.init_offset), (0x11, Some(8)));
        assert_eq!(table.get(ContextType::Stat).unwrap().init_offset, None);
        assert_eq!(table.get(ContextType::Cq).unwrap().init_value, 0);
        assert_eq!(table.get(ContextType::Ftqm).unwrap().instances(), 8);
        assert_eq!(table.tqm_fp_rings(), 8);
    }

    #[test]
    fn test_clamp_entries() {
        let table = ContextTable::from_legacy_qcaps(&legacy_caps());
        let stqm = table.get(ContextType::Stqm).unwrap();
        assert_eq!(stqm.clamp_entries(1), 1024);
        assert_eq!(stqm.clamp_entries(1500), 1504);
        assert_eq!(stqm.clamp_entries(100_000), 8192);
    }

    #[test]
    fn test_provision_and_initialize() {
        let dma = HeapDmaAllocator::new();
        let mut table = ContextTable::from_legacy_qcaps(&legacy_caps());
        table.provision(&dma, ContextType::Qp, 1088, MAX_CTX_PAGES).unwrap();
        let qp = table.get(ContextType::Qp).unwrap();
        assert_eq!(qp.entries(), 1088);
        let pages = qp.page_tables();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].depth(), PageTableDepth::Level1);
        assert_eq!(pages[0].read_u8(8), 0x11);
        assert_eq!(pages[0].read_u8(352 + 8), 0x11);
        assert_eq!(pages[0].read_u8(352 + 9), 0);

        table.provision(&dma, ContextType::Stat, 1, MAX_CTX_PAGES).unwrap();
        let stat = &table.get(ContextType::Stat).unwrap().page_tables()[0];
        assert!((0..PAGE_SIZE).all(|i| stat.read_u8(i) == 0x11));

        table.provision(&dma, ContextType::Ftqm, 2000, MAX_CTX_PAGES).unwrap();
        let ftqm = table.get(ContextType::Ftqm).unwrap();
        assert_eq!(ftqm.page_tables().len(), 8);
        assert!(ftqm.page_tables().iter().all(|t| t.depth() == PageTableDepth::Level2));
    }

    #[test]
    fn test_failed_provision_releases() {
        let dma = HeapDmaAllocator::new();
        let mut table = ContextTable::from_legacy_qcaps(&legacy_caps());
        dma.fail_after(5);
        assert_eq!(table.provision(&dma, ContextType::Ftqm, 2000, MAX_CTX_PAGES), Err(ContextMemError::DmaAllocationFailed));
        assert!(!table.get(ContextType::Ftqm).unwrap().is_provisioned());
        assert_eq!(dma.live_regions(), 0);
    }

    #[test]
    fn test_legacy_cfg_enables() {
        let dma = HeapDmaAllocator::new();
        let mut table = ContextTable::from_legacy_qcaps(&legacy_caps());
        for t in [ContextType::Qp, ContextType::Cq, ContextType::Stqm, ContextType::Ftqm] {
            table.provision(&dma, t, 1024, MAX_CTX_PAGES).unwrap();
        }
        let req = table.legacy_cfg_request();
        let enables = req.enables.get();
        assert_eq!(enables & BS_CFG_ENABLES_QP, BS_CFG_ENABLES_QP);
        assert_eq!(enables & BS_CFG_ENABLES_SRQ, 0);
        assert_eq!(enables & BS_CFG_ENABLES_TQM_SP, BS_CFG_ENABLES_TQM_SP);
        assert_eq!(enables & (0xFF * BS_CFG_ENABLES_TQM_RING0), 0xFF * BS_CFG_ENABLES_TQM_RING0);
        assert_eq!(req.qp.num_entries.get(), 1024);
        assert_eq!(req.qp.pg_attr, PageTableDepth::Level1 as u8);
        assert_eq!(req.qp_num_qp1_entries.get(), 64);
        let qp_table = &table.get(ContextType::Qp).unwrap().page_tables()[0];
        assert_eq!(req.qp.page_dir.get(), qp_table.base_addr().value());
        assert!(!table.is_type_committed(ContextType::Qp));
        table.mark_committed();
        assert!(table.is_type_committed(ContextType::Qp));
        assert!(!table.is_type_committed(ContextType::Srq));
    }

    #[test]
    fn test_v2_qcaps_and_cfg_sequence() {
        let dma = HeapDmaAllocator::new();
        let mut table = ContextTable::new();
        let mut resp = FuncBackingStoreQcapsV2Output::new_zeroed();
        resp.flags = Le32::new(BS_QCAPS_V2_FLAGS_TYPE_VALID | BS_QCAPS_V2_FLAGS_ENABLE_CTX_KIND_INIT);
        resp.type_ = Le16::new(ContextType::Qp as u16);
        resp.entry_size = Le16::new(256);
        resp.max_num_entries = Le32::new(4096);
        resp.ctx_init_value = 0x7;
        resp.ctx_init_offset = BS_CTX_INIT_OFFSET_INVALID;
        resp.subtype_valid_cnt = 2;
        resp.split_entry = [Le32::new(1024), Le32::new(64), Le32::new(0), Le32::new(0)];
        table.insert(ContextMemType::from_v2_qcaps(&resp).unwrap().unwrap());

        resp.type_ = Le16::new(ContextType::Ftqm as u16);
        resp.flags = Le32::new(BS_QCAPS_V2_FLAGS_TYPE_VALID);
        resp.instance_bit_map = Le32::new(0b101);
        resp.subtype_valid_cnt = 0;
        table.insert(ContextMemType::from_v2_qcaps(&resp).unwrap().unwrap());

        resp.flags = Le32::new(0);
        assert!(ContextMemType::from_v2_qcaps(&resp).unwrap().is_none());
        resp.flags = Le32::new(BS_QCAPS_V2_FLAGS_TYPE_VALID);
        resp.type_ = Le16::new(0x99);
        assert_eq!(ContextMemType::from_v2_qcaps(&resp).err(), Some(ContextMemError::UnknownType(0x99)));

        table.provision(&dma, ContextType::Qp, 1088, MAX_CTX_PAGES).unwrap();
        table.provision(&dma, ContextType::Ftqm, 512, MAX_CTX_PAGES).unwrap();
        let reqs = table.v2_cfg_requests();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].type_.get(), 0);
        assert_eq!(reqs[0].subtype_valid_cnt, 2);
        assert_eq!(reqs[0].split_entry[1].get(), 64);
        assert_eq!(reqs[1].type_.get(), ContextType::Ftqm as u16);
        assert_eq!(reqs[1].instance.get(), 0);
        assert_eq!(reqs[2].instance.get(), 2);
        assert_eq!(reqs[0].flags.get(), 0);
        assert_eq!(reqs[1].flags.get(), 0);
        assert_eq!(reqs[2].flags.get(), BS_CFG_V2_FLAGS_BS_CFG_ALL_DONE);
    }
}
