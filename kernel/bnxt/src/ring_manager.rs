//! Rings, statistics contexts and ring groups, and their registration with firmware.
//!
//! Every object lives in a slot of an [`Arena`] owned by the [`BnxtNic`]; callers refer to it
//! by a small copyable handle. A ring's slot index doubles as the logical id it was
//! registered with, which also picks its doorbell on legacy chips.

use alloc::vec::Vec;
use bnxt_ethernet::completion::CompletionEntry;
use bnxt_ethernet::hwrm::new_request;
use bnxt_ethernet::messages::*;
use bnxt_ethernet::ring::{normalize_ring_size, DoorbellTarget, Ring, RingKind, INVALID_HW_RING_ID};
use bnxt_ethernet::RingError;
use nic_hal::DmaMemory;

use crate::backing_store::context_type_for;
use crate::{BnxtError, BnxtNic, QueuePair};

/// Size of the hardware statistics block firmware DMAs into each stat context.
const STAT_CTX_DMA_LEN: usize = 176;
/// Receive buffer size announced for P5 and newer receive rings.
const RX_BUF_SIZE: u16 = 2048;
/// Firmware's marker for "no stat context".
const INVALID_STATS_CTX_ID: u32 = 0xFFFF_FFFF;

/// A ring owned by a [`BnxtNic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingHandle(u16);

/// A statistics context owned by a [`BnxtNic`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StatCtxHandle(u16);

/// A firmware ring group (legacy chips only).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingGroupHandle(u16);

impl RingHandle {
    /// The logical ring id firmware knows this ring by.
    pub fn index(&self) -> u16 {
        self.0
    }
}

impl StatCtxHandle {
    pub fn index(&self) -> u16 {
        self.0
    }
}

impl RingGroupHandle {
    pub fn index(&self) -> u16 {
        self.0
    }
}

/// Slot storage that reuses freed slots, lowest index first.
struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Arena<T> {
    const fn new() -> Arena<T> {
        Arena { slots: Vec::new() }
    }

    /// The index the next insertion will use.
    fn vacant_index(&self) -> Result<u16, BnxtError> {
        let index = self.slots.iter().position(Option::is_none).unwrap_or(self.slots.len());
        u16::try_from(index)
            .ok()
            .filter(|i| *i != u16::MAX)
            .ok_or(BnxtError::InsufficientResources)
    }

    fn insert_at(&mut self, index: u16, value: T) {
        let index = index as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index] = Some(value);
    }

    fn get(&self, index: u16) -> Option<&T> {
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, index: u16) -> Option<&mut T> {
        self.slots.get_mut(index as usize).and_then(Option::as_mut)
    }

    fn remove(&mut self, index: u16) -> Option<T> {
        self.slots.get_mut(index as usize).and_then(Option::take)
    }

    /// Indices of the live slots whose value satisfies `pred`.
    fn indices_where(&self, pred: impl Fn(&T) -> bool) -> Vec<u16> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().filter(|v| pred(v)).map(|_| i as u16))
            .collect()
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

struct StatCtx {
    fw_id: u32,
    /// Firmware writes the counters here.
    _mem: DmaMemory,
}

struct RingGroup {
    fw_id: u32,
}

/// Every ring, stat context and ring group of one function.
pub(crate) struct RingManager {
    rings: Arena<Ring>,
    stat_ctxs: Arena<StatCtx>,
    groups: Arena<RingGroup>,
}

impl RingManager {
    pub(crate) const fn new() -> RingManager {
        RingManager { rings: Arena::new(), stat_ctxs: Arena::new(), groups: Arena::new() }
    }

    pub(crate) fn ring(&self, handle: RingHandle) -> Option<&Ring> {
        self.rings.get(handle.0)
    }

    pub(crate) fn ring_count(&self) -> usize {
        self.rings.len()
    }
}

/// The objects a new ring reports to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingLinks {
    /// The completion ring of a transmit or receive ring.
    pub cmpl: Option<RingHandle>,
    /// The notification ring of a completion ring (P5 and newer).
    pub nq: Option<RingHandle>,
    pub stat: Option<StatCtxHandle>,
}

impl BnxtNic {
    pub fn ring(&self, handle: RingHandle) -> Option<&Ring> {
        self.rings.ring(handle)
    }

    /// Number of rings currently allocated.
    pub fn ring_count(&self) -> usize {
        self.rings.ring_count()
    }

    /// Allocates a ring and registers it with firmware, linking it to the default
    /// completion or notification ring.
    pub fn allocate_ring(&mut self, kind: RingKind, size: u32) -> Result<RingHandle, BnxtError> {
        self.ensure_not_in_reset()?;
        let links = match kind {
            RingKind::Completion => RingLinks { nq: self.default_nq, ..RingLinks::default() },
            RingKind::Tx | RingKind::Rx | RingKind::RxAgg => RingLinks { cmpl: self.default_cmpl, ..RingLinks::default() },
            RingKind::Notification => RingLinks::default(),
        };
        self.alloc_ring(kind, size, links)
    }

    /// Allocates a ring of `kind` with at least `size` entries and registers it through `RING_ALLOC`.
    ///
    /// On P5 and newer chips firmware keeps the ring's context in the backing store, so the ring
    /// is refused before anything is allocated if that context type was never committed.
    pub fn allocate_ring_with(&mut self, kind: RingKind, size: u32, links: RingLinks) -> Result<RingHandle, BnxtError> {
        self.ensure_not_in_reset()?;
        self.alloc_ring(kind, size, links)
    }

    /// Like [`Self::allocate_ring_with()`], also usable while a reset rebuilds the data path.
    pub(crate) fn alloc_ring(&mut self, kind: RingKind, size: u32, links: RingLinks) -> Result<RingHandle, BnxtError> {
        let size = normalize_ring_size(kind, size)?;
        if self.generation.needs_backing_store() {
            let ctx_type = context_type_for(kind);
            if !self.backing_store.as_ref().map_or(false, |t| t.is_type_committed(ctx_type)) {
                warn!("bnxt: cannot allocate a {:?} ring, no {:?} backing store was committed", kind, ctx_type);
                return Err(BnxtError::BackingStoreMissing(ctx_type));
            }
        }

        let cmpl_fw_id = match links.cmpl {
            Some(h) => Some(self.rings.ring(h).ok_or(BnxtError::InvalidHandle)?.fw_ring_id()),
            None => None,
        };
        let nq_fw_id = match links.nq {
            Some(h) => Some(self.rings.ring(h).ok_or(BnxtError::InvalidHandle)?.fw_ring_id()),
            None => None,
        };
        let stat_fw_id = match links.stat {
            Some(h) => Some(self.rings.stat_ctxs.get(h.0).ok_or(BnxtError::InvalidHandle)?.fw_id),
            None => None,
        };

        let index = self.rings.rings.vacant_index()?;
        let mut ring = Ring::new(&*self.dma, kind, size, self.generation.tracks_epochs())?;

        let mut req: RingAllocInput = new_request();
        let mut enables = 0;
        req.ring_type = kind as u8;
        req.page_size = RING_ALLOC_PAGE_SIZE_4K;
        req.page_tbl_depth = ring.memory().depth() as u8;
        req.page_tbl_addr = Le64::new(ring.memory().base_addr().value());
        req.logical_id = Le16::new(index);
        req.length = Le32::new(size);
        req.cmpl_ring_id = Le16::new(cmpl_fw_id.unwrap_or(INVALID_HW_RING_ID));
        req.stat_ctx_id = Le32::new(INVALID_STATS_CTX_ID);
        if let Some(id) = stat_fw_id {
            enables |= RING_ALLOC_ENABLES_STAT_CTX_ID_VALID;
            req.stat_ctx_id = Le32::new(id);
        }
        if let Some(id) = nq_fw_id {
            enables |= RING_ALLOC_ENABLES_NQ_RING_ID_VALID;
            req.nq_ring_id = Le16::new(id);
        }
        match kind {
            RingKind::Completion | RingKind::Notification => req.int_mode = RING_ALLOC_INT_MODE_MSIX,
            RingKind::Rx | RingKind::RxAgg if self.generation.needs_backing_store() => {
                enables |= RING_ALLOC_ENABLES_RX_BUF_SIZE_VALID;
                req.rx_buf_size = Le16::new(RX_BUF_SIZE);
            }
            _ => {}
        }
        req.enables = Le32::new(enables);

        // on failure `ring` is dropped here, which frees its memory
        let resp = self.send(&req)?;
        let fw_id = resp.ring_id.get();
        ring.set_fw_ring_id(fw_id);
        ring.set_doorbell(DoorbellTarget { offset: self.generation.doorbell_offset(index), xid: fw_id as u32 });
        debug!("bnxt: allocated {:?} ring {} with {} entries, firmware id {}", kind, index, size, fw_id);
        self.rings.rings.insert_at(index, ring);
        Ok(RingHandle(index))
    }

    /// Unregisters a ring from firmware and frees its memory.
    ///
    /// If firmware refuses to let go of the ring, the ring stays allocated and the error is returned.
    pub fn free_ring(&mut self, handle: RingHandle) -> Result<(), BnxtError> {
        self.ensure_not_in_reset()?;
        let ring = self.rings.rings.get(handle.0).ok_or(BnxtError::InvalidHandle)?;
        if ring.is_registered() && self.fw_accessible() {
            self.send_ring_free(ring)?;
        }
        self.rings.rings.remove(handle.0);
        Ok(())
    }

    fn send_ring_free(&self, ring: &Ring) -> Result<(), BnxtError> {
        let mut req: RingFreeInput = new_request();
        req.ring_type = ring.kind() as u8;
        req.ring_id = Le16::new(ring.fw_ring_id());
        self.send(&req)?;
        Ok(())
    }

    /// Writes one 16-byte descriptor to a transmit or receive ring and rings its doorbell.
    ///
    /// Returns the new producer index.
    pub fn post(&mut self, handle: RingHandle, desc: &[u8]) -> Result<u32, BnxtError> {
        self.ensure_not_in_reset()?;
        let ring = self.rings.rings.get_mut(handle.0).ok_or(BnxtError::InvalidHandle)?;
        let prod = ring.post(desc)?;
        let bar = &*self.io.bar1;
        match ring.kind() {
            RingKind::Tx => self.doorbells.ring_tx(bar, ring, prod),
            _ => self.doorbells.ring_rx(bar, ring, prod),
        }
        Ok(prod)
    }

    /// Consumes every new entry of a completion or notification ring, then acknowledges them
    /// and re-arms the ring.
    pub fn drain_completions(&mut self, handle: RingHandle) -> Result<Vec<CompletionEntry>, BnxtError> {
        self.ensure_not_in_reset()?;
        let ring = self.rings.rings.get_mut(handle.0).ok_or(BnxtError::InvalidHandle)?;
        if ring.kind().is_producer() {
            return Err(RingError::WrongKind.into());
        }
        let entries: Vec<CompletionEntry> = ring.drain().collect();
        let bar = &*self.io.bar1;
        match ring.kind() {
            RingKind::Notification => self.doorbells.arm_notification(bar, ring, true),
            _ => self.doorbells.arm_rx_completion(bar, ring, true),
        }
        Ok(entries)
    }

    /// Enables interrupts on every completion and notification ring.
    pub(crate) fn arm_completion_rings(&mut self) {
        let bar = &*self.io.bar1;
        for ring in self.rings.rings.slots.iter().flatten() {
            match ring.kind() {
                RingKind::Completion => self.doorbells.arm_rx_completion(bar, ring, true),
                RingKind::Notification => self.doorbells.arm_notification(bar, ring, true),
                _ => {}
            }
        }
    }

    /// Allocates a statistics context that firmware refreshes every `stats_update_ms`.
    pub fn allocate_stat_ctx(&mut self) -> Result<StatCtxHandle, BnxtError> {
        self.ensure_not_in_reset()?;
        self.alloc_stat_ctx()
    }

    fn alloc_stat_ctx(&mut self) -> Result<StatCtxHandle, BnxtError> {
        let index = self.rings.stat_ctxs.vacant_index()?;
        let mut mem = self.dma.allocate(STAT_CTX_DMA_LEN).map_err(BnxtError::Dma)?;
        mem.fill(0);

        let mut req: StatCtxAllocInput = new_request();
        req.stats_dma_addr = Le64::new(mem.phys_addr().value());
        req.update_period_ms = Le32::new(self.config.stats_update_ms);
        req.stats_dma_length = Le16::new(STAT_CTX_DMA_LEN as u16);
        let fw_id = self.send(&req)?.stat_ctx_id.get();
        self.rings.stat_ctxs.insert_at(index, StatCtx { fw_id, _mem: mem });
        Ok(StatCtxHandle(index))
    }

    /// Binds a completion ring, a receive ring and a stat context into a firmware ring group.
    pub fn allocate_ring_group(
        &mut self,
        cmpl: RingHandle,
        rx: RingHandle,
        stat: StatCtxHandle,
    ) -> Result<RingGroupHandle, BnxtError> {
        self.ensure_not_in_reset()?;
        self.alloc_ring_group(cmpl, rx, stat)
    }

    fn alloc_ring_group(&mut self, cmpl: RingHandle, rx: RingHandle, stat: StatCtxHandle) -> Result<RingGroupHandle, BnxtError> {
        let cr = self.rings.ring(cmpl).ok_or(BnxtError::InvalidHandle)?.fw_ring_id();
        let rr = self.rings.ring(rx).ok_or(BnxtError::InvalidHandle)?.fw_ring_id();
        let sc = self.rings.stat_ctxs.get(stat.0).ok_or(BnxtError::InvalidHandle)?.fw_id;
        let index = self.rings.groups.vacant_index()?;

        let mut req: RingGrpAllocInput = new_request();
        req.cr = Le16::new(cr);
        req.rr = Le16::new(rr);
        req.ar = Le16::new(INVALID_HW_RING_ID);
        req.sc = Le16::new(sc as u16);
        let fw_id = self.send(&req)?.ring_group_id.get();
        self.rings.groups.insert_at(index, RingGroup { fw_id });
        Ok(RingGroupHandle(index))
    }

    /// Creates one transmit/receive queue pair: a stat context, a completion ring, and the
    /// transmit and receive rings reporting to it. Legacy chips also get a ring group.
    ///
    /// Objects created before a failure are left in place; the caller tears them down
    /// together with the rest of the data path (`close_inner`).
    pub(crate) fn create_queue_pair(&mut self) -> Result<QueuePair, BnxtError> {
        let stat_ctx = self.alloc_stat_ctx()?;
        let cmpl = self.alloc_ring(
            RingKind::Completion,
            self.config.cmpl_ring_size,
            RingLinks { nq: self.default_nq, ..RingLinks::default() },
        )?;
        let links = RingLinks { cmpl: Some(cmpl), nq: None, stat: Some(stat_ctx) };
        let tx = self.alloc_ring(RingKind::Tx, self.config.tx_ring_size, links)?;
        let rx = self.alloc_ring(RingKind::Rx, self.config.rx_ring_size, links)?;
        let ring_group = if self.generation.needs_ring_groups() {
            Some(self.alloc_ring_group(cmpl, rx, stat_ctx)?)
        } else {
            None
        };
        Ok(QueuePair { tx, rx, cmpl, stat_ctx, ring_group })
    }

    /// Frees every ring group, ring and stat context, users before the objects they point at.
    /// Firmware is only told when `notify_fw` is set; failures are logged and skipped.
    pub(crate) fn free_all_rings(&mut self, notify_fw: bool) {
        for index in self.rings.groups.indices_where(|_| true) {
            if let Some(group) = self.rings.groups.remove(index) {
                if notify_fw {
                    let mut req: RingGrpFreeInput = new_request();
                    req.ring_group_id = Le32::new(group.fw_id);
                    if let Err(e) = self.send(&req) {
                        warn!("bnxt: failed to free ring group {}: {}", group.fw_id, e);
                    }
                }
            }
        }

        let stages: [fn(&Ring) -> bool; 3] = [
            |r| r.kind().is_producer(),
            |r| r.kind() == RingKind::Completion,
            |r| r.kind() == RingKind::Notification,
        ];
        for stage in stages {
            for index in self.rings.rings.indices_where(stage) {
                if let Some(ring) = self.rings.rings.remove(index) {
                    if notify_fw && ring.is_registered() {
                        if let Err(e) = self.send_ring_free(&ring) {
                            warn!("bnxt: failed to free {:?} ring {}: {}", ring.kind(), ring.fw_ring_id(), e);
                        }
                    }
                }
            }
        }

        for index in self.rings.stat_ctxs.indices_where(|_| true) {
            if let Some(ctx) = self.rings.stat_ctxs.remove(index) {
                if notify_fw {
                    let mut req: StatCtxFreeInput = new_request();
                    req.stat_ctx_id = Le32::new(ctx.fw_id);
                    if let Err(e) = self.send(&req) {
                        warn!("bnxt: failed to free stat context {}: {}", ctx.fw_id, e);
                    }
                }
            }
        }
    }
}
