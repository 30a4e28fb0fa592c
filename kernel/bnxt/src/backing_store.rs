//! Context memory ("backing store") for P5 and newer chips.
//!
//! Firmware on these chips keeps queue and ring state in host memory. Before the first ring
//! can be created the driver asks what each context type needs, provisions page tables for
//! it, and hands them to firmware in one legacy `FUNC_BACKING_STORE_CFG` request or in a
//! series of `FUNC_BACKING_STORE_CFG_V2` requests ending with `ALL_DONE`.

use bnxt_ethernet::capabilities::FwCapabilities;
use bnxt_ethernet::context_memory::{ContextMemType, ContextTable, ContextType};
use bnxt_ethernet::hwrm::new_request;
use bnxt_ethernet::messages::*;
use bnxt_ethernet::ring::RingKind;
use bnxt_ethernet::{ContextMemError, HwrmChannel};
use nic_hal::DmaAllocator;

use crate::{BnxtError, BnxtNic};

/// Upper bound on `FUNC_BACKING_STORE_QCAPS_V2` queries, in case firmware's type chain loops.
const MAX_V2_QUERIES: usize = 64;

/// The context type firmware keeps the state of a `kind` ring in.
pub(crate) fn context_type_for(kind: RingKind) -> ContextType {
    match kind {
        RingKind::Tx | RingKind::Rx | RingKind::RxAgg => ContextType::Qp,
        RingKind::Completion | RingKind::Notification => ContextType::Cq,
    }
}

/// Asks firmware what each context type needs.
pub(crate) fn query_requirements(hwrm: &mut HwrmChannel, caps: FwCapabilities) -> Result<ContextTable, BnxtError> {
    if !caps.contains(FwCapabilities::BACKING_STORE_V2) {
        let req: FuncBackingStoreQcapsInput = new_request();
        let resp = hwrm.send(&req)?;
        return Ok(ContextTable::from_legacy_qcaps(&resp));
    }

    let mut table = ContextTable::new();
    let mut next = ContextType::Qp as u16;
    for _ in 0..MAX_V2_QUERIES {
        if next == BS_QCAPS_V2_TYPE_INVALID {
            return Ok(table);
        }
        let mut req: FuncBackingStoreQcapsV2Input = new_request();
        req.type_ = Le16::new(next);
        let resp = hwrm.send(&req)?;
        match ContextMemType::from_v2_qcaps(&resp) {
            Ok(Some(ctxm)) => table.insert(ctxm),
            Ok(None) => trace!("bnxt: backing store type {:#X} is not valid", next),
            Err(ContextMemError::UnknownType(t)) => debug!("bnxt: skipping unknown backing store type {:#X}", t),
            Err(e) => return Err(e.into()),
        }
        next = resp.next_valid_type.get();
    }
    warn!("bnxt: firmware reported more than {} backing store types", MAX_V2_QUERIES);
    Ok(table)
}

/// How many entries to provision for a type, or `None` if the driver does not use it.
fn entries_wanted(table: &ContextTable, ctxm: &ContextMemType) -> Option<u32> {
    let split_or_max = |c: &ContextMemType| match c.split_count {
        0 => c.max_entries,
        n => c.split[..n as usize].iter().sum(),
    };
    match ctxm.ctx_type {
        ContextType::Qp | ContextType::Srq | ContextType::Cq | ContextType::Vnic => Some(split_or_max(ctxm)),
        ContextType::Stat => Some(ctxm.max_entries),
        // every queue pair and shared receive queue may need a TQM entry
        ContextType::Stqm | ContextType::Ftqm => {
            let qp = table.get(ContextType::Qp).map_or(0, split_or_max);
            let srq = table.get(ContextType::Srq).map_or(0, split_or_max);
            Some(qp + srq)
        }
        // RDMA and tracing only
        _ => None,
    }
}

/// Allocates page tables for every context type the L2 driver needs.
/// On failure everything provisioned so far is released again.
pub(crate) fn provision(table: &mut ContextTable, dma: &dyn DmaAllocator, fanout: usize) -> Result<(), BnxtError> {
    let wanted: alloc::vec::Vec<(ContextType, u32)> = table
        .types()
        .filter_map(|c| entries_wanted(table, c).map(|n| (c.ctx_type, n)))
        .collect();
    for (ctx_type, entries) in wanted {
        if let Err(e) = table.provision(dma, ctx_type, entries, fanout) {
            error!("bnxt: failed to provision {} {:?} context entries: {:?}", entries, ctx_type, e);
            table.release_all();
            return Err(e.into());
        }
    }
    Ok(())
}

/// Hands the provisioned memory to firmware.
pub(crate) fn commit(hwrm: &mut HwrmChannel, table: &mut ContextTable, v2: bool) -> Result<(), BnxtError> {
    let result = if v2 {
        table.v2_cfg_requests().iter().try_for_each(|req| hwrm.send(req).map(|_| ()))
    } else {
        hwrm.send(&table.legacy_cfg_request()).map(|_| ())
    };
    if let Err(e) = result {
        error!("bnxt: firmware rejected the backing store: {}", e);
        table.release_all();
        return Err(e.into());
    }
    table.mark_committed();
    Ok(())
}

impl BnxtNic {
    /// Queries, provisions and commits the backing store. Must finish before any ring is created.
    pub(crate) fn setup_backing_store(&mut self) -> Result<(), BnxtError> {
        let v2 = self.caps.contains(FwCapabilities::BACKING_STORE_V2);
        let mut table = query_requirements(&mut self.hwrm.lock(), self.caps)?;
        provision(&mut table, &*self.dma, self.config.ctx_fanout)?;
        commit(&mut self.hwrm.lock(), &mut table, v2)?;
        info!("bnxt: committed {} backing store ({} types)",
            if v2 { "V2" } else { "legacy" },
            table.types().filter(|c| c.is_provisioned()).count());
        self.backing_store = Some(table);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sim_nic;
    use bnxt_ethernet::error::fw_code;
    use bnxt_ethernet::sim::SimDeviceConfig;

    #[test]
    fn test_context_type_for_ring_kinds() {
        assert_eq!(context_type_for(RingKind::Tx), ContextType::Qp);
        assert_eq!(context_type_for(RingKind::RxAgg), ContextType::Qp);
        assert_eq!(context_type_for(RingKind::Notification), ContextType::Cq);
    }

    #[test]
    fn test_legacy_provisioning_skips_rdma_types() {
        let (sim, nic) = sim_nic(SimDeviceConfig::p5());
        let mut table = query_requirements(&mut nic.hwrm.lock(), nic.caps).unwrap();
        provision(&mut table, &sim.dma(), nic.config.ctx_fanout).unwrap();
        let entries = |t| table.get(t).unwrap().entries();
        assert_eq!(entries(ContextType::Qp), 1024);
        assert_eq!(entries(ContextType::Srq), 512);
        assert_eq!(entries(ContextType::Vnic), 64);
        assert_eq!(entries(ContextType::Stqm), 1536);
        assert_eq!(table.get(ContextType::Ftqm).unwrap().page_tables().len(), 2);
        assert!(!table.get(ContextType::Mrav).unwrap().is_provisioned());
        assert!(!table.get(ContextType::Tim).unwrap().is_provisioned());
    }

    #[test]
    fn test_v2_walks_the_type_chain() {
        let (sim, nic) = sim_nic(SimDeviceConfig::p7());
        let table = query_requirements(&mut nic.hwrm.lock(), nic.caps).unwrap();
        assert_eq!(sim.count_requests(RequestType::FuncBackingStoreQcapsV2), 7);
        assert_eq!(table.types().count(), 7);
        assert_eq!(table.get(ContextType::Ftqm).unwrap().instances(), 2);
    }

    #[test]
    fn test_provision_failure_releases_everything() {
        let (sim, nic) = sim_nic(SimDeviceConfig::p5());
        let mut table = query_requirements(&mut nic.hwrm.lock(), nic.caps).unwrap();
        let dma = sim.dma();
        let live = dma.live_regions();
        dma.fail_after(5);
        assert!(provision(&mut table, &dma, nic.config.ctx_fanout).is_err());
        dma.never_fail();
        assert!(table.types().all(|c| !c.is_provisioned()));
        assert_eq!(dma.live_regions(), live);
    }

    #[test]
    fn test_rejected_commit_leaves_nothing_committed() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::p5());
        let live = sim.dma().live_regions();
        sim.fail_next(RequestType::FuncBackingStoreCfg, fw_code::INVALID_PARAMS);
        assert!(nic.open().is_err());
        assert!(nic.backing_store().is_none());
        assert_eq!(sim.dma().live_regions(), live);
        assert_eq!(sim.count_requests(RequestType::RingAlloc), 0);
    }
}
