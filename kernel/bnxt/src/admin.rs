//! Management operations: firmware reset on request, firmware image installation,
//! NVRAM access and raw HWRM passthrough.
//!
//! All of them are refused while a firmware reset is in progress.

use alloc::vec::Vec;
use bnxt_ethernet::hwrm::new_request;
use bnxt_ethernet::messages::*;
use nic_hal::DmaMemory;

use crate::reset::ResetKind;
use crate::{BnxtError, BnxtNic};

/// `install_type` value that installs every pending item.
pub const NVM_INSTALL_UPDATE_TYPE_ALL: u32 = 0xFFFF_FFFF;
/// `dir_ordinal`, `dir_ext` and `dir_attr` value meaning "any".
const NVM_DIR_ANY: u16 = 0;

/// What firmware reported after installing an image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstallResult {
    /// Bitmap of the items that were installed.
    pub installed_items: u64,
    /// Zero on success.
    pub result: u8,
    /// The item that failed, if `result` is nonzero.
    pub problem_item: u8,
    /// Nonzero if the new image only runs after a firmware reset.
    pub reset_required: u8,
}

impl BnxtNic {
    /// Resets firmware on request. Returns the delay before the first reset step;
    /// drive the rest with [`crate::reset::run_fw_reset_task()`].
    pub fn admin_fw_reset(&mut self) -> Result<u64, BnxtError> {
        self.ensure_not_in_reset()?;
        let kind = if self.health.is_some() {
            ResetKind::Forced
        } else {
            ResetKind::Planned {
                min_dsecs: self.config.fw_reset_min_dsecs,
                max_dsecs: self.config.fw_reset_max_dsecs,
            }
        };
        self.begin_fw_reset(kind).ok_or(BnxtError::InReset)
    }

    /// Writes `image` to the NVRAM directory entry of `dir_type` and has firmware install it.
    pub fn admin_flash_firmware(&mut self, dir_type: u16, image: &[u8]) -> Result<InstallResult, BnxtError> {
        self.ensure_not_in_reset()?;
        self.admin_nvm_write(dir_type, image)?;

        let mut req: NvmInstallUpdateInput = new_request();
        req.install_type = Le32::new(NVM_INSTALL_UPDATE_TYPE_ALL);
        // the channel waits for this request much longer than for any other
        let resp = self.send(&req)?;
        let result = InstallResult {
            installed_items: resp.installed_items.get(),
            result: resp.result,
            problem_item: resp.problem_item,
            reset_required: resp.reset_required,
        };
        if result.result != 0 {
            error!("bnxt: firmware install failed on item {}: result {:#X}", result.problem_item, result.result);
        } else {
            info!("bnxt: installed firmware items {:#X}{}", result.installed_items,
                if result.reset_required != 0 { ", reset required" } else { "" });
        }
        Ok(result)
    }

    /// Reads `len` bytes at `offset` of NVRAM directory entry `dir_idx`.
    pub fn admin_nvm_read(&mut self, dir_idx: u16, offset: u32, len: u32) -> Result<Vec<u8>, BnxtError> {
        self.ensure_not_in_reset()?;
        let buf = self.dma_buffer(len as usize)?;
        let mut req: NvmReadInput = new_request();
        req.host_dest_addr = Le64::new(buf.phys_addr().value());
        req.dir_idx = Le16::new(dir_idx);
        req.offset = Le32::new(offset);
        req.len = Le32::new(len);
        self.send(&req)?;
        let mut data = alloc::vec![0u8; len as usize];
        buf.read_bytes(0, &mut data);
        Ok(data)
    }

    /// Writes `data` as the NVRAM directory entry of `dir_type`. Returns the entry's index.
    pub fn admin_nvm_write(&mut self, dir_type: u16, data: &[u8]) -> Result<u16, BnxtError> {
        self.ensure_not_in_reset()?;
        let mut buf = self.dma_buffer(data.len())?;
        buf.write_bytes(0, data);
        let mut req: NvmWriteInput = new_request();
        req.host_src_addr = Le64::new(buf.phys_addr().value());
        req.dir_type = Le16::new(dir_type);
        req.dir_ordinal = Le16::new(NVM_DIR_ANY);
        req.dir_ext = Le16::new(NVM_DIR_ANY);
        req.dir_attr = Le16::new(NVM_DIR_ANY);
        req.dir_data_length = Le32::new(data.len() as u32);
        req.dir_item_length = Le32::new(data.len() as u32);
        let resp = self.send(&req)?;
        debug!("bnxt: wrote {} bytes to NVRAM entry {}", resp.dir_item_length.get(), resp.dir_idx.get());
        Ok(resp.dir_idx.get())
    }

    /// Sends an arbitrary HWRM request and returns firmware's raw response, header included.
    pub fn admin_passthrough(&mut self, req_type: u16, payload: &[u8]) -> Result<Vec<u8>, BnxtError> {
        self.ensure_not_in_reset()?;
        Ok(self.hwrm.lock().send_raw(req_type, payload)?)
    }

    fn dma_buffer(&self, len: usize) -> Result<DmaMemory, BnxtError> {
        if len == 0 {
            return Err(BnxtError::Dma("zero-length NVRAM transfer"));
        }
        self.dma.allocate(len).map_err(BnxtError::Dma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reset::run_fw_reset_task;
    use crate::tests::sim_nic;
    use bnxt_ethernet::error::fw_code;
    use bnxt_ethernet::sim::SimDeviceConfig;
    use spin::Mutex;
    use zerocopy::FromBytes;

    const DIR_TYPE_FW: u16 = 0x2;

    #[test]
    fn test_nvm_write_then_read_back() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        let image: Vec<u8> = (0..64u8).collect();
        let idx = nic.admin_nvm_write(DIR_TYPE_FW, &image).unwrap();
        assert_eq!(sim.nvm_item(DIR_TYPE_FW).as_deref(), Some(&image[..]));
        assert_eq!(nic.admin_nvm_read(idx, 16, 8).unwrap(), &image[16..24]);
        // reading past the end of the entry is firmware's call to reject
        assert!(matches!(nic.admin_nvm_read(idx, 60, 8), Err(BnxtError::Hwrm(_))));
    }

    #[test]
    fn test_flash_installs_image() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::p5());
        let live = sim.dma().live_regions();
        let result = nic.admin_flash_firmware(DIR_TYPE_FW, &[0xAB; 128]).unwrap();
        assert_eq!(result.result, 0);
        assert_eq!(result.installed_items, 1);
        assert_eq!(sim.count_requests(RequestType::NvmInstallUpdate), 1);
        // transfer buffers are freed again
        assert_eq!(sim.dma().live_regions(), live);

        sim.fail_next(RequestType::NvmWrite, fw_code::INVALID_PARAMS);
        assert!(nic.admin_flash_firmware(DIR_TYPE_FW, &[0; 4]).is_err());
        assert_eq!(sim.count_requests(RequestType::NvmInstallUpdate), 1);
    }

    #[test]
    fn test_passthrough_returns_raw_response() {
        let (_sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        let req: VerGetInput = new_request();
        let raw = nic.admin_passthrough(RequestType::VerGet.into(), payload_of(&req)).unwrap();
        let ver = VerGetOutput::read_from_prefix(&raw[..]).unwrap();
        assert_eq!(ver.fw_maj, nic.fw_version().major);
        assert_eq!(ver.chip_num.get(), nic.fw_version().chip_num);

        assert!(matches!(nic.admin_passthrough(0x7777, &[]), Err(BnxtError::Hwrm(_))));
    }

    #[test]
    fn test_admin_calls_are_refused_during_reset() {
        let (_sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        assert!(nic.admin_fw_reset().is_ok());
        assert_eq!(nic.admin_fw_reset(), Err(BnxtError::InReset));
        assert_eq!(nic.admin_nvm_read(0, 0, 4), Err(BnxtError::InReset));
        assert_eq!(nic.admin_nvm_write(DIR_TYPE_FW, &[1]), Err(BnxtError::InReset));
        assert_eq!(nic.admin_passthrough(0, &[]), Err(BnxtError::InReset));
        assert_eq!(nic.close(), Err(BnxtError::InReset));

        let nic = Mutex::new(nic);
        run_fw_reset_task(&nic).unwrap();
        let mut nic = nic.into_inner();
        assert!(nic.is_open());
        assert!(nic.admin_nvm_write(DIR_TYPE_FW, &[1]).is_ok());
    }
}
