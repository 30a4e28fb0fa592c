//! The HWRM channel: synchronous commands to the firmware through the BAR0 mailbox.
//!
//! A command is written into the mailbox window, the trigger register is rung, and firmware
//! DMAs the response into a host buffer whose address was part of the request header.
//! Completion is detected in two phases: first the response length becomes nonzero,
//! then the last byte of the response turns into [`HWRM_RESP_VALID_KEY`].

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::convert::Infallible;
use core::mem::size_of;
use nic_hal::{poll_until, write_barrier, read_barrier, Backoff, Clock, DmaAllocator, DmaMemory, PollOutcome, PollStatus, RegisterSpace, PAGE_SIZE};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::error::{ErrorKind, HwrmError, TimeoutPhase};
use crate::messages::*;

/// Offset in BAR0 of the request mailbox.
pub const HWRM_REQ_WINDOW_OFFSET: usize = 0x0;
/// Offset in BAR0 of the register that tells firmware a request is waiting.
pub const HWRM_TRIGGER_OFFSET: usize = 0x100;
/// Mailbox length used until firmware reports its own.
pub const HWRM_DEFAULT_MAX_REQ_LEN: usize = 128;
/// Size of the response buffer and of the short-command side buffer.
pub const HWRM_BUF_LEN: usize = PAGE_SIZE;
/// The value firmware writes into the last response byte once the response is complete.
pub const HWRM_RESP_VALID_KEY: u8 = 1;
/// "Any completion ring" and "the firmware itself" sentinels for the request header.
pub const HWRM_NA_SIGNATURE: u16 = 0xFFFF;
/// Marks a mailbox as holding a [`ShortRequest`] envelope.
pub const HWRM_SHORT_REQ_SIGNATURE: u16 = 0x4321;

/// Command timeout used until firmware advertises one.
pub const DFLT_HWRM_CMD_TIMEOUT_MS: u64 = 500;
/// Command timeout used while polling firmware that may still be restarting.
pub const SHORT_HWRM_CMD_TIMEOUT_MS: u64 = 20;
/// Firmware image installation can take minutes.
pub const HWRM_FW_INSTALL_TIMEOUT_MS: u64 = 5 * 60 * 1000;

const HWRM_POLL_BACKOFF: Backoff = Backoff::fixed(1);

/// The firmware command channel of one PCI function.
///
/// Only one command may be outstanding; `&mut self` on every send enforces that,
/// and the driver keeps the channel behind its own per-device lock.
pub struct HwrmChannel {
    bar0: Arc<dyn RegisterSpace>,
    clock: Arc<dyn Clock>,
    resp: DmaMemory,
    short_req: Option<DmaMemory>,
    short_cmd_required: bool,
    seq_id: u16,
    default_timeout_ms: u64,
    timeout_ms: u64,
    max_req_len: usize,
    max_ext_req_len: usize,
    max_resp_len: usize,
}

impl HwrmChannel {
    /// Creates a channel with default limits; call [`HwrmChannel::apply_version()`] once
    /// `VER_GET` has told us what firmware supports.
    pub fn new(bar0: Arc<dyn RegisterSpace>, clock: Arc<dyn Clock>, dma: &dyn DmaAllocator) -> Result<HwrmChannel, HwrmError> {
        let resp = dma.allocate(HWRM_BUF_LEN).map_err(|_e| HwrmError::DmaAllocationFailed)?;
        Ok(HwrmChannel {
            bar0,
            clock,
            resp,
            short_req: None,
            short_cmd_required: false,
            seq_id: 0,
            default_timeout_ms: DFLT_HWRM_CMD_TIMEOUT_MS,
            timeout_ms: DFLT_HWRM_CMD_TIMEOUT_MS,
            max_req_len: HWRM_DEFAULT_MAX_REQ_LEN,
            max_ext_req_len: HWRM_BUF_LEN,
            max_resp_len: HWRM_BUF_LEN,
        })
    }

    /// Adopts the limits and timeout that firmware advertised in its `VER_GET` response.
    /// Zero fields keep the driver defaults.
    pub fn apply_version(&mut self, ver: &VerGetOutput) {
        self.default_timeout_ms = match ver.def_req_timeout.get() {
            0 => DFLT_HWRM_CMD_TIMEOUT_MS,
            t => t as u64,
        };
        self.timeout_ms = self.default_timeout_ms;
        self.max_req_len = match ver.max_req_win_len.get() {
            0 => HWRM_DEFAULT_MAX_REQ_LEN,
            len => len as usize,
        };
        self.max_resp_len = match ver.max_resp_len.get() {
            0 => HWRM_BUF_LEN,
            len => (len as usize).min(HWRM_BUF_LEN),
        };
        self.max_ext_req_len = match ver.max_ext_req_len.get() {
            0 => HWRM_BUF_LEN,
            len => (len as usize).min(HWRM_BUF_LEN),
        };
        debug!("HWRM channel: timeout {} ms, max request {} bytes, max response {} bytes",
            self.timeout_ms, self.max_req_len, self.max_resp_len);
    }

    /// Allocates the side buffer for short commands.
    /// If `required`, every request is sent as a short command from now on;
    /// otherwise only requests too large for the mailbox are.
    pub fn enable_short_commands(&mut self, dma: &dyn DmaAllocator, required: bool) -> Result<(), HwrmError> {
        if self.short_req.is_none() {
            self.short_req = Some(dma.allocate(HWRM_BUF_LEN).map_err(|_e| HwrmError::DmaAllocationFailed)?);
        }
        self.short_cmd_required = required;
        Ok(())
    }

    pub fn short_commands_enabled(&self) -> bool {
        self.short_req.is_some()
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.default_timeout_ms
    }

    /// Overrides the command timeout until [`HwrmChannel::restore_default_timeout()`].
    pub fn set_timeout_ms(&mut self, ms: u64) {
        self.timeout_ms = ms;
    }

    pub fn restore_default_timeout(&mut self) {
        self.timeout_ms = self.default_timeout_ms;
    }

    pub fn max_req_len(&self) -> usize {
        self.max_req_len
    }

    /// The sequence number the next request will carry.
    pub fn next_seq_id(&self) -> u16 {
        self.seq_id
    }

    fn timeout_for(&self, req_type: u16) -> u64 {
        if req_type == u16::from(RequestType::NvmInstallUpdate) {
            HWRM_FW_INSTALL_TIMEOUT_MS
        } else {
            self.timeout_ms
        }
    }

    /// Sends a typed request and returns the typed response.
    ///
    /// A response shorter than `R::Response` leaves the missing tail zeroed.
    pub fn send<R: HwrmRequest>(&mut self, req: &R) -> Result<R::Response, HwrmError> {
        let req_type = u16::from(R::REQ_TYPE);
        let timeout = self.timeout_for(req_type);
        let bytes = self.exchange(req_type, payload_of(req), timeout)?;
        let mut out = R::Response::new_zeroed();
        let n = bytes.len().min(size_of::<R::Response>());
        out.as_bytes_mut()[..n].copy_from_slice(&bytes[..n]);
        Ok(out)
    }

    /// Sends a request with an explicit timeout instead of the channel's current one.
    pub fn send_with_timeout<R: HwrmRequest>(&mut self, req: &R, timeout_ms: u64) -> Result<R::Response, HwrmError> {
        let saved = self.timeout_ms;
        self.timeout_ms = timeout_ms;
        let result = self.send(req);
        self.timeout_ms = saved;
        result
    }

    /// Sends `payload` (everything after the request header) as a request of type `req_type`
    /// and returns the raw response, header included.
    pub fn send_raw(&mut self, req_type: u16, payload: &[u8]) -> Result<Vec<u8>, HwrmError> {
        let timeout = self.timeout_for(req_type);
        self.exchange(req_type, payload, timeout)
    }

    fn exchange(&mut self, req_type: u16, payload: &[u8], timeout_ms: u64) -> Result<Vec<u8>, HwrmError> {
        let seq_id = self.seq_id;
        self.seq_id = self.seq_id.wrapping_add(1);

        let header = RequestHeader {
            req_type: Le16::new(req_type),
            cmpl_ring: Le16::new(HWRM_NA_SIGNATURE),
            seq_id: Le16::new(seq_id),
            target_id: Le16::new(HWRM_NA_SIGNATURE),
            resp_addr: Le64::new(self.resp.phys_addr().value()),
        };
        let mut msg = Vec::with_capacity(size_of::<RequestHeader>() + payload.len() + 3);
        msg.extend_from_slice(header.as_bytes());
        msg.extend_from_slice(payload);
        // the mailbox is written one dword at a time
        while msg.len() % 4 != 0 {
            msg.push(0);
        }

        let mut short = ShortRequest::new_zeroed();
        let mailbox: &[u8] = if self.short_cmd_required || msg.len() > self.max_req_len {
            let max = self.max_ext_req_len;
            let side = match self.short_req.as_mut() {
                Some(side) if msg.len() <= max => side,
                Some(_) => return Err(HwrmError::RequestTooLarge { len: msg.len(), max }),
                None => return Err(HwrmError::RequestTooLarge { len: msg.len(), max: self.max_req_len }),
            };
            side.zero_range(0, max);
            side.write_bytes(0, &msg);
            short.req_type = Le16::new(req_type);
            short.signature = Le16::new(HWRM_SHORT_REQ_SIGNATURE);
            short.size = Le16::new(msg.len() as u16);
            short.req_addr = Le64::new(side.phys_addr().value());
            short.as_bytes()
        } else {
            &msg
        };

        // clear the previous response so stale length/valid bytes can't satisfy the polls
        self.resp.zero_range(0, self.max_resp_len);

        for (i, chunk) in mailbox.chunks(4).enumerate() {
            let mut dword = [0u8; 4];
            dword[..chunk.len()].copy_from_slice(chunk);
            self.bar0.write32(HWRM_REQ_WINDOW_OFFSET + i * 4, u32::from_le_bytes(dword));
        }
        let written = (mailbox.len() + 3) & !3;
        for off in (written..self.max_req_len).step_by(4) {
            self.bar0.write32(HWRM_REQ_WINDOW_OFFSET + off, 0);
        }
        write_barrier();
        self.bar0.write32(HWRM_TRIGGER_OFFSET, 1);

        let clock = self.clock.clone();
        let resp = &self.resp;
        let bound = self.max_resp_len;

        let len = match poll_until(&*clock, timeout_ms, HWRM_POLL_BACKOFF, || {
            let len = resp.read_u16_le(RESP_LEN_OFFSET) as usize;
            if len != 0 && len <= bound { PollStatus::<usize, Infallible>::Ready(len) } else { PollStatus::Pending }
        }) {
            PollOutcome::Ok(len) => len,
            PollOutcome::Timeout => {
                error!("HWRM request {:#X} (seq {}) timed out after {} ms with no response length", req_type, seq_id, timeout_ms);
                return Err(HwrmError::Timeout { req_type, seq_id, phase: TimeoutPhase::ResponseLength });
            }
            PollOutcome::Error(never) => match never {},
        };

        match poll_until(&*clock, timeout_ms, HWRM_POLL_BACKOFF, || {
            if resp.read_u8(len - 1) == HWRM_RESP_VALID_KEY { PollStatus::<(), Infallible>::Ready(()) } else { PollStatus::Pending }
        }) {
            PollOutcome::Ok(()) => {}
            PollOutcome::Timeout => {
                error!("HWRM request {:#X} (seq {}) timed out after {} ms waiting for the valid marker (len {})", req_type, seq_id, timeout_ms, len);
                return Err(HwrmError::Timeout { req_type, seq_id, phase: TimeoutPhase::ValidMarker });
            }
            PollOutcome::Error(never) => match never {},
        }
        read_barrier();

        let mut out = alloc::vec![0u8; len];
        resp.read_bytes(0, &mut out);
        let hdr = ResponseHeader::read_from_prefix(&out[..]).ok_or(HwrmError::InvalidResponse { req_type, len })?;
        if hdr.seq_id.get() != seq_id {
            warn!("HWRM response to {:#X} carries seq {}, expected {}", req_type, hdr.seq_id.get(), seq_id);
        }

        let code = hdr.error_code.get();
        if code != 0 {
            let kind = ErrorKind::from_fw_code(code);
            if kind != ErrorKind::GenericFailure {
                error!("HWRM request {:#X} (seq {}) failed with error {:#X} ({:?})", req_type, seq_id, code, kind);
            }
            return Err(HwrmError::Firmware { req_type, code, kind });
        }
        Ok(out)
    }
}

/// Builds a request of type `R` with a zeroed header, ready for its payload fields to be filled in.
pub fn new_request<R: HwrmRequest>() -> R {
    R::new_zeroed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimDevice, SimDeviceConfig, ShortCmdSupport};
    use crate::error::fw_code;

    fn channel(sim: &Arc<SimDevice>) -> HwrmChannel {
        HwrmChannel::new(sim.clone(), sim.clock(), &sim.dma()).unwrap()
    }

    fn ver_get() -> VerGetInput {
        let mut req: VerGetInput = new_request();
        req.hwrm_intf_maj = HWRM_VERSION_MAJOR;
        req.hwrm_intf_min = HWRM_VERSION_MINOR;
        req.hwrm_intf_upd = HWRM_VERSION_UPDATE;
        req
    }

    #[test]
    fn test_ver_get_roundtrip_and_sequence_numbers() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        let resp = ch.send(&ver_get()).unwrap();
        assert_eq!(resp.chip_num.get(), 0x1750);
        assert_eq!(resp.valid, HWRM_RESP_VALID_KEY);
        ch.send(&ver_get()).unwrap();

        let reqs = sim.requests();
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].seq_id, 0);
        assert_eq!(reqs[1].seq_id, 1);
        assert_eq!(reqs[0].target_id, HWRM_NA_SIGNATURE);
        assert_eq!(reqs[0].cmpl_ring, HWRM_NA_SIGNATURE);
        assert!(!reqs[0].short);
    }

    #[test]
    fn test_zero_default_timeout_keeps_builtin_default() {
        let mut cfg = SimDeviceConfig::p5();
        cfg.def_req_timeout_ms = 0;
        let sim = SimDevice::new(cfg);
        let mut ch = channel(&sim);
        let ver = ch.send(&ver_get()).unwrap();
        ch.apply_version(&ver);
        assert_eq!(ch.timeout_ms(), DFLT_HWRM_CMD_TIMEOUT_MS);

        let mut cfg = SimDeviceConfig::p5();
        cfg.def_req_timeout_ms = 1200;
        let sim = SimDevice::new(cfg);
        let mut ch = channel(&sim);
        let ver = ch.send(&ver_get()).unwrap();
        ch.apply_version(&ver);
        assert_eq!(ch.timeout_ms(), 1200);
    }

    #[test]
    fn test_oversized_request_is_sent_as_short_command() {
        let mut cfg = SimDeviceConfig::p5();
        cfg.short_cmd = ShortCmdSupport::Supported;
        let sim = SimDevice::new(cfg);
        let mut ch = channel(&sim);
        let ver = ch.send(&ver_get()).unwrap();
        ch.apply_version(&ver);
        ch.enable_short_commands(&sim.dma(), false).unwrap();

        // 296 bytes, larger than the 128-byte mailbox
        let req: FuncBackingStoreCfgInput = new_request();
        assert!(size_of::<FuncBackingStoreCfgInput>() > ch.max_req_len());
        ch.send(&req).unwrap();

        let last = sim.requests().pop().unwrap();
        assert!(last.short);
        assert_eq!(last.req_type, u16::from(RequestType::FuncBackingStoreCfg));
        assert_eq!(last.mailbox_len, size_of::<ShortRequest>());
        assert_eq!(last.body.len(), size_of::<FuncBackingStoreCfgInput>());

        // a small request still goes straight through the mailbox
        ch.send(&ver_get()).unwrap();
        assert!(!sim.requests().pop().unwrap().short);
    }

    #[test]
    fn test_short_command_required_wraps_everything() {
        let mut cfg = SimDeviceConfig::p5();
        cfg.short_cmd = ShortCmdSupport::Required;
        let sim = SimDevice::new(cfg);
        let mut ch = channel(&sim);
        ch.enable_short_commands(&sim.dma(), true).unwrap();
        ch.send(&ver_get()).unwrap();
        assert!(sim.requests().pop().unwrap().short);
    }

    #[test]
    fn test_oversized_request_without_short_commands_is_rejected() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        let req: FuncBackingStoreCfgInput = new_request();
        let err = ch.send(&req).unwrap_err();
        assert_eq!(err, HwrmError::RequestTooLarge { len: 296, max: HWRM_DEFAULT_MAX_REQ_LEN });
        assert_eq!(err.kind(), Some(ErrorKind::InvalidArgument));
        assert!(sim.requests().is_empty());
    }

    #[test]
    fn test_mailbox_is_zero_padded_to_window() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        // leave garbage from a longer request in the mailbox first
        let mut big: FuncDrvRgtrInput = new_request();
        big.async_event_fwd = [Le32::new(u32::MAX); 8];
        ch.send(&big).unwrap();
        ch.send(&ver_get()).unwrap();
        let mailbox = sim.mailbox();
        assert!(mailbox[size_of::<VerGetInput>()..HWRM_DEFAULT_MAX_REQ_LEN].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_firmware_errors_are_classified() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        sim.fail_next(RequestType::FuncQcaps, fw_code::RESOURCE_ACCESS_DENIED);
        let mut req: FuncQcapsInput = new_request();
        req.fid = Le16::new(FID_SELF);
        let err = ch.send(&req).unwrap_err();
        assert_eq!(err, HwrmError::Firmware {
            req_type: u16::from(RequestType::FuncQcaps),
            code: fw_code::RESOURCE_ACCESS_DENIED,
            kind: ErrorKind::PermissionDenied,
        });
        // the injected failure was one-shot
        assert!(ch.send(&req).is_ok());
    }

    #[test]
    fn test_no_response_times_out_on_length() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        sim.set_firmware_down(true);
        let start = sim.clock().now_ms();
        let err = ch.send(&ver_get()).unwrap_err();
        assert_eq!(err, HwrmError::Timeout { req_type: 0, seq_id: 0, phase: TimeoutPhase::ResponseLength });
        assert_eq!(sim.clock().now_ms() - start, DFLT_HWRM_CMD_TIMEOUT_MS);
    }

    #[test]
    fn test_missing_valid_marker_times_out_on_second_phase() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        ch.set_timeout_ms(SHORT_HWRM_CMD_TIMEOUT_MS);
        sim.set_withhold_valid_marker(true);
        let err = ch.send(&ver_get()).unwrap_err();
        assert!(matches!(err, HwrmError::Timeout { phase: TimeoutPhase::ValidMarker, .. }));
        assert!(err.kind().is_none());

        sim.set_withhold_valid_marker(false);
        ch.restore_default_timeout();
        assert!(ch.send(&ver_get()).is_ok());
    }

    #[test]
    fn test_send_raw_returns_header_and_payload() {
        let sim = SimDevice::new(SimDeviceConfig::p5());
        let mut ch = channel(&sim);
        let req = ver_get();
        let raw = ch.send_raw(0, payload_of(&req)).unwrap();
        assert_eq!(raw.len(), size_of::<VerGetOutput>());
        let hdr = ResponseHeader::read_from_prefix(&raw[..]).unwrap();
        assert_eq!(hdr.error_code.get(), 0);
        assert_eq!(hdr.resp_len.get() as usize, raw.len());
    }
}
