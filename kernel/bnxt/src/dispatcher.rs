//! Delivery of firmware async events.
//!
//! Firmware posts async events to the default completion ring. The driver acts on the ones
//! that concern the function as a whole (link changes, reset notifications, error recovery
//! and error reports), then forwards every recognized event to the listeners that subscribed
//! to its id. Listeners also hear when a firmware reset starts and how it ended.

use alloc::boxed::Box;
use alloc::vec::Vec;
use bnxt_ethernet::async_event::{AsyncEvent, ResetNotify, ResetSeverity, MAX_ASYNC_EVENT_ID};
use bnxt_ethernet::completion::{AsyncEventCompletion, CompletionEntry};

use crate::{BnxtError, BnxtNic, DeviceState, ServiceEvents};

/// A set of async event ids.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventMask([u64; MAX_ASYNC_EVENT_ID / 64]);

impl EventMask {
    pub const fn empty() -> EventMask {
        EventMask([0; MAX_ASYNC_EVENT_ID / 64])
    }

    pub fn from_ids(ids: &[u16]) -> EventMask {
        let mut mask = EventMask::empty();
        for id in ids {
            mask.insert(*id);
        }
        mask
    }

    /// Ids beyond the 256 firmware can forward are ignored.
    pub fn insert(&mut self, id: u16) {
        if let Some(word) = self.0.get_mut(id as usize / 64) {
            *word |= 1u64 << (id % 64);
        }
    }

    pub fn contains(&self, id: u16) -> bool {
        self.0.get(id as usize / 64).map_or(false, |word| *word & (1u64 << (id % 64)) != 0)
    }

    pub fn union(&self, other: &EventMask) -> EventMask {
        let mut out = *self;
        for (a, b) in out.0.iter_mut().zip(other.0.iter()) {
            *a |= *b;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// The mask as the eight 32-bit words of `FUNC_DRV_RGTR`'s `async_event_fwd`.
    pub fn words(&self) -> [u32; 8] {
        let mut out = [0; 8];
        for (i, word) in self.0.iter().enumerate() {
            out[2 * i] = *word as u32;
            out[2 * i + 1] = (*word >> 32) as u32;
        }
        out
    }
}

/// Receives the async events it subscribed to.
///
/// Listeners run in the context of whoever services the default completion ring,
/// with the NIC locked; they must not call back into it.
pub trait AsyncEventListener: Send {
    fn on_event(&mut self, event: &AsyncEventCompletion);

    /// A firmware reset is starting; every ring is about to go away.
    fn on_reset_begin(&mut self) {}

    /// The firmware reset finished, successfully or not.
    fn on_reset_complete(&mut self, _result: Result<(), BnxtError>) {}
}

/// Identifies one subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriberId(u32);

struct Subscriber {
    id: SubscriberId,
    mask: EventMask,
    listener: Box<dyn AsyncEventListener>,
}

/// The registered listeners.
pub struct AsyncEventDispatcher {
    subscribers: Vec<Subscriber>,
    next_id: u32,
}

impl AsyncEventDispatcher {
    pub const fn new() -> AsyncEventDispatcher {
        AsyncEventDispatcher { subscribers: Vec::new(), next_id: 0 }
    }

    pub fn subscribe(&mut self, mask: EventMask, listener: Box<dyn AsyncEventListener>) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.subscribers.push(Subscriber { id, mask, listener });
        id
    }

    /// Returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// The union of every subscriber's mask.
    pub fn subscribed_events(&self) -> EventMask {
        self.subscribers.iter().fold(EventMask::empty(), |acc, s| acc.union(&s.mask))
    }

    /// Hands `event` to each subscriber of its id, in subscription order. Returns how many got it.
    pub fn dispatch(&mut self, event: &AsyncEventCompletion) -> usize {
        let id = event.event_id.get();
        let mut delivered = 0;
        for s in self.subscribers.iter_mut().filter(|s| s.mask.contains(id)) {
            s.listener.on_event(event);
            delivered += 1;
        }
        delivered
    }

    pub(crate) fn notify_reset_begin(&mut self) {
        for s in self.subscribers.iter_mut() {
            s.listener.on_reset_begin();
        }
    }

    pub(crate) fn notify_reset_complete(&mut self, result: Result<(), BnxtError>) {
        for s in self.subscribers.iter_mut() {
            s.listener.on_reset_complete(result);
        }
    }
}

impl Default for AsyncEventDispatcher {
    fn default() -> Self {
        AsyncEventDispatcher::new()
    }
}

impl BnxtNic {
    /// Subscribes `listener` to the events in `mask`.
    ///
    /// If the driver is registered, firmware is asked again to forward the combined set.
    pub fn subscribe(&mut self, mask: EventMask, listener: Box<dyn AsyncEventListener>) -> Result<SubscriberId, BnxtError> {
        let id = self.dispatcher.subscribe(mask, listener);
        if !self.in_reset() && !mask.is_empty() {
            if let Err(e) = self.register_driver() {
                self.dispatcher.unsubscribe(id);
                return Err(e);
            }
        }
        Ok(id)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.dispatcher.unsubscribe(id)
    }

    /// Drains the default completion ring and handles every async event on it.
    /// Returns the number of async events seen.
    pub fn service_default_completions(&mut self) -> Result<usize, BnxtError> {
        let ring = self.default_cmpl.ok_or(BnxtError::NotOpen)?;
        let entries = self.drain_completions(ring)?;
        let mut events = 0;
        for entry in entries.iter() {
            if self.handle_async_event(entry) {
                events += 1;
            }
        }
        Ok(events)
    }

    /// Acts on one completion from the default ring. Returns false if it is not an async event.
    pub fn handle_async_event(&mut self, entry: &CompletionEntry) -> bool {
        let Some(raw) = entry.as_async_event() else {
            trace!("bnxt: ignoring {:?} on the default completion ring", entry);
            return false;
        };
        match AsyncEvent::decode(&raw) {
            AsyncEvent::LinkChange(id) => {
                debug!("bnxt: link event {:?}", id);
                self.link_generation = self.link_generation.wrapping_add(1);
                self.events.insert(ServiceEvents::LINK_CHANGE);
            }
            AsyncEvent::ResetNotify(notify) => self.on_reset_notify(notify),
            AsyncEvent::ErrorRecovery { primary, enabled } => {
                if let Some(health) = self.health.as_mut() {
                    health.set_recovery(&self.io, primary, enabled);
                    self.events.insert(ServiceEvents::ERROR_RECOVERY);
                } else {
                    warn!("bnxt: error recovery event, but firmware never described error recovery");
                }
            }
            AsyncEvent::ErrorReport(report) => error!("bnxt: firmware error report: {}", report),
            AsyncEvent::Informational(id) => debug!("bnxt: async event {:?}", id),
            AsyncEvent::Unknown(id) => {
                debug!("bnxt: dropping unknown async event {:#X}", id);
                return true;
            }
        }
        self.dispatcher.dispatch(&raw);
        true
    }

    fn on_reset_notify(&mut self, notify: ResetNotify) {
        info!("bnxt: firmware reset notification: {:?}, wait {}-{} ds",
            notify.severity, notify.min_wait_dsecs, notify.max_wait_dsecs);
        match notify.severity {
            ResetSeverity::Fatal => self.state.insert(DeviceState::FW_FATAL_COND),
            ResetSeverity::NonFatal => self.state.insert(DeviceState::FW_NON_FATAL_COND),
            ResetSeverity::Planned | ResetSeverity::Activation => {}
        }
        self.reset.pending_notify = Some(notify);
        self.events.insert(ServiceEvents::RESET_NOTIFY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::sim_nic;
    use alloc::sync::Arc;
    use bnxt_ethernet::async_event::AsyncEventId;
    use bnxt_ethernet::messages::RequestType;
    use bnxt_ethernet::sim::SimDeviceConfig;
    use spin::Mutex;

    #[derive(Default)]
    struct Log {
        events: Vec<u16>,
        resets: Vec<Result<(), BnxtError>>,
        begins: usize,
    }

    struct Recorder(Arc<Mutex<Log>>);

    impl AsyncEventListener for Recorder {
        fn on_event(&mut self, event: &AsyncEventCompletion) {
            self.0.lock().events.push(event.event_id.get());
        }
        fn on_reset_begin(&mut self) {
            self.0.lock().begins += 1;
        }
        fn on_reset_complete(&mut self, result: Result<(), BnxtError>) {
            self.0.lock().resets.push(result);
        }
    }

    fn recorder() -> (Arc<Mutex<Log>>, Box<dyn AsyncEventListener>) {
        let log = Arc::new(Mutex::new(Log::default()));
        (log.clone(), Box::new(Recorder(log)))
    }

    #[test]
    fn test_event_mask_words() {
        let mask = EventMask::from_ids(&[0, 8, 33, 0x45, 255, 300]);
        assert!(mask.contains(0x45));
        assert!(!mask.contains(1));
        assert!(!mask.contains(300));
        let words = mask.words();
        assert_eq!(words[0], 1 | 1 << 8);
        assert_eq!(words[1], 1 << 1);
        assert_eq!(words[2], 1 << 5);
        assert_eq!(words[7], 1 << 31);
        assert!(EventMask::empty().is_empty());
    }

    #[test]
    fn test_dispatch_only_to_matching_subscribers() {
        let mut d = AsyncEventDispatcher::new();
        let (a, la) = recorder();
        let (b, lb) = recorder();
        let id_a = d.subscribe(EventMask::from_ids(&[0x33]), la);
        d.subscribe(EventMask::from_ids(&[0x33, 0x10]), lb);
        assert!(d.subscribed_events().contains(0x10));

        let mut ev = AsyncEventCompletion::default();
        ev.event_id.set(0x10);
        assert_eq!(d.dispatch(&ev), 1);
        ev.event_id.set(0x33);
        assert_eq!(d.dispatch(&ev), 2);
        assert_eq!(a.lock().events, [0x33]);
        assert_eq!(b.lock().events, [0x10, 0x33]);

        assert!(d.unsubscribe(id_a));
        assert!(!d.unsubscribe(id_a));
        assert_eq!(d.dispatch(&ev), 1);
    }

    #[test]
    fn test_subscribe_updates_forwarding() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        let registrations = sim.count_requests(RequestType::FuncDrvRgtr);
        let (_log, listener) = recorder();
        nic.subscribe(EventMask::from_ids(&[AsyncEventId::VfCfgChange as u16]), listener).unwrap();
        assert_eq!(sim.count_requests(RequestType::FuncDrvRgtr), registrations + 1);
        assert_eq!(sim.async_event_fwd()[1], 1 << (0x33 - 32));
        // the driver's own events stay forwarded
        assert!(sim.async_event_fwd()[0] & (1 << AsyncEventId::ResetNotify as u16) != 0);
    }

    #[test]
    fn test_link_and_unknown_events() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        let (log, listener) = recorder();
        nic.subscribe(EventMask::from_ids(&[0x00, 0x77]), listener).unwrap();

        sim.post_async_event(AsyncEventId::LinkStatusChange as u16, 0, 0, 0, 0).unwrap();
        sim.post_async_event(0x77, 0, 0, 0, 0).unwrap();
        assert_eq!(nic.service_default_completions().unwrap(), 2);
        assert_eq!(nic.link_generation(), 1);
        assert!(nic.pending_events().contains(ServiceEvents::LINK_CHANGE));
        // unknown events are dropped even if someone asked for them
        assert_eq!(log.lock().events, [0x00]);
    }

    #[test]
    fn test_fatal_reset_notify_marks_state() {
        let (sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        nic.open().unwrap();
        sim.post_async_event(AsyncEventId::ResetNotify as u16, 0x0200, 0, 5, 100).unwrap();
        assert_eq!(nic.service_default_completions().unwrap(), 1);
        assert!(nic.state().contains(DeviceState::FW_FATAL_COND));
        assert!(nic.pending_events().contains(ServiceEvents::RESET_NOTIFY));
        let notify = nic.reset.pending_notify.unwrap();
        assert_eq!((notify.min_wait_dsecs, notify.max_wait_dsecs), (5, 100));
    }

    #[test]
    fn test_service_requires_open_device() {
        let (_sim, mut nic) = sim_nic(SimDeviceConfig::legacy());
        assert_eq!(nic.service_default_completions(), Err(BnxtError::NotOpen));
    }
}
