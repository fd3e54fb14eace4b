//! UID routing across transports.
//!
//! Every transport (SPI, USB, RS485, ...) registers itself as a
//! [`Stack`]: a name, a set of owned device UIDs, and a dispatch
//! operation for outbound packets. The [`Router`] is the single entry
//! point the client layer talks to: outbound requests are routed to the
//! stack claiming the UID (or broadcast to all of them), inbound
//! responses and callbacks funnel through one [`ResponseSink`] callback.
//!
//! The router holds no inbound queue; the sink is expected to return
//! quickly and delegate network serialization to the client layer.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error};

use crate::packet::Packet;

/// A transport plus its set of owned UIDs.
///
/// Implementations learn their UID set during their own discovery
/// (enumeration, hotplug, ...) and must answer [`Stack::owns_uid`]
/// without blocking.
pub trait Stack: Send + Sync {
    /// Display name of the transport (for logs).
    fn name(&self) -> &str;

    /// Check if a device with this UID lives behind the transport.
    fn owns_uid(&self, uid: u32) -> bool;

    /// Hand an outbound client packet to the transport.
    ///
    /// The transport copies the packet by its declared length; the
    /// router keeps ownership of the original. Must not block on I/O.
    fn dispatch_request(&self, packet: &Packet);
}

/// Consumer of inbound packets, implemented by the client layer.
pub trait ResponseSink: Send + Sync {
    /// Deliver one response or callback packet to interested clients.
    fn dispatch_response(&self, packet: &Packet);
}

/// Registry of the active transports and the inbound callback.
pub struct Router {
    stacks: RwLock<Vec<Arc<dyn Stack>>>,
    sink: Arc<dyn ResponseSink>,
}

impl Router {
    /// Create a router delivering inbound traffic to `sink`.
    pub fn new(sink: Arc<dyn ResponseSink>) -> Self {
        Self {
            stacks: RwLock::new(Vec::new()),
            sink,
        }
    }

    /// Register a transport. Stacks are consulted in registration order.
    pub fn add_stack(&self, stack: Arc<dyn Stack>) {
        debug!("Adding stack {} to router", stack.name());
        self.write_stacks().push(stack);
    }

    /// Remove a transport by name. Returns `false` if it was not
    /// registered.
    pub fn remove_stack(&self, name: &str) -> bool {
        let mut stacks = self.write_stacks();
        match stacks.iter().position(|stack| stack.name() == name) {
            Some(index) => {
                stacks.remove(index);
                true
            }
            None => {
                error!("Stack {} not found in router", name);
                false
            }
        }
    }

    /// Number of registered transports.
    pub fn stack_count(&self) -> usize {
        self.read_stacks().len()
    }

    /// Route one outbound client request.
    ///
    /// UID 0 broadcasts to every registered stack; each stack fans the
    /// packet out to every device it owns. Otherwise the first stack
    /// claiming the UID receives the packet; an unclaimed UID is logged
    /// and dropped, with no negative acknowledgement to the client.
    pub fn dispatch_request(&self, packet: &Packet) {
        let stacks = self.read_stacks();

        if stacks.is_empty() {
            debug!("No stacks registered, dropping request {}", packet);
            return;
        }

        if packet.header.is_broadcast() {
            debug!(
                "Broadcasting request {} to {} stack(s)",
                packet,
                stacks.len()
            );
            for stack in stacks.iter() {
                stack.dispatch_request(packet);
            }
            return;
        }

        match stacks.iter().find(|stack| stack.owns_uid(packet.uid())) {
            Some(stack) => {
                debug!("Routing request {} to stack {}", packet, stack.name());
                stack.dispatch_request(packet);
            }
            None => {
                error!("No stack knows the UID, dropping request {}", packet);
            }
        }
    }

    /// Deliver one inbound packet to the client layer.
    pub fn dispatch_response(&self, packet: &Packet) {
        self.sink.dispatch_response(packet);
    }

    fn read_stacks(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn Stack>>> {
        self.stacks.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_stacks(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn Stack>>> {
        self.stacks.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::Bytes;

    struct RecordingStack {
        name: String,
        uids: Vec<u32>,
        dispatched: Mutex<Vec<Packet>>,
    }

    impl RecordingStack {
        fn new(name: &str, uids: Vec<u32>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                uids,
                dispatched: Mutex::new(Vec::new()),
            })
        }

        fn dispatched(&self) -> Vec<Packet> {
            self.dispatched.lock().unwrap().clone()
        }
    }

    impl Stack for RecordingStack {
        fn name(&self) -> &str {
            &self.name
        }

        fn owns_uid(&self, uid: u32) -> bool {
            self.uids.contains(&uid)
        }

        fn dispatch_request(&self, packet: &Packet) {
            self.dispatched.lock().unwrap().push(packet.clone());
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        responses: Mutex<Vec<Packet>>,
    }

    impl ResponseSink for RecordingSink {
        fn dispatch_response(&self, packet: &Packet) {
            self.responses.lock().unwrap().push(packet.clone());
        }
    }

    fn packet(uid: u32) -> Packet {
        Packet::request(uid, 1, 1, true, Bytes::new()).unwrap()
    }

    #[test]
    fn test_unicast_reaches_owner_only() {
        let router = Router::new(Arc::new(RecordingSink::default()));
        let spi = RecordingStack::new("spi", vec![0xAB]);
        let usb = RecordingStack::new("usb", vec![0xCD]);
        router.add_stack(spi.clone());
        router.add_stack(usb.clone());

        router.dispatch_request(&packet(0xCD));

        assert!(spi.dispatched().is_empty());
        assert_eq!(usb.dispatched().len(), 1);
        assert_eq!(usb.dispatched()[0].uid(), 0xCD);
    }

    #[test]
    fn test_broadcast_reaches_every_stack() {
        let router = Router::new(Arc::new(RecordingSink::default()));
        let spi = RecordingStack::new("spi", vec![0xAB]);
        let usb = RecordingStack::new("usb", vec![0xCD]);
        router.add_stack(spi.clone());
        router.add_stack(usb.clone());

        router.dispatch_request(&packet(0));

        assert_eq!(spi.dispatched().len(), 1);
        assert_eq!(usb.dispatched().len(), 1);
    }

    #[test]
    fn test_unknown_uid_dropped() {
        let router = Router::new(Arc::new(RecordingSink::default()));
        let spi = RecordingStack::new("spi", vec![0xAB]);
        router.add_stack(spi.clone());

        router.dispatch_request(&packet(0xDEAD_BEEF));

        assert!(spi.dispatched().is_empty());
    }

    #[test]
    fn test_first_registered_owner_wins() {
        let router = Router::new(Arc::new(RecordingSink::default()));
        let first = RecordingStack::new("first", vec![0xAB]);
        let second = RecordingStack::new("second", vec![0xAB]);
        router.add_stack(first.clone());
        router.add_stack(second.clone());

        router.dispatch_request(&packet(0xAB));

        assert_eq!(first.dispatched().len(), 1);
        assert!(second.dispatched().is_empty());
    }

    #[test]
    fn test_remove_stack() {
        let router = Router::new(Arc::new(RecordingSink::default()));
        let spi = RecordingStack::new("spi", vec![0xAB]);
        router.add_stack(spi.clone());

        assert_eq!(router.stack_count(), 1);
        assert!(router.remove_stack("spi"));
        assert!(!router.remove_stack("spi"));
        assert_eq!(router.stack_count(), 0);

        router.dispatch_request(&packet(0xAB));
        assert!(spi.dispatched().is_empty());
    }

    #[test]
    fn test_responses_reach_sink() {
        let sink = Arc::new(RecordingSink::default());
        let router = Router::new(sink.clone());

        router.dispatch_response(&packet(0xAB));

        let responses = sink.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].uid(), 0xAB);
    }
}
