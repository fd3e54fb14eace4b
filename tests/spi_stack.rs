//! End-to-end tests for the SPI stack transport.
//!
//! The engine runs against a scripted in-memory bus: each mock slave
//! answers enumeration with its UID list, clocks out prepared reply
//! frames, and records every packet the master delivers. Config timings
//! are shortened so enumeration and retry budgets resolve in
//! milliseconds.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use brickwire::config::SpiStackConfig;
use brickwire::packet::{Packet, FUNCTION_STACK_ENUMERATE, MAX_STACK_ENUMERATE_UIDS};
use brickwire::spi::frame::{FRAME_EMPTY_SIZE, FRAME_SIZE, INFO_BUSY, PREAMBLE};
use brickwire::spi::hash::pearson_hash;
use brickwire::spi::{SpiBus, SpiStack};
use brickwire::Stack;
use brickwire::{spawn_dispatch_task, ResponseSink, Router};

// ============================================================================
// Scripted bus
// ============================================================================

/// Build a slave-side frame: same layout as the master side, but the
/// info byte may carry the busy flag.
fn slave_frame(packet: Option<&Packet>, busy: bool) -> [u8; FRAME_SIZE] {
    let mut frame = [0u8; FRAME_SIZE];
    frame[0] = PREAMBLE;

    let length = match packet {
        Some(packet) => {
            packet.write_into(&mut frame[2..2 + packet.len()]);
            packet.len() + 4
        }
        None => FRAME_EMPTY_SIZE,
    };

    frame[1] = length as u8;
    frame[length - 2] = if busy { INFO_BUSY } else { 0 };
    frame[length - 1] = pearson_hash(&frame[..length - 1]);
    frame
}

/// The enumerate response a slave reports: its UID list, zero-terminated
/// when shorter than the capacity.
fn enumerate_response(uids: &[u32]) -> Packet {
    let mut payload = Vec::new();
    for uid in uids {
        payload.extend_from_slice(&uid.to_le_bytes());
    }
    if uids.len() < MAX_STACK_ENUMERATE_UIDS {
        payload.extend_from_slice(&0u32.to_le_bytes());
    }

    Packet::request(0, FUNCTION_STACK_ENUMERATE, 1, false, Bytes::from(payload)).unwrap()
}

#[derive(Default)]
struct ScriptedSlave {
    present: bool,
    uids: Vec<u32>,
    busy: bool,
    /// Frames to clock out, oldest first. Raw so corruption can be
    /// scripted.
    replies: VecDeque<[u8; FRAME_SIZE]>,
    /// Packets the master delivered (enumerate requests excluded).
    received: Vec<Packet>,
    /// Empty (poll) frames observed.
    polls: usize,
}

#[derive(Default)]
struct BusInner {
    slaves: Vec<ScriptedSlave>,
    /// Stack addresses in packet-delivery order, across all slaves.
    deliveries: Vec<usize>,
}

/// Shared handle to the scripted bus; clones observe the same state.
#[derive(Clone)]
struct MockBus(Arc<Mutex<BusInner>>);

impl MockBus {
    fn new(slave_uids: Vec<Vec<u32>>) -> Self {
        let slaves = slave_uids
            .into_iter()
            .map(|uids| ScriptedSlave {
                present: true,
                uids,
                ..Default::default()
            })
            .collect();

        Self(Arc::new(Mutex::new(BusInner {
            slaves,
            deliveries: Vec::new(),
        })))
    }

    fn empty() -> Self {
        Self(Arc::new(Mutex::new(BusInner::default())))
    }

    fn received(&self, address: usize) -> Vec<Packet> {
        self.0.lock().unwrap().slaves[address].received.clone()
    }

    fn polls(&self, address: usize) -> usize {
        self.0.lock().unwrap().slaves[address].polls
    }

    fn deliveries(&self) -> Vec<usize> {
        self.0.lock().unwrap().deliveries.clone()
    }

    fn set_busy(&self, address: usize, busy: bool) {
        self.0.lock().unwrap().slaves[address].busy = busy;
    }

    fn push_reply(&self, address: usize, frame: [u8; FRAME_SIZE]) {
        self.0.lock().unwrap().slaves[address].replies.push_back(frame);
    }
}

impl SpiBus for MockBus {
    fn transfer(
        &mut self,
        stack_address: u8,
        tx: &[u8; FRAME_SIZE],
        rx: &mut [u8; FRAME_SIZE],
    ) -> io::Result<()> {
        let mut inner = self.0.lock().unwrap();
        let address = stack_address as usize;

        let Some(slave) = inner.slaves.get_mut(address) else {
            return Ok(()); // nothing driving MISO, rx stays zero
        };
        if !slave.present {
            return Ok(());
        }

        // Clock out the reply that was ready before this transaction.
        let reply = slave
            .replies
            .pop_front()
            .unwrap_or_else(|| slave_frame(None, slave.busy));
        rx.copy_from_slice(&reply);

        // Process what the master sent.
        let length = tx[1] as usize;
        if length > FRAME_EMPTY_SIZE {
            let packet = Packet::from_wire(&tx[2..length - 2]).expect("malformed master frame");
            if packet.header.function_id == FUNCTION_STACK_ENUMERATE {
                let response = enumerate_response(&slave.uids);
                let busy = slave.busy;
                slave.replies.push_back(slave_frame(Some(&response), busy));
            } else {
                slave.received.push(packet);
                inner.deliveries.push(address);
            }
        } else {
            slave.polls += 1;
        }

        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

#[derive(Default)]
struct RecordingSink {
    responses: Mutex<Vec<Packet>>,
}

impl RecordingSink {
    fn responses(&self) -> Vec<Packet> {
        self.responses.lock().unwrap().clone()
    }
}

impl ResponseSink for RecordingSink {
    fn dispatch_response(&self, packet: &Packet) {
        self.responses.lock().unwrap().push(packet.clone());
    }
}

/// Route engine logs through `RUST_LOG` when debugging a test.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> SpiStackConfig {
    SpiStackConfig {
        poll_interval_us: 200,
        enumerate_tries: 3,
        enumerate_wait_ms: 1,
        ..Default::default()
    }
}

async fn wait_enumerated(stack: &SpiStack) -> usize {
    wait_for(|| stack.slave_count(), "enumeration did not finish").await
}

/// Poll `probe` every few milliseconds until it yields a value.
async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>, message: &str) -> T {
    for _ in 0..400 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("{}", message);
}

struct Harness {
    bus: MockBus,
    stack: Arc<SpiStack>,
    sink: Arc<RecordingSink>,
    router: Arc<Router>,
}

impl Harness {
    async fn start(bus: MockBus) -> Self {
        init_tracing();

        let sink = Arc::new(RecordingSink::default());
        let router = Arc::new(Router::new(sink.clone()));

        let (stack, receiver) = SpiStack::spawn(test_config(), Box::new(bus.clone())).unwrap();
        router.add_stack(stack.clone());
        spawn_dispatch_task(receiver, router.clone());

        wait_enumerated(&stack).await;

        Self {
            bus,
            stack,
            sink,
            router,
        }
    }
}

fn request(uid: u32, sequence_number: u8) -> Packet {
    Packet::request(uid, 17, sequence_number, true, Bytes::from_static(b"\x2a")).unwrap()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_stack_enumerates_to_zero_and_thread_exits() {
    init_tracing();
    let (stack, _receiver) = SpiStack::spawn(test_config(), Box::new(MockBus::empty())).unwrap();

    assert_eq!(wait_enumerated(&stack).await, 0);
    assert_eq!(stack.uid_count(), 0);

    // The engine thread ends on its own; shutdown only joins it.
    stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_slave_round_trip() {
    let harness = Harness::start(MockBus::new(vec![vec![0x0000_ABCD]])).await;

    assert_eq!(harness.stack.slave_count(), Some(1));
    assert_eq!(harness.stack.uid_count(), 1);
    assert!(harness.stack.owns_uid(0x0000_ABCD));

    // Outbound: the request reaches slave 0 byte-identical.
    let outbound = request(0x0000_ABCD, 1);
    harness.router.dispatch_request(&outbound);

    let delivered = wait_for(
        || harness.bus.received(0).first().cloned(),
        "request never reached the slave",
    )
    .await;
    assert_eq!(delivered, outbound);
    assert_eq!(harness.bus.received(0).len(), 1);

    // Inbound: a scripted response reaches the sink exactly once.
    let response =
        Packet::request(0x0000_ABCD, 17, 1, false, Bytes::from_static(b"response")).unwrap();
    harness.bus.push_reply(0, slave_frame(Some(&response), false));

    let forwarded = wait_for(
        || harness.sink.responses().first().cloned(),
        "response never reached the sink",
    )
    .await;
    assert_eq!(forwarded, response);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.sink.responses().len(), 1);

    harness.stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_reaches_every_slave_once_in_index_order() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11], vec![0x22], vec![0x33]])).await;
    assert_eq!(harness.stack.slave_count(), Some(3));

    let broadcast = request(0, 1);
    harness.router.dispatch_request(&broadcast);

    wait_for(
        || (harness.bus.deliveries().len() == 3).then_some(()),
        "broadcast did not reach all slaves",
    )
    .await;

    assert_eq!(harness.bus.deliveries(), vec![0, 1, 2]);
    for address in 0..3 {
        let received = harness.bus.received(address);
        assert_eq!(received.len(), 1, "slave {} copies", address);
        assert_eq!(received[0].uid(), 0);
    }
    assert_eq!(harness.stack.queued_request_count(), 0);

    harness.stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_slave_retries_without_popping() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11]])).await;

    // Let the engine observe the busy bit before anything is queued.
    harness.bus.set_busy(0, true);
    let observed = harness.bus.polls(0);
    wait_for(
        || (harness.bus.polls(0) > observed + 2).then_some(()),
        "busy bit never observed",
    )
    .await;

    let outbound = request(0x11, 1);
    harness.router.dispatch_request(&outbound);

    // While busy the slave only sees empty frames; the entry stays
    // queued.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.bus.received(0).is_empty());
    assert_eq!(harness.stack.queued_request_count(), 1);

    // Busy clears; the queued packet goes out and is popped.
    harness.bus.set_busy(0, false);
    let delivered = wait_for(
        || harness.bus.received(0).first().cloned(),
        "packet never delivered after busy cleared",
    )
    .await;
    assert_eq!(delivered, outbound);
    assert_eq!(harness.stack.queued_request_count(), 0);

    harness.stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_corrupted_frame_is_dropped_and_loop_continues() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11]])).await;

    let response = Packet::request(0x11, 17, 1, false, Bytes::from_static(b"payload")).unwrap();
    let mut corrupted = slave_frame(Some(&response), false);
    corrupted[10] ^= 0x01; // single flip inside the payload region

    harness.bus.push_reply(0, corrupted);

    // The corrupt frame must not surface.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(harness.sink.responses().is_empty());

    // The next tick proceeds normally: a clean frame still gets through.
    harness.bus.push_reply(0, slave_frame(Some(&response), false));
    let forwarded = wait_for(
        || harness.sink.responses().first().cloned(),
        "clean frame after corruption never arrived",
    )
    .await;
    assert_eq!(forwarded, response);

    harness.stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_uid_is_dropped_before_the_queue() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11]])).await;

    harness.router.dispatch_request(&request(0xDEAD_BEEF, 1));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.stack.queued_request_count(), 0);
    assert!(harness.bus.received(0).is_empty());
    assert!(harness.sink.responses().is_empty());

    harness.stack.shutdown();
}

// ============================================================================
// Ordering properties
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_single_uid_stream_is_delivered_in_enqueue_order() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11]])).await;

    for sequence in 1..=5u8 {
        harness.router.dispatch_request(&request(0x11, sequence));
    }

    wait_for(
        || (harness.bus.received(0).len() == 5).then_some(()),
        "stream did not drain",
    )
    .await;

    let sequences: Vec<u8> = harness
        .bus
        .received(0)
        .iter()
        .map(|packet| packet.header.sequence_number())
        .collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    harness.stack.shutdown();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requests_are_never_delivered_to_a_non_owner() {
    let harness = Harness::start(MockBus::new(vec![vec![0x11], vec![0x22]])).await;

    harness.router.dispatch_request(&request(0x22, 1));
    harness.router.dispatch_request(&request(0x11, 2));

    wait_for(
        || (harness.bus.deliveries().len() == 2).then_some(()),
        "requests did not drain",
    )
    .await;

    for packet in harness.bus.received(0) {
        assert_eq!(packet.uid(), 0x11);
    }
    for packet in harness.bus.received(1) {
        assert_eq!(packet.uid(), 0x22);
    }

    harness.stack.shutdown();
}
