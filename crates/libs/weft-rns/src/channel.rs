pub mod stream;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::error::RnsError;

/// Message type ids at or above this value are reserved for the stack.
pub const RESERVED_TYPE_THRESHOLD: u16 = 0xF000;

/// Initial and minimum outstanding-envelope window.
pub const WINDOW: usize = 2;
pub const WINDOW_MIN: usize = 2;
pub const WINDOW_MAX_SLOW: usize = 5;
pub const WINDOW_MAX_MEDIUM: usize = 16;
pub const WINDOW_MAX_FAST: usize = 48;
const MEDIUM_RATE_THRESHOLD: usize = 5;
const FAST_RATE_THRESHOLD: usize = 10;

pub const MAX_TRIES: u8 = 5;

/// Envelope header: type, sequence, and payload length, each u16 BE.
pub const ENVELOPE_OVERHEAD: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    New,
    Sent,
    Delivered,
    Failed,
}

/// Transmission seam between a channel and its link. The transport
/// implements this against real links; tests swap in loopbacks.
pub trait ChannelOutlet: Send {
    fn send(&mut self, raw: &[u8]) -> Result<(), RnsError>;
    fn resend(&mut self, raw: &[u8]) -> Result<(), RnsError>;
    fn mdu(&self) -> usize;
    fn rtt(&self) -> Duration;
    fn is_usable(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn pack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(ENVELOPE_OVERHEAD + self.payload.len());
        out.extend_from_slice(&self.msg_type.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, RnsError> {
        if raw.len() < ENVELOPE_OVERHEAD {
            return Err(RnsError::PacketError);
        }
        let msg_type = u16::from_be_bytes([raw[0], raw[1]]);
        let sequence = u16::from_be_bytes([raw[2], raw[3]]);
        let len = u16::from_be_bytes([raw[4], raw[5]]) as usize;
        if raw.len() < ENVELOPE_OVERHEAD + len {
            return Err(RnsError::PacketError);
        }
        Ok(Self { msg_type, sequence, payload: raw[ENVELOPE_OVERHEAD..ENVELOPE_OVERHEAD + len].to_vec() })
    }
}

/// Signed circular distance in the 16-bit sequence space: positive when
/// `b` is ahead of `a`.
fn seq_distance(a: u16, b: u16) -> i32 {
    let diff = b.wrapping_sub(a);
    if diff < 0x8000 {
        diff as i32
    } else {
        diff as i32 - 0x10000
    }
}

pub type Handler = Box<dyn FnMut(&Envelope) -> bool + Send>;

struct PendingEnvelope {
    raw: Vec<u8>,
    tries: u8,
    last_sent: Instant,
}

/// Reliable, ordered, typed messaging over a link. Send side keeps a
/// sliding window of unproven envelopes; receive side holds gaps in a
/// ring until filled, handing envelopes to handlers strictly in order.
pub struct Channel<O: ChannelOutlet> {
    outlet: O,
    registered_types: Vec<u16>,
    handlers: Vec<Handler>,
    next_sequence: u16,
    rx_expected: u16,
    rx_ring: BTreeMap<u16, Envelope>,
    pending: HashMap<u16, PendingEnvelope>,
    states: HashMap<u16, MessageState>,
    window: usize,
    window_max: usize,
    success_streak: usize,
}

impl<O: ChannelOutlet> Channel<O> {
    pub fn new(outlet: O) -> Self {
        Self {
            outlet,
            registered_types: Vec::new(),
            handlers: Vec::new(),
            next_sequence: 0,
            rx_expected: 0,
            rx_ring: BTreeMap::new(),
            pending: HashMap::new(),
            states: HashMap::new(),
            window: WINDOW,
            window_max: WINDOW_MAX_SLOW,
            success_streak: 0,
        }
    }

    /// Registers a message type. Reserved ids and duplicates are
    /// refused so a later `send` cannot silently collide.
    pub fn register_type(&mut self, msg_type: u16) -> Result<(), RnsError> {
        if msg_type >= RESERVED_TYPE_THRESHOLD {
            return Err(RnsError::Unregistered);
        }
        self.register_type_unchecked(msg_type)
    }

    /// Registration path for the stack's own reserved messages.
    pub(crate) fn register_type_unchecked(&mut self, msg_type: u16) -> Result<(), RnsError> {
        if self.registered_types.contains(&msg_type) {
            return Err(RnsError::Unregistered);
        }
        self.registered_types.push(msg_type);
        Ok(())
    }

    /// Handlers run in registration order until one consumes the
    /// envelope by returning true.
    pub fn add_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&Envelope) -> bool + Send + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    pub fn is_ready(&self) -> bool {
        self.outlet.is_usable() && self.pending.len() < self.window
    }

    pub fn mdu(&self) -> usize {
        self.outlet.mdu().saturating_sub(ENVELOPE_OVERHEAD)
    }

    /// Sends one typed message. Fails with `WindowFull` instead of
    /// blocking when the tx window has no room.
    pub fn send(&mut self, msg_type: u16, payload: Vec<u8>) -> Result<u16, RnsError> {
        if !self.registered_types.contains(&msg_type) {
            return Err(RnsError::Unregistered);
        }
        if !self.outlet.is_usable() {
            return Err(RnsError::NotReady);
        }
        if payload.len() + ENVELOPE_OVERHEAD > self.outlet.mdu() {
            return Err(RnsError::Overflow);
        }
        if self.pending.len() >= self.window {
            return Err(RnsError::WindowFull);
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let envelope = Envelope { msg_type, sequence, payload };
        let raw = envelope.pack();
        self.outlet.send(&raw)?;

        self.pending.insert(sequence, PendingEnvelope { raw, tries: 1, last_sent: Instant::now() });
        self.states.insert(sequence, MessageState::Sent);

        Ok(sequence)
    }

    /// Called when the delivery proof for an envelope arrives. The
    /// window slides, and sustained success widens it.
    pub fn mark_delivered(&mut self, sequence: u16) {
        if self.pending.remove(&sequence).is_none() {
            return;
        }
        self.states.insert(sequence, MessageState::Delivered);

        self.success_streak += 1;
        if self.success_streak >= FAST_RATE_THRESHOLD {
            self.window_max = WINDOW_MAX_FAST;
        } else if self.success_streak >= MEDIUM_RATE_THRESHOLD {
            self.window_max = WINDOW_MAX_MEDIUM;
        }
        if self.window < self.window_max {
            self.window += 1;
        }
    }

    /// Retry sweep. Envelopes past their deadline are retransmitted up
    /// to MAX_TRIES; beyond that they fail and the window contracts.
    pub fn sweep(&mut self) -> Vec<u16> {
        let timeout = std::cmp::max(self.outlet.rtt() * 3, Duration::from_millis(5000));
        let now = Instant::now();

        let mut failed = Vec::new();
        let mut to_resend = Vec::new();

        for (sequence, pending) in self.pending.iter_mut() {
            if now.duration_since(pending.last_sent) < timeout {
                continue;
            }
            if pending.tries >= MAX_TRIES {
                failed.push(*sequence);
            } else {
                pending.tries += 1;
                pending.last_sent = now;
                to_resend.push(*sequence);
            }
        }

        for sequence in &to_resend {
            if let Some(pending) = self.pending.get(sequence) {
                let raw = pending.raw.clone();
                if self.outlet.resend(&raw).is_err() {
                    log::warn!("channel: resend failed for sequence {}", sequence);
                }
            }
            self.contract_window();
        }

        for sequence in &failed {
            self.pending.remove(sequence);
            self.states.insert(*sequence, MessageState::Failed);
            self.contract_window();
        }

        failed
    }

    fn contract_window(&mut self) {
        self.success_streak = 0;
        self.window = std::cmp::max(WINDOW_MIN, self.window / 2);
    }

    /// Inbound raw envelope. In-order envelopes dispatch immediately;
    /// ahead-of-sequence ones wait in the ring, duplicates are dropped.
    pub fn receive(&mut self, raw: &[u8]) -> Result<(), RnsError> {
        let envelope = Envelope::unpack(raw)?;
        let distance = seq_distance(self.rx_expected, envelope.sequence);

        if distance < 0 {
            // Already delivered; a duplicate from a retransmission.
            return Ok(());
        }

        if distance > 0 {
            self.rx_ring.entry(envelope.sequence).or_insert(envelope);
            return Ok(());
        }

        self.dispatch(envelope);

        // Drain any now-in-order prefix held in the ring.
        while let Some(envelope) = self.rx_ring.remove(&self.rx_expected) {
            self.dispatch(envelope);
        }

        Ok(())
    }

    fn dispatch(&mut self, envelope: Envelope) {
        self.rx_expected = self.rx_expected.wrapping_add(1);

        if !self.registered_types.contains(&envelope.msg_type) {
            log::debug!("channel: dropping unregistered message type {:#06x}", envelope.msg_type);
            return;
        }

        for handler in self.handlers.iter_mut() {
            if handler(&envelope) {
                break;
            }
        }
    }

    pub fn state(&self, sequence: u16) -> MessageState {
        self.states.get(&sequence).copied().unwrap_or(MessageState::New)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    pub fn outlet(&self) -> &O {
        &self.outlet
    }

    pub fn outlet_mut(&mut self) -> &mut O {
        &mut self.outlet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct LoopbackOutlet {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        mdu: usize,
    }

    impl LoopbackOutlet {
        fn new() -> Self {
            Self { sent: Arc::new(Mutex::new(Vec::new())), mdu: 400 }
        }
    }

    impl ChannelOutlet for LoopbackOutlet {
        fn send(&mut self, raw: &[u8]) -> Result<(), RnsError> {
            self.sent.lock().expect("lock").push(raw.to_vec());
            Ok(())
        }

        fn resend(&mut self, raw: &[u8]) -> Result<(), RnsError> {
            self.sent.lock().expect("lock").push(raw.to_vec());
            Ok(())
        }

        fn mdu(&self) -> usize {
            self.mdu
        }

        fn rtt(&self) -> Duration {
            Duration::from_millis(50)
        }

        fn is_usable(&self) -> bool {
            true
        }
    }

    #[test]
    fn envelope_pack_round_trip() {
        let envelope = Envelope { msg_type: 0x0001, sequence: 0x0203, payload: vec![9, 8, 7] };
        let unpacked = Envelope::unpack(&envelope.pack()).expect("unpacked");
        assert_eq!(unpacked, envelope);
    }

    #[test]
    fn sequence_distance_is_circular() {
        assert_eq!(seq_distance(0, 1), 1);
        assert_eq!(seq_distance(0xFFFF, 0), 1);
        assert_eq!(seq_distance(0, 0xFFFF), -1);
        assert!(seq_distance(0, 0x8000) < 0);
    }

    #[test]
    fn send_rejects_when_window_full() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        channel.register_type(0x0001).expect("registered");

        assert!(channel.send(0x0001, vec![1]).is_ok());
        assert!(channel.send(0x0001, vec![2]).is_ok());
        assert_eq!(channel.send(0x0001, vec![3]), Err(RnsError::WindowFull));
    }

    #[test]
    fn reserved_and_duplicate_registration_fail() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        assert_eq!(channel.register_type(0xF000), Err(RnsError::Unregistered));
        channel.register_type(0x0001).expect("registered");
        assert_eq!(channel.register_type(0x0001), Err(RnsError::Unregistered));
    }

    #[test]
    fn window_grows_with_sustained_success() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        channel.register_type(0x0001).expect("registered");

        let mut delivered = 0u16;
        let mut sent = 0u16;
        while delivered < 60 {
            while channel.outstanding() < channel.window() && sent < 60 {
                channel.send(0x0001, vec![sent as u8]).expect("sent");
                sent += 1;
            }
            channel.mark_delivered(delivered);
            delivered += 1;
        }

        assert!(channel.window() >= WINDOW_MAX_MEDIUM);
    }

    #[test]
    fn out_of_order_envelopes_deliver_in_sequence() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        channel.register_type(0x0001).expect("registered");

        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        channel.add_handler(move |envelope| {
            order_clone.lock().expect("lock").push(envelope.sequence);
            true
        });

        let env = |sequence: u16| Envelope { msg_type: 0x0001, sequence, payload: vec![] }.pack();

        channel.receive(&env(1)).expect("held");
        channel.receive(&env(2)).expect("held");
        channel.receive(&env(0)).expect("dispatched");
        // A duplicate of an already-delivered sequence is dropped.
        channel.receive(&env(1)).expect("dropped");

        assert_eq!(*order.lock().expect("lock"), vec![0, 1, 2]);
    }

    #[test]
    fn handlers_run_until_consumed() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        channel.register_type(0x0001).expect("registered");

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls_a = calls.clone();
        channel.add_handler(move |_| {
            calls_a.lock().expect("lock").push("first");
            false
        });
        let calls_b = calls.clone();
        channel.add_handler(move |_| {
            calls_b.lock().expect("lock").push("second");
            true
        });
        let calls_c = calls.clone();
        channel.add_handler(move |_| {
            calls_c.lock().expect("lock").push("third");
            true
        });

        let raw = Envelope { msg_type: 0x0001, sequence: 0, payload: vec![] }.pack();
        channel.receive(&raw).expect("dispatched");

        assert_eq!(*calls.lock().expect("lock"), vec!["first", "second"]);
    }

    #[test]
    fn oversized_payload_is_refused() {
        let mut channel = Channel::new(LoopbackOutlet::new());
        channel.register_type(0x0001).expect("registered");
        assert_eq!(channel.send(0x0001, vec![0u8; 400]), Err(RnsError::Overflow));
    }
}
