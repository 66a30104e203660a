//! In-memory device for tests and simulators.
//!
//! [`MockDevice`] records everything the protocol hands to the host
//! (packets, deliveries, session events, log lines) and queues delayed
//! actions so tests can pump timers by hand. Time is virtual: actions
//! carry deadlines on a [`SimClock`] that only advances when a test
//! fires them, and multiple devices can share one clock so a harness
//! can always fire the globally earliest timer first. Randomness is
//! seeded and deterministic: a failing run replays from its seed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::contacts::{ContactId, ContactsContainer, MemoryContactsContainer};
use crate::device::{DelayedAction, Device, DeviceAddress, MessageId, SessionId};
use crate::ProtocolError;

/// SplitMix64; enough randomness for deterministic tests.
struct SplitMix64(u64);

impl SplitMix64 {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9e3779b97f4a7c15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    fn fill(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let word = self.next().to_be_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }
}

/// A virtual clock, advanced only by firing delayed actions.
#[derive(Default)]
pub struct SimClock {
    elapsed: Mutex<Duration>,
}

impl SimClock {
    pub fn new() -> Arc<SimClock> {
        Arc::new(SimClock::default())
    }

    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }

    fn advance_to(&self, deadline: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = (*elapsed).max(deadline);
    }
}

struct PendingAction {
    fire_at: Duration,
    seq: u64,
    action: DelayedAction,
}

struct MockState {
    rng: SplitMix64,
    packets_sent: Vec<(DeviceAddress, Vec<u8>)>,
    delivered: Vec<MessageId>,
    messages: Vec<(SessionId, Vec<u8>)>,
    sessions: Vec<(SessionId, ContactId, DeviceAddress)>,
    sessions_broken: usize,
    delay_actions: Vec<PendingAction>,
    next_action_seq: u64,
    sync_state: HashMap<ContactId, Option<Vec<u8>>>,
    log: Vec<String>,
    max_packet_size: usize,
    reply_payload: Option<Vec<u8>>,
}

/// A scripted [`Device`] backed by an in-memory contact store.
pub struct MockDevice {
    state: Mutex<MockState>,
    contacts: MemoryContactsContainer,
    clock: Arc<SimClock>,
    base: Instant,
}

impl MockDevice {
    pub fn with_seed(seed: u64) -> Self {
        MockDevice::with_clock(seed, SimClock::new())
    }

    /// A device on a shared clock, for multi-node harnesses.
    pub fn with_clock(seed: u64, clock: Arc<SimClock>) -> Self {
        MockDevice {
            state: Mutex::new(MockState {
                rng: SplitMix64(seed),
                packets_sent: Vec::new(),
                delivered: Vec::new(),
                messages: Vec::new(),
                sessions: Vec::new(),
                sessions_broken: 0,
                delay_actions: Vec::new(),
                next_action_seq: 0,
                sync_state: HashMap::new(),
                log: Vec::new(),
                max_packet_size: 514,
                reply_payload: None,
            }),
            contacts: MemoryContactsContainer::new(),
            clock,
            base: Instant::now(),
        }
    }

    /// The in-memory contact store backing [`Device::contacts`].
    pub fn contact_store(&self) -> &MemoryContactsContainer {
        &self.contacts
    }

    /// Override the MTU reported for every peer (default 514).
    pub fn set_max_packet_size(&self, size: usize) {
        self.state.lock().max_packet_size = size;
    }

    /// Payload returned from [`Device::reply_payload`].
    pub fn set_reply_payload(&self, payload: Option<Vec<u8>>) {
        self.state.lock().reply_payload = payload;
    }

    /// Remove and return the most recently sent packet.
    ///
    /// # Panics
    /// Panics when no packet has been sent.
    pub fn pop_last_packet(&self) -> (DeviceAddress, Vec<u8>) {
        self.state
            .lock()
            .packets_sent
            .pop()
            .expect("no packets have been sent")
    }

    /// Drain every sent packet, oldest first.
    pub fn take_packets(&self) -> Vec<(DeviceAddress, Vec<u8>)> {
        std::mem::take(&mut self.state.lock().packets_sent)
    }

    pub fn sent_packet_count(&self) -> usize {
        self.state.lock().packets_sent.len()
    }

    /// Messages handed to [`Device::process_message`], in arrival order.
    pub fn received_messages(&self) -> Vec<(SessionId, Vec<u8>)> {
        self.state.lock().messages.clone()
    }

    /// Delivery confirmations, in arrival order.
    pub fn delivered_messages(&self) -> Vec<MessageId> {
        self.state.lock().delivered.clone()
    }

    /// Sessions currently considered established (broken ones removed).
    pub fn sessions(&self) -> Vec<(SessionId, ContactId, DeviceAddress)> {
        self.state.lock().sessions.clone()
    }

    pub fn sessions_broken(&self) -> usize {
        self.state.lock().sessions_broken
    }

    /// Latest sync state pushed for `contact`; `Some(None)` after deletion.
    pub fn sync_state(&self, contact: &ContactId) -> Option<Option<Vec<u8>>> {
        self.state.lock().sync_state.get(contact).cloned()
    }

    pub fn pending_delay_actions(&self) -> usize {
        self.state.lock().delay_actions.len()
    }

    /// Deadline of the next delayed action, if any.
    pub fn next_delay_at(&self) -> Option<Duration> {
        self.state
            .lock()
            .delay_actions
            .iter()
            .map(|pending| pending.fire_at)
            .min()
    }

    /// Pop and execute the delayed action with the earliest deadline,
    /// advancing the clock to it.
    ///
    /// # Panics
    /// Panics when no action is queued.
    pub fn run_next_delay_action(&self) {
        let pending = {
            let mut state = self.state.lock();
            let index = state
                .delay_actions
                .iter()
                .enumerate()
                .min_by_key(|(_, pending)| (pending.fire_at, pending.seq))
                .map(|(index, _)| index)
                .expect("no delay actions queued");
            state.delay_actions.remove(index)
        };

        self.clock.advance_to(pending.fire_at);
        (pending.action)();
    }

    /// Execute delayed actions in deadline order until none remain.
    pub fn run_all_delay_actions(&self) {
        while self.pending_delay_actions() > 0 {
            self.run_next_delay_action();
        }
    }

    /// Every line the protocol logged, for debugging failed tests.
    pub fn log_lines(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }
}

impl Device for MockDevice {
    fn log(&self, message: &str) {
        self.state.lock().log.push(message.to_owned());
    }

    fn send_packet(&self, address: &DeviceAddress, packet: &[u8]) {
        self.state
            .lock()
            .packets_sent
            .push((address.clone(), packet.to_vec()));
    }

    fn max_packet_size(&self, _address: &DeviceAddress) -> Result<usize, ProtocolError> {
        Ok(self.state.lock().max_packet_size)
    }

    fn message_delivered(&self, message: MessageId) {
        self.state.lock().delivered.push(message);
    }

    fn process_message(&self, session: SessionId, message: &[u8]) {
        self.state.lock().messages.push((session, message.to_vec()));
    }

    fn reply_payload(&self, _session: SessionId, _contact: &ContactId) -> Option<Vec<u8>> {
        self.state.lock().reply_payload.clone()
    }

    fn session_established(
        &self,
        session: SessionId,
        contact: &ContactId,
        address: &DeviceAddress,
    ) {
        self.state
            .lock()
            .sessions
            .push((session, contact.clone(), address.clone()));
    }

    fn session_broken(&self, session: SessionId) {
        let mut state = self.state.lock();
        state.sessions_broken += 1;
        state.sessions.retain(|(id, _, _)| *id != session);
    }

    fn sync_state_changed(&self, contact: &ContactId, state: Option<&[u8]>) {
        self.state
            .lock()
            .sync_state
            .insert(contact.clone(), state.map(|s| s.to_vec()));
    }

    fn fill_random(&self, buf: &mut [u8]) {
        self.state.lock().rng.fill(buf);
    }

    fn fill_crypto_random(&self, buf: &mut [u8]) {
        self.state.lock().rng.fill(buf);
    }

    fn delay(&self, action: DelayedAction, duration: Duration) {
        let fire_at = self.clock.elapsed() + duration;
        let mut state = self.state.lock();
        let seq = state.next_action_seq;
        state.next_action_seq += 1;
        state.delay_actions.push(PendingAction {
            fire_at,
            seq,
            action,
        });
    }

    fn now(&self) -> Instant {
        self.base + self.clock.elapsed()
    }

    fn contacts(&self) -> &dyn ContactsContainer {
        &self.contacts
    }
}
