//! Deterministic in-process bridge
//!
//! Messages sit in a FIFO queue until the driver calls [`MockBridge::deliver_next`]
//! or [`MockBridge::deliver_all`], so latency is entirely under test control.
//! Each message is attempted at most once.

use super::{Bridge, BridgeError, BridgeReceiver, BridgeStatus, DeliveredMessage, Envelope};
use crate::error::fmt_id;
use crate::lending::MessageId;

use dashmap::DashMap;
use ethers::types::{Address, H256, U256};
use sha3::{Digest, Keccak256};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, Weak};
use tracing::{debug, info, warn};

pub struct MockBridge {
    fee: U256,
    /// (source selector, source token) -> destination token
    routes: DashMap<(u64, Address), Address>,
    receivers: DashMap<u64, Weak<dyn BridgeReceiver>>,
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    /// Next sequence number per (source selector, sending contract)
    sequences: HashMap<(u64, Address), u64>,
    queue: VecDeque<Queued>,
    statuses: HashMap<MessageId, BridgeStatus>,
}

struct Queued {
    destination_chain_selector: u64,
    message: DeliveredMessage,
}

impl MockBridge {
    /// Bridge charging a flat `fee` per message
    pub fn new(fee: U256) -> Self {
        Self {
            fee,
            routes: DashMap::new(),
            receivers: DashMap::new(),
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Register the chain that receives messages addressed to `selector`
    pub fn register(&self, selector: u64, receiver: Weak<dyn BridgeReceiver>) {
        self.receivers.insert(selector, receiver);
    }

    /// Allow `source_token` on `source_chain_selector` to arrive as `destination_token`
    pub fn add_route(&self, source_chain_selector: u64, source_token: Address, destination_token: Address) {
        self.routes
            .insert((source_chain_selector, source_token), destination_token);
    }

    pub fn pending_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Deliver the oldest queued message, if any
    pub fn deliver_next(&self) -> Option<MessageId> {
        // Never hold the queue lock while calling into a receiver
        let queued = self.lock().queue.pop_front()?;
        let message_id = queued.message.message_id;

        let receiver = self
            .receivers
            .get(&queued.destination_chain_selector)
            .and_then(|r| r.upgrade());

        let status = match receiver {
            Some(receiver) => match receiver.receive(queued.message) {
                Ok(()) => {
                    info!("Delivered message {}", fmt_id(&message_id));
                    BridgeStatus::Delivered
                }
                Err(reason) => {
                    warn!("Message {} dropped at destination: {}", fmt_id(&message_id), reason);
                    BridgeStatus::Failed
                }
            },
            None => {
                warn!(
                    "Message {} dropped: selector {} has no live receiver",
                    fmt_id(&message_id),
                    queued.destination_chain_selector
                );
                BridgeStatus::Failed
            }
        };

        self.lock().statuses.insert(message_id, status);
        Some(message_id)
    }

    /// Drain the queue in submission order
    pub fn deliver_all(&self) -> Vec<MessageId> {
        std::iter::from_fn(|| self.deliver_next()).collect()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Bridge for MockBridge {
    fn fee(&self, _envelope: &Envelope) -> U256 {
        self.fee
    }

    fn submit(&self, envelope: Envelope) -> Result<MessageId, BridgeError> {
        if !self.receivers.contains_key(&envelope.destination_chain_selector) {
            return Err(BridgeError::UnknownDestination(
                envelope.destination_chain_selector,
            ));
        }

        let token_amount = match envelope.token_amount {
            Some((token, amount)) => {
                let routed = self
                    .routes
                    .get(&(envelope.source_chain_selector, token))
                    .map(|r| *r)
                    .ok_or(BridgeError::UnroutedToken {
                        source_chain_selector: envelope.source_chain_selector,
                        token,
                    })?;
                Some((routed, amount))
            }
            None => None,
        };

        let mut state = self.lock();
        let sequence = state
            .sequences
            .entry((envelope.source_chain_selector, envelope.sender))
            .or_insert(0);
        *sequence += 1;
        let message_id = message_id(envelope.source_chain_selector, envelope.sender, *sequence);

        debug!(
            "Queued message {} from {:?} to selector {}",
            fmt_id(&message_id),
            envelope.sender,
            envelope.destination_chain_selector
        );

        state.statuses.insert(message_id, BridgeStatus::Pending);
        state.queue.push_back(Queued {
            destination_chain_selector: envelope.destination_chain_selector,
            message: DeliveredMessage {
                message_id,
                source_chain_selector: envelope.source_chain_selector,
                sender: envelope.sender,
                receiver: envelope.receiver,
                token_amount,
                payload: envelope.payload,
            },
        });

        Ok(message_id)
    }

    fn status(&self, message_id: &MessageId) -> BridgeStatus {
        self.lock()
            .statuses
            .get(message_id)
            .copied()
            .unwrap_or(BridgeStatus::Unknown)
    }
}

/// keccak256(selector || sender || sequence)
fn message_id(source_chain_selector: u64, sender: Address, sequence: u64) -> MessageId {
    let mut hasher = Keccak256::new();
    hasher.update(source_chain_selector.to_be_bytes());
    hasher.update(sender.as_bytes());
    hasher.update(sequence.to_be_bytes());
    H256::from_slice(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Payload;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<DeliveredMessage>>,
    }

    impl BridgeReceiver for Recorder {
        fn receive(&self, message: DeliveredMessage) -> Result<(), String> {
            self.seen.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn envelope(sender: Address, token: Option<(Address, U256)>) -> Envelope {
        Envelope {
            source_chain_selector: 1,
            sender,
            destination_chain_selector: 2,
            receiver: Address::repeat_byte(0xee),
            token_amount: token,
            payload: Payload::Deposit {
                depositor: Address::repeat_byte(0xdd),
            },
        }
    }

    fn setup() -> (MockBridge, Arc<Recorder>) {
        let bridge = MockBridge::new(U256::from(10));
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn BridgeReceiver> = Arc::downgrade(&recorder) as Weak<dyn BridgeReceiver>;
        bridge.register(2, weak);
        (bridge, recorder)
    }

    #[test]
    fn test_per_sender_order_and_single_delivery() {
        let (bridge, recorder) = setup();
        let a = Address::repeat_byte(0xa);
        let b = Address::repeat_byte(0xb);

        let a1 = bridge.submit(envelope(a, None)).unwrap();
        let b1 = bridge.submit(envelope(b, None)).unwrap();
        let a2 = bridge.submit(envelope(a, None)).unwrap();
        assert_ne!(a1, a2);
        assert_eq!(bridge.status(&a1), BridgeStatus::Pending);
        assert!(recorder.seen.lock().unwrap().is_empty());

        assert_eq!(bridge.deliver_all(), vec![a1, b1, a2]);
        assert!(bridge.deliver_all().is_empty());

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        let from_a: Vec<_> = seen.iter().filter(|m| m.sender == a).map(|m| m.message_id).collect();
        assert_eq!(from_a, vec![a1, a2]);
        assert_eq!(bridge.status(&a2), BridgeStatus::Delivered);
    }

    #[test]
    fn test_ids_are_deterministic() {
        let (first, _r1) = setup();
        let (second, _r2) = setup();
        let sender = Address::repeat_byte(0xa);
        assert_eq!(
            first.submit(envelope(sender, None)).unwrap(),
            second.submit(envelope(sender, None)).unwrap()
        );
    }

    #[test]
    fn test_token_routing() {
        let (bridge, recorder) = setup();
        let src = Address::repeat_byte(0x51);
        let dst = Address::repeat_byte(0xd5);
        let sender = Address::repeat_byte(0xa);

        let err = bridge
            .submit(envelope(sender, Some((src, U256::from(5)))))
            .unwrap_err();
        assert!(matches!(err, BridgeError::UnroutedToken { .. }));

        bridge.add_route(1, src, dst);
        bridge
            .submit(envelope(sender, Some((src, U256::from(5)))))
            .unwrap();
        bridge.deliver_all();
        assert_eq!(
            recorder.seen.lock().unwrap()[0].token_amount,
            Some((dst, U256::from(5)))
        );
    }

    #[test]
    fn test_dropped_receiver_fails_message() {
        let (bridge, recorder) = setup();
        let id = bridge.submit(envelope(Address::repeat_byte(0xa), None)).unwrap();
        drop(recorder);

        bridge.deliver_all();
        assert_eq!(bridge.status(&id), BridgeStatus::Failed);
        assert_eq!(bridge.status(&H256::zero()), BridgeStatus::Unknown);
    }

    #[test]
    fn test_unknown_destination() {
        let bridge = MockBridge::new(U256::zero());
        let err = bridge.submit(envelope(Address::zero(), None)).unwrap_err();
        assert_eq!(err, BridgeError::UnknownDestination(2));
    }
}
