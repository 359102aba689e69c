//! Bridge-relevant contract events and log parsing
//!
//! Only the events the coordinator reasons about are decoded: a ledger or vault
//! handing a message to the bridge (`MessageSent`) and a contract accepting a
//! delivered message (`MessageReceived`). Everything else is kept as `Unknown`.

use crate::lending::MessageId;

use ethers::types::{Log, H256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Events carried on a [`crate::chain::Receipt`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    /// A contract submitted a message to the bridge
    MessageSent {
        message_id: MessageId,
        destination_chain_selector: u64,
    },

    /// A contract accepted a message delivered by the bridge
    MessageReceived {
        message_id: MessageId,
        source_chain_selector: u64,
    },

    /// Anything else
    Unknown { topic: H256 },
}

impl ChainEvent {
    /// Get event name for metrics and logs
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::MessageSent { .. } => "message_sent",
            ChainEvent::MessageReceived { .. } => "message_received",
            ChainEvent::Unknown { .. } => "unknown",
        }
    }

    /// Message id if this is an outbound bridge message
    pub fn sent_message_id(&self) -> Option<MessageId> {
        match self {
            ChainEvent::MessageSent { message_id, .. } => Some(*message_id),
            _ => None,
        }
    }
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use super::signature_topic;
    use ethers::types::H256;
    use lazy_static::lazy_static;

    lazy_static! {
        pub static ref MESSAGE_SENT: H256 = signature_topic(
            "MessageSent(bytes32,uint64,address,address,(address,uint256),uint256)"
        );
        pub static ref MESSAGE_RECEIVED: H256 = signature_topic(
            "MessageReceived(bytes32,uint64,address,address,(address,uint256))"
        );
    }
}

/// keccak256 of an event signature
pub fn signature_topic(signature: &str) -> H256 {
    H256::from_slice(&Keccak256::digest(signature.as_bytes()))
}

/// Parser for vault and ledger logs
pub struct EventParser;

impl EventParser {
    /// Parse a log entry into a ChainEvent
    pub fn parse_log(log: &Log) -> ChainEvent {
        let topic = log.topics.first().copied().unwrap_or_default();

        // Both events index (messageId, chainSelector) as topics 1 and 2
        let indexed = (log.topics.get(1), log.topics.get(2));

        match indexed {
            (Some(id), Some(selector)) if topic == *topics::MESSAGE_SENT => {
                ChainEvent::MessageSent {
                    message_id: *id,
                    destination_chain_selector: selector_from_topic(selector),
                }
            }
            (Some(id), Some(selector)) if topic == *topics::MESSAGE_RECEIVED => {
                ChainEvent::MessageReceived {
                    message_id: *id,
                    source_chain_selector: selector_from_topic(selector),
                }
            }
            _ => ChainEvent::Unknown { topic },
        }
    }

    pub fn parse_logs(logs: &[Log]) -> Vec<ChainEvent> {
        logs.iter().map(Self::parse_log).collect()
    }
}

/// uint64 topics are right-aligned in the 32-byte word
fn selector_from_topic(topic: &H256) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&topic.as_bytes()[24..32]);
    u64::from_be_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector_topic(selector: u64) -> H256 {
        let mut word = [0u8; 32];
        word[24..].copy_from_slice(&selector.to_be_bytes());
        H256::from(word)
    }

    #[test]
    fn test_parse_message_sent() {
        let id = H256::repeat_byte(7);
        let log = Log {
            topics: vec![*topics::MESSAGE_SENT, id, selector_topic(14767482510784806043)],
            ..Default::default()
        };

        assert_eq!(
            EventParser::parse_log(&log),
            ChainEvent::MessageSent {
                message_id: id,
                destination_chain_selector: 14767482510784806043,
            }
        );
    }

    #[test]
    fn test_unrelated_log_is_unknown() {
        let transfer = signature_topic("Transfer(address,address,uint256)");
        let log = Log {
            topics: vec![transfer],
            ..Default::default()
        };
        let event = EventParser::parse_log(&log);
        assert_eq!(event.name(), "unknown");
        assert_eq!(event.sent_message_id(), None);
    }

    #[test]
    fn test_topic_is_keccak_of_signature() {
        // Well-known ERC-20 Transfer topic
        assert_eq!(
            format!("{:?}", signature_topic("Transfer(address,address,uint256)")),
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        );
    }
}
