use chatkey_shared::ids::{ChatId, KeyRecordId};
use serde::Serialize;

/// Key lifecycle notifications for UI collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangeEvent {
    /// A key became active and is installed in this client's cache.
    Activated { chat_id: ChatId, record_id: KeyRecordId },
    /// A record this client took part in was expired.
    Expired { chat_id: ChatId, record_id: KeyRecordId },
    /// Neither the relay nor the fallback poll completed the exchange
    /// before the pending record aged out.
    DeliveryFailed { chat_id: ChatId, record_id: KeyRecordId },
}

impl ExchangeEvent {
    pub fn chat_id(&self) -> ChatId {
        match self {
            ExchangeEvent::Activated { chat_id, .. }
            | ExchangeEvent::Expired { chat_id, .. }
            | ExchangeEvent::DeliveryFailed { chat_id, .. } => *chat_id,
        }
    }

    pub fn record_id(&self) -> KeyRecordId {
        match self {
            ExchangeEvent::Activated { record_id, .. }
            | ExchangeEvent::Expired { record_id, .. }
            | ExchangeEvent::DeliveryFailed { record_id, .. } => *record_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_snake_case_tag() {
        let event = ExchangeEvent::DeliveryFailed {
            chat_id: ChatId::new(),
            record_id: KeyRecordId::new(),
        };
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["type"], "delivery_failed");
    }

    #[test]
    fn accessors_return_ids() {
        let chat_id = ChatId::new();
        let record_id = KeyRecordId::new();
        let event = ExchangeEvent::Activated { chat_id, record_id };
        assert_eq!(event.chat_id(), chat_id);
        assert_eq!(event.record_id(), record_id);
    }
}
