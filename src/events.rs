use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Domain events emitted by the engine. Notification delivery is an external
/// concern; subscribers that fall behind lose events rather than backpressure
/// the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    JobSucceeded {
        job_id: Uuid,
        business_id: Uuid,
        #[serde(with = "rust_decimal::serde::float")]
        amount: Decimal,
        correlation_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        business_id: Uuid,
        reason: String,
    },
    BalanceUpdated {
        business_id: Uuid,
        #[serde(with = "rust_decimal::serde::float")]
        escrow_balance: Decimal,
    },
    TransactionPosted {
        correlation_id: Uuid,
    },
    WindowSettled {
        window_id: Uuid,
        processed: usize,
        failed: usize,
    },
    AccountFrozen {
        business_id: Uuid,
        #[serde(with = "rust_decimal::serde::float")]
        delta: Decimal,
    },
}

/// Broadcast-based event bus. Sending never blocks and never fails the
/// caller; a send with no subscribers is a no-op.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: DomainEvent) {
        // Receivers lagging or absent is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(DomainEvent::BalanceUpdated {
            business_id: Uuid::new_v4(),
            escrow_balance: dec!(100.00),
        });

        match rx.recv().await.unwrap() {
            DomainEvent::BalanceUpdated { escrow_balance, .. } => {
                assert_eq!(escrow_balance, dec!(100.00));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_noop() {
        let bus = EventBus::new(16);
        bus.emit(DomainEvent::TransactionPosted {
            correlation_id: Uuid::new_v4(),
        });
    }
}
