use shared::events::RuleChange;
use tokio::sync::broadcast;

const DEFAULT_CHANGE_CAPACITY: usize = 256;

/// Process-wide fan-out of rule changes. Clones share the underlying
/// channel. Every subscriber sees every change in publish order; dropping a
/// receiver is what unsubscribes it.
#[derive(Clone)]
pub struct ChangeBus {
    sender: broadcast::Sender<RuleChange>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuleChange> {
        self.sender.subscribe()
    }

    pub fn publish(&self, change: RuleChange) {
        let _ = self.sender.send(change);
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANGE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::domain::RuleId;

    #[tokio::test]
    async fn delivers_changes_in_publish_order() {
        let bus = ChangeBus::default();
        let mut receiver = bus.subscribe();

        bus.publish(RuleChange::Removed { id: RuleId(1) });
        bus.publish(RuleChange::Cleared);

        assert!(matches!(
            receiver.recv().await,
            Ok(RuleChange::Removed { id: RuleId(1) })
        ));
        assert!(matches!(receiver.recv().await, Ok(RuleChange::Cleared)));
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_fine() {
        let bus = ChangeBus::default();
        bus.publish(RuleChange::Cleared);
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_change() {
        let bus = ChangeBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(RuleChange::Removed { id: RuleId(9) });

        for receiver in [&mut first, &mut second] {
            assert!(matches!(
                receiver.recv().await,
                Ok(RuleChange::Removed { id: RuleId(9) })
            ));
        }
    }

    #[tokio::test]
    async fn subscribing_after_a_publish_misses_it() {
        let bus = ChangeBus::default();
        bus.publish(RuleChange::Cleared);

        let mut late = bus.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }
}
