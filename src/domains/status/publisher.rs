use super::alert::Alert;
use super::snapshot::StatusSnapshot;
use std::collections::VecDeque;
use tokio::sync::watch;

const DEFAULT_ALERT_HISTORY: usize = 50;

/// Publishes snapshots to any number of readers. Readers always see the
/// latest snapshot; intermediate ones may be skipped.
pub struct StatusPublisher {
    tx: watch::Sender<StatusSnapshot>,
    alerts: VecDeque<Alert>,
    history: usize,
}

impl StatusPublisher {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_ALERT_HISTORY)
    }

    pub fn with_history(history: usize) -> Self {
        let (tx, _rx) = watch::channel(StatusSnapshot::empty());
        Self {
            tx,
            alerts: VecDeque::new(),
            history: history.max(1),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.tx.subscribe()
    }

    pub fn raise(&mut self, alert: Alert) {
        self.alerts.push_front(alert);
        self.alerts.truncate(self.history);
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter()
    }

    /// Attach retained alerts and publish.
    pub fn publish(&self, mut snapshot: StatusSnapshot) {
        snapshot.alerts = self.alerts.iter().cloned().collect();
        self.tx.send_replace(snapshot);
    }

    pub fn latest(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::status::AlertKind;
    use chrono::Utc;

    #[test]
    fn subscribers_see_latest_snapshot_with_alerts() {
        let mut publisher = StatusPublisher::with_history(2);
        let rx = publisher.subscribe();
        for i in 0..3 {
            publisher.raise(Alert::warning(AlertKind::GrantUnavailable, format!("a{i}"), Utc::now()));
        }
        let mut snapshot = StatusSnapshot::empty();
        snapshot.queue_depth = 7;
        publisher.publish(snapshot);

        let seen = rx.borrow().clone();
        assert_eq!(seen.queue_depth, 7);
        assert_eq!(seen.alerts.len(), 2);
        assert_eq!(seen.alerts[0].message, "a2");
    }
}
