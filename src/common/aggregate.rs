use crate::common::{DomainEvent, DomainResult};
use serde::{Deserialize, Serialize};

/// Event-sourced state. Commands go through `record`, replay goes through
/// `apply`; both bump the version by exactly one per event.
pub trait AggregateRoot: Send + Sync + Clone {
    type Event: DomainEvent + Serialize + for<'de> Deserialize<'de>;

    fn aggregate_id(&self) -> &str;
    fn version(&self) -> u64;

    fn apply(&mut self, event: &Self::Event) -> DomainResult<()>;

    /// Events recorded since the last `take_uncommitted`, oldest first.
    fn pending_mut(&mut self) -> &mut Vec<Self::Event>;

    fn record(&mut self, event: Self::Event) -> DomainResult<()> {
        self.apply(&event)?;
        self.pending_mut().push(event);
        Ok(())
    }

    fn take_uncommitted(&mut self) -> Vec<Self::Event> {
        std::mem::take(self.pending_mut())
    }

    /// Rebuild state from a snapshot (or a fresh aggregate) plus the
    /// events stored after it.
    fn replay<I>(mut base: Self, events: I) -> DomainResult<Self>
    where
        I: IntoIterator<Item = Self::Event>,
    {
        for event in events {
            base.apply(&event)?;
        }
        Ok(base)
    }
}
