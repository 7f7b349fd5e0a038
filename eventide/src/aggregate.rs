//! Aggregates: state rebuilt by folding a stream.

use crate::event::{DomainEvent, NewEvent};
use crate::metadata::EventMetadata;
use crate::types::{AggregateId, EventVersion, PartitionKey, StreamKey};

/// Domain state reconstructed from events.
///
/// `Default` is the state before the first event; `apply` must be a pure
/// fold so that replaying a stream always yields the same state.
pub trait Aggregate: Default + Send + Sync + 'static {
    /// The events this aggregate produces and consumes.
    type Event: DomainEvent;

    /// Folds one event into the state.
    fn apply(&mut self, event: &Self::Event);
}

/// An aggregate instance loaded for the duration of one command.
///
/// Carries the stream identity, the version the stream had when it was
/// loaded, and the events recorded since, which [`crate::Repository::save`]
/// appends with that version as the expected version.
#[derive(Debug, Clone)]
pub struct AggregateRoot<A: Aggregate> {
    stream: StreamKey,
    version: EventVersion,
    state: A,
    uncommitted: Vec<NewEvent<A::Event>>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate for a stream that has no events yet.
    pub fn new(aggregate_id: AggregateId, partition_key: PartitionKey) -> Self {
        Self {
            stream: StreamKey::new(aggregate_id, partition_key),
            version: EventVersion::initial(),
            state: A::default(),
            uncommitted: Vec::new(),
        }
    }

    /// Rebuilds an aggregate by folding `events` in order.
    pub fn from_history<'e>(
        stream: StreamKey,
        version: EventVersion,
        events: impl IntoIterator<Item = &'e A::Event>,
    ) -> Self {
        let mut state = A::default();
        for event in events {
            state.apply(event);
        }
        Self {
            stream,
            version,
            state,
            uncommitted: Vec::new(),
        }
    }

    /// Applies `event` to the state and buffers it for the next save.
    pub fn record(&mut self, event: A::Event) {
        self.record_with_metadata(event, EventMetadata::default());
    }

    /// Like [`AggregateRoot::record`], attaching actor and correlation metadata.
    pub fn record_with_metadata(&mut self, event: A::Event, metadata: EventMetadata) {
        self.state.apply(&event);
        self.uncommitted.push(NewEvent::with_metadata(event, metadata));
    }

    /// The aggregate id.
    pub const fn id(&self) -> &AggregateId {
        &self.stream.aggregate_id
    }

    /// The partition key.
    pub const fn partition_key(&self) -> &PartitionKey {
        &self.stream.partition_key
    }

    /// The stream this aggregate is folded from.
    pub const fn stream(&self) -> &StreamKey {
        &self.stream
    }

    /// The committed stream version (the version at load time until saved).
    pub const fn version(&self) -> EventVersion {
        self.version
    }

    /// Current domain state, including uncommitted events.
    pub const fn state(&self) -> &A {
        &self.state
    }

    /// Events recorded since the last load or save.
    pub fn uncommitted_events(&self) -> &[NewEvent<A::Event>] {
        &self.uncommitted
    }

    /// Whether there is anything to save.
    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub(crate) fn take_uncommitted(&mut self) -> Vec<NewEvent<A::Event>> {
        std::mem::take(&mut self.uncommitted)
    }

    pub(crate) fn restore_uncommitted(&mut self, events: Vec<NewEvent<A::Event>>) {
        self.uncommitted = events;
    }

    pub(crate) fn mark_committed(&mut self, version: EventVersion) {
        self.version = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventType;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum CounterEvent {
        Incremented(u32),
        Reset,
    }

    impl DomainEvent for CounterEvent {
        fn event_type(&self) -> EventType {
            match self {
                Self::Incremented(_) => EventType::of("Incremented"),
                Self::Reset => EventType::of("Reset"),
            }
        }
    }

    #[derive(Debug, Default)]
    struct Counter {
        total: u32,
    }

    impl Aggregate for Counter {
        type Event = CounterEvent;

        fn apply(&mut self, event: &CounterEvent) {
            match event {
                CounterEvent::Incremented(by) => self.total += by,
                CounterEvent::Reset => self.total = 0,
            }
        }
    }

    fn root() -> AggregateRoot<Counter> {
        AggregateRoot::new(
            AggregateId::try_new("counter-1").unwrap(),
            PartitionKey::try_new("p").unwrap(),
        )
    }

    #[test]
    fn record_applies_and_buffers() {
        let mut counter = root();
        counter.record(CounterEvent::Incremented(2));
        counter.record(CounterEvent::Incremented(3));
        assert_eq!(counter.state().total, 5);
        assert_eq!(counter.uncommitted_events().len(), 2);
        assert_eq!(counter.version(), EventVersion::initial());
    }

    #[test]
    fn from_history_folds_in_order() {
        let events = [
            CounterEvent::Incremented(4),
            CounterEvent::Reset,
            CounterEvent::Incremented(1),
        ];
        let counter = AggregateRoot::<Counter>::from_history(
            root().stream().clone(),
            EventVersion::initial().advance(3),
            events.iter(),
        );
        assert_eq!(counter.state().total, 1);
        assert_eq!(counter.version().value(), 3);
        assert!(!counter.has_changes());
    }

    #[test]
    fn commit_clears_the_buffer_and_moves_the_version() {
        let mut counter = root();
        counter.record(CounterEvent::Incremented(1));
        let pending = counter.take_uncommitted();
        counter.mark_committed(EventVersion::initial().advance(pending.len()));
        assert!(!counter.has_changes());
        assert_eq!(counter.version().value(), 1);
    }
}
