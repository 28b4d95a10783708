use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use domstore_types::{StorageKey, StorageValue};

/// Mutation notification delivered to area observers.
///
/// `source` is the opaque tag the mutating caller passed along.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AreaEvent {
    KeyAdded {
        key: StorageKey,
        value: StorageValue,
        source: String,
    },
    KeyChanged {
        key: StorageKey,
        new_value: StorageValue,
        old_value: StorageValue,
        source: String,
    },
    KeyDeleted {
        key: StorageKey,
        old_value: StorageValue,
        source: String,
    },
    AllDeleted {
        source: String,
    },
}

impl AreaEvent {
    pub fn source(&self) -> &str {
        match self {
            Self::KeyAdded { source, .. }
            | Self::KeyChanged { source, .. }
            | Self::KeyDeleted { source, .. }
            | Self::AllDeleted { source } => source,
        }
    }
}

/// Receiving end handed to an observer.
pub type ObserverStream = mpsc::UnboundedReceiver<AreaEvent>;

/// Identifies the area an observer was registered through, so that the
/// observers of one area can follow it when its map is forked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverOwner(u64);

impl ObserverOwner {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

struct Observer {
    owner: ObserverOwner,
    sender: mpsc::UnboundedSender<AreaEvent>,
}

/// Fan-out of area events to observers.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Observer>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer and return its stream.
    pub fn add(&mut self, owner: ObserverOwner) -> ObserverStream {
        let (sender, rx) = mpsc::unbounded_channel();
        self.observers.push(Observer { owner, sender });
        rx
    }

    /// Deliver `event` to every observer.
    /// Observers whose streams were dropped are pruned.
    pub fn dispatch(&mut self, event: &AreaEvent) {
        self.observers
            .retain(|observer| observer.sender.send(event.clone()).is_ok());
    }

    /// Remove and return the observers registered by `owner`.
    pub fn take_owned_by(&mut self, owner: ObserverOwner) -> ObserverSet {
        let (taken, kept): (Vec<Observer>, Vec<Observer>) = std::mem::take(&mut self.observers)
            .into_iter()
            .partition(|observer| observer.owner == owner);
        self.observers = kept;
        ObserverSet { observers: taken }
    }

    /// Move every observer of `other` into this set.
    pub fn extend(&mut self, other: ObserverSet) {
        self.observers.extend(other.observers);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_deleted(source: &str) -> AreaEvent {
        AreaEvent::AllDeleted {
            source: source.into(),
        }
    }

    #[test]
    fn dispatch_reaches_every_observer() {
        let mut set = ObserverSet::new();
        let mut a = set.add(ObserverOwner::new(1));
        let mut b = set.add(ObserverOwner::new(2));
        set.dispatch(&all_deleted("tab"));
        assert_eq!(a.try_recv().unwrap().source(), "tab");
        assert_eq!(b.try_recv().unwrap(), all_deleted("tab"));
    }

    #[test]
    fn dropped_streams_are_pruned() {
        let mut set = ObserverSet::new();
        let _kept = set.add(ObserverOwner::new(1));
        drop(set.add(ObserverOwner::new(1)));
        assert_eq!(set.len(), 2);
        set.dispatch(&all_deleted("x"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn observers_move_with_their_owner() {
        let mut set = ObserverSet::new();
        let mut mine = set.add(ObserverOwner::new(7));
        let mut theirs = set.add(ObserverOwner::new(8));

        let mut moved = set.take_owned_by(ObserverOwner::new(7));
        assert_eq!(moved.len(), 1);
        assert_eq!(set.len(), 1);

        moved.dispatch(&all_deleted("fork"));
        assert!(mine.try_recv().is_ok());
        assert!(theirs.try_recv().is_err());

        set.extend(moved);
        assert_eq!(set.len(), 2);
    }
}
