use std::sync::mpsc::{channel, Receiver, Sender};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// `current` was replaced (preview, commit, undo, redo, load, reset).
    ImageChanged,
    /// The timeline or its cursor changed.
    HistoryChanged,
    /// A recoverable failure; the session state is unchanged.
    Error(String),
}

/// Fan-out of events to any number of channel subscribers.
///
/// Subscribers whose receiver has been dropped are pruned on the next send.
pub struct EventBus<E> {
    subscribers: Vec<Sender<E>>,
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn subscribe(&mut self) -> Receiver<E> {
        let (tx, rx) = channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: E) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventBus, SessionEvent};

    #[test]
    fn dropped_receivers_are_pruned() {
        let mut bus = EventBus::default();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.emit(SessionEvent::ImageChanged);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(kept.try_recv(), Ok(SessionEvent::ImageChanged));
    }
}
