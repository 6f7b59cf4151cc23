use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

/// Fan-out of events to any number of channel subscribers.
///
/// Emission is synchronous and never blocks: channels are unbounded and
/// subscribers whose receiver was dropped are pruned on the next emit.
pub struct Emitter<T> {
    senders: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> Emitter<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = crossbeam_channel::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: T) {
        let mut senders = self.senders.lock();
        if senders.is_empty() {
            return;
        }
        senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn has_subscribers(&self) -> bool {
        !self.senders.lock().is_empty()
    }
}

impl<T: Clone> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("subscribers", &self.senders.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let emitter = Emitter::new();
        let rx1 = emitter.subscribe();
        let rx2 = emitter.subscribe();
        drop(rx2);

        emitter.emit(1u32);
        emitter.emit(2u32);

        assert_eq!(rx1.try_iter().collect::<Vec<_>>(), vec![1, 2]);
        assert!(emitter.has_subscribers());
        drop(rx1);
        emitter.emit(3);
        assert!(!emitter.has_subscribers());
    }
}
