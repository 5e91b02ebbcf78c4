//! Lossless fan-out of events to any number of listeners

use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Every listener gets its own unbounded queue, so a burst of events is
/// never dropped because a listener has not been polled yet.
pub(crate) struct Listeners<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Listeners<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.senders.lock().push(sender);
        receiver
    }

    /// Deliver to every live listener, forgetting the ones that hung up
    pub fn emit(&self, event: T) {
        self.senders
            .lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}
