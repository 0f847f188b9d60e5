use tokio::sync::watch;

pub type StateReceiver<T> = watch::Receiver<T>;

/// Multicast state cell. Late subscribers see the current value
/// immediately; each subscriber observes later transitions in order.
#[derive(Clone)]
pub struct StateCell<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> StateCell<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn subscribe(&self) -> StateReceiver<T> {
        self.tx.subscribe()
    }

    pub fn publish(&self, value: T) {
        // send_replace stores the value even while nobody subscribes;
        // send would drop it once the initial receiver is gone.
        self.tx.send_replace(value);
    }

    pub fn current(&self) -> T {
        self.tx.borrow().clone()
    }
}
