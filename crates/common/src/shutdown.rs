use tokio::sync::watch;

/// Single-writer, many-reader shutdown flag. Components hold a clone and
/// either poll `is_signalled` at admission points or `wait` inside their
/// serve loops.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn signal(&self) {
        // Receivers may all have been dropped already; that is fine.
        let _ = self.tx.send(true);
    }

    pub fn is_signalled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // wait_for only errors when the sender is dropped, and we hold it.
        let _ = rx.wait_for(|signalled| *signalled).await;
    }
}
