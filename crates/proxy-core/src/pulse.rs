use tokio::sync::watch;

/// Level-triggered coordination signal with per-listener consumption.
///
/// The engine raises a pulse to mark a milestone (a sync round finished, a
/// task was enqueued, a fetch iteration completed). Listeners each track
/// which emissions they have already observed, so concurrent observers never
/// steal wake-ups from one another.
#[derive(Debug, Clone)]
pub struct Pulse {
    tx: watch::Sender<u64>,
}

impl Pulse {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(0),
        }
    }

    /// Raise the pulse, waking every listener currently waiting.
    pub fn emit(&self) {
        self.tx.send_modify(|count| *count = count.wrapping_add(1));
    }

    /// Create a listener that observes emissions from this point on.
    ///
    /// Emissions that happened before the subscription are not reported.
    pub fn subscribe(&self) -> PulseListener {
        let mut rx = self.tx.subscribe();
        let seen = *rx.borrow_and_update();
        PulseListener { rx, seen }
    }
}

impl Default for Pulse {
    fn default() -> Self {
        Self::new()
    }
}

/// One observer of a [`Pulse`].
#[derive(Debug)]
pub struct PulseListener {
    rx: watch::Receiver<u64>,
    seen: u64,
}

impl PulseListener {
    /// Suspend until the pulse has been emitted at least once since this
    /// listener last returned from `wait`.
    ///
    /// Emissions that happened in between two waits are coalesced into a
    /// single return; a listener never misses them, and never observes the
    /// same emission twice.
    pub async fn wait(&mut self) {
        loop {
            let current = *self.rx.borrow_and_update();
            if current != self.seen {
                self.seen = current;
                return;
            }
            if self.rx.changed().await.is_err() {
                // The pulse was dropped; it can never fire again.
                std::future::pending::<()>().await;
            }
        }
    }
}
