use tokio::sync::{broadcast, mpsc};

/// Shutdown is a broadcast everyone listens to, paired with an mpsc channel
/// whose senders are held by the receivers. When the last receiver drops,
/// the waiter unblocks and main knows every worker has drained.
pub fn channel() -> (Sender, Receiver) {
    let (broadcast_tx, _) = broadcast::channel(1);

    let (alive_tx, alive_rx) = mpsc::channel(1);
    let waiter = DrainWaiter(alive_rx);

    let s = Sender {
        sender: broadcast_tx.clone(),
        waiter,
    };
    let r = Receiver::new(broadcast_tx, alive_tx);

    (s, r)
}

pub struct DrainWaiter(mpsc::Receiver<()>);

impl DrainWaiter {
    pub async fn wait(mut self) {
        let _ = self.0.recv().await;
    }
}

pub struct Sender {
    sender: broadcast::Sender<()>,
    waiter: DrainWaiter,
}

impl Sender {
    pub fn send(self) -> DrainWaiter {
        let _ = self.sender.send(());
        self.waiter
    }
}

#[derive(Debug)]
pub struct Receiver {
    sender: broadcast::Sender<()>,
    receiver: broadcast::Receiver<()>,
    _alive_marker: mpsc::Sender<()>,
}

impl Receiver {
    fn new(sender: broadcast::Sender<()>, alive_marker: mpsc::Sender<()>) -> Self {
        Self {
            receiver: sender.subscribe(),
            sender,
            _alive_marker: alive_marker,
        }
    }

    pub async fn recv(&mut self) {
        let _ = self.receiver.recv().await;
    }
}

impl Clone for Receiver {
    fn clone(&self) -> Self {
        Self {
            receiver: self.sender.subscribe(),
            sender: self.sender.clone(),
            _alive_marker: self._alive_marker.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn signal_reaches_every_clone() {
        let (tx, rx) = super::channel();
        let mut rx2 = rx.clone();
        let mut rx1 = rx;

        let waiter = tx.send();

        timeout(Duration::from_secs(1), rx1.recv()).await.unwrap();
        timeout(Duration::from_secs(1), rx2.recv()).await.unwrap();

        drop(rx1);
        drop(rx2);

        timeout(Duration::from_secs(1), waiter.wait()).await.unwrap();
    }
}
