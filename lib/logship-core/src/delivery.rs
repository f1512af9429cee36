use tokio::sync::oneshot;

/// Final outcome of an entry handed to a client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// The entry reached its destination.
    Delivered,

    /// The entry was given up on, whether due to exhausted retries, rejection, or the client stopping.
    Dropped,
}

/// Resolves a [`DeliveryReceipt`].
///
/// Dropping an unresolved acknowledgement resolves its receipt as [`Delivery::Dropped`].
#[derive(Debug)]
pub struct DeliveryAck(oneshot::Sender<Delivery>);

impl DeliveryAck {
    /// Marks the entry as delivered.
    pub fn delivered(self) {
        let _ = self.0.send(Delivery::Delivered);
    }

    /// Marks the entry as dropped.
    pub fn dropped(self) {
        let _ = self.0.send(Delivery::Dropped);
    }
}

#[derive(Debug)]
enum ReceiptState {
    Ready(Delivery),
    Pending(oneshot::Receiver<Delivery>),
}

/// Tracks the outcome of a single entry.
#[derive(Debug)]
pub struct DeliveryReceipt(ReceiptState);

impl DeliveryReceipt {
    /// Creates a receipt that is already resolved as delivered.
    pub fn delivered() -> Self {
        Self(ReceiptState::Ready(Delivery::Delivered))
    }

    /// Creates a pending receipt along with the acknowledgement that resolves it.
    pub fn pending() -> (DeliveryAck, Self) {
        let (tx, rx) = oneshot::channel();
        (DeliveryAck(tx), Self(ReceiptState::Pending(rx)))
    }

    /// Waits for the outcome of the entry.
    ///
    /// This method is cancel-safe, and may be called again after it has resolved.
    pub async fn wait(&mut self) -> Delivery {
        match &mut self.0 {
            ReceiptState::Ready(delivery) => *delivery,
            ReceiptState::Pending(rx) => {
                let delivery = rx.await.unwrap_or(Delivery::Dropped);
                self.0 = ReceiptState::Ready(delivery);
                delivery
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acknowledgement_resolves_the_receipt() {
        let (ack, mut receipt) = DeliveryReceipt::pending();
        ack.delivered();
        assert_eq!(receipt.wait().await, Delivery::Delivered);
        assert_eq!(receipt.wait().await, Delivery::Delivered);
    }

    #[tokio::test]
    async fn unresolved_acknowledgement_counts_as_dropped() {
        let (ack, mut receipt) = DeliveryReceipt::pending();
        drop(ack);
        assert_eq!(receipt.wait().await, Delivery::Dropped);
    }
}
