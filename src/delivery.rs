// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

/// 画面投递通道 (pipeline → display)
///
/// Single-slot, latest-value hand-off. Publishing never blocks: if the
/// consumer has not taken the previous item it is replaced by the new one.
/// Built on a `bounded(1)` crossbeam channel whose publisher keeps its own
/// receiver to evict the stale item.
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::time::Duration;

use crate::frame::{AnnotatedFrame, DetectionSet};

/// What the display consumer receives for each processed frame.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub frame: AnnotatedFrame,
    pub detections: DetectionSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The slot was empty.
    Delivered,
    /// An undrained item was overwritten.
    Replaced,
}

/// Publisher side, owned by the pipeline.
#[derive(Debug, Clone)]
pub struct DeliveryChannel {
    tx: Sender<Delivery>,
    evict: Receiver<Delivery>,
}

/// Consumer side. Clones share the same slot.
#[derive(Debug, Clone)]
pub struct DeliveryReceiver {
    rx: Receiver<Delivery>,
}

impl Default for DeliveryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryChannel {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, evict: rx }
    }

    pub fn receiver(&self) -> DeliveryReceiver {
        DeliveryReceiver {
            rx: self.evict.clone(),
        }
    }

    /// Puts `item` in the slot, replacing whatever is there.
    pub fn publish(&self, item: Delivery) -> PublishOutcome {
        let mut item = item;
        let mut outcome = PublishOutcome::Delivered;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return outcome,
                Err(TrySendError::Full(back)) => {
                    // the consumer may win the race for the stale item; retry either way
                    if self.evict.try_recv().is_ok() {
                        outcome = PublishOutcome::Replaced;
                    }
                    item = back;
                }
                // unreachable while `evict` is alive
                Err(TrySendError::Disconnected(_)) => return outcome,
            }
        }
    }

    /// Drops any undelivered item.
    pub fn clear(&self) {
        while self.evict.try_recv().is_ok() {}
    }
}

impl DeliveryReceiver {
    /// Takes the current item, if any.
    pub fn try_latest(&self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Waits up to `timeout` for an item.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Delivery> {
        self.rx.recv_timeout(timeout).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn item(index: u64) -> Delivery {
        Delivery {
            frame: AnnotatedFrame::new(index, RgbImage::new(2, 2)),
            detections: DetectionSet::empty(),
        }
    }

    #[test]
    fn test_latest_value_wins() {
        let channel = DeliveryChannel::new();
        let rx = channel.receiver();

        assert_eq!(channel.publish(item(0)), PublishOutcome::Delivered);
        assert_eq!(channel.publish(item(1)), PublishOutcome::Replaced);
        assert_eq!(channel.publish(item(2)), PublishOutcome::Replaced);

        assert_eq!(rx.try_latest().map(|d| d.frame.index()), Some(2));
        assert!(rx.try_latest().is_none());
    }

    #[test]
    fn test_publish_without_consumer_never_blocks() {
        let channel = DeliveryChannel::new();
        for i in 0..1000 {
            channel.publish(item(i));
        }
        assert_eq!(channel.receiver().try_latest().unwrap().frame.index(), 999);
    }

    #[test]
    fn test_clear_and_timeout() {
        let channel = DeliveryChannel::new();
        channel.publish(item(7));
        channel.clear();
        let rx = channel.receiver();
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_none());

        let publisher = channel.clone();
        let handle = std::thread::spawn(move || {
            publisher.publish(item(8));
        });
        let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(got.frame.index(), 8);
        handle.join().unwrap();
    }
}
