//! Hand-off buffer between the sampling worker and the controller.

use crate::models::Sample;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// Ordered, unbounded FIFO of samples.
///
/// The worker pushes whole samples; the controller drains once per run after
/// the worker has returned, which leaves the buffer empty for the next run.
#[derive(Clone)]
pub struct ReadingsChannel {
    tx: Sender<Sample>,
    rx: Receiver<Sample>,
}

impl Default for ReadingsChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadingsChannel {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        ReadingsChannel { tx, rx }
    }

    pub fn push(&self, sample: Sample) {
        // both ends live in self, so the channel can't be disconnected
        let _ = self.tx.send(sample);
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Everything buffered so far, oldest first.
    pub fn drain(&self) -> Vec<Sample> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_drain_is_fifo_and_empties() {
        let channel = ReadingsChannel::new();
        for i in 0..5u64 {
            channel.push(Sample::new(Duration::from_secs(i * 30), 100, 100));
        }
        assert_eq!(channel.len(), 5);
        let drained = channel.drain();
        let minutes: Vec<f64> = drained.iter().map(|s| s.elapsed_minutes()).collect();
        assert_eq!(minutes, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        assert!(channel.is_empty());
        assert!(channel.drain().is_empty());
    }

    #[test]
    fn test_producer_on_another_thread() {
        let channel = ReadingsChannel::new();
        let producer = channel.clone();
        std::thread::spawn(move || {
            for i in 0..100u64 {
                producer.push(Sample::new(Duration::from_secs(i), 1, 1));
            }
        })
        .join()
        .unwrap();
        assert_eq!(channel.drain().len(), 100);
    }
}
