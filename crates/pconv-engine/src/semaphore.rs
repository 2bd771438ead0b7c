//! Counting semaphore
//!
//! Built on a bounded crossbeam channel of unit tokens: posting never
//! blocks, and a send/receive pair gives the happens-before edge that
//! publishes buffer writes between the processing thread and a level worker.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use pconv_core::{ConvError, ConvResult};
use std::time::Duration;

/// Default token capacity for level trigger/done semaphores
pub const DEFAULT_CAPACITY: usize = 64;

pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
    capacity: usize,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self { tx, rx, capacity }
    }

    /// Reset the count to `count` tokens
    pub fn init(&self, count: usize) -> ConvResult<()> {
        if count > self.capacity {
            return Err(ConvError::BadParam(format!(
                "semaphore count {count} exceeds capacity {}",
                self.capacity
            )));
        }
        while self.rx.try_recv().is_ok() {}
        for _ in 0..count {
            self.post();
        }
        Ok(())
    }

    /// Increment the count. Never blocks; returns false if the count is saturated.
    #[inline]
    pub fn post(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => false,
        }
    }

    /// Block until a token is available, then take it
    #[inline]
    pub fn wait(&self) {
        // Both channel ends live in `self`, so the channel never disconnects.
        let _ = self.rx.recv();
    }

    /// Take a token if one is available
    #[inline]
    pub fn trywait(&self) -> bool {
        self.rx.try_recv().is_ok()
    }

    /// Wait at most `timeout` for a token
    #[inline]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Current count
    pub fn count(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_and_trywait() {
        let sem = Semaphore::new(4);
        assert!(!sem.trywait());
        assert!(sem.post());
        assert!(sem.post());
        assert_eq!(sem.count(), 2);
        assert!(sem.trywait());
        assert!(sem.trywait());
        assert!(!sem.trywait());
    }

    #[test]
    fn test_post_saturates_without_blocking() {
        let sem = Semaphore::new(2);
        assert!(sem.post());
        assert!(sem.post());
        assert!(!sem.post());
        assert_eq!(sem.count(), 2);
    }

    #[test]
    fn test_init_resets_count() {
        let sem = Semaphore::new(8);
        for _ in 0..5 {
            sem.post();
        }
        sem.init(1).unwrap();
        assert_eq!(sem.count(), 1);
        sem.init(0).unwrap();
        assert!(!sem.trywait());
        assert!(sem.init(9).is_err());
    }

    #[test]
    fn test_wait_timeout() {
        let sem = Semaphore::new(1);
        assert!(!sem.wait_timeout(Duration::from_millis(5)));
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread_handshake() {
        let trig = Arc::new(Semaphore::default());
        let done = Arc::new(Semaphore::default());
        let (t, d) = (Arc::clone(&trig), Arc::clone(&done));

        let worker = thread::spawn(move || {
            for _ in 0..100 {
                t.wait();
                d.post();
            }
        });

        for _ in 0..100 {
            trig.post();
            done.wait();
        }
        worker.join().unwrap();
        assert_eq!(trig.count(), 0);
        assert_eq!(done.count(), 0);
    }
}
