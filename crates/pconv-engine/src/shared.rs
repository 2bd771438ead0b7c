//! Sample buffers shared between the processing thread and level workers
//!
//! Every element is an `AtomicF64` accessed with relaxed ordering. Ordering
//! between writer and reader comes from the semaphore handshake; when a level
//! runs late the reader sees a mix of old and new samples, which is the
//! documented late-completion behaviour, never undefined behaviour.

use pconv_core::{ConvError, ConvResult, Sample};
use portable_atomic::{AtomicF64, Ordering};
use std::sync::atomic::AtomicBool;

pub struct SharedBuffer {
    data: Box<[AtomicF64]>,
}

impl SharedBuffer {
    pub fn new(len: usize) -> ConvResult<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|e| ConvError::MemAlloc(format!("shared buffer of {len}: {e}")))?;
        data.extend((0..len).map(|_| AtomicF64::new(0.0)));
        Ok(Self {
            data: data.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn load(&self, index: usize) -> Sample {
        self.data[index].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, index: usize, value: Sample) {
        self.data[index].store(value, Ordering::Relaxed);
    }

    /// Copy `dst.len()` samples starting at `start` into `dst`
    #[inline]
    pub fn read_into(&self, start: usize, dst: &mut [Sample]) {
        let n = dst.len();
        for (d, s) in dst.iter_mut().zip(&self.data[start..start + n]) {
            *d = s.load(Ordering::Relaxed);
        }
    }

    /// Overwrite samples starting at `start` with `src`
    #[inline]
    pub fn write_from(&self, start: usize, src: &[Sample]) {
        for (d, &s) in self.data[start..start + src.len()].iter().zip(src) {
            d.store(s, Ordering::Relaxed);
        }
    }

    /// Add samples starting at `start` onto the stored values
    ///
    /// Single writer per buffer, so load/store is enough.
    #[inline]
    pub fn accumulate_from(&self, start: usize, src: &[Sample]) {
        for (d, &s) in self.data[start..start + src.len()].iter().zip(src) {
            d.store(d.load(Ordering::Relaxed) + s, Ordering::Relaxed);
        }
    }

    /// Add stored samples starting at `start` onto `dst`
    #[inline]
    pub fn add_into(&self, start: usize, dst: &mut [Sample]) {
        let n = dst.len();
        for (d, s) in dst.iter_mut().zip(&self.data[start..start + n]) {
            *d += s.load(Ordering::Relaxed);
        }
    }

    pub fn fill(&self, value: Sample) {
        for d in self.data.iter() {
            d.store(value, Ordering::Relaxed);
        }
    }
}

/// Triple overlap buffer of one output channel within one level
///
/// Slot `opind` is read by the processing thread while the worker completes
/// `opind + 1` and starts `opind + 2`.
pub struct OutRing {
    pub buff: [SharedBuffer; 3],
    active: AtomicBool,
}

impl OutRing {
    pub fn new(parsize: usize) -> ConvResult<Self> {
        Ok(Self {
            buff: [
                SharedBuffer::new(parsize)?,
                SharedBuffer::new(parsize)?,
                SharedBuffer::new(parsize)?,
            ],
            active: AtomicBool::new(false),
        })
    }

    /// True while the level has an output node for this channel
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, std::sync::atomic::Ordering::Release);
    }

    pub fn clear(&self) {
        for b in &self.buff {
            b.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_roundtrip() {
        let buf = SharedBuffer::new(8).unwrap();
        buf.write_from(2, &[1.0, 2.0, 3.0]);
        let mut out = [0.0; 4];
        buf.read_into(1, &mut out);
        assert_eq!(out, [0.0, 1.0, 2.0, 3.0]);
        assert_eq!(buf.load(3), 2.0);
    }

    #[test]
    fn test_accumulate_and_add_into() {
        let buf = SharedBuffer::new(4).unwrap();
        buf.write_from(0, &[1.0, 1.0, 1.0, 1.0]);
        buf.accumulate_from(1, &[0.5, 0.25]);
        let mut acc = [10.0; 4];
        buf.add_into(0, &mut acc);
        assert_eq!(acc, [11.0, 11.5, 11.25, 11.0]);
        buf.fill(0.0);
        assert_eq!(buf.load(1), 0.0);
    }

    #[test]
    fn test_outring_activation() {
        let ring = OutRing::new(16).unwrap();
        assert!(!ring.is_active());
        ring.set_active(true);
        ring.buff[2].store(5, 1.0);
        assert!(ring.is_active());
        ring.clear();
        assert_eq!(ring.buff[2].load(5), 0.0);
    }
}
