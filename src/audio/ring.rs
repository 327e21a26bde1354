//! Lock-free PCM ring buffer
//!
//! Single-producer single-consumer hand-off between a capture/decode thread
//! and the mixing thread. Neither side ever blocks:
//!
//! - on overrun the producer drags the read cursor forward, dropping the
//!   oldest unread audio and keeping one frame of latency;
//! - on underrun the consumer pads with silence and still reports a full read;
//!   a read the producer lapped mid-copy is discarded the same way.
//!
//! Cursors are absolute sample counts; the slot index is `cursor % capacity`.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{fence, AtomicI16, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared storage behind a producer/consumer pair
pub struct PcmRingBuffer {
    slots: Box<[AtomicI16]>,
    capacity: usize,
    /// Samples retained when the producer laps the consumer
    keep: usize,
    write: CachePadded<AtomicU64>,
    read: CachePadded<AtomicU64>,
    overrun_count: AtomicU64,
    underrun_count: AtomicU64,
}

impl PcmRingBuffer {
    /// Create a ring of `capacity` samples that keeps `frame_samples` of
    /// audio when it overruns.
    pub fn new(capacity: usize, frame_samples: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be non-zero");
        let slots = (0..capacity).map(|_| AtomicI16::new(0)).collect();
        Self {
            slots,
            capacity,
            keep: frame_samples.clamp(1, capacity),
            write: CachePadded::new(AtomicU64::new(0)),
            read: CachePadded::new(AtomicU64::new(0)),
            overrun_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
        }
    }

    /// Split into the two endpoints. Neither handle is `Clone`, which is what
    /// keeps the buffer single-producer single-consumer.
    pub fn split(self) -> (PcmProducer, PcmConsumer) {
        let shared = Arc::new(self);
        (
            PcmProducer {
                ring: shared.clone(),
            },
            PcmConsumer { ring: shared },
        )
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Distance in samples between the write and read cursors
    pub fn lag(&self) -> usize {
        // Write first: both cursors only grow, so a later read can only shrink the gap
        let write = self.write.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Acquire);
        write.saturating_sub(read) as usize
    }

    pub fn overrun_count(&self) -> u64 {
        self.overrun_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    fn slot(&self, cursor: u64) -> &AtomicI16 {
        &self.slots[(cursor % self.capacity as u64) as usize]
    }
}

/// Writing end of a [`PcmRingBuffer`]
pub struct PcmProducer {
    ring: Arc<PcmRingBuffer>,
}

impl PcmProducer {
    /// Copy up to `sample_count` samples from `frame` into the ring.
    pub fn push(&mut self, frame: &[i16], sample_count: usize) {
        let ring = &*self.ring;
        let n = sample_count.min(frame.len());
        if n == 0 {
            return;
        }
        // Anything older than one capacity would be overwritten anyway
        let src = &frame[n.saturating_sub(ring.capacity)..n];

        let write = ring.write.load(Ordering::Relaxed);
        let new_write = write + src.len() as u64;
        let limit = (ring.capacity - ring.keep) as u64;

        // Move the reader out of the way before touching its slots
        let bumped = ring
            .read
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |read| {
                if new_write.saturating_sub(read) > limit {
                    Some(new_write - ring.keep as u64)
                } else {
                    None
                }
            });
        if bumped.is_ok() {
            ring.overrun_count.fetch_add(1, Ordering::Relaxed);
        }
        // Pairs with the consumer's fence: a reader that sees any of the slot
        // stores below also sees the cursor move above
        fence(Ordering::Release);

        for (i, sample) in src.iter().enumerate() {
            ring.slot(write + i as u64).store(*sample, Ordering::Relaxed);
        }
        ring.write.store(new_write, Ordering::Release);
    }

    pub fn ring(&self) -> &PcmRingBuffer {
        &self.ring
    }
}

/// Reading end of a [`PcmRingBuffer`]
pub struct PcmConsumer {
    ring: Arc<PcmRingBuffer>,
}

impl PcmConsumer {
    /// Fill `dest[..sample_count]`, zero-padding whatever the producer has not
    /// supplied yet. Always returns `min(sample_count, dest.len())`.
    pub fn pop_into(&mut self, dest: &mut [i16], sample_count: usize) -> usize {
        let ring = &*self.ring;
        let need = sample_count.min(dest.len());

        let read = ring.read.load(Ordering::Acquire);
        let write = ring.write.load(Ordering::Acquire);
        let available = write.saturating_sub(read).min(ring.capacity as u64) as usize;
        let take = need.min(available);

        for (i, out) in dest[..take].iter_mut().enumerate() {
            *out = ring.slot(read + i as u64).load(Ordering::Relaxed);
        }

        fence(Ordering::Acquire);
        // A failed exchange means the producer lapped us mid-read: the copied
        // block may mix old and new audio, so it is dropped and its cursor wins.
        let lapped = ring
            .read
            .compare_exchange(read, read + take as u64, Ordering::AcqRel, Ordering::Acquire)
            .is_err();
        if lapped {
            dest[..need].fill(0);
            ring.underrun_count.fetch_add(1, Ordering::Relaxed);
            return need;
        }

        if take < need {
            dest[take..need].fill(0);
            ring.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
        need
    }

    pub fn ring(&self) -> &PcmRingBuffer {
        &self.ring
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(start: i16, len: usize) -> Vec<i16> {
        (0..len).map(|i| start.wrapping_add(i as i16)).collect()
    }

    #[test]
    fn test_push_then_pop_in_order() {
        let (mut tx, mut rx) = PcmRingBuffer::new(64, 8).split();
        tx.push(&ramp(1, 10), 10);
        assert_eq!(tx.ring().lag(), 10);

        let mut out = [0i16; 10];
        assert_eq!(rx.pop_into(&mut out, 10), 10);
        assert_eq!(out.to_vec(), ramp(1, 10));
        assert_eq!(rx.ring().lag(), 0);
    }

    #[test]
    fn test_underrun_pads_with_silence() {
        let (mut tx, mut rx) = PcmRingBuffer::new(64, 8).split();
        tx.push(&[7, 7, 7], 3);

        let mut out = [99i16; 8];
        assert_eq!(rx.pop_into(&mut out, 8), 8);
        assert_eq!(out, [7, 7, 7, 0, 0, 0, 0, 0]);
        assert_eq!(rx.ring().underrun_count(), 1);
    }

    #[test]
    fn test_pop_from_empty_is_full_silence() {
        let (_tx, mut rx) = PcmRingBuffer::new(16, 4).split();
        let mut out = [5i16; 4];
        assert_eq!(rx.pop_into(&mut out, 4), 4);
        assert_eq!(out, [0; 4]);
    }

    #[test]
    fn test_push_respects_sample_count_and_frame_len() {
        let (mut tx, _rx) = PcmRingBuffer::new(64, 8).split();
        tx.push(&ramp(0, 10), 4);
        assert_eq!(tx.ring().lag(), 4);
        tx.push(&ramp(0, 3), 100);
        assert_eq!(tx.ring().lag(), 7);
    }

    #[test]
    fn test_overrun_keeps_newest_frame() {
        let (mut tx, mut rx) = PcmRingBuffer::new(32, 4).split();
        // 29 samples: lag 29 > 32 - 4, so the reader jumps to write - 4
        tx.push(&ramp(0, 29), 29);
        assert_eq!(tx.ring().overrun_count(), 1);
        assert_eq!(tx.ring().lag(), 4);

        let mut out = [0i16; 4];
        rx.pop_into(&mut out, 4);
        assert_eq!(out, [25, 26, 27, 28]);
    }

    #[test]
    fn test_oversized_push_keeps_tail() {
        let (mut tx, mut rx) = PcmRingBuffer::new(16, 4).split();
        tx.push(&ramp(0, 100), 100);
        assert!(tx.ring().lag() <= 16);

        let mut out = [0i16; 4];
        rx.pop_into(&mut out, 4);
        assert_eq!(out, [96, 97, 98, 99]);
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = PcmRingBuffer::new(8, 2).split();
        let mut out = [0i16; 5];
        for round in 0..10i16 {
            tx.push(&ramp(round * 5, 5), 5);
            rx.pop_into(&mut out, 5);
            assert_eq!(out.to_vec(), ramp(round * 5, 5));
        }
        assert_eq!(tx.ring().overrun_count(), 0);
    }

    #[test]
    fn test_threads_never_short_read() {
        let (mut tx, mut rx) = PcmRingBuffer::new(960, 48).split();
        let producer = std::thread::spawn(move || {
            let frame = ramp(1, 48);
            for _ in 0..2_000 {
                tx.push(&frame, 48);
            }
        });
        let mut out = [0i16; 64];
        for _ in 0..2_000 {
            assert_eq!(rx.pop_into(&mut out, 64), 64);
            assert!(rx.ring().lag() <= 960);
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_lapped_reads_never_return_torn_blocks() {
        const WRAP: i16 = 30_000;
        let next = |v: i16| v % WRAP + 1;

        let (mut tx, mut rx) = PcmRingBuffer::new(64, 8).split();
        let producer = std::thread::spawn(move || {
            let mut value = 1i16;
            let mut frame = [0i16; 8];
            for _ in 0..50_000 {
                for slot in frame.iter_mut() {
                    *slot = value;
                    value = next(value);
                }
                tx.push(&frame, 8);
            }
        });

        let mut out = [0i16; 24];
        for _ in 0..50_000 {
            rx.pop_into(&mut out, 24);
            let audio = out.iter().take_while(|s| **s != 0).count();
            assert!(out[audio..].iter().all(|s| *s == 0), "audio after padding: {:?}", out);
            for pair in out[..audio].windows(2) {
                assert_eq!(pair[1], next(pair[0]), "torn block: {:?}", out);
            }
        }
        producer.join().unwrap();
    }

    proptest! {
        #[test]
        fn prop_pop_reports_requested(ops in prop::collection::vec((any::<bool>(), 0usize..200), 1..200)) {
            let (mut tx, mut rx) = PcmRingBuffer::new(128, 16).split();
            let src = ramp(0, 200);
            let mut dest = vec![0i16; 200];
            for (is_push, n) in ops {
                if is_push {
                    tx.push(&src, n);
                } else {
                    prop_assert_eq!(rx.pop_into(&mut dest, n), n);
                }
                prop_assert!(tx.ring().lag() <= tx.ring().capacity());
            }
        }

        #[test]
        fn prop_lag_bounded_when_consumer_stalls(pushes in prop::collection::vec(1usize..300, 1..100)) {
            let (mut tx, _rx) = PcmRingBuffer::new(256, 32).split();
            let src = ramp(0, 300);
            for n in pushes {
                tx.push(&src, n);
                prop_assert!(tx.ring().lag() <= 256);
            }
        }
    }
}
