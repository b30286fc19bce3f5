//! Lock-free single-producer/single-consumer sample FIFO.
//!
//! Bridges a device callback and the processing thread on top of a `ringbuf` heap ring.
//! Neither side blocks or allocates after construction.
//!
//! On overflow the buffer follows its [`OverflowPolicy`]:
//! - [`OverflowPolicy::DropOldest`] (capture side): the producer stores the new samples and
//!   marks the same number of the oldest unread ones as evicted. The consumer discards
//!   evicted samples before it reads. Storage is twice the logical capacity so the producer
//!   never has to wait for that discard.
//! - [`OverflowPolicy::DropNewest`] (playback side): samples that do not fit are discarded.
//!
//! Every write that drops anything counts one overrun.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use ringbuf::{
    traits::{Consumer as _, Observer as _, Producer as _, Split as _},
    HeapCons, HeapProd, HeapRb,
};

use crate::Sample;

/// Behaviour when a write does not fit in the free space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

struct Counters {
    /// Logical capacity in samples.
    capacity: usize,
    /// Oldest unread samples the consumer still has to discard.
    evicted: AtomicUsize,
    overruns: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    /// Unread samples that will actually be delivered, given the ring's occupancy.
    #[inline]
    fn backlog(&self, occupied: usize) -> usize {
        occupied.saturating_sub(self.evicted.load(Ordering::Acquire))
    }
}

/// Constructor namespace for the producer/consumer pair.
pub struct RingBuffer;

impl RingBuffer {
    /// Allocates a ring holding at least `min_capacity` samples (rounded up to a power of two).
    pub fn with_capacity(min_capacity: usize, policy: OverflowPolicy) -> (Producer, Consumer) {
        let capacity = min_capacity.max(2).next_power_of_two();
        let storage = match policy {
            OverflowPolicy::DropOldest => 2 * capacity,
            OverflowPolicy::DropNewest => capacity,
        };
        let (ring, reader) = HeapRb::<Sample>::new(storage).split();
        let counters = Arc::new(Counters {
            capacity,
            evicted: AtomicUsize::new(0),
            overruns: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });
        (
            Producer {
                ring,
                policy,
                counters: Arc::clone(&counters),
            },
            Consumer {
                ring: reader,
                counters,
            },
        )
    }
}

/// Writing half. Exactly one thread may own it.
pub struct Producer {
    ring: HeapProd<Sample>,
    policy: OverflowPolicy,
    counters: Arc<Counters>,
}

impl Producer {
    /// Writes `samples` without blocking and returns how many were stored.
    ///
    /// With `DropOldest` every sample is stored (at most the last `capacity` of the slice);
    /// with `DropNewest` only what fits is stored.
    pub fn write(&mut self, samples: &[Sample]) -> usize {
        let counters = &*self.counters;
        let (stored, dropped) = match self.policy {
            OverflowPolicy::DropNewest => {
                let stored = self.ring.push_slice(samples);
                (stored, samples.len() - stored)
            }
            OverflowPolicy::DropOldest => {
                let skipped = samples.len().saturating_sub(counters.capacity);
                let samples = &samples[skipped..];
                // Storage only runs out when the reader has stalled with evictions pending;
                // the newest samples are lost then.
                let fits = samples.len().min(self.ring.vacant_len());
                let backlog = counters.backlog(self.ring.occupied_len());
                let evicted = (backlog + fits).saturating_sub(counters.capacity);
                if evicted > 0 {
                    // Published before the samples so a reader that sees them also sees this.
                    counters.evicted.fetch_add(evicted, Ordering::AcqRel);
                }
                let stored = self.ring.push_slice(&samples[..fits]);
                (stored, skipped + evicted + (samples.len() - stored))
            }
        };

        if dropped > 0 {
            counters.overruns.fetch_add(1, Ordering::Relaxed);
            counters.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        stored
    }

    /// Writes `count` zeros, following the same overflow policy.
    pub fn write_silence(&mut self, count: usize) -> usize {
        const CHUNK: [Sample; 64] = [0.0; 64];
        let mut written = 0;
        let mut remaining = count;
        while remaining > 0 {
            let take = remaining.min(CHUNK.len());
            written += self.write(&CHUNK[..take]);
            remaining -= take;
        }
        written
    }

    pub fn available_to_write(&self) -> usize {
        self.capacity() - self.counters.backlog(self.ring.occupied_len())
    }

    pub fn capacity(&self) -> usize {
        self.counters.capacity
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Reading half. Exactly one thread may own it.
pub struct Consumer {
    ring: HeapCons<Sample>,
    counters: Arc<Counters>,
}

impl Consumer {
    /// Reads up to `out.len()` samples without blocking and returns how many were read.
    pub fn read(&mut self, out: &mut [Sample]) -> usize {
        let available = self.discard_evicted();
        let count = available.min(out.len());
        self.ring.pop_slice(&mut out[..count])
    }

    /// Discards up to `count` unread samples and returns how many were skipped.
    pub fn skip(&mut self, count: usize) -> usize {
        let available = self.discard_evicted();
        self.ring.skip(available.min(count))
    }

    /// Discards everything currently readable.
    pub fn clear(&mut self) -> usize {
        self.skip(usize::MAX)
    }

    pub fn available_to_read(&self) -> usize {
        self.counters.backlog(self.ring.occupied_len())
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            counters: Arc::clone(&self.counters),
        }
    }

    /// Drops samples the producer evicted and returns how many remain readable.
    fn discard_evicted(&mut self) -> usize {
        // Occupancy first: the eviction count covering those samples is then visible.
        let occupied = self.ring.occupied_len();
        let evicted = self.counters.evicted.load(Ordering::Acquire).min(occupied);
        if evicted == 0 {
            return occupied;
        }
        let skipped = self.ring.skip(evicted);
        self.counters.evicted.fetch_sub(skipped, Ordering::AcqRel);
        occupied - skipped
    }
}

/// Read-only view used for status reporting.
#[derive(Clone)]
pub struct RingMonitor {
    counters: Arc<Counters>,
}

impl RingMonitor {
    /// Number of writes that had to drop samples.
    pub fn overrun_count(&self) -> u64 {
        self.counters.overruns.load(Ordering::Relaxed)
    }

    /// Total number of samples dropped by overflow handling.
    pub fn dropped_samples(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let (producer, consumer) = RingBuffer::with_capacity(1000, OverflowPolicy::DropNewest);
        assert_eq!(producer.capacity(), 1024);
        assert_eq!(producer.available_to_write(), 1024);
        assert_eq!(consumer.available_to_read(), 0);

        let (producer, _consumer) = RingBuffer::with_capacity(1000, OverflowPolicy::DropOldest);
        assert_eq!(producer.available_to_write(), 1024);
    }

    #[test]
    fn reads_back_in_order_across_wraparound() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(8, OverflowPolicy::DropNewest);
        let mut out = [0.0; 8];

        assert_eq!(producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), 6);
        assert_eq!(consumer.read(&mut out[..4]), 4);
        assert_eq!(&out[..4], &[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(producer.write(&[7.0, 8.0, 9.0, 10.0]), 4);
        assert_eq!(consumer.available_to_read(), 6);
        assert_eq!(consumer.read(&mut out), 6);
        assert_eq!(&out[..6], &[5.0, 6.0, 7.0, 8.0, 9.0, 10.0]);
        assert_eq!(producer.monitor().overrun_count(), 0);
    }

    #[test]
    fn drop_newest_discards_what_does_not_fit() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropNewest);
        assert_eq!(producer.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(producer.write(&[4.0, 5.0, 6.0]), 1);

        let monitor = producer.monitor();
        assert_eq!(monitor.overrun_count(), 1);
        assert_eq!(monitor.dropped_samples(), 2);

        let mut out = [0.0; 4];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn drop_oldest_keeps_the_most_recent_samples() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        assert_eq!(producer.write(&[1.0, 2.0, 3.0]), 3);
        assert_eq!(producer.write(&[4.0, 5.0, 6.0]), 3);
        assert_eq!(consumer.available_to_read(), 4);
        assert_eq!(producer.available_to_write(), 0);

        let monitor = consumer.monitor();
        assert_eq!(monitor.overrun_count(), 1);
        assert_eq!(monitor.dropped_samples(), 2);

        let mut out = [0.0; 8];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(&out[..4], &[3.0, 4.0, 5.0, 6.0]);
        assert_eq!(consumer.available_to_read(), 0);
    }

    #[test]
    fn drop_oldest_counts_only_unread_samples() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        producer.write(&[1.0, 2.0, 3.0]);
        let mut out = [0.0; 4];
        assert_eq!(consumer.read(&mut out[..1]), 1);

        producer.write(&[4.0, 5.0, 6.0]);
        assert_eq!(consumer.monitor().dropped_samples(), 1);
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);

        producer.write(&[7.0]);
        assert_eq!(consumer.read(&mut out), 1);
        assert_eq!(out[0], 7.0);
        assert_eq!(consumer.monitor().overrun_count(), 1);
    }

    #[test]
    fn drop_oldest_truncates_oversized_writes() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        let input: Vec<Sample> = (0..10).map(|i| i as Sample).collect();
        assert_eq!(producer.write(&input), 4);

        let mut out = [0.0; 4];
        assert_eq!(consumer.read(&mut out), 4);
        assert_eq!(out, [6.0, 7.0, 8.0, 9.0]);
        assert_eq!(consumer.monitor().dropped_samples(), 6);
    }

    #[test]
    fn drop_oldest_survives_a_stalled_reader() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        for block in 0..10 {
            let base = (block * 3) as Sample;
            producer.write(&[base, base + 1.0, base + 2.0]);
        }
        assert_eq!(consumer.available_to_read(), 4);

        let mut out = [0.0; 4];
        assert_eq!(consumer.read(&mut out), 4);
        for pair in out.windows(2) {
            assert!(pair[1] > pair[0], "out of order: {out:?}");
        }
        assert!(consumer.monitor().overrun_count() >= 8);

        // Once the reader is back the newest samples flow again.
        producer.write(&[100.0, 101.0]);
        assert_eq!(consumer.read(&mut out), 2);
        assert_eq!(&out[..2], &[100.0, 101.0]);
    }

    #[test]
    fn skip_and_clear_discard_unread_samples() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(8, OverflowPolicy::DropNewest);
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(consumer.skip(2), 2);

        let mut out = [0.0; 1];
        consumer.read(&mut out);
        assert_eq!(out[0], 3.0);

        assert_eq!(consumer.clear(), 2);
        assert_eq!(consumer.available_to_read(), 0);
        assert_eq!(producer.write_silence(5), 5);
        assert_eq!(consumer.available_to_read(), 5);
    }

    #[test]
    fn clear_after_eviction_leaves_nothing_behind() {
        let (mut producer, mut consumer) = RingBuffer::with_capacity(4, OverflowPolicy::DropOldest);
        producer.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        producer.write(&[7.0, 8.0]);
        assert_eq!(consumer.clear(), 4);
        assert_eq!(consumer.available_to_read(), 0);

        producer.write(&[9.0]);
        let mut out = [0.0; 2];
        assert_eq!(consumer.read(&mut out), 1);
        assert_eq!(out[0], 9.0);
    }

    #[test]
    fn concurrent_transfer_preserves_order() {
        const TOTAL: usize = 200_000;
        let (mut producer, mut consumer) = RingBuffer::with_capacity(256, OverflowPolicy::DropNewest);

        let writer = thread::spawn(move || {
            let mut next = 0usize;
            while next < TOTAL {
                let end = (next + 37).min(TOTAL);
                let chunk: Vec<Sample> = (next..end).map(|i| (i % 4096) as Sample).collect();
                let written = producer.write(&chunk);
                next += written;
                if written == 0 {
                    thread::yield_now();
                }
            }
        });

        let mut expected = 0usize;
        let mut buffer = [0.0; 64];
        while expected < TOTAL {
            let read = consumer.read(&mut buffer);
            for &sample in &buffer[..read] {
                assert_eq!(sample, (expected % 4096) as Sample);
                expected += 1;
            }
            if read == 0 {
                thread::yield_now();
            }
        }

        writer.join().expect("writer thread panicked");
    }
}
