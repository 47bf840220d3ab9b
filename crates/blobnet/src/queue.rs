use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pad hot counters to their own cache line so producers and consumers do
/// not false-share.
#[repr(align(64))]
struct CacheAligned<T>(T);

struct Slot<T>(UnsafeCell<Option<T>>);

/// A bounded multi-producer multi-consumer FIFO.
///
/// Both sides run a two-phase claim: a CAS advances the pending counter to
/// reserve a slot, the slot is written (or taken), and the committed counter
/// is advanced once every earlier claim has retired. Consumers never observe
/// a slot before its producer committed, and the consumed sequence is a
/// prefix of the committed insertion order. The commit spin is short and only
/// taken when claims retire out of order.
pub struct RingQueue<T> {
    slots: Box<[Slot<T>]>,
    insert_pending: CacheAligned<AtomicU64>,
    insert_committed: CacheAligned<AtomicU64>,
    consume_pending: CacheAligned<AtomicU64>,
    consume_committed: CacheAligned<AtomicU64>,
}

unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring queue capacity must be non-zero");
        let slots = (0..capacity)
            .map(|_| Slot(UnsafeCell::new(None)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        RingQueue {
            slots,
            insert_pending: CacheAligned(AtomicU64::new(0)),
            insert_committed: CacheAligned(AtomicU64::new(0)),
            consume_pending: CacheAligned(AtomicU64::new(0)),
            consume_committed: CacheAligned(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn empty(&self) -> bool {
        self.insert_committed.0.load(Ordering::Acquire)
            == self.consume_committed.0.load(Ordering::Acquire)
    }

    /// Number of committed, unconsumed elements. Racy by nature; only a hint.
    pub fn len(&self) -> usize {
        let committed = self.insert_committed.0.load(Ordering::Acquire);
        let consumed = self.consume_committed.0.load(Ordering::Acquire);
        (committed - consumed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.empty()
    }

    /// Insert one element. Returns its logical slot, or the element back
    /// when the queue is full.
    pub fn try_insert(&self, value: T) -> Result<u64, T> {
        loop {
            let consumed = self.consume_committed.0.load(Ordering::Acquire);
            let claim = self.insert_pending.0.load(Ordering::Relaxed);
            if claim - consumed >= self.slots.len() as u64 {
                return Err(value);
            }
            if self
                .insert_pending
                .0
                .compare_exchange_weak(claim, claim + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                unsafe {
                    *self.slot(claim) = Some(value);
                }
                self.commit(&self.insert_committed.0, claim, 1);
                return Ok(claim);
            }
        }
    }

    /// Insert a batch as one contiguous claim, preserving its order.
    /// Returns the first slot, or the batch back when it does not fit.
    pub fn try_insert_many(&self, values: Vec<T>) -> Result<u64, Vec<T>> {
        let n = values.len() as u64;
        if n == 0 {
            return Ok(self.insert_pending.0.load(Ordering::Relaxed));
        }
        if n as usize > self.slots.len() {
            return Err(values);
        }
        loop {
            let consumed = self.consume_committed.0.load(Ordering::Acquire);
            let claim = self.insert_pending.0.load(Ordering::Relaxed);
            if claim + n - consumed > self.slots.len() as u64 {
                return Err(values);
            }
            if self
                .insert_pending
                .0
                .compare_exchange_weak(claim, claim + n, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                for (off, value) in values.into_iter().enumerate() {
                    unsafe {
                        *self.slot(claim + off as u64) = Some(value);
                    }
                }
                self.commit(&self.insert_committed.0, claim, n);
                return Ok(claim);
            }
        }
    }

    /// Take the oldest committed element, or None when empty.
    pub fn try_consume(&self) -> Option<T> {
        loop {
            let committed = self.insert_committed.0.load(Ordering::Acquire);
            let claim = self.consume_pending.0.load(Ordering::Relaxed);
            if claim >= committed {
                return None;
            }
            if self
                .consume_pending
                .0
                .compare_exchange_weak(claim, claim + 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                let value = unsafe { (*self.slot(claim)).take() };
                debug_assert!(value.is_some(), "consumed a slot before its commit");
                self.commit(&self.consume_committed.0, claim, 1);
                return value;
            }
        }
    }

    fn slot(&self, index: u64) -> *mut Option<T> {
        self.slots[(index % self.slots.len() as u64) as usize].0.get()
    }

    /// Retire a claim: wait until every earlier claim committed, then
    /// advance by the claimed count.
    fn commit(&self, counter: &AtomicU64, claim: u64, count: u64) {
        while counter.load(Ordering::Acquire) != claim {
            std::hint::spin_loop();
        }
        counter.store(claim + count, Ordering::Release);
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        while self.try_consume().is_some() {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn bounded_fifo() {
        let queue = RingQueue::new(2);
        assert_eq!(queue.try_insert(1), Ok(0));
        assert_eq!(queue.try_insert(2), Ok(1));
        assert_eq!(queue.try_insert(3), Err(3));
        assert_eq!(queue.try_consume(), Some(1));
        assert_eq!(queue.try_consume(), Some(2));
        assert_eq!(queue.try_consume(), None);
        assert_eq!(queue.try_insert_many(vec![3, 4]), Ok(2));
        assert_eq!(queue.try_consume(), Some(3));
        assert_eq!(queue.try_consume(), Some(4));
        assert!(queue.empty());
    }

    #[test]
    fn insert_many_must_fit_whole() {
        let queue = RingQueue::new(4);
        assert!(queue.try_insert(0).is_ok());
        assert_eq!(queue.try_insert_many(vec![1, 2, 3, 4]), Err(vec![1, 2, 3, 4]));
        assert!(queue.try_insert_many(vec![1, 2, 3]).is_ok());
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn contended_producers_and_consumers() {
        let queue = Arc::new(RingQueue::new(64));
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 5_000;

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = queue.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match queue.try_insert(value) {
                            Ok(_) => break,
                            Err(back) => {
                                value = back;
                                std::thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..2 {
            let queue = queue.clone();
            consumers.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < (PRODUCERS * PER_PRODUCER / 2) as usize {
                    match queue.try_consume() {
                        Some(v) => seen.push(v),
                        None => std::thread::yield_now(),
                    }
                }
                seen
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let mut all = HashSet::new();
        for c in consumers {
            for v in c.join().unwrap() {
                assert!(all.insert(v), "element {v} consumed twice");
            }
        }
        assert_eq!(all.len(), (PRODUCERS * PER_PRODUCER) as usize);
        assert!(queue.empty());
    }

    #[test]
    fn single_producer_order_is_fifo() {
        let queue = Arc::new(RingQueue::new(8));
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    let mut v = i;
                    while let Err(back) = queue.try_insert(v) {
                        v = back;
                        std::thread::yield_now();
                    }
                }
            })
        };
        let mut expect = 0u64;
        while expect < 10_000 {
            if let Some(v) = queue.try_consume() {
                assert_eq!(v, expect);
                expect += 1;
            }
        }
        producer.join().unwrap();
    }
}
