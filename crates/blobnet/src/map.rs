use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// A concurrent map over a fixed bucket table with one read/write lock per
/// bucket. The table never resizes; sizing is the caller's call at
/// construction. There is no iterator that advances across buckets; callers
/// that want a sweep visit buckets externally through `for_each`.
pub struct ShardedMap<K, V, S = fxhash::FxBuildHasher> {
    buckets: Box<[RwLock<Vec<(K, V)>>]>,
    len: AtomicUsize,
    hasher: S,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    pub fn with_buckets(buckets: usize) -> Self {
        Self::with_buckets_and_hasher(buckets, fxhash::FxBuildHasher::default())
    }
}

impl<K: Eq + Hash, V, S: BuildHasher> ShardedMap<K, V, S> {
    pub fn with_buckets_and_hasher(buckets: usize, hasher: S) -> Self {
        assert!(buckets > 0, "bucket count must be non-zero");
        let buckets = (0..buckets)
            .map(|_| RwLock::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        ShardedMap {
            buckets,
            len: AtomicUsize::new(0),
            hasher,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, key: &K) -> &RwLock<Vec<(K, V)>> {
        let mut h = self.hasher.build_hasher();
        key.hash(&mut h);
        &self.buckets[(h.finish() % self.buckets.len() as u64) as usize]
    }

    /// Insert or replace; returns the previous value when the key existed.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let mut chain = self.bucket_of(&key).write().unwrap();
        for entry in chain.iter_mut() {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        chain.push((key, value));
        self.len.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert only when absent; true when the value went in.
    pub fn push(&self, key: K, value: V) -> bool {
        let mut chain = self.bucket_of(&key).write().unwrap();
        if chain.iter().any(|entry| entry.0 == key) {
            return false;
        }
        chain.push((key, value));
        self.len.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.bucket_of(key)
            .read()
            .unwrap()
            .iter()
            .any(|entry| &entry.0 == key)
    }

    /// Run `f` against the value under the bucket's read lock.
    pub fn with<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        let chain = self.bucket_of(key).read().unwrap();
        chain.iter().find(|entry| &entry.0 == key).map(|e| f(&e.1))
    }

    /// Run `f` against the value under the bucket's write lock.
    pub fn with_mut<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut chain = self.bucket_of(key).write().unwrap();
        chain
            .iter_mut()
            .find(|entry| &entry.0 == key)
            .map(|e| f(&mut e.1))
    }

    pub fn find(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.with(key, V::clone)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut chain = self.bucket_of(key).write().unwrap();
        let at = chain.iter().position(|entry| &entry.0 == key)?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(chain.swap_remove(at).1)
    }

    /// Visit every entry, one bucket lock at a time.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for bucket in self.buckets.iter() {
            let chain = bucket.read().unwrap();
            for (k, v) in chain.iter() {
                f(k, v);
            }
        }
    }
}
