//! Replay protection: a two-generation cuckoo filter over salts seen
//! so far. Two generations let the filter roll over without a step
//! where legitimate-but-unseen salts from the previous generation
//! start appearing as replays: a lookup checks both, an insert only
//! goes into the current one.
//!
//! The SipHash key pair is drawn from the OS RNG once per `SaltFilter`
//! and never rotated for its lifetime, so an attacker can't pre-compute
//! bucket placement offline; both generations share the same pair.

use parking_lot::Mutex;
use siphasher::sip::SipHasher24;
use std::hash::{Hash, Hasher};

const NUM_BUCKETS: usize = 262_144;
const BUCKET_SIZE: usize = 4;
/// Relocation attempts per insert before the filter gives up and
/// reports itself full: 16 eviction rounds of up to 32 kicks each.
const MAX_RELOCATIONS: usize = 16 * 32;
/// Rotate to a fresh generation after this many successful inserts.
const ROTATE_AFTER: u64 = 800_000;

struct CuckooFilter {
    buckets: Vec<[u32; BUCKET_SIZE]>,
    count: u64,
    key0: u64,
    key1: u64,
}

impl CuckooFilter {
    fn new(key0: u64, key1: u64) -> Self {
        Self {
            buckets: vec![[0u32; BUCKET_SIZE]; NUM_BUCKETS],
            count: 0,
            key0,
            key1,
        }
    }

    fn hash_bucket(&self, data: &[u8]) -> usize {
        let mut hasher = SipHasher24::new_with_keys(self.key0, self.key1);
        data.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_BUCKETS
    }

    fn fingerprint(&self, data: &[u8]) -> u32 {
        let mut hasher = SipHasher24::new_with_keys(self.key1, self.key0);
        data.hash(&mut hasher);
        let fp = hasher.finish() as u32;
        // A zero fingerprint would be indistinguishable from an empty
        // slot, so remap it to 1.
        if fp == 0 {
            1
        } else {
            fp
        }
    }

    fn alt_bucket(&self, index: usize, fp: u32) -> usize {
        let mut hasher = SipHasher24::new_with_keys(self.key0, self.key1);
        fp.hash(&mut hasher);
        index ^ (hasher.finish() as usize % NUM_BUCKETS)
    }

    fn contains(&self, data: &[u8]) -> bool {
        let i1 = self.hash_bucket(data);
        let fp = self.fingerprint(data);
        let i2 = self.alt_bucket(i1, fp);
        self.buckets[i1].contains(&fp) || self.buckets[i2].contains(&fp)
    }

    /// Insert `data`. Returns `false` only if the filter is full and
    /// the item could not be placed after exhausting relocations.
    fn insert(&mut self, data: &[u8]) -> bool {
        if self.contains(data) {
            return true;
        }
        let i1 = self.hash_bucket(data);
        let mut fp = self.fingerprint(data);
        if Self::try_insert_into(&mut self.buckets[i1], fp) {
            self.count += 1;
            return true;
        }
        let i2 = self.alt_bucket(i1, fp);
        if Self::try_insert_into(&mut self.buckets[i2], fp) {
            self.count += 1;
            return true;
        }

        let mut index = if rand_bit() { i1 } else { i2 };
        for _ in 0..MAX_RELOCATIONS {
            let slot = (fp as usize) % BUCKET_SIZE;
            std::mem::swap(&mut self.buckets[index][slot], &mut fp);
            index = self.alt_bucket(index, fp);
            if Self::try_insert_into(&mut self.buckets[index], fp) {
                self.count += 1;
                return true;
            }
        }
        false
    }

    fn try_insert_into(bucket: &mut [u32; BUCKET_SIZE], fp: u32) -> bool {
        for slot in bucket.iter_mut() {
            if *slot == 0 {
                *slot = fp;
                return true;
            }
        }
        false
    }
}

fn rand_bit() -> bool {
    rand::random::<bool>()
}

/// Replay-protection filter shared across every Shadowsocks session
/// using one listener or connector. Safe to call from multiple tasks
/// concurrently; the actual reactor may be a multi-threaded tokio
/// runtime even though each connection's own state machine is
/// single-threaded.
pub struct SaltFilter {
    inner: Mutex<Generations>,
}

struct Generations {
    current: CuckooFilter,
    previous: CuckooFilter,
    // Both generations share this key pair: a salt recorded under
    // `previous` must still hash to the same buckets/fingerprint after
    // rotation, or replay detection would break across the rollover.
    key0: u64,
    key1: u64,
}

impl SaltFilter {
    pub fn new() -> Self {
        let key0 = rand::random::<u64>();
        let key1 = rand::random::<u64>();
        Self {
            inner: Mutex::new(Generations {
                current: CuckooFilter::new(key0, key1),
                previous: CuckooFilter::new(key0, key1),
                key0,
                key1,
            }),
        }
    }

    /// Check-and-insert in one step: returns `true` if `salt` was
    /// already seen (replay), `false` if it was newly recorded.
    pub fn check_and_insert(&self, salt: &[u8]) -> bool {
        let mut gens = self.inner.lock();
        if gens.current.contains(salt) || gens.previous.contains(salt) {
            return true;
        }
        gens.current.insert(salt);
        Self::maybe_rotate(&mut gens);
        false
    }

    /// Unconditionally record `salt`, regardless of whether it was
    /// already present. Used for salts this process itself generated
    /// (outbound request/response salts), which can never be replays
    /// but are still worth guarding against future collision.
    pub fn insert(&self, salt: &[u8]) {
        let mut gens = self.inner.lock();
        gens.current.insert(salt);
        Self::maybe_rotate(&mut gens);
    }

    fn maybe_rotate(gens: &mut Generations) {
        if gens.current.count >= ROTATE_AFTER {
            let fresh = CuckooFilter::new(gens.key0, gens.key1);
            let old_current = std::mem::replace(&mut gens.current, fresh);
            gens.previous = old_current;
        }
    }
}

impl Default for SaltFilter {
    fn default() -> Self {
        Self::new()
    }
}
