//! In-memory hash chain of per-tick stress readings.
//!
//! Each entry commits to the previous entry's hash, so a retained window can
//! be re-verified end to end. Old entries are evicted once the window is
//! full; heights keep counting.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use sha2::{Digest, Sha256};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub height: u64,
    pub timestamp: String,
    pub readings: BTreeMap<String, f64>,
    pub prev_hash: String,
    pub hash: String,
}

/// sha256(prev_hash || height || timestamp || domain=stress;...) as hex.
pub fn hash_entry(
    prev_hash: &str,
    height: u64,
    timestamp: &str,
    readings: &BTreeMap<String, f64>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(height.to_be_bytes());
    hasher.update(timestamp.as_bytes());
    for (domain, stress) in readings {
        hasher.update(domain.as_bytes());
        hasher.update(b"=");
        hasher.update(stress.to_bits().to_be_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
pub struct StressLedger {
    entries: VecDeque<LedgerEntry>,
    capacity: usize,
    next_height: u64,
    head: String,
}

impl StressLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
            next_height: 0,
            head: GENESIS_HASH.to_string(),
        }
    }

    pub fn append<'a, I>(&mut self, timestamp: &str, readings: I) -> &LedgerEntry
    where
        I: IntoIterator<Item = (&'a str, f64)>,
    {
        let readings: BTreeMap<String, f64> = readings
            .into_iter()
            .map(|(domain, stress)| (domain.to_string(), stress))
            .collect();
        let height = self.next_height;
        let hash = hash_entry(&self.head, height, timestamp, &readings);
        let entry = LedgerEntry {
            height,
            timestamp: timestamp.to_string(),
            readings,
            prev_hash: std::mem::replace(&mut self.head, hash.clone()),
            hash,
        };

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.next_height += 1;
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Entries appended so far, including evicted ones.
    pub fn height(&self) -> u64 {
        self.next_height
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }

    /// Re-derive every retained hash and check each link.
    pub fn verify(&self) -> bool {
        let mut expected_prev: Option<&str> = None;
        for entry in &self.entries {
            if let Some(prev) = expected_prev {
                if entry.prev_hash != prev {
                    return false;
                }
            } else if entry.height == 0 && entry.prev_hash != GENESIS_HASH {
                return false;
            }
            let expected =
                hash_entry(&entry.prev_hash, entry.height, &entry.timestamp, &entry.readings);
            if expected != entry.hash {
                return false;
            }
            expected_prev = Some(&entry.hash);
        }
        expected_prev.map_or(true, |last| last == self.head)
    }
}
