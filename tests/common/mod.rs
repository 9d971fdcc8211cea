#![allow(dead_code)]

use bulk_batcher::error::{BatchError, Result};
use bulk_batcher::pipeline::Item;

/// In-memory record with a fixed size (or a measurement failure) and key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Record {
    pub id: usize,
    pub key: Option<String>,
    pub size: Option<u64>,
}

impl Item for Record {
    fn byte_size(&self) -> Result<u64> {
        self.size
            .ok_or_else(|| BatchError::Measurement(format!("record {} has no size", self.id)))
    }

    fn partition_key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

pub fn record(id: usize, key: Option<&str>, size: u64) -> Record {
    Record {
        id,
        key: key.map(String::from),
        size: Some(size),
    }
}

pub fn unmeasurable(id: usize, key: Option<&str>) -> Record {
    Record {
        id,
        key: key.map(String::from),
        size: None,
    }
}

/// Small deterministic generator so property runs are reproducible.
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}

/// Random records over `keys` distinct partitions; roughly one in
/// `fail_every` cannot be measured (0 disables failures).
pub fn random_records(
    rng: &mut Lcg,
    count: usize,
    keys: u64,
    max_size: u64,
    fail_every: u64,
) -> Vec<Record> {
    (0..count)
        .map(|id| {
            let key = match rng.below(keys + 1) {
                0 => None,
                k => Some(format!("p{k}")),
            };
            let size = if fail_every > 0 && rng.below(fail_every) == 0 {
                None
            } else {
                Some(1 + rng.below(max_size))
            };
            Record { id, key, size }
        })
        .collect()
}
