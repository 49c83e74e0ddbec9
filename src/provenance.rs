//! Provenance table (spec.md §4.8): aggregates `(file,line)` — or a return
//! address when `line == 0` — into per-site counters, for the leak and
//! high-water reports.

use crate::caller::CallerKey;

/// Per-site counters (spec.md §3: "a fourfold counter").
#[derive(Debug, Clone, Copy, Default)]
pub struct SiteCounts {
    pub bytes_ever: u64,
    pub count_ever: u64,
    pub bytes_in_use: u64,
    pub count_in_use: u64,
}

struct Entry {
    key: CallerKey,
    counts: SiteCounts,
    /// Original insertion position, used to restore array order after a
    /// sorted report (spec.md §4.8: "restores original array order in
    /// linear time using the stored position pointer").
    position: u32,
    occupied: bool,
}

/// Open-addressed hash table keyed by [`CallerKey`], with linear probing and
/// an overflow bucket for keys that collide into a full table.
pub struct ProvenanceTable {
    buckets: Vec<Entry>,
    len: usize,
    other: SiteCounts,
}

/// 32-bit mixing hash (FNV-1a), applied over the bytes spec.md §4.8 names:
/// the file path when we have a source location, the pointer bytes when we
/// only have a return address.
fn mix_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

impl ProvenanceTable {
    /// `memory_table_size` is the configured table size; the bucket count is
    /// `2x` that, per spec.md §4.8.
    pub fn new(memory_table_size: usize) -> Self {
        let capacity = (memory_table_size * 2).max(1);
        Self {
            buckets: (0..capacity)
                .map(|_| Entry {
                    key: CallerKey::Unknown,
                    counts: SiteCounts::default(),
                    position: 0,
                    occupied: false,
                })
                .collect(),
            len: 0,
            other: SiteCounts::default(),
        }
    }

    fn probe_start(&self, key: &CallerKey) -> usize {
        let mut scratch = [0u8; 8];
        let hash = mix_hash(key.hash_bytes(&mut scratch));
        hash as usize % self.buckets.len()
    }

    fn find_slot(&self, key: &CallerKey) -> Option<usize> {
        let start = self.probe_start(key);
        let n = self.buckets.len();
        for step in 0..n {
            let i = (start + step) % n;
            if self.buckets[i].occupied && self.buckets[i].key == *key {
                return Some(i);
            }
            if !self.buckets[i].occupied {
                return None;
            }
        }
        None
    }

    /// Redirect new distinct keys to the overflow bucket once the table is
    /// more than half full (spec.md §4.8).
    fn over_half_full(&self) -> bool {
        self.len * 2 > self.buckets.len()
    }

    /// Insert an allocation: bumps both "ever" and "in-use".
    pub fn insert(&mut self, key: CallerKey, bytes: usize) {
        if let Some(i) = self.find_slot(&key) {
            let c = &mut self.buckets[i].counts;
            c.bytes_ever += bytes as u64;
            c.count_ever += 1;
            c.bytes_in_use += bytes as u64;
            c.count_in_use += 1;
            return;
        }

        if self.over_half_full() {
            self.other.bytes_ever += bytes as u64;
            self.other.count_ever += 1;
            self.other.bytes_in_use += bytes as u64;
            self.other.count_in_use += 1;
            return;
        }

        let start = self.probe_start(&key);
        let n = self.buckets.len();
        for step in 0..n {
            let i = (start + step) % n;
            if !self.buckets[i].occupied {
                self.buckets[i] = Entry {
                    key,
                    counts: SiteCounts {
                        bytes_ever: bytes as u64,
                        count_ever: 1,
                        bytes_in_use: bytes as u64,
                        count_in_use: 1,
                    },
                    position: i as u32,
                    occupied: true,
                };
                self.len += 1;
                return;
            }
        }
        // Table is completely full despite the half-full guard (can only
        // happen with a pathologically small `memory_table_size`).
        self.other.bytes_ever += bytes as u64;
        self.other.count_ever += 1;
        self.other.bytes_in_use += bytes as u64;
        self.other.count_in_use += 1;
    }

    /// Release an allocation: subtracts from "in-use" only.
    pub fn remove(&mut self, key: &CallerKey, bytes: usize) {
        if let Some(i) = self.find_slot(key) {
            let c = &mut self.buckets[i].counts;
            c.bytes_in_use = c.bytes_in_use.saturating_sub(bytes as u64);
            c.count_in_use = c.count_in_use.saturating_sub(1);
            return;
        }
        self.other.bytes_in_use = self.other.bytes_in_use.saturating_sub(bytes as u64);
        self.other.count_in_use = self.other.count_in_use.saturating_sub(1);
    }

    pub fn in_use_for(&self, key: &CallerKey) -> SiteCounts {
        self.find_slot(key)
            .map(|i| self.buckets[i].counts)
            .unwrap_or_default()
    }

    pub fn other_pointers_bytes(&self) -> u64 {
        self.other.bytes_in_use
    }

    pub fn other_pointers_count(&self) -> u64 {
        self.other.count_in_use
    }

    /// Sum of `bytes_in_use` across every entry plus the overflow bucket
    /// (spec.md §8 property 6's right-hand side, before fence overhead).
    pub fn total_bytes_in_use(&self) -> u64 {
        self.buckets
            .iter()
            .filter(|e| e.occupied)
            .map(|e| e.counts.bytes_in_use)
            .sum::<u64>()
            + self.other.bytes_in_use
    }

    /// Top `limit` entries by total size descending, restoring original
    /// array order afterwards (spec.md §4.8).
    pub fn report(&mut self, limit: usize) -> Vec<(CallerKey, SiteCounts)> {
        let mut occupied: Vec<usize> = (0..self.buckets.len())
            .filter(|&i| self.buckets[i].occupied)
            .collect();

        sort_by_total_size_desc(&mut occupied, &self.buckets);

        occupied
            .into_iter()
            .take(limit)
            .map(|i| (self.buckets[i].key, self.buckets[i].counts))
            .collect()
    }
}

/// Quicksort with an insertion-sort base case below `PARTITION_CUTOFF`,
/// matching spec.md §4.8's "quicksort with insertion-sort below a tunable
/// partition size". Sorts indices by `bucket[i].counts.bytes_ever`
/// descending; callers restore original order by re-reading
/// `bucket[i].position`, which this function never touches.
const PARTITION_CUTOFF: usize = 8;

fn sort_by_total_size_desc(indices: &mut [usize], buckets: &[Entry]) {
    fn key(buckets: &[Entry], i: usize) -> u64 {
        buckets[i].counts.bytes_ever
    }

    fn insertion_sort(indices: &mut [usize], buckets: &[Entry]) {
        for i in 1..indices.len() {
            let mut j = i;
            while j > 0 && key(buckets, indices[j - 1]) < key(buckets, indices[j]) {
                indices.swap(j - 1, j);
                j -= 1;
            }
        }
    }

    fn quicksort(indices: &mut [usize], buckets: &[Entry]) {
        if indices.len() <= PARTITION_CUTOFF {
            insertion_sort(indices, buckets);
            return;
        }
        let pivot = key(buckets, indices[indices.len() / 2]);
        let (mut lt, mut gt) = (0, indices.len());
        let mut i = 0;
        while i < gt {
            let k = key(buckets, indices[i]);
            if k > pivot {
                indices.swap(i, lt);
                lt += 1;
                i += 1;
            } else if k < pivot {
                gt -= 1;
                indices.swap(i, gt);
            } else {
                i += 1;
            }
        }
        quicksort(&mut indices[..lt], buckets);
        quicksort(&mut indices[gt..], buckets);
    }

    quicksort(indices, buckets);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(line: u32) -> CallerKey {
        CallerKey::File {
            file: "x.rs",
            line,
        }
    }

    #[test]
    fn insert_then_remove_round_trips_in_use_counts() {
        let mut table = ProvenanceTable::new(64);
        table.insert(file(10), 100);
        assert_eq!(table.in_use_for(&file(10)).bytes_in_use, 100);
        table.remove(&file(10), 100);
        assert_eq!(table.in_use_for(&file(10)).bytes_in_use, 0);
        // "ever" counters are untouched by remove.
        assert_eq!(table.in_use_for(&file(10)).bytes_ever, 100);
    }

    #[test]
    fn distinct_keys_get_independent_counters() {
        let mut table = ProvenanceTable::new(64);
        table.insert(file(1), 10);
        table.insert(file(2), 20);
        assert_eq!(table.in_use_for(&file(1)).bytes_in_use, 10);
        assert_eq!(table.in_use_for(&file(2)).bytes_in_use, 20);
    }

    #[test]
    fn report_sorts_by_size_descending_and_preserves_table_afterwards() {
        let mut table = ProvenanceTable::new(64);
        table.insert(file(1), 10);
        table.insert(file(2), 50);
        table.insert(file(3), 30);

        let report = table.report(10);
        let sizes: Vec<u64> = report.iter().map(|(_, c)| c.bytes_ever).collect();
        assert_eq!(sizes, vec![50, 30, 10]);

        // table is still queryable by key after the report.
        assert_eq!(table.in_use_for(&file(2)).bytes_in_use, 50);
    }

    #[test]
    fn an_overfull_table_redirects_new_keys_to_the_overflow_bucket() {
        let mut table = ProvenanceTable::new(2); // 4 buckets
        for i in 0..10 {
            table.insert(file(i), 1);
        }
        assert!(table.other_pointers_count() > 0);
    }
}
