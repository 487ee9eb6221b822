//! Bounded-memory membership structure used by the deletion sweep.
//!
//! Content ids are reduced to 16-byte MD5 digests. Digests accumulate in an
//! in-memory set until the spill threshold, then flush as sorted segment
//! files into a temp directory; `contains` answers exactly from the set plus
//! a binary search over each segment. Memory stays bounded by the threshold
//! regardless of how many ids a space holds.

use data_types::ContentId;
use md5::{Digest, Md5};
use std::{
    collections::HashSet,
    fs::File,
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};
use tempfile::TempDir;

const DIGEST_LEN: u64 = 16;

fn digest(id: &ContentId) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(id.as_str().as_bytes());
    hasher.finalize().into()
}

#[derive(Debug)]
struct Segment {
    path: PathBuf,
    entries: u64,
}

impl Segment {
    fn contains(&self, needle: &[u8; 16]) -> std::io::Result<bool> {
        let mut file = File::open(&self.path)?;
        let mut buf = [0u8; 16];
        let (mut lo, mut hi) = (0u64, self.entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            file.seek(SeekFrom::Start(mid * DIGEST_LEN))?;
            file.read_exact(&mut buf)?;
            match buf.cmp(needle) {
                std::cmp::Ordering::Equal => return Ok(true),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(false)
    }
}

/// An exact membership set over content ids with a bounded memory footprint.
#[derive(Debug)]
pub struct DigestSet {
    mem: HashSet<[u8; 16]>,
    spill_threshold: usize,
    spill_dir: Option<TempDir>,
    segments: Vec<Segment>,
}

impl DigestSet {
    /// Create a set that spills to disk once `spill_threshold` digests are
    /// buffered in memory.
    pub fn new(spill_threshold: usize) -> Self {
        Self {
            mem: HashSet::new(),
            spill_threshold: spill_threshold.max(1),
            spill_dir: None,
            segments: Vec::new(),
        }
    }

    /// Record a content id.
    pub fn insert(&mut self, id: &ContentId) -> std::io::Result<()> {
        self.mem.insert(digest(id));
        if self.mem.len() >= self.spill_threshold {
            self.spill()?;
        }
        Ok(())
    }

    /// True if `insert` was called for this id (exact, never probabilistic).
    pub fn contains(&self, id: &ContentId) -> std::io::Result<bool> {
        let needle = digest(id);
        if self.mem.contains(&needle) {
            return Ok(true);
        }
        for segment in &self.segments {
            if segment.contains(&needle)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop all recorded ids and any spilled segments.
    pub fn clear(&mut self) {
        self.mem.clear();
        self.segments.clear();
        self.spill_dir = None;
    }

    fn spill(&mut self) -> std::io::Result<()> {
        if self.spill_dir.is_none() {
            self.spill_dir = Some(tempfile::Builder::new().prefix("digest-set").tempdir()?);
        }
        let dir = self.spill_dir.as_ref().expect("spill dir just created");

        let mut digests: Vec<_> = self.mem.drain().collect();
        digests.sort_unstable();

        let path = dir.path().join(format!("seg-{:04}.bin", self.segments.len()));
        let mut file = File::create(&path)?;
        for d in &digests {
            file.write_all(d)?;
        }
        file.sync_all()?;

        self.segments.push(Segment {
            path,
            entries: digests.len() as u64,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> ContentId {
        ContentId::new(format!("content-{n:06}"))
    }

    #[test]
    fn in_memory_membership() {
        let mut set = DigestSet::new(1000);
        set.insert(&id(1)).unwrap();
        set.insert(&id(2)).unwrap();

        assert!(set.contains(&id(1)).unwrap());
        assert!(set.contains(&id(2)).unwrap());
        assert!(!set.contains(&id(3)).unwrap());
    }

    #[test]
    fn spilled_membership_stays_exact() {
        // threshold of 10 forces many segment spills for 100 ids
        let mut set = DigestSet::new(10);
        for n in 0..100 {
            set.insert(&id(n)).unwrap();
        }

        for n in 0..100 {
            assert!(set.contains(&id(n)).unwrap(), "id {n} missing");
        }
        for n in 100..200 {
            assert!(!set.contains(&id(n)).unwrap(), "id {n} spurious");
        }
    }

    #[test]
    fn clear_releases_everything() {
        let mut set = DigestSet::new(5);
        for n in 0..20 {
            set.insert(&id(n)).unwrap();
        }
        set.clear();

        assert!(!set.contains(&id(1)).unwrap());
        set.insert(&id(1)).unwrap();
        assert!(set.contains(&id(1)).unwrap());
    }
}
