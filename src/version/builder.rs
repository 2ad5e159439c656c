//! Version builder — applies edits to a base version and produces the
//! next published version.

use std::collections::HashSet;
use std::sync::Arc;

use crate::keys::InternalKeyComparator;

use super::{FileMetadata, Version, VersionError, VersionStorageInfo, edit::VersionEdit};

/// Accumulates one or more edits on top of a base version, then saves
/// the result as a fresh [`Version`].
pub struct VersionBuilder {
    base: Arc<Version>,
    icmp: InternalKeyComparator,
    added: Vec<Vec<Arc<FileMetadata>>>,
    deleted: Vec<HashSet<u64>>,
}

impl VersionBuilder {
    /// Starts building on top of `base`.
    pub fn new(base: Arc<Version>, icmp: InternalKeyComparator) -> Self {
        let levels = base.storage.num_levels();
        Self {
            base,
            icmp,
            added: vec![Vec::new(); levels],
            deleted: vec![HashSet::new(); levels],
        }
    }

    /// Applies one edit's file additions and deletions.
    pub fn apply(&mut self, edit: &VersionEdit) -> Result<(), VersionError> {
        let levels = self.base.storage.num_levels();

        for (level, number) in &edit.deleted_files {
            if *level >= levels {
                return Err(VersionError::Corruption(format!(
                    "edit deletes file {number} at level {level}, but the column family has {levels} levels"
                )));
            }
            self.deleted[*level].insert(*number);
            // A file re-added after deletion within one batch of edits
            // would be a logic error; the delete set wins unless a
            // later apply() re-adds it, mirroring edit order.
            self.added[*level].retain(|f| f.number != *number);
        }

        for (level, entry) in &edit.new_files {
            if *level >= levels {
                return Err(VersionError::Corruption(format!(
                    "edit adds file {} at level {level}, but the column family has {levels} levels",
                    entry.number
                )));
            }
            self.deleted[*level].remove(&entry.number);
            self.added[*level].push(Arc::new(FileMetadata::from_edit(entry)));
        }
        Ok(())
    }

    /// Merges base and accumulated changes into a new version,
    /// validating that every deleted file existed and that levels ≥ 1
    /// stay disjoint and sorted.
    ///
    /// Returns the new version together with the base's metadata for
    /// files the edits removed (the caller moves them to the obsolete
    /// list).
    pub fn save(self, cf_id: u32) -> Result<(Version, Vec<Arc<FileMetadata>>), VersionError> {
        let levels = self.base.storage.num_levels();
        let mut files: Vec<Vec<Arc<FileMetadata>>> = Vec::with_capacity(levels);
        let mut removed: Vec<Arc<FileMetadata>> = Vec::new();

        for level in 0..levels {
            let mut matched: HashSet<u64> = HashSet::new();
            let mut level_files: Vec<Arc<FileMetadata>> = Vec::new();

            for file in self.base.storage.files(level) {
                if self.deleted[level].contains(&file.number) {
                    matched.insert(file.number);
                    removed.push(Arc::clone(file));
                } else {
                    level_files.push(Arc::clone(file));
                }
            }
            for number in &self.deleted[level] {
                if !matched.contains(number) {
                    return Err(VersionError::Corruption(format!(
                        "edit deletes file {number} at level {level}, which is not in the current version"
                    )));
                }
            }
            level_files.extend(self.added[level].iter().cloned());

            if level == 0 {
                // Newest first, by largest sequence.
                level_files.sort_by(|a, b| b.largest_seq.cmp(&a.largest_seq));
            } else {
                level_files.sort_by(|a, b| {
                    self.icmp
                        .compare(a.smallest.encoded(), b.smallest.encoded())
                });
                for pair in level_files.windows(2) {
                    if self
                        .icmp
                        .compare(pair[0].largest.encoded(), pair[1].smallest.encoded())
                        != std::cmp::Ordering::Less
                    {
                        return Err(VersionError::Corruption(format!(
                            "files {} and {} overlap at level {level}",
                            pair[0].number, pair[1].number
                        )));
                    }
                }
            }
            files.push(level_files);
        }

        let storage = VersionStorageInfo::with_files(levels, files);
        Ok((Version { cf_id, storage }, removed))
    }
}
