//! VersionSet — owner of the MANIFEST, the file-number and sequence
//! counters, and the current version of every column family.
//!
//! All version changes funnel through [`VersionSet::log_and_apply`]:
//! the edit is staged, appended to the MANIFEST (rolling to a fresh
//! MANIFEST + CURRENT install when the old one grows past its limit),
//! and only then installed in memory.  A failure before the append
//! leaves no observable change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use tracing::info;

use crate::error::DbError;
use crate::filename::{manifest_file_name, read_current_file, set_current_file};
use crate::keys::{InternalKey, InternalKeyComparator, SequenceNumber};
use crate::options::{ColumnFamilyOptions, DbOptions};
use crate::wal::{LogReader, LogWriter};

use super::{
    FileMetadata, Version, VersionBuilder, VersionError, edit::VersionEdit,
};

/// Name of the default column family.
pub const DEFAULT_COLUMN_FAMILY_NAME: &str = "default";

// ------------------------------------------------------------------------------------------------
// ColumnFamilyState
// ------------------------------------------------------------------------------------------------

/// Mutable per-column-family bookkeeping owned by the version set.
pub struct ColumnFamilyState {
    /// Column family id (0 = default).
    pub id: u32,
    /// Column family name.
    pub name: String,
    /// Configuration.
    pub options: ColumnFamilyOptions,
    /// Internal-key comparator derived from the configured user
    /// comparator.
    pub icmp: InternalKeyComparator,
    /// Currently published version.
    pub current: Arc<Version>,
    /// Smallest WAL number still needed by this family.
    pub log_number: u64,
    /// Round-robin compaction cursor per level.
    pub compact_pointer: Vec<Option<InternalKey>>,
}

impl ColumnFamilyState {
    /// Test-only constructor for building states outside a version set.
    #[cfg(test)]
    pub(crate) fn new_for_tests(id: u32, name: String, options: ColumnFamilyOptions) -> Self {
        Self::new(id, name, options)
    }

    fn new(id: u32, name: String, options: ColumnFamilyOptions) -> Self {
        let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
        let num_levels = options.num_levels;
        Self {
            id,
            name,
            options,
            icmp,
            current: Arc::new(Version::empty(id, num_levels)),
            log_number: 0,
            compact_pointer: vec![None; num_levels],
        }
    }
}

impl std::fmt::Debug for ColumnFamilyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColumnFamilyState")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("log_number", &self.log_number)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// The on-disk state machine.  See the module docs.
pub struct VersionSet {
    db_path: PathBuf,
    db_options: DbOptions,

    next_file_number: u64,
    /// Last sequence number assigned to any write.
    pub last_sequence: SequenceNumber,
    manifest_file_number: u64,
    prev_log_number: u64,

    manifest: Option<LogWriter>,
    column_families: BTreeMap<u32, ColumnFamilyState>,
    max_column_family: u32,

    /// Files removed from published versions, awaiting physical
    /// deletion once nothing references them.
    obsolete_files: Vec<Arc<FileMetadata>>,
    /// Every version ever installed and possibly still referenced.
    live_versions: Vec<Weak<Version>>,
}

impl VersionSet {
    /// Creates an empty version set for `db_path`.
    pub fn new(db_path: &Path, db_options: DbOptions) -> Self {
        Self {
            db_path: db_path.to_path_buf(),
            db_options,
            next_file_number: 1,
            last_sequence: 0,
            manifest_file_number: 0,
            prev_log_number: 0,
            manifest: None,
            column_families: BTreeMap::new(),
            max_column_family: 0,
            obsolete_files: Vec::new(),
            live_versions: Vec::new(),
        }
    }

    // --------------------------------------------------------------------
    // Counters
    // --------------------------------------------------------------------

    /// Hands out the next database-wide file number.
    pub fn new_file_number(&mut self) -> u64 {
        let number = self.next_file_number;
        self.next_file_number += 1;
        number
    }

    /// Advances the counter past an externally observed number.
    pub fn mark_file_number_used(&mut self, number: u64) {
        if number >= self.next_file_number {
            self.next_file_number = number + 1;
        }
    }

    /// Current MANIFEST file number.
    pub fn manifest_file_number(&self) -> u64 {
        self.manifest_file_number
    }

    /// Smallest WAL number still needed by any column family.
    pub fn min_log_number(&self) -> u64 {
        self.column_families
            .values()
            .map(|cf| cf.log_number)
            .min()
            .unwrap_or(0)
    }

    // --------------------------------------------------------------------
    // Column family access
    // --------------------------------------------------------------------

    /// State of column family `id`.
    pub fn column_family(&self, id: u32) -> Option<&ColumnFamilyState> {
        self.column_families.get(&id)
    }

    pub(crate) fn column_family_mut(&mut self, id: u32) -> Option<&mut ColumnFamilyState> {
        self.column_families.get_mut(&id)
    }

    /// Looks a column family up by name.
    pub fn column_family_by_name(&self, name: &str) -> Option<&ColumnFamilyState> {
        self.column_families.values().find(|cf| cf.name == name)
    }

    /// All column families, ascending by id.
    pub fn iter_column_families(&self) -> impl Iterator<Item = &ColumnFamilyState> {
        self.column_families.values()
    }

    /// Ids of all column families.
    pub fn column_family_ids(&self) -> Vec<u32> {
        self.column_families.keys().copied().collect()
    }

    // --------------------------------------------------------------------
    // Bootstrap (fresh database)
    // --------------------------------------------------------------------

    /// Initializes a fresh database: registers the given column
    /// families and writes the first MANIFEST plus CURRENT.
    pub fn bootstrap(
        &mut self,
        descriptors: &[(String, ColumnFamilyOptions)],
    ) -> Result<(), DbError> {
        for (idx, (name, options)) in descriptors.iter().enumerate() {
            let id = idx as u32;
            self.column_families
                .insert(id, ColumnFamilyState::new(id, name.clone(), options.clone()));
            self.max_column_family = self.max_column_family.max(id);
        }
        self.roll_manifest()?;
        info!(
            db = %self.db_path.display(),
            manifest = self.manifest_file_number,
            families = self.column_families.len(),
            "fresh database bootstrapped"
        );
        Ok(())
    }

    // --------------------------------------------------------------------
    // LogAndApply
    // --------------------------------------------------------------------

    /// Applies a file-level edit to its column family: stages counters,
    /// persists the edit to the MANIFEST, and installs the new version.
    pub fn log_and_apply(&mut self, edit: &mut VersionEdit) -> Result<(), DbError> {
        let cf_id = edit.column_family;
        let Some(cf) = self.column_families.get(&cf_id) else {
            return Err(DbError::InvalidArgument(format!(
                "column family {cf_id} does not exist"
            )));
        };

        // Stage: fill in the global counters the edit must carry.
        if edit.next_file_number.is_none() {
            edit.next_file_number = Some(self.next_file_number);
        }
        if edit.last_sequence.is_none() {
            edit.last_sequence = Some(self.last_sequence);
        }
        if let Some(log_number) = edit.log_number
            && log_number < cf.log_number
        {
            return Err(DbError::InvalidArgument(format!(
                "edit moves log_number backwards ({log_number} < {})",
                cf.log_number
            )));
        }

        // Build the replacement version before touching the MANIFEST.
        let mut builder = VersionBuilder::new(Arc::clone(&cf.current), cf.icmp.clone());
        builder.apply(edit).map_err(DbError::from)?;
        let (version, removed) = builder.save(cf_id).map_err(DbError::from)?;

        // Persist.
        self.append_edit(edit)?;

        // Install.
        let options = self
            .column_families
            .get(&cf_id)
            .map(|cf| cf.options.clone())
            .unwrap_or_default();
        self.install_version(cf_id, version, removed, &options);

        let cf = self
            .column_families
            .get_mut(&cf_id)
            .expect("column family vanished during log_and_apply");
        if let Some(log_number) = edit.log_number {
            cf.log_number = log_number;
        }
        for (level, key) in &edit.compact_pointers {
            cf.compact_pointer[*level] = Some(key.clone());
        }
        if let Some(prev) = edit.prev_log_number {
            self.prev_log_number = prev;
        }
        Ok(())
    }

    /// Creates a column family: persists the creation edit and
    /// registers the state.  Returns the new id.
    pub fn create_column_family(
        &mut self,
        name: &str,
        options: ColumnFamilyOptions,
        log_number: u64,
    ) -> Result<u32, DbError> {
        if self.column_family_by_name(name).is_some() {
            return Err(DbError::InvalidArgument(format!(
                "column family {name:?} already exists"
            )));
        }
        let id = self.max_column_family + 1;

        let mut edit = VersionEdit::for_column_family(id);
        edit.column_family_name = Some(name.to_string());
        edit.comparator_name = Some(options.comparator.name().to_string());
        edit.log_number = Some(log_number);
        edit.max_column_family = Some(id);
        edit.next_file_number = Some(self.next_file_number);
        edit.last_sequence = Some(self.last_sequence);
        self.append_edit(&edit)?;

        let mut state = ColumnFamilyState::new(id, name.to_string(), options);
        state.log_number = log_number;
        self.column_families.insert(id, state);
        self.max_column_family = id;
        info!(name, id, "column family created");
        Ok(id)
    }

    /// Drops a column family: persists the drop edit, unregisters the
    /// state, and queues its files for deletion.
    pub fn drop_column_family(&mut self, id: u32) -> Result<(), DbError> {
        if id == 0 {
            return Err(DbError::InvalidArgument(
                "the default column family cannot be dropped".into(),
            ));
        }
        if !self.column_families.contains_key(&id) {
            return Err(DbError::InvalidArgument(format!(
                "column family {id} does not exist"
            )));
        }

        let mut edit = VersionEdit::for_column_family(id);
        edit.is_column_family_drop = true;
        self.append_edit(&edit)?;

        if let Some(state) = self.column_families.remove(&id) {
            let removed: Vec<Arc<FileMetadata>> =
                state.current.all_files().map(Arc::clone).collect();
            self.obsolete_files.extend(removed);
            info!(name = %state.name, id, "column family dropped");
        }
        Ok(())
    }

    fn install_version(
        &mut self,
        cf_id: u32,
        mut version: Version,
        removed: Vec<Arc<FileMetadata>>,
        options: &ColumnFamilyOptions,
    ) {
        version.storage.compute_compaction_score(options);
        let version = Arc::new(version);
        self.live_versions.push(Arc::downgrade(&version));
        if let Some(cf) = self.column_families.get_mut(&cf_id) {
            cf.current = version;
        }
        self.obsolete_files.extend(removed);
        // Keep the live list from growing without bound.
        self.live_versions.retain(|weak| weak.strong_count() > 0);
    }

    // --------------------------------------------------------------------
    // MANIFEST plumbing
    // --------------------------------------------------------------------

    /// Appends one encoded edit, rolling the MANIFEST first when it is
    /// missing or oversized.
    fn append_edit(&mut self, edit: &VersionEdit) -> Result<(), DbError> {
        let needs_roll = match &self.manifest {
            None => true,
            Some(writer) => writer.file_size() > self.db_options.max_manifest_file_size,
        };
        if needs_roll {
            self.roll_manifest()?;
            // The snapshot written by the roll already includes current
            // state; the edit still must follow it.
        }

        let mut record = Vec::new();
        edit.encode(&mut record);
        let writer = self
            .manifest
            .as_mut()
            .expect("roll_manifest left no writer");
        writer.add_record(&record)?;
        writer.sync()?;
        Ok(())
    }

    /// Starts a fresh MANIFEST: writes a base snapshot of every column
    /// family, fsyncs, and installs it as CURRENT.
    fn roll_manifest(&mut self) -> Result<(), DbError> {
        let number = self.new_file_number();
        let path = manifest_file_name(&self.db_path, number);
        let mut writer = LogWriter::create(&path)?;
        self.write_snapshot(&mut writer)?;
        writer.sync()?;
        set_current_file(&self.db_path, number)?;
        self.manifest = Some(writer);
        self.manifest_file_number = number;
        info!(manifest = number, "MANIFEST rolled");
        Ok(())
    }

    /// Serializes the full current state as a sequence of edits.
    fn write_snapshot(&self, writer: &mut LogWriter) -> Result<(), DbError> {
        // Head edit: global counters.
        let mut head = VersionEdit::default();
        head.next_file_number = Some(self.next_file_number);
        head.last_sequence = Some(self.last_sequence);
        head.prev_log_number = Some(self.prev_log_number);
        head.max_column_family = Some(self.max_column_family);
        let mut record = Vec::new();
        head.encode(&mut record);
        writer.add_record(&record)?;

        for cf in self.column_families.values() {
            let mut edit = VersionEdit::for_column_family(cf.id);
            edit.column_family_name = Some(cf.name.clone());
            edit.comparator_name = Some(cf.options.comparator.name().to_string());
            edit.log_number = Some(cf.log_number);
            for (level, pointer) in cf.compact_pointer.iter().enumerate() {
                if let Some(key) = pointer {
                    edit.compact_pointers.push((level, key.clone()));
                }
            }
            for level in 0..cf.current.storage.num_levels() {
                for file in cf.current.storage.files(level) {
                    edit.add_file(
                        level,
                        file.number,
                        file.path_id,
                        file.file_size,
                        file.smallest.clone(),
                        file.largest.clone(),
                        file.smallest_seq,
                        file.largest_seq,
                    );
                }
            }
            let mut record = Vec::new();
            edit.encode(&mut record);
            writer.add_record(&record)?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------

    /// Reconstructs state from CURRENT + MANIFEST.
    ///
    /// `descriptors` must name every persisted column family (with its
    /// options); recovery validates comparator identity and that no
    /// file sits at a level the new configuration no longer has.
    pub fn recover(
        &mut self,
        descriptors: &[(String, ColumnFamilyOptions)],
    ) -> Result<(), DbError> {
        let manifest_name = read_current_file(&self.db_path)?;
        let manifest_number = manifest_name
            .strip_prefix("MANIFEST-")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| {
                DbError::Corruption(format!("CURRENT names a non-manifest file {manifest_name:?}"))
            })?;

        let by_name: HashMap<&str, &ColumnFamilyOptions> = descriptors
            .iter()
            .map(|(name, options)| (name.as_str(), options))
            .collect();

        struct Recovering {
            name: String,
            options: ColumnFamilyOptions,
            builder: VersionBuilder,
            log_number: u64,
            compact_pointers: Vec<(usize, InternalKey)>,
            comparator_name: Option<String>,
        }

        let mut recovering: BTreeMap<u32, Recovering> = BTreeMap::new();
        let create_family =
            |id: u32, name: &str| -> Result<Recovering, DbError> {
                let options = by_name.get(name).copied().cloned().ok_or_else(|| {
                    DbError::InvalidArgument(format!(
                        "column family {name:?} exists in the database but was not opened"
                    ))
                })?;
                let icmp = InternalKeyComparator::new(Arc::clone(&options.comparator));
                let base = Arc::new(Version::empty(id, options.num_levels));
                Ok(Recovering {
                    name: name.to_string(),
                    options,
                    builder: VersionBuilder::new(base, icmp),
                    log_number: 0,
                    compact_pointers: Vec::new(),
                    comparator_name: None,
                })
            };

        // The default family exists from the first record on.
        recovering.insert(0, create_family(0, DEFAULT_COLUMN_FAMILY_NAME)?);

        let manifest_path = self.db_path.join(&manifest_name);
        let mut reader = LogReader::open(&manifest_path)?;
        let mut records = 0u64;
        loop {
            let record = match reader.read_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    // The MANIFEST is the source of truth; any damage
                    // fails the open.
                    return Err(DbError::Corruption(format!(
                        "MANIFEST {manifest_name}: {err}"
                    )));
                }
            };
            records += 1;
            let edit = VersionEdit::decode(&record)?;
            let cf_id = edit.column_family;

            if let Some(name) = &edit.column_family_name {
                if let Some(existing) = recovering.get_mut(&cf_id) {
                    existing.name = name.clone();
                } else {
                    recovering.insert(cf_id, create_family(cf_id, name)?);
                }
                self.max_column_family = self.max_column_family.max(cf_id);
            }
            if edit.is_column_family_drop {
                recovering.remove(&cf_id);
                continue;
            }

            if let Some(next) = edit.next_file_number {
                self.next_file_number = self.next_file_number.max(next);
            }
            if let Some(seq) = edit.last_sequence {
                self.last_sequence = self.last_sequence.max(seq);
            }
            if let Some(prev) = edit.prev_log_number {
                self.prev_log_number = prev;
            }
            if let Some(max_cf) = edit.max_column_family {
                self.max_column_family = self.max_column_family.max(max_cf);
            }

            let Some(target) = recovering.get_mut(&cf_id) else {
                if edit.new_files.is_empty() && edit.deleted_files.is_empty() {
                    continue;
                }
                return Err(DbError::Corruption(format!(
                    "MANIFEST edit targets unknown column family {cf_id}"
                )));
            };
            if let Some(log_number) = edit.log_number {
                target.log_number = target.log_number.max(log_number);
            }
            if let Some(name) = &edit.comparator_name {
                target.comparator_name = Some(name.clone());
            }
            target
                .compact_pointers
                .extend(edit.compact_pointers.iter().cloned());
            target.builder.apply(&edit).map_err(DbError::from)?;
        }

        // Validate and install.
        for (id, rec) in recovering {
            if let Some(stored) = &rec.comparator_name {
                let configured = rec.options.comparator.name();
                if stored != configured {
                    return Err(DbError::InvalidArgument(format!(
                        "column family {:?} was created with comparator {stored:?} but is being opened with {configured:?}",
                        rec.name
                    )));
                }
            }

            let (version, _) = rec.builder.save(id).map_err(DbError::from)?;
            for file in version.all_files() {
                self.mark_file_number_used(file.number);
            }
            let mut state = ColumnFamilyState::new(id, rec.name, rec.options);
            state.log_number = rec.log_number;
            for (level, key) in rec.compact_pointers {
                if level < state.compact_pointer.len() {
                    state.compact_pointer[level] = Some(key);
                }
            }
            self.install_recovered(&mut state, version);
            self.column_families.insert(id, state);
        }

        self.mark_file_number_used(manifest_number);
        self.manifest_file_number = manifest_number;
        // A fresh MANIFEST is started on the next edit; the recovered
        // one is never appended to.
        self.manifest = None;

        info!(
            manifest = %manifest_name,
            records,
            families = self.column_families.len(),
            last_sequence = self.last_sequence,
            "version set recovered"
        );
        Ok(())
    }

    fn install_recovered(&mut self, state: &mut ColumnFamilyState, mut version: Version) {
        version.storage.compute_compaction_score(&state.options);
        let version = Arc::new(version);
        self.live_versions.push(Arc::downgrade(&version));
        state.current = version;
    }

    // --------------------------------------------------------------------
    // Live / obsolete file bookkeeping
    // --------------------------------------------------------------------

    /// Numbers of every table file referenced by any still-referenced
    /// version.
    pub fn live_file_numbers(&mut self) -> HashSet<u64> {
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        let mut live = HashSet::new();
        for weak in &self.live_versions {
            if let Some(version) = weak.upgrade() {
                for file in version.all_files() {
                    live.insert(file.number);
                }
            }
        }
        for cf in self.column_families.values() {
            for file in cf.current.all_files() {
                live.insert(file.number);
            }
        }
        live
    }

    /// Number of versions still referenced by anything (current
    /// versions, iterators, compactions).
    pub fn num_live_versions(&mut self) -> usize {
        self.live_versions.retain(|weak| weak.strong_count() > 0);
        self.live_versions.len()
    }

    /// Drains obsolete file metadata whose reference count shows no
    /// remaining holder.
    pub fn take_unreferenced_obsolete_files(&mut self) -> Vec<Arc<FileMetadata>> {
        let (free, kept): (Vec<_>, Vec<_>) = self
            .obsolete_files
            .drain(..)
            .partition(|meta| Arc::strong_count(meta) == 1);
        self.obsolete_files = kept;
        if !free.is_empty() {
            let numbers: Vec<u64> = free.iter().map(|f| f.number).collect();
            tracing::debug!(?numbers, "table files became obsolete");
        }
        free
    }

    /// Database path this version set manages.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

impl std::fmt::Debug for VersionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionSet")
            .field("next_file_number", &self.next_file_number)
            .field("last_sequence", &self.last_sequence)
            .field("manifest_file_number", &self.manifest_file_number)
            .field("column_families", &self.column_families.len())
            .finish_non_exhaustive()
    }
}
