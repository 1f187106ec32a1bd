//! # Config - store tuning knobs
//!
//! [`StoreConfig`] carries every setting the differential store reads:
//! consolidation batching, background task switches, lock timeouts and the
//! file-merge policy. Defaults match the values the store has always shipped
//! with; [`StoreConfig::from_env`] overrides them from `TSTORE_*` variables.
//!
//! ```text
//! TSTORE_WORKING_DIR                    checkpoint directory        (default: "data/tstore")
//! TSTORE_TRACE_TYPE                     tracing context tag         (default: "tstore")
//! TSTORE_DELTAS_TO_CONSOLIDATE          deltas per consolidation    (default: 3)
//! TSTORE_SLOW_CONSOLIDATION_MARGIN      extra deltas before warning (default: 7)
//! TSTORE_BACKGROUND_CONSOLIDATION       consolidate off-thread      (default: true)
//! TSTORE_SWEEP                          evict values after swaps    (default: true)
//! TSTORE_SWEEP_VALUES                   values may be evicted       (default: true)
//! TSTORE_CHECKPOINT_LOCK_TIMEOUT_MS     checkpoint prime lock wait  (default: 1000)
//! TSTORE_CONSOLIDATION_LOCK_TIMEOUT_MS  consolidation lock wait     (default: 256000)
//! TSTORE_MERGE_POLICY                   comma list of invalid,deleted,filecount,none
//! TSTORE_MERGE_FILES_COUNT_THRESHOLD    qualifying files to merge   (default: 16)
//! TSTORE_INVALID_ENTRIES_PERCENT        invalid % per file          (default: 33)
//! TSTORE_DELETED_ENTRIES_PERCENT        deleted % per file          (default: 33)
//! TSTORE_FILE_COUNT_MERGE_THRESHOLD     files per size bucket       (default: 16)
//! ```
use std::path::PathBuf;
use std::time::Duration;

/// Default number of delta components that must accumulate before
/// consolidation does any work.
pub const DEFAULT_NUMBER_OF_DELTAS_TO_BE_CONSOLIDATED: u32 = 3;

/// Default slack above the consolidation batch size before a slow
/// consolidation is reported.
pub const DEFAULT_SLOW_CONSOLIDATION_MARGIN: u32 = 7;

pub const DEFAULT_CHECKPOINT_LOCK_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_CONSOLIDATION_LOCK_TIMEOUT_MS: u64 = 256 * 1_000;

pub const DEFAULT_MERGE_FILES_COUNT_THRESHOLD: usize = 16;
pub const DEFAULT_PERCENTAGE_OF_INVALID_ENTRIES_PER_FILE: u64 = 33;
pub const DEFAULT_PERCENTAGE_OF_DELETED_ENTRIES_PER_FILE: u64 = 33;
pub const DEFAULT_FILE_COUNT_MERGE_THRESHOLD: usize = 16;

pub const DEFAULT_VERY_SMALL_FILE_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_SMALL_FILE_SIZE: u64 = 16 * 1024 * 1024;
pub const DEFAULT_MEDIUM_FILE_SIZE: u64 = 200 * 1024 * 1024;

/// Set of merge policies consulted by the merge helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergePolicy(u8);

impl MergePolicy {
    pub const NONE: MergePolicy = MergePolicy(0);
    /// Merge files whose share of superseded entries is high.
    pub const INVALID_ENTRIES: MergePolicy = MergePolicy(1);
    /// Merge files whose share of tombstones is high.
    pub const DELETED_ENTRIES: MergePolicy = MergePolicy(2);
    /// Merge when too many files of similar size accumulate.
    pub const FILE_COUNT: MergePolicy = MergePolicy(4);
    pub const ALL: MergePolicy = MergePolicy(1 | 2 | 4);

    #[must_use]
    pub fn contains(self, other: MergePolicy) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn union(self, other: MergePolicy) -> MergePolicy {
        MergePolicy(self.0 | other.0)
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Parses `invalid,deleted,filecount` style lists. Unknown names are
    /// ignored with a warning.
    pub fn parse_list(s: &str) -> MergePolicy {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .fold(MergePolicy::NONE, |acc, name| {
                match name.to_ascii_lowercase().as_str() {
                    "invalid" | "invalidentries" => acc.union(MergePolicy::INVALID_ENTRIES),
                    "deleted" | "deletedentries" => acc.union(MergePolicy::DELETED_ENTRIES),
                    "filecount" => acc.union(MergePolicy::FILE_COUNT),
                    "all" => acc.union(MergePolicy::ALL),
                    "none" => acc,
                    other => {
                        tracing::warn!(policy = other, "ignoring unknown merge policy");
                        acc
                    }
                }
            })
    }
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy::INVALID_ENTRIES
    }
}

/// File-merge policy thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    pub policy: MergePolicy,
    /// Minimum number of qualifying files before an entry-based merge runs.
    pub merge_files_count_threshold: usize,
    pub percentage_of_invalid_entries_per_file: u64,
    /// When set, a file with at least this many invalid entries qualifies
    /// regardless of its percentage.
    pub number_of_invalid_entries: Option<u64>,
    pub percentage_of_deleted_entries_per_file: u64,
    /// Files per size bucket before a file-count merge runs.
    pub file_count_merge_threshold: usize,
    pub very_small_file_size: u64,
    pub small_file_size: u64,
    pub medium_file_size: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::default(),
            merge_files_count_threshold: DEFAULT_MERGE_FILES_COUNT_THRESHOLD,
            percentage_of_invalid_entries_per_file: DEFAULT_PERCENTAGE_OF_INVALID_ENTRIES_PER_FILE,
            number_of_invalid_entries: None,
            percentage_of_deleted_entries_per_file: DEFAULT_PERCENTAGE_OF_DELETED_ENTRIES_PER_FILE,
            file_count_merge_threshold: DEFAULT_FILE_COUNT_MERGE_THRESHOLD,
            very_small_file_size: DEFAULT_VERY_SMALL_FILE_SIZE,
            small_file_size: DEFAULT_SMALL_FILE_SIZE,
            medium_file_size: DEFAULT_MEDIUM_FILE_SIZE,
        }
    }
}

/// Complete configuration of one store instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding checkpoint files and the metadata table.
    pub working_dir: PathBuf,
    /// Tag attached to every log event of this store.
    pub trace_type: String,
    /// Identifier passed to the version manager.
    pub state_provider_id: u64,
    /// `false` keeps everything in memory: checkpoints never touch disk.
    pub has_persisted_state: bool,
    pub number_of_deltas_to_be_consolidated: u32,
    pub slow_consolidation_margin: u32,
    pub enable_background_consolidation: bool,
    pub enable_sweep: bool,
    /// Whether in-memory values of checkpointed records may be evicted.
    pub sweep_values: bool,
    pub checkpoint_lock_timeout: Duration,
    pub consolidation_lock_timeout: Duration,
    pub merge: MergeConfig,
}

impl StoreConfig {
    /// Default configuration rooted at `working_dir`.
    pub fn new<P: Into<PathBuf>>(working_dir: P) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    /// Reads overrides from `TSTORE_*` environment variables.
    ///
    /// Malformed numbers fall back to the default, the same way the shell
    /// front-end has always treated its environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let md = MergeConfig::default();
        let get = |key: &str| lookup(key);

        Self {
            working_dir: get("TSTORE_WORKING_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.working_dir),
            trace_type: get("TSTORE_TRACE_TYPE").unwrap_or(d.trace_type),
            state_provider_id: parse_or(get("TSTORE_STATE_PROVIDER_ID"), d.state_provider_id),
            has_persisted_state: parse_or(get("TSTORE_PERSISTED"), d.has_persisted_state),
            number_of_deltas_to_be_consolidated: parse_or(
                get("TSTORE_DELTAS_TO_CONSOLIDATE"),
                d.number_of_deltas_to_be_consolidated,
            ),
            slow_consolidation_margin: parse_or(
                get("TSTORE_SLOW_CONSOLIDATION_MARGIN"),
                d.slow_consolidation_margin,
            ),
            enable_background_consolidation: parse_or(
                get("TSTORE_BACKGROUND_CONSOLIDATION"),
                d.enable_background_consolidation,
            ),
            enable_sweep: parse_or(get("TSTORE_SWEEP"), d.enable_sweep),
            sweep_values: parse_or(get("TSTORE_SWEEP_VALUES"), d.sweep_values),
            checkpoint_lock_timeout: Duration::from_millis(parse_or(
                get("TSTORE_CHECKPOINT_LOCK_TIMEOUT_MS"),
                DEFAULT_CHECKPOINT_LOCK_TIMEOUT_MS,
            )),
            consolidation_lock_timeout: Duration::from_millis(parse_or(
                get("TSTORE_CONSOLIDATION_LOCK_TIMEOUT_MS"),
                DEFAULT_CONSOLIDATION_LOCK_TIMEOUT_MS,
            )),
            merge: MergeConfig {
                policy: get("TSTORE_MERGE_POLICY")
                    .map(|s| MergePolicy::parse_list(&s))
                    .unwrap_or(md.policy),
                merge_files_count_threshold: parse_or(
                    get("TSTORE_MERGE_FILES_COUNT_THRESHOLD"),
                    md.merge_files_count_threshold,
                ),
                percentage_of_invalid_entries_per_file: parse_or(
                    get("TSTORE_INVALID_ENTRIES_PERCENT"),
                    md.percentage_of_invalid_entries_per_file,
                ),
                number_of_invalid_entries: get("TSTORE_INVALID_ENTRIES_COUNT")
                    .and_then(|s| s.trim().parse().ok()),
                percentage_of_deleted_entries_per_file: parse_or(
                    get("TSTORE_DELETED_ENTRIES_PERCENT"),
                    md.percentage_of_deleted_entries_per_file,
                ),
                file_count_merge_threshold: parse_or(
                    get("TSTORE_FILE_COUNT_MERGE_THRESHOLD"),
                    md.file_count_merge_threshold,
                ),
                ..md
            },
        }
    }

    /// Number of deltas past which consolidation is reported as slow.
    #[must_use]
    pub fn slow_consolidation_index(&self) -> u32 {
        self.number_of_deltas_to_be_consolidated + self.slow_consolidation_margin
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            working_dir: PathBuf::from("data/tstore"),
            trace_type: "tstore".to_string(),
            state_provider_id: 1,
            has_persisted_state: true,
            number_of_deltas_to_be_consolidated: DEFAULT_NUMBER_OF_DELTAS_TO_BE_CONSOLIDATED,
            slow_consolidation_margin: DEFAULT_SLOW_CONSOLIDATION_MARGIN,
            enable_background_consolidation: true,
            enable_sweep: true,
            sweep_values: true,
            checkpoint_lock_timeout: Duration::from_millis(DEFAULT_CHECKPOINT_LOCK_TIMEOUT_MS),
            consolidation_lock_timeout: Duration::from_millis(DEFAULT_CONSOLIDATION_LOCK_TIMEOUT_MS),
            merge: MergeConfig::default(),
        }
    }
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests;
