use config::{MergeConfig, MergePolicy};

use crate::metadata::{FileMetadata, MetadataTable};

/// Why a consolidation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsolidationMode {
    #[default]
    Default,
    /// Purge everything superseded or deleted: every file holding such
    /// entries is merged, however few there are.
    Gdpr,
}

/// Size classes for the file-count policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SizeBucket {
    VerySmall,
    Small,
    Medium,
    Large,
}

/// Decides which checkpoint files a consolidation should merge.
#[derive(Debug, Clone)]
pub struct MergeHelper {
    config: MergeConfig,
}

impl MergeHelper {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Ids of the files to merge, ascending, or `None` when no policy
    /// triggers.
    pub fn should_merge(&self, table: &MetadataTable, mode: ConsolidationMode) -> Option<Vec<u32>> {
        let policy = self.config.policy;
        if policy.is_none() && mode == ConsolidationMode::Default {
            return None;
        }

        let mut selected: Vec<u32> = Vec::new();

        let qualifying: Vec<u32> = table
            .files()
            .filter(|f| self.qualifies(f, mode))
            .map(|f| f.file_id())
            .collect();
        let threshold = match mode {
            ConsolidationMode::Gdpr => 1,
            ConsolidationMode::Default => self.config.merge_files_count_threshold.max(1),
        };
        if !qualifying.is_empty() && qualifying.len() >= threshold {
            selected.extend(qualifying);
        }

        if policy.contains(MergePolicy::FILE_COUNT) {
            if let Some(bucket) = self.full_size_bucket(table) {
                selected.extend(bucket);
            }
        }

        if selected.is_empty() {
            return None;
        }
        selected.sort_unstable();
        selected.dedup();
        Some(selected)
    }

    fn qualifies(&self, file: &FileMetadata, mode: ConsolidationMode) -> bool {
        let total = file.total_entries();
        if total == 0 {
            return false;
        }
        let invalid = file.invalid_entries();
        let deleted = file.deleted_entries();

        if mode == ConsolidationMode::Gdpr {
            return invalid > 0 || deleted > 0;
        }

        let policy = self.config.policy;
        if policy.contains(MergePolicy::INVALID_ENTRIES) {
            if invalid * 100 / total >= self.config.percentage_of_invalid_entries_per_file {
                return true;
            }
            if let Some(count) = self.config.number_of_invalid_entries {
                if invalid >= count {
                    return true;
                }
            }
        }
        policy.contains(MergePolicy::DELETED_ENTRIES)
            && deleted * 100 / total >= self.config.percentage_of_deleted_entries_per_file
    }

    fn bucket_of(&self, size: u64) -> SizeBucket {
        if size < self.config.very_small_file_size {
            SizeBucket::VerySmall
        } else if size < self.config.small_file_size {
            SizeBucket::Small
        } else if size < self.config.medium_file_size {
            SizeBucket::Medium
        } else {
            SizeBucket::Large
        }
    }

    /// The oldest `file_count_merge_threshold` files of the smallest size
    /// class that has reached the threshold.
    fn full_size_bucket(&self, table: &MetadataTable) -> Option<Vec<u32>> {
        let threshold = self.config.file_count_merge_threshold.max(2);
        let mut buckets: [Vec<u32>; 4] = Default::default();
        for file in table.files() {
            let slot = self.bucket_of(file.size_on_disk()) as usize;
            buckets[slot].push(file.file_id());
        }
        buckets
            .into_iter()
            .find(|ids| ids.len() >= threshold)
            .map(|mut ids| {
                ids.truncate(threshold);
                ids
            })
    }
}
