//! Definition of index options and the workload configuration loader.

use crate::kv::Key;
use crate::model::LinearModel;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// How a bucket-local probe hint is derived for a key.
///
/// The hint only chooses where the probe starts; every mode is correct,
/// they differ in expected probe length under collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HintKind {
    /// Always probe from slot zero.
    None,
    /// Key modulo the bucket capacity.
    #[default]
    KeyMod,
    /// An opaque 64-bit mix of the key, modulo the bucket capacity.
    HashMod,
    /// Prediction of a per-bucket endpoint model over the covered range.
    Model,
}

/// Which fit the inner-layer segmentation runs over a closed piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelKind {
    /// Line through the first and last key.
    Endpoints,
    /// Ordinary least squares over `(key, rank)` pairs.
    #[default]
    Regression,
}

impl ModelKind {
    /// Fit a model over a sorted piece of keys.
    pub(crate) fn fit(&self, keys: &[Key]) -> LinearModel {
        match self {
            ModelKind::Endpoints => LinearModel::endpoints(keys),
            ModelKind::Regression => LinearModel::regression(keys),
        }
    }
}

/// Tuning knobs of a [`BuckIndex`](crate::BuckIndex).
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    /// Target bucket occupancy at bulk load and rebuild, in `(0, 1]`.
    pub initial_fill_ratio: f64,
    /// Tolerance of the inner-layer segmentation, in rank positions.
    pub error_bound: u64,
    /// Slots per data bucket.
    pub data_bucket_capacity: usize,
    /// Slots per segment bucket.
    pub segment_bucket_capacity: usize,
    /// Absorbed-split count at which a leaf segment becomes a merge candidate.
    pub merge_smo_threshold: u32,
    /// Neighbors inspected on each side when deciding a merge.
    pub merge_window: usize,
    /// Probe hint derivation.
    pub hint: HintKind,
    /// Inner-layer model fit.
    pub model: ModelKind,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            initial_fill_ratio: 0.7,
            error_bound: 8,
            data_bucket_capacity: 256,
            segment_bucket_capacity: 8,
            merge_smo_threshold: 2,
            merge_window: 2,
            hint: HintKind::default(),
            model: ModelKind::default(),
        }
    }
}

impl IndexOptions {
    /// Assert that the options are usable.
    ///
    /// # Panics
    ///
    /// * Fill ratio out of `(0, 1]`.
    /// * Error bound of zero.
    /// * Data bucket capacity below two (a split needs both halves).
    /// * Segment bucket capacity below two.
    pub(crate) fn validate(&self) {
        assert!(
            self.initial_fill_ratio > 0.0 && self.initial_fill_ratio <= 1.0,
            "fill ratio must be in (0, 1]"
        );
        assert!(self.error_bound >= 1, "error bound must be at least 1");
        assert!(
            self.data_bucket_capacity >= 2,
            "data buckets need at least 2 slots"
        );
        assert!(
            self.segment_bucket_capacity >= 2,
            "segment buckets need at least 2 slots"
        );
    }
}

/// Failure to load a workload configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("missing value for config key: {0}")]
    MissingValue(String),
    #[error("invalid value {value:?} for config key {key}")]
    InvalidValue { key: String, value: String },
}

/// Workload settings read from a `key value` text file.
///
/// Lines starting with `#` and blank lines are skipped; key and value are
/// whitespace separated. Recognized keys are `g_data_path`, `g_bulk_load`
/// and `g_read_ratio`; anything else is an error.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadConfig {
    /// Input data file; empty means a synthetic workload.
    pub data_path: String,
    /// Whether to bulk load the data set instead of inserting one by one.
    pub bulk_load: bool,
    /// Fraction of read operations in the mixed phase.
    pub read_ratio: f32,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            data_path: String::new(),
            bulk_load: false,
            read_ratio: 0.5,
        }
    }
}

impl WorkloadConfig {
    /// Load a configuration from a file.
    ///
    /// # Arguments
    ///
    /// * `path` - Config file location.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Open {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for line in text.lines() {
            if line.len() <= 1 || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(key) = parts.next() else {
                continue;
            };
            let value = parts
                .next()
                .ok_or_else(|| ConfigError::MissingValue(key.to_string()))?;

            match key {
                "g_data_path" => config.data_path = value.to_string(),
                "g_bulk_load" => {
                    let parsed: i64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                    config.bulk_load = parsed != 0;
                }
                "g_read_ratio" => {
                    config.read_ratio =
                        value.parse().map_err(|_| ConfigError::InvalidValue {
                            key: key.to_string(),
                            value: value.to_string(),
                        })?;
                }
                _ => return Err(ConfigError::UnknownKey(key.to_string())),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = WorkloadConfig::default();
        assert_eq!("", config.data_path);
        assert!(!config.bulk_load);
        assert_eq!(0.5, config.read_ratio);
    }

    #[test]
    fn parse_recognized_keys() {
        let text = "# workload\n\
                    g_data_path /tmp/keys.txt\n\
                    g_bulk_load 1\n\
                    g_read_ratio 0.9\n";
        let config = WorkloadConfig::parse(text).unwrap();
        assert_eq!("/tmp/keys.txt", config.data_path);
        assert!(config.bulk_load);
        assert_eq!(0.9, config.read_ratio);
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let text = "# a comment\n\n# another\ng_bulk_load 0\n";
        let config = WorkloadConfig::parse(text).unwrap();
        assert!(!config.bulk_load);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = WorkloadConfig::parse("g_threads 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "g_threads"));
    }

    #[test]
    fn missing_value_is_an_error() {
        let err = WorkloadConfig::parse("g_read_ratio\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(k) if k == "g_read_ratio"));
    }

    #[test]
    fn malformed_value_is_an_error() {
        let err = WorkloadConfig::parse("g_read_ratio fast\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = WorkloadConfig::load("/definitely/not/here.cfg").unwrap_err();
        assert!(matches!(err, ConfigError::Open { .. }));
    }
}
