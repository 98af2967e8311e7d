//! Workload driver for the learned index.
//!
//! Takes a single positional argument, the path to a `key value` config
//! file, and runs a load phase followed by a mixed read/insert phase. The
//! data file named by `g_data_path` holds one record per line, a key and an
//! optional value; an empty path generates a uniform synthetic data set.

use buckindex::{BuckIndex, ConfigError, Key, KeyValue, Value, WorkloadConfig};
use clap::Parser;
use rand::Rng;
use rand::seq::IndexedRandom;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const SYNTHETIC_KEYS: usize = 100_000;
const MIXED_OPERATIONS: usize = 100_000;

#[derive(Debug, Parser)]
#[command(about = "Drive a bucketized learned index from a workload config file")]
struct Args {
    /// Path to the workload config file.
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match WorkloadConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let records = match load_records(&config) {
        Ok(records) => records,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };
    info!(records = records.len(), bulk_load = config.bulk_load, "data set ready");

    let mut index = BuckIndex::new(0.7, 8);
    if config.bulk_load {
        index.bulk_load(&records);
    } else {
        for kv in &records {
            index.insert(*kv);
        }
    }

    run_mixed_phase(&mut index, &records, config.read_ratio);

    let stats = index.stats();
    info!(
        keys = stats.num_keys,
        segments = stats.num_segments,
        data_buckets = stats.num_data_buckets,
        height = stats.height,
        merges = stats.n_merging,
        propagations = stats.n_non_merging,
        memory = index.memory_size(),
        "workload complete"
    );
    ExitCode::SUCCESS
}

/// Read the data set named by the config, or synthesize one.
fn load_records(config: &WorkloadConfig) -> Result<Vec<KeyValue>, ConfigError> {
    if config.data_path.is_empty() {
        let mut rng = rand::rng();
        let mut keys: Vec<Key> = (0..SYNTHETIC_KEYS).map(|_| rng.random::<Key>() | 1).collect();
        keys.sort_unstable();
        keys.dedup();
        return Ok(keys.into_iter().map(|k| KeyValue::new(k, k)).collect());
    }

    let text =
        std::fs::read_to_string(&config.data_path).map_err(|source| ConfigError::Open {
            path: config.data_path.clone(),
            source,
        })?;

    let mut records = Vec::new();
    for line in text.lines() {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(raw_key) = parts.next() else {
            continue;
        };
        let key: Key = raw_key.parse().map_err(|_| ConfigError::InvalidValue {
            key: "g_data_path".to_string(),
            value: raw_key.to_string(),
        })?;
        let value: Value = match parts.next() {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "g_data_path".to_string(),
                value: raw.to_string(),
            })?,
            None => key,
        };
        records.push(KeyValue::new(key, value));
    }
    records.sort_unstable_by_key(|kv| kv.key);
    records.dedup_by_key(|kv| kv.key);
    Ok(records)
}

/// Run reads against loaded keys and inserts of fresh ones in the
/// configured ratio.
fn run_mixed_phase(index: &mut BuckIndex, records: &[KeyValue], read_ratio: f32) {
    let mut rng = rand::rng();
    let mut hits = 0usize;
    let mut inserts = 0usize;

    for _ in 0..MIXED_OPERATIONS {
        if rng.random::<f32>() < read_ratio {
            if let Some(kv) = records.choose(&mut rng) {
                if index.lookup(kv.key).is_some() {
                    hits += 1;
                }
            }
        } else {
            let key = rng.random::<Key>() | 1;
            if index.insert(KeyValue::new(key, key)) {
                inserts += 1;
            }
        }
    }
    info!(hits, inserts, read_ratio = read_ratio as f64, "mixed phase done");
}
