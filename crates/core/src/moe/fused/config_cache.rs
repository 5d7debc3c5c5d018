//! Tuned kernel config tables, loaded on first use and memoized.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use super::config::{config_file_name, default_config, KernelConfig};
use crate::error::{MoeError, Result};
use crate::quantization::BlockShape;

/// Batch size breakpoint -> tuned config.
pub type ConfigTable = BTreeMap<usize, KernelConfig>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TableKey {
    num_experts: usize,
    n: usize,
    dtype: Option<String>,
    block_shape: Option<BlockShape>,
}

/// Memoized lookup of tuned config tables plus an optional override.
///
/// Each `(E, N, dtype, block_shape)` family is read from disk at most once;
/// a missing file is remembered as `None` and later calls fall back to
/// [`default_config`] without touching the filesystem again.
#[derive(Debug)]
pub struct MoeConfigCache {
    config_dir: Option<PathBuf>,
    device_name: String,
    override_config: Option<KernelConfig>,
    tables: Mutex<HashMap<TableKey, Option<Arc<ConfigTable>>>>,
}

impl MoeConfigCache {
    /// Cache reading `E=..,N=..,device_name=...json` files from `config_dir`.
    pub fn new(config_dir: impl Into<PathBuf>, device_name: impl Into<String>) -> Self {
        Self {
            config_dir: Some(config_dir.into()),
            device_name: device_name.into(),
            override_config: None,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Cache that never reads files; every selection uses the heuristics.
    pub fn heuristic_only() -> Self {
        Self {
            config_dir: None,
            device_name: "cpu".to_string(),
            override_config: None,
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Use `config` for every launch, ignoring tables and heuristics.
    pub fn with_override(mut self, config: KernelConfig) -> Self {
        self.override_config = Some(config);
        self
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    /// Tuned table for one problem family, `None` when no file exists.
    ///
    /// A file that exists but cannot be read or parsed is an error and is
    /// not memoized, so a fixed file is picked up by the next call.
    pub fn lookup(
        &self,
        num_experts: usize,
        n: usize,
        dtype: Option<&str>,
        block_shape: Option<BlockShape>,
    ) -> Result<Option<Arc<ConfigTable>>> {
        let block_shape = block_shape.filter(|s| s.block_n > 0 && s.block_k > 0);
        let key = TableKey {
            num_experts,
            n,
            dtype: dtype.map(str::to_string),
            block_shape,
        };

        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(table) = tables.get(&key) {
            return Ok(table.clone());
        }

        let table = match &self.config_dir {
            None => {
                debug!(num_experts, n, "No MoE config directory, using heuristic configs");
                None
            }
            Some(dir) => {
                let path = dir.join(config_file_name(
                    num_experts,
                    n,
                    &self.device_name,
                    dtype,
                    block_shape,
                ));
                if path.is_file() {
                    info!(path = %path.display(), "Using configuration for MoE layer");
                    Some(Arc::new(read_table(&path)?))
                } else {
                    warn!(
                        path = %path.display(),
                        "Using default MoE config. Performance might be sub-optimal!"
                    );
                    None
                }
            }
        };
        tables.insert(key, table.clone());
        Ok(table)
    }

    /// Pick the launch config for a chunk of `m` tokens.
    ///
    /// Order: the override, then the tuned entry whose batch size is nearest
    /// to `m` (ties go to the smaller batch size), then [`default_config`].
    /// `w1_dims` and `w2_dims` are the logical `(E, N, K)` weight shapes.
    pub fn try_get_optimal(
        &self,
        w1_dims: (usize, usize, usize),
        w2_dims: (usize, usize, usize),
        top_k: usize,
        dtype: Option<&str>,
        m: usize,
        block_shape: Option<BlockShape>,
    ) -> Result<KernelConfig> {
        if let Some(config) = self.override_config {
            return Ok(config);
        }

        let (num_experts, _, n) = w2_dims;
        if let Some(table) = self.lookup(num_experts, n, dtype, block_shape)? {
            if let Some(config) = nearest_entry(&table, m) {
                return Ok(config);
            }
        }
        Ok(default_config(
            m,
            num_experts,
            n,
            w1_dims.2,
            top_k,
            dtype,
            block_shape,
        ))
    }
}

fn nearest_entry(table: &ConfigTable, m: usize) -> Option<KernelConfig> {
    table
        .iter()
        .min_by_key(|(&bp, _)| bp.abs_diff(m))
        .map(|(_, config)| *config)
}

fn read_table(path: &Path) -> Result<ConfigTable> {
    let text = std::fs::read_to_string(path)?;
    let raw: HashMap<String, KernelConfig> =
        serde_json::from_str(&text).map_err(|source| MoeError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
    raw.into_iter()
        .map(|(key, config)| {
            let batch = key.trim().parse::<usize>().map_err(|_| {
                MoeError::Configuration(format!(
                    "{}: batch size key {key:?} is not an integer",
                    path.display()
                ))
            })?;
            Ok((batch, config))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "1": {"BLOCK_SIZE_M": 16, "BLOCK_SIZE_N": 32, "BLOCK_SIZE_K": 64, "GROUP_SIZE_M": 1},
        "64": {"BLOCK_SIZE_M": 32, "BLOCK_SIZE_N": 64, "BLOCK_SIZE_K": 64, "GROUP_SIZE_M": 8},
        "256": {"BLOCK_SIZE_M": 128, "BLOCK_SIZE_N": 128, "BLOCK_SIZE_K": 64, "GROUP_SIZE_M": 16}
    }"#;

    fn write_table(dir: &Path, name: &str, body: &str) {
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn test_nearest_entry() {
        let table: HashMap<String, KernelConfig> = serde_json::from_str(TABLE).unwrap();
        let table: ConfigTable = table
            .into_iter()
            .map(|(k, v)| (k.parse().unwrap(), v))
            .collect();
        assert_eq!(nearest_entry(&table, 1).unwrap().block_size_m, 16);
        assert_eq!(nearest_entry(&table, 40).unwrap().block_size_m, 32);
        assert_eq!(nearest_entry(&table, 1000).unwrap().block_size_m, 128);
        // 160 is equally far from 64 and 256
        assert_eq!(nearest_entry(&table, 160).unwrap().block_size_m, 32);
    }

    #[test]
    fn test_lookup_reads_and_memoizes() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), &config_file_name(8, 64, "test dev", None, None), TABLE);
        let cache = MoeConfigCache::new(dir.path(), "test dev");

        let first = cache.lookup(8, 64, None, None).unwrap().unwrap();
        assert_eq!(first.len(), 3);

        // Later edits are not observed once the table is cached.
        write_table(dir.path(), &config_file_name(8, 64, "test dev", None, None), "{}");
        let second = cache.lookup(8, 64, None, None).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = MoeConfigCache::new(dir.path(), "dev");
        assert!(cache.lookup(8, 64, None, None).unwrap().is_none());

        let config = cache
            .try_get_optimal((8, 128, 32), (8, 32, 64), 2, None, 4, None)
            .unwrap();
        assert_eq!(config, KernelConfig::small_batch());
        let config = cache
            .try_get_optimal((8, 128, 32), (8, 32, 64), 2, None, 100, None)
            .unwrap();
        assert_eq!(config, KernelConfig::large_batch());
    }

    #[test]
    fn test_try_get_optimal_uses_table() {
        let dir = tempfile::tempdir().unwrap();
        write_table(
            dir.path(),
            &config_file_name(8, 64, "dev", Some("fp8_w8a8"), Some(BlockShape::new(32, 32))),
            TABLE,
        );
        let cache = MoeConfigCache::new(dir.path(), "dev");
        let config = cache
            .try_get_optimal(
                (8, 128, 32),
                (8, 32, 64),
                2,
                Some("fp8_w8a8"),
                200,
                Some(BlockShape::new(32, 32)),
            )
            .unwrap();
        assert_eq!(config.block_size_m, 128);
        assert_eq!(config.group_size_m, 16);
    }

    #[test]
    fn test_selection_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), &config_file_name(4, 16, "dev", None, None), TABLE);
        let cache = MoeConfigCache::new(dir.path(), "dev");
        let a = cache
            .try_get_optimal((4, 32, 16), (4, 16, 16), 2, None, 8, None)
            .unwrap();
        let b = cache
            .try_get_optimal((4, 32, 16), (4, 16, 16), 2, None, 8, None)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_override_wins() {
        let forced = KernelConfig {
            block_size_m: 32,
            ..KernelConfig::small_batch()
        };
        let cache = MoeConfigCache::heuristic_only().with_override(forced);
        let config = cache
            .try_get_optimal((8, 128, 32), (8, 32, 64), 2, None, 1000, None)
            .unwrap();
        assert_eq!(config, forced);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        write_table(dir.path(), &config_file_name(8, 64, "dev", None, None), "{not json");
        let cache = MoeConfigCache::new(dir.path(), "dev");
        let err = cache.lookup(8, 64, None, None).unwrap_err();
        assert!(matches!(err, MoeError::ConfigFile { .. }));

        write_table(
            dir.path(),
            &config_file_name(8, 64, "dev", None, None),
            r#"{"small": {"BLOCK_SIZE_M": 16}}"#,
        );
        let err = cache.lookup(8, 64, None, None).unwrap_err();
        assert!(matches!(err, MoeError::Configuration(_)));
    }
}
