//! Tactic cache, FFTW wisdom-style persistence.
//!
//! Profiled tables are saved to a JSON file keyed by hardware fingerprint
//! and [`GemmIdentity`]. A later build on the same hardware seeds its
//! profilers from the file instead of measuring again.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::autotuning::identity::GemmIdentity;
use crate::autotuning::profiler::{MProfileTable, Tactic};

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub m: usize,
    pub tactic: Option<T>,
}

/// One identity's profiled table as stored on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedTable<T> {
    pub identity: GemmIdentity,
    pub entries: Vec<CachedEntry<T>>,
    pub workspace_bytes: usize,
    /// Unix seconds when the table was recorded
    pub timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile<T> {
    version: u32,
    /// hw_fingerprint -> (identity key -> table)
    entries: BTreeMap<String, BTreeMap<String, CachedTable<T>>>,
}

#[derive(Debug, Clone)]
pub struct TacticCache<T> {
    entries: BTreeMap<String, BTreeMap<String, CachedTable<T>>>,
    path: PathBuf,
    dirty: bool,
}

impl<T: Tactic> TacticCache<T> {
    pub fn new(path: PathBuf) -> Self {
        TacticCache {
            entries: BTreeMap::new(),
            path,
            dirty: false,
        }
    }

    /// Default location: `$XDG_CACHE_HOME/gllm-wq/tactics.json`, falling back
    /// to `~/.cache`.
    pub fn default_path() -> PathBuf {
        if let Some(cache_dir) = dirs_cache() {
            cache_dir.join("gllm-wq").join("tactics.json")
        } else {
            PathBuf::from("gllm_wq_tactics.json")
        }
    }

    /// Loads the cache at `path`. A missing or unreadable file yields an
    /// empty cache.
    pub fn load(path: &Path) -> Self {
        let mut cache = TacticCache::new(path.to_path_buf());
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return cache,
            Err(e) => {
                log::warn!("tactic cache {} unreadable: {e}", path.display());
                return cache;
            }
        };
        match parse_cache::<T>(&content) {
            Ok(file) if file.version == CACHE_VERSION => {
                cache.entries = file.entries;
                log::info!(
                    "loaded {} cached tactic tables from {}",
                    cache.total_entries(),
                    path.display()
                );
            }
            Ok(file) => {
                log::warn!(
                    "tactic cache {} has version {}, expected {CACHE_VERSION}; ignoring",
                    path.display(),
                    file.version
                );
            }
            Err(e) => {
                log::warn!("tactic cache {} is corrupt, ignoring: {e}", path.display());
            }
        }
        cache
    }

    pub fn load_default() -> Self {
        Self::load(&Self::default_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Cached table for `identity` on the given hardware.
    pub fn get(&self, hw_fingerprint: &str, identity: &GemmIdentity) -> Option<MProfileTable<T>> {
        self.entries
            .get(hw_fingerprint)
            .and_then(|m| m.get(&identity.cache_key()))
            .map(to_table)
    }

    /// Every cached table for the given hardware.
    pub fn tables(&self, hw_fingerprint: &str) -> Vec<(GemmIdentity, MProfileTable<T>)> {
        self.entries
            .get(hw_fingerprint)
            .map(|m| m.values().map(|c| (c.identity, to_table(c))).collect())
            .unwrap_or_default()
    }

    /// Inserts or replaces the table for `identity`.
    pub fn put(&mut self, hw_fingerprint: &str, identity: &GemmIdentity, table: &MProfileTable<T>) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let cached = CachedTable {
            identity: *identity,
            entries: table
                .entries()
                .map(|(m, tactic)| CachedEntry {
                    m,
                    tactic: tactic.cloned(),
                })
                .collect(),
            workspace_bytes: table.workspace_bytes(),
            timestamp,
        };
        let hw_map = self.entries.entry(hw_fingerprint.to_string()).or_default();
        let key = identity.cache_key();
        let changed = hw_map.get(&key).map_or(true, |old| {
            old.entries != cached.entries || old.workspace_bytes != cached.workspace_bytes
        });
        if changed {
            hw_map.insert(key, cached);
            self.dirty = true;
        }
    }

    /// Writes the cache to disk if it changed since the last load or save.
    pub fn save(&mut self) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CacheFile {
            version: CACHE_VERSION,
            entries: self.entries.clone(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(io::Error::from)?;
        std::fs::write(&self.path, content)?;
        self.dirty = false;
        log::info!(
            "saved {} tactic tables to {}",
            self.total_entries(),
            self.path.display()
        );
        Ok(())
    }

    /// Number of tables across all hardware fingerprints.
    pub fn total_entries(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }

    pub fn fingerprints(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Drops every table recorded for one hardware fingerprint.
    pub fn clear_hw(&mut self, hw_fingerprint: &str) {
        if self.entries.remove(hw_fingerprint).is_some() {
            self.dirty = true;
        }
    }
}

fn to_table<T: Tactic>(cached: &CachedTable<T>) -> MProfileTable<T> {
    let mut table = MProfileTable::new();
    for e in &cached.entries {
        table.insert(e.m, e.tactic.clone());
    }
    table.set_workspace_bytes(cached.workspace_bytes);
    table
}

fn parse_cache<T: DeserializeOwned>(content: &str) -> serde_json::Result<CacheFile<T>> {
    serde_json::from_str(content)
}

fn dirs_cache() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return Some(PathBuf::from(xdg));
    }
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".cache"));
    }
    None
}
