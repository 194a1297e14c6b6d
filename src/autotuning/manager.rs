//! Build-session registry of tactic profilers.
//!
//! Plugins that resolve to the same [`ProfilerKey`] share one profiler and
//! therefore one tactic cache, so identical layers of a graph are measured
//! once. The manager is created by the caller and passed down explicitly;
//! profilers live as long as the manager or a plugin holding them.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::autotuning::profiler::{Tactic, TacticProfiler};
use crate::autotuning::ProfilerConfig;
use crate::runtime::Device;
use crate::types::WeightType;

/// Which profiler a plugin uses: weight type, kernel family and target SM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProfilerKey {
    pub weight: WeightType,
    pub family: String,
    pub sm: u32,
}

impl ProfilerKey {
    pub fn new(weight: WeightType, family: impl Into<String>, sm: u32) -> Self {
        Self {
            weight,
            family: family.into(),
            sm,
        }
    }

    /// Hardware fingerprint for the persistent tactic cache.
    pub fn fingerprint(&self, device_name: &str) -> String {
        format!("{device_name}-sm{}-{}", self.sm, self.family)
    }
}

impl fmt::Display for ProfilerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/sm{}", self.family, self.weight, self.sm)
    }
}

pub struct ProfilerManager<T> {
    config: ProfilerConfig,
    device: Arc<dyn Device>,
    profilers: Mutex<HashMap<ProfilerKey, Arc<TacticProfiler<T>>>>,
}

impl<T> fmt::Debug for ProfilerManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerManager")
            .field("config", &self.config)
            .field("device", &self.device.name())
            .finish_non_exhaustive()
    }
}

impl<T: Tactic> ProfilerManager<T> {
    pub fn new(config: ProfilerConfig, device: Arc<dyn Device>) -> Self {
        Self {
            config,
            device,
            profilers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Shared profiler for `key`. Equal keys always yield the same instance.
    pub fn get_profiler(&self, key: &ProfilerKey) -> Arc<TacticProfiler<T>> {
        self.get_profiler_with(key, |_| {})
    }

    /// Like [`ProfilerManager::get_profiler`], running `seed` once on a newly
    /// created profiler before any other caller can see it.
    pub fn get_profiler_with<F>(&self, key: &ProfilerKey, seed: F) -> Arc<TacticProfiler<T>>
    where
        F: FnOnce(&TacticProfiler<T>),
    {
        let mut profilers = self.profilers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = profilers.get(key) {
            return p.clone();
        }
        log::debug!("creating profiler for {key}");
        let profiler = Arc::new(TacticProfiler::new(self.config.clone(), self.device.clone()));
        seed(&profiler);
        profilers.insert(key.clone(), profiler.clone());
        profiler
    }

    /// A profiler owned by the caller alone, used when reconstructing a
    /// serialized plugin. Never registered, never shared.
    pub fn isolated(&self, key: &ProfilerKey) -> Arc<TacticProfiler<T>> {
        log::debug!("creating isolated profiler for {key}");
        Arc::new(TacticProfiler::new(self.config.clone(), self.device.clone()))
    }

    /// Every shared profiler with its key, ordered by key.
    pub fn profilers(&self) -> Vec<(ProfilerKey, Arc<TacticProfiler<T>>)> {
        let profilers = self.profilers.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = profilers
            .iter()
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn len(&self) -> usize {
        self.profilers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
