//! Plugin factory: builds plugins from attribute fields or serialized blobs.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::autotuning::cache::TacticCache;
use crate::autotuning::manager::{ProfilerKey, ProfilerManager};
use crate::autotuning::profiler::TacticProfiler;
use crate::error::{PluginError, PluginResult};
use crate::plugin::{PluginConfig, WeightOnlyQuantMatmulPlugin, PLUGIN_NAME, PLUGIN_VERSION};
use crate::runner::{GemmConfig, KernelRunner, RunnerFactory};
use crate::types::{DataType, WeightType};

pub const FIELD_WEIGHT_TYPE_ID: &str = "weight_type_id";
pub const FIELD_TYPE_ID: &str = "type_id";

const FIELD_NAMES: [&str; 2] = [FIELD_WEIGHT_TYPE_ID, FIELD_TYPE_ID];

#[derive(Debug, Clone, PartialEq)]
pub enum PluginFieldData {
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float32(Vec<f32>),
    Char(String),
}

/// One named plugin attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginField {
    pub name: String,
    pub data: PluginFieldData,
}

impl PluginField {
    pub fn int32(name: impl Into<String>, value: i32) -> Self {
        Self {
            name: name.into(),
            data: PluginFieldData::Int32(vec![value]),
        }
    }

    /// The field as a single integer, if it holds exactly one.
    fn as_scalar_int(&self) -> Option<i64> {
        match &self.data {
            PluginFieldData::Int32(v) if v.len() == 1 => Some(i64::from(v[0])),
            PluginFieldData::Int64(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }
}

pub struct WeightOnlyQuantMatmulPluginFactory {
    config: PluginConfig,
    runners: Arc<dyn RunnerFactory>,
    manager: Arc<ProfilerManager<GemmConfig>>,
    cache: Option<Mutex<TacticCache<GemmConfig>>>,
    namespace: String,
}

impl fmt::Debug for WeightOnlyQuantMatmulPluginFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightOnlyQuantMatmulPluginFactory")
            .field("config", &self.config)
            .field("runners", &self.runners.family())
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl WeightOnlyQuantMatmulPluginFactory {
    /// Loads the tactic cache named by `config`, if any.
    pub fn new(
        config: PluginConfig,
        runners: Arc<dyn RunnerFactory>,
        manager: Arc<ProfilerManager<GemmConfig>>,
    ) -> Self {
        let cache = config
            .tactic_cache
            .as_deref()
            .map(|path| Mutex::new(TacticCache::load(path)));
        Self {
            config,
            runners,
            manager,
            cache,
            namespace: String::new(),
        }
    }

    pub fn plugin_name(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn plugin_version(&self) -> &'static str {
        PLUGIN_VERSION
    }

    /// Attribute names `create_plugin` understands. Both are scalar `i32`.
    pub fn field_names(&self) -> &'static [&'static str] {
        &FIELD_NAMES
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ProfilerManager<GemmConfig>> {
        &self.manager
    }

    /// Builds a plugin from its `weight_type_id` and `type_id` attributes.
    /// Plugins with equal weight type and runner family share a profiler.
    pub fn create_plugin(
        &self,
        name: &str,
        fields: &[PluginField],
    ) -> PluginResult<WeightOnlyQuantMatmulPlugin> {
        let mut weight_id = None;
        let mut type_id = None;
        for field in fields {
            let slot = match field.name.as_str() {
                FIELD_WEIGHT_TYPE_ID => &mut weight_id,
                FIELD_TYPE_ID => &mut type_id,
                other => {
                    log::warn!("{PLUGIN_NAME}: ignoring unknown field '{other}'");
                    continue;
                }
            };
            *slot = Some(field.as_scalar_int().ok_or_else(|| {
                PluginError::InvalidConfig(format!("field '{}' must be a scalar int", field.name))
            })?);
        }
        let weight_id = weight_id.ok_or_else(|| missing_field(FIELD_WEIGHT_TYPE_ID))?;
        let type_id = type_id.ok_or_else(|| missing_field(FIELD_TYPE_ID))?;

        let weight = WeightType::from_id(weight_id).ok_or_else(|| {
            PluginError::UnsupportedType(format!("weight type id {weight_id}"))
        })?;
        let dtype = u8::try_from(type_id)
            .ok()
            .and_then(DataType::from_tag)
            .ok_or_else(|| PluginError::UnsupportedType(format!("data type id {type_id}")))?;

        let sm = self.manager.device().sm_version();
        let runner = self.runners.create(dtype, weight, sm)?;
        let profiler = self.shared_profiler(runner.as_ref(), weight, sm);
        log::info!("creating {PLUGIN_NAME} plugin '{name}' ({dtype}, {weight}, sm{sm})");
        WeightOnlyQuantMatmulPlugin::new(dtype, weight, runner, profiler, sm, self.config.autotune)
    }

    /// Rebuilds a serialized plugin on a profiler of its own.
    pub fn deserialize_plugin(
        &self,
        name: &str,
        blob: &[u8],
    ) -> PluginResult<WeightOnlyQuantMatmulPlugin> {
        let (dtype, weight) = WeightOnlyQuantMatmulPlugin::peek_types(blob)?;
        let sm = self.manager.device().sm_version();
        let runner = self.runners.create(dtype, weight, sm)?;
        let key = ProfilerKey::new(weight, runner.family(), sm);
        let profiler = self.manager.isolated(&key);
        log::info!(
            "deserializing {PLUGIN_NAME} plugin '{name}' ({} bytes)",
            blob.len()
        );
        WeightOnlyQuantMatmulPlugin::deserialize(blob, runner, profiler, sm, self.config.autotune)
    }

    fn shared_profiler(
        &self,
        runner: &dyn KernelRunner,
        weight: WeightType,
        sm: u32,
    ) -> Arc<TacticProfiler<GemmConfig>> {
        let key = ProfilerKey::new(weight, runner.family(), sm);
        self.manager
            .get_profiler_with(&key, |profiler| self.seed_from_cache(&key, profiler))
    }

    fn seed_from_cache(&self, key: &ProfilerKey, profiler: &TacticProfiler<GemmConfig>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let cache = cache.lock().unwrap_or_else(|e| e.into_inner());
        let fingerprint = key.fingerprint(self.manager.device().name());
        let mut seeded = 0;
        for (identity, table) in cache.tables(&fingerprint) {
            if identity.weight == key.weight && profiler.import(&identity, table) {
                seeded += 1;
            }
        }
        if seeded > 0 {
            log::info!("seeded {seeded} tactic tables for {key} from {}", cache.path().display());
        }
    }

    /// Writes every shared profiler's tables to the tactic cache. Returns
    /// the number of tables written; zero when persistence is disabled.
    pub fn persist_tactics(&self) -> PluginResult<usize> {
        let Some(cache) = &self.cache else {
            return Ok(0);
        };
        let profilers = self.manager.profilers();
        let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
        let mut written = 0;
        for (key, profiler) in profilers {
            let fingerprint = key.fingerprint(self.manager.device().name());
            for (identity, table) in profiler.export() {
                cache.put(&fingerprint, &identity, &table);
                written += 1;
            }
        }
        cache.save()?;
        Ok(written)
    }
}

fn missing_field(name: &str) -> PluginError {
    PluginError::InvalidConfig(format!("missing required field '{name}'"))
}
