//! Tactic profiler: measures candidate tactics per representative M and
//! caches the winners per [`GemmIdentity`].
//!
//! # Concurrency
//!
//! Every identity owns a slot holding a profiling mutex and a published,
//! immutable table. Profiling an identity holds its mutex for the whole
//! measurement pass, so concurrent requests for the same identity wait and
//! then find every bucket already present. Lookups only take the slot's read
//! lock and clone an `Arc`; they never wait on a running pass.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::autotuning::identity::{GemmDims, GemmIdentity};
use crate::autotuning::measure;
use crate::autotuning::ProfilerConfig;
use crate::codec::{CodecError, Decoder, Encoder, LEN_PREFIX_BYTES};
use crate::error::{KernelResult, PluginError, PluginResult};
use crate::runtime::{Device, DevicePtr, Stream};

/// An opaque kernel configuration the profiler can measure, store and persist.
pub trait Tactic:
    Clone + PartialEq + fmt::Debug + fmt::Display + Send + Sync + Serialize + DeserializeOwned + 'static
{
    fn encode(&self, enc: &mut Encoder);

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError>;

    /// Bytes written by [`Tactic::encode`].
    fn encoded_len(&self) -> usize {
        let mut enc = Encoder::new();
        self.encode(&mut enc);
        enc.len()
    }
}

/// The problem-specific half of profiling: where candidates come from, how
/// much scratch they need and how to launch one.
pub trait ProfileTarget: Send + Sync {
    type Tactic: Tactic;

    /// Candidate tactics for one representative problem, in a stable order.
    fn tactics(&self, m: usize, n: usize, k: usize) -> Vec<Self::Tactic>;

    /// Cheap static validity filter applied before measuring.
    fn check_tactic(&self, _m: usize, _n: usize, _k: usize, _tactic: &Self::Tactic) -> bool {
        true
    }

    /// Scratch bytes needed to launch any candidate for `m <= max_m`.
    fn tmp_size(&self, max_m: usize, n: usize, k: usize) -> usize;

    /// Kernel workspace the plugin must request from the host for `max_m`.
    fn kernel_workspace_size(&self, max_m: usize, n: usize, k: usize) -> usize;

    /// Launches `tactic` once on `stream`, carving inputs from `scratch`.
    fn run_tactic(
        &self,
        m: usize,
        n: usize,
        k: usize,
        tactic: &Self::Tactic,
        scratch: DevicePtr,
        stream: &dyn Stream,
    ) -> KernelResult<()>;
}

// ── Per-identity table ──────────────────────────────────────────────────

/// Winning tactic per representative M for one identity. `None` marks a
/// bucket where every candidate failed.
#[derive(Debug, Clone, PartialEq)]
pub struct MProfileTable<T> {
    entries: BTreeMap<usize, Option<T>>,
    workspace_bytes: usize,
}

impl<T> Default for MProfileTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            workspace_bytes: 0,
        }
    }
}

impl<T: Tactic> MProfileTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, m: usize, tactic: Option<T>) {
        self.entries.insert(m, tactic);
    }

    pub fn contains(&self, m: usize) -> bool {
        self.entries.contains_key(&m)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes
    }

    pub fn set_workspace_bytes(&mut self, bytes: usize) {
        self.workspace_bytes = bytes;
    }

    pub fn buckets(&self) -> impl Iterator<Item = usize> + '_ {
        self.entries.keys().copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, Option<&T>)> + '_ {
        self.entries.iter().map(|(&m, t)| (m, t.as_ref()))
    }

    /// Smallest profiled bucket not below `m`, else the largest bucket.
    pub fn bucket_for(&self, m: usize) -> Option<usize> {
        self.entries
            .range(m..)
            .next()
            .or_else(|| self.entries.iter().next_back())
            .map(|(&bucket, _)| bucket)
    }

    /// Bucket chosen for `m` and its tactic, if any.
    pub fn lookup(&self, m: usize) -> Option<(usize, Option<&T>)> {
        let bucket = self.bucket_for(m)?;
        self.entries.get(&bucket).map(|t| (bucket, t.as_ref()))
    }

    /// First of `buckets` that has no viable tactic.
    pub fn first_failure(&self, buckets: &[usize]) -> Option<usize> {
        buckets
            .iter()
            .copied()
            .find(|m| matches!(self.entries.get(m), Some(None)))
    }

    /// Bytes written by [`MProfileTable::encode`].
    pub fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .values()
            .map(|t| 8 + 1 + t.as_ref().map_or(0, |t| LEN_PREFIX_BYTES + t.encoded_len()))
            .sum::<usize>()
    }

    /// Writes the bucket entries. The workspace size is not part of the encoding.
    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u32(self.entries.len() as u32);
        for (&m, tactic) in &self.entries {
            enc.put_u64(m as u64);
            enc.put_bool(tactic.is_some());
            if let Some(t) = tactic {
                enc.put_nested(|e| t.encode(e));
            }
        }
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let count = dec.get_u32()?;
        let mut table = Self::new();
        for _ in 0..count {
            let m = dec.get_usize()?;
            let tactic = if dec.get_bool()? {
                Some(dec.get_nested(T::decode)?)
            } else {
                None
            };
            table.insert(m, tactic);
        }
        Ok(table)
    }
}

struct ProfileSlot<T> {
    profiling: Mutex<()>,
    table: RwLock<Arc<MProfileTable<T>>>,
}

impl<T: Tactic> ProfileSlot<T> {
    fn new() -> Self {
        Self {
            profiling: Mutex::new(()),
            table: RwLock::new(Arc::new(MProfileTable::new())),
        }
    }

    fn current(&self) -> Arc<MProfileTable<T>> {
        self.table.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn publish(&self, table: Arc<MProfileTable<T>>) {
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = table;
    }
}

// ── Profiler ────────────────────────────────────────────────────────────

pub struct TacticProfiler<T> {
    config: ProfilerConfig,
    device: Arc<dyn Device>,
    /// Widest M range announced per `(n, k)` through `set_limits`.
    limits: Mutex<HashMap<(usize, usize), GemmDims>>,
    slots: Mutex<HashMap<GemmIdentity, Arc<ProfileSlot<T>>>>,
    passes: AtomicUsize,
}

impl<T> fmt::Debug for TacticProfiler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TacticProfiler")
            .field("config", &self.config)
            .field("device", &self.device.name())
            .field("passes", &self.passes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<T: Tactic> TacticProfiler<T> {
    pub fn new(config: ProfilerConfig, device: Arc<dyn Device>) -> Self {
        Self {
            config,
            device,
            limits: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            passes: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Records `dims` as a valid range to profile over. Ranges announced for
    /// the same weight extents are merged.
    pub fn set_limits(&self, dims: &GemmDims) {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits
            .entry((dims.n, dims.k))
            .and_modify(|l| *l = l.union(dims))
            .or_insert(*dims);
    }

    /// Limits recorded for the given weight extents.
    pub fn limits(&self, n: usize, k: usize) -> Option<GemmDims> {
        let limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        limits.get(&(n, k)).copied()
    }

    /// Number of measurement passes run so far. A pass profiles every missing
    /// bucket of one identity.
    pub fn measurement_passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }

    fn slot(&self, identity: &GemmIdentity) -> Arc<ProfileSlot<T>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry(*identity)
            .or_insert_with(|| Arc::new(ProfileSlot::new()))
            .clone()
    }

    fn existing_slot(&self, identity: &GemmIdentity) -> Option<Arc<ProfileSlot<T>>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(identity).cloned()
    }

    /// Profiles every representative M of `dims` not yet cached for
    /// `identity` and returns the published table.
    ///
    /// Already-profiled buckets are never measured again. Fails with
    /// [`PluginError::NoViableTactic`] if any bucket of `dims` has no viable
    /// tactic; the partial table stays cached and is available through
    /// [`TacticProfiler::snapshot`].
    pub fn profile_tactics<P>(
        &self,
        target: &P,
        identity: &GemmIdentity,
        dims: &GemmDims,
    ) -> PluginResult<Arc<MProfileTable<T>>>
    where
        P: ProfileTarget<Tactic = T>,
    {
        if identity.n != dims.n || identity.k != dims.k {
            return Err(PluginError::ShapeMismatch(format!(
                "identity {identity} does not match dims {dims}"
            )));
        }
        match self.limits(dims.n, dims.k) {
            Some(limits) if limits.contains(dims) => {}
            Some(limits) => {
                return Err(PluginError::InvalidConfig(format!(
                    "dims {dims} exceed profiling limits {limits}"
                )))
            }
            None => {
                return Err(PluginError::InvalidConfig(format!(
                    "set_limits was not called for n={} k={}",
                    dims.n, dims.k
                )))
            }
        }

        let buckets = self.config.profile_buckets(dims, identity.gemv);
        let slot = self.slot(identity);
        let _pass = slot.profiling.lock().unwrap_or_else(|e| e.into_inner());

        let current = slot.current();
        let missing: Vec<usize> = buckets
            .iter()
            .copied()
            .filter(|&m| !current.contains(m))
            .collect();
        if missing.is_empty() {
            log::debug!("{identity}: all {} buckets already profiled", buckets.len());
            return Self::check_viable(identity, current, &buckets);
        }

        let max_m = buckets.iter().copied().max().unwrap_or(1);
        let (n, k) = (dims.n, dims.k);
        let scratch = self.device.allocate(target.tmp_size(max_m, n, k))?;
        let stream = self.device.create_stream()?;

        log::info!(
            "{identity}: profiling {} buckets (max_m={max_m}) on {}",
            missing.len(),
            self.device.name()
        );
        let t0 = Instant::now();

        let mut next = (*current).clone();
        for m in missing {
            let best = self.profile_problem(target, m, n, k, scratch.ptr(), stream.as_ref());
            if let Some(t) = &best {
                log::debug!("{identity}: m={m} -> {t}");
            }
            next.insert(m, best);
        }
        next.workspace_bytes = next
            .workspace_bytes
            .max(target.kernel_workspace_size(max_m, n, k));

        let next = Arc::new(next);
        slot.publish(next.clone());
        self.passes.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{identity}: profiled in {:.1}ms",
            t0.elapsed().as_secs_f64() * 1000.0
        );

        Self::check_viable(identity, next, &buckets)
    }

    fn check_viable(
        identity: &GemmIdentity,
        table: Arc<MProfileTable<T>>,
        buckets: &[usize],
    ) -> PluginResult<Arc<MProfileTable<T>>> {
        match table.first_failure(buckets) {
            Some(m) => Err(PluginError::NoViableTactic {
                identity: *identity,
                m,
            }),
            None => Ok(table),
        }
    }

    /// Measures every candidate for one problem; the lowest median wins and
    /// ties keep the earlier candidate.
    fn profile_problem<P>(
        &self,
        target: &P,
        m: usize,
        n: usize,
        k: usize,
        scratch: DevicePtr,
        stream: &dyn Stream,
    ) -> Option<T>
    where
        P: ProfileTarget<Tactic = T>,
    {
        let mut best: Option<(T, f64)> = None;
        for tactic in target.tactics(m, n, k) {
            if !target.check_tactic(m, n, k, &tactic) {
                log::debug!("skipping {tactic} for ({m}, {n}, {k}): rejected by check");
                continue;
            }
            let measured = measure::bench_on_stream(&self.config.bench, stream, |_| {
                target.run_tactic(m, n, k, &tactic, scratch, stream)
            });
            match measured {
                Ok(result) => {
                    if best.as_ref().map_or(true, |(_, b)| result.median_ns < *b) {
                        best = Some((tactic, result.median_ns));
                    }
                }
                Err(e) => {
                    log::warn!("tactic {tactic} failed for ({m}, {n}, {k}), skipping: {e}");
                }
            }
        }
        if best.is_none() {
            log::warn!("no valid tactic found for shape ({m}, {n}, {k})");
        }
        best.map(|(t, _)| t)
    }

    /// Cached tactic for `m`, taken from the closest bucket not below it.
    pub fn get_best_config(&self, identity: &GemmIdentity, m: usize) -> PluginResult<T> {
        let table = self
            .snapshot(identity)
            .ok_or(PluginError::NotProfiled { identity: *identity })?;
        match table.lookup(m) {
            Some((_, Some(tactic))) => Ok(tactic.clone()),
            Some((bucket, None)) => Err(PluginError::NoViableTactic {
                identity: *identity,
                m: bucket,
            }),
            None => Err(PluginError::NotProfiled { identity: *identity }),
        }
    }

    /// Published table for `identity`, if it has any profiled bucket.
    pub fn snapshot(&self, identity: &GemmIdentity) -> Option<Arc<MProfileTable<T>>> {
        self.existing_slot(identity)
            .map(|slot| slot.current())
            .filter(|table| !table.is_empty())
    }

    /// Seeds `identity` with a previously profiled table. Returns `false`
    /// and keeps the existing table if the identity is already profiled.
    pub fn import(&self, identity: &GemmIdentity, table: MProfileTable<T>) -> bool {
        if table.is_empty() {
            return false;
        }
        let slot = self.slot(identity);
        let _pass = slot.profiling.lock().unwrap_or_else(|e| e.into_inner());
        if !slot.current().is_empty() {
            return false;
        }
        slot.publish(Arc::new(table));
        true
    }

    /// Every profiled identity with its table, ordered by identity.
    pub fn export(&self) -> Vec<(GemmIdentity, Arc<MProfileTable<T>>)> {
        let slots: Vec<(GemmIdentity, Arc<ProfileSlot<T>>)> = {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.iter().map(|(id, s)| (*id, s.clone())).collect()
        };
        let mut out: Vec<_> = slots
            .into_iter()
            .map(|(id, slot)| (id, slot.current()))
            .filter(|(_, table)| !table.is_empty())
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
