//! Device, stream and workspace primitives the profiler and plugin run on.
//!
//! The plugin never owns device memory it is handed: inputs, outputs and the
//! per-call workspace are opaque [`DevicePtr`]s owned by the host. Only the
//! profiler allocates, through [`Device::allocate`], and only at build time.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::{KernelError, KernelResult};

/// Alignment of every region carved out of a workspace.
pub const WORKSPACE_ALIGNMENT: usize = 256;

/// Opaque device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub fn addr(self) -> u64 {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// An asynchronous execution queue.
pub trait Stream: Send + Sync + fmt::Debug {
    /// Blocks until all submitted work has completed.
    fn synchronize(&self) -> KernelResult<()>;

    /// Completion time, in nanoseconds on a stream-local clock, of all work
    /// submitted so far. Used like a recorded-then-synchronized event pair.
    fn timestamp_ns(&self) -> KernelResult<u64>;
}

/// A device allocation. Freed when dropped.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    bytes: usize,
    _storage: Box<dyn Any + Send + Sync>,
}

impl DeviceBuffer {
    /// Wraps an allocation whose lifetime is tied to `storage`.
    pub fn new(ptr: DevicePtr, bytes: usize, storage: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            ptr,
            bytes,
            _storage: storage,
        }
    }

    pub fn ptr(&self) -> DevicePtr {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .finish()
    }
}

/// The accelerator the profiler measures on.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Compute capability as `major * 10 + minor`, e.g. 80 for SM 8.0.
    fn sm_version(&self) -> u32;

    fn allocate(&self, bytes: usize) -> KernelResult<DeviceBuffer>;

    fn create_stream(&self) -> KernelResult<Arc<dyn Stream>>;
}

// ── Host implementations ────────────────────────────────────────────────

/// Host-memory device. Runners executing on it work synchronously, so its
/// streams are always idle when queried.
#[derive(Debug, Clone)]
pub struct HostDevice {
    name: String,
    sm_version: u32,
}

impl HostDevice {
    pub fn new(name: impl Into<String>, sm_version: u32) -> Self {
        Self {
            name: name.into(),
            sm_version,
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new("host", 0)
    }
}

impl Device for HostDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn sm_version(&self) -> u32 {
        self.sm_version
    }

    fn allocate(&self, bytes: usize) -> KernelResult<DeviceBuffer> {
        let words = bytes.div_ceil(std::mem::size_of::<u64>());
        let mut storage: Vec<u64> = Vec::new();
        storage
            .try_reserve_exact(words)
            .map_err(|e| KernelError::Allocation {
                bytes,
                reason: e.to_string(),
            })?;
        storage.resize(words, 0);
        let ptr = if bytes == 0 {
            DevicePtr::NULL
        } else {
            DevicePtr::new(storage.as_ptr() as u64)
        };
        Ok(DeviceBuffer::new(ptr, bytes, Box::new(storage)))
    }

    fn create_stream(&self) -> KernelResult<Arc<dyn Stream>> {
        Ok(Arc::new(HostStream::new()))
    }
}

/// Host stream timed with the monotonic clock.
#[derive(Debug)]
pub struct HostStream {
    origin: Instant,
    syncs: AtomicU64,
}

impl HostStream {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            syncs: AtomicU64::new(0),
        }
    }

    /// Number of `synchronize` calls observed.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }
}

impl Default for HostStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for HostStream {
    fn synchronize(&self) -> KernelResult<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn timestamp_ns(&self) -> KernelResult<u64> {
        self.synchronize()?;
        Ok(self.origin.elapsed().as_nanos() as u64)
    }
}

// ── Workspace layout ────────────────────────────────────────────────────

fn align_up(bytes: usize) -> usize {
    bytes.div_ceil(WORKSPACE_ALIGNMENT) * WORKSPACE_ALIGNMENT
}

/// Total bytes needed to hold `sizes` back to back, each region aligned.
pub fn total_workspace_size(sizes: &[usize]) -> usize {
    sizes.iter().map(|&s| align_up(s)).sum()
}

/// Start address of each region of a workspace laid out by
/// [`total_workspace_size`].
pub fn partition_workspace(base: DevicePtr, sizes: &[usize]) -> Vec<DevicePtr> {
    let mut offset = 0usize;
    sizes
        .iter()
        .map(|&s| {
            let ptr = base.offset(offset);
            offset += align_up(s);
            ptr
        })
        .collect()
}
