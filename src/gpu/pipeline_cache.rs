//! # Pipeline State Cache
//!
//! Render-pass tasks bind pipeline states but never compile them. They ask the
//! [`PipelineStateCache`] for the pipeline matching a [`RenderStateKey`]; the cache
//! compiles on first use through the device and keeps the most recently used states
//! alive. When the cache is full, the least recently used state is evicted and released
//! on the device.
//!
//! The cache is shared by every render-pass task of every frame slot, so it is the one
//! render structure guarded by a mutex.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::debug;
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{GpuDevice, GpuError, PipelineId};

/// Default number of pipeline states kept alive.
pub const DEFAULT_PIPELINE_CACHE_CAPACITY: usize = 64;

/// Which render-pass stage a pipeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PassKind {
    /// Depth-only pass from a light's viewpoint.
    Shadow,
    /// Lit color pass from a camera viewpoint.
    Forward,
}

/// Color blending of a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendMode {
    /// No blending; depth writes on.
    #[default]
    Opaque,
    /// Classic `src * a + dst * (1 - a)`.
    AlphaBlend,
    /// `src + dst`.
    Additive,
}

impl BlendMode {
    /// `true` for modes drawn in the transparent list.
    pub fn is_transparent(self) -> bool {
        !matches!(self, BlendMode::Opaque)
    }
}

/// Face culling of a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    /// Draw both faces.
    None,
    /// Cull back faces.
    #[default]
    Back,
    /// Cull front faces.
    Front,
}

/// Everything that selects a distinct pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderStateKey {
    /// Stage.
    pub pass: PassKind,
    /// Blending.
    pub blend: BlendMode,
    /// Culling.
    pub cull: CullMode,
    /// Whether vertices come from the skinning output instead of the mesh itself.
    pub skinned: bool,
}

impl RenderStateKey {
    /// Key of a forward-pass draw.
    pub fn forward(blend: BlendMode, cull: CullMode, skinned: bool) -> Self {
        Self {
            pass: PassKind::Forward,
            blend,
            cull,
            skinned,
        }
    }

    /// Key of a shadow-pass draw. Shadow casters are always opaque.
    pub fn shadow(cull: CullMode, skinned: bool) -> Self {
        Self {
            pass: PassKind::Shadow,
            blend: BlendMode::Opaque,
            cull,
            skinned,
        }
    }
}

/// LRU-bounded map from render state to compiled pipeline.
pub struct PipelineStateCache {
    device: Arc<dyn GpuDevice>,
    pipelines: Mutex<LruCache<RenderStateKey, PipelineId>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PipelineStateCache {
    /// Creates a cache holding at most `capacity` states (at least one).
    pub fn new(device: Arc<dyn GpuDevice>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            device,
            pipelines: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the pipeline for `key`, compiling it on first use.
    pub fn get_or_create(&self, key: &RenderStateKey) -> Result<PipelineId, GpuError> {
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*pipeline);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let pipeline = self.device.create_pipeline(key)?;
        debug!("Compiled pipeline {:?} for {:?}", pipeline, key);

        if let Some((evicted_key, evicted)) = pipelines.push(*key, pipeline) {
            if evicted_key != *key {
                debug!("Evicting pipeline {:?} for {:?}", evicted, evicted_key);
                self.device.release_pipeline(evicted);
            }
        }
        Ok(pipeline)
    }

    /// Number of cached states.
    pub fn len(&self) -> usize {
        self.pipelines.lock().len()
    }

    /// `true` when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.pipelines.lock().is_empty()
    }

    /// Lookups answered from the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that compiled a new state.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for PipelineStateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStateCache")
            .field("len", &self.len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .finish()
    }
}
