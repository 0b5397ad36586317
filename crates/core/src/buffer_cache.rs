//! Grow-only scratch pool keyed by logical role.
//!
//! Each role owns at most one buffer. A request that fits the current
//! capacity reuses it; a larger request replaces it with a buffer of exactly
//! the requested size. Nothing shrinks until [`BufferCache::clear`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use half::f16;
use tracing::debug;

use crate::compute::ComputeBackend;
use crate::error::{PipelineError, Result};

/// Word-aligned byte storage that can be viewed as u8, f32 or f16.
pub struct ScratchMemory {
    words: Vec<u32>,
    capacity: usize,
}

pub type BufferHandle = Arc<Mutex<ScratchMemory>>;

impl ScratchMemory {
    /// Allocates zeroed memory, reporting failure instead of aborting.
    pub fn try_allocate(bytes: usize) -> std::result::Result<Self, std::collections::TryReserveError> {
        let word_count = bytes.div_ceil(4);
        let mut words = Vec::new();
        words.try_reserve_exact(word_count)?;
        words.resize(word_count, 0);
        Ok(Self {
            words,
            capacity: bytes,
        })
    }

    pub fn with_len(bytes: usize) -> Result<Self> {
        Self::try_allocate(bytes).map_err(|_| PipelineError::AllocationFailed {
            role: "tensor".to_string(),
            bytes,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.words)[..self.capacity]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let capacity = self.capacity;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.words)[..capacity]
    }

    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    pub fn as_f16(&self) -> &[f16] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_f16_mut(&mut self) -> &mut [f16] {
        bytemuck::cast_slice_mut(&mut self.words)
    }

    pub fn into_handle(self) -> BufferHandle {
        Arc::new(Mutex::new(self))
    }
}

impl fmt::Debug for ScratchMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchMemory")
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Locks a scratch buffer. A panicked frame job cannot leave scratch bytes in
/// a state the next frame depends on, so poisoning is ignored.
pub fn lock_scratch(handle: &BufferHandle) -> MutexGuard<'_, ScratchMemory> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferRole {
    Preprocess,
    PreprocessResize,
    Postprocess,
    PostprocessResize,
    Widen,
}

impl BufferRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preprocess => "preprocess",
            Self::PreprocessResize => "preprocess-resize",
            Self::Postprocess => "postprocess",
            Self::PostprocessResize => "postprocess-resize",
            Self::Widen => "widen",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedBuffer {
    pub capacity: usize,
    pub handle: BufferHandle,
}

pub struct BufferCache {
    backend: Arc<dyn ComputeBackend>,
    entries: HashMap<BufferRole, CachedBuffer>,
    max_bytes: Option<usize>,
    allocations: u64,
}

impl BufferCache {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self {
            backend,
            entries: HashMap::new(),
            max_bytes: None,
            allocations: 0,
        }
    }

    /// Caps the combined capacity of all cached buffers. `0` means unlimited.
    pub fn with_budget(mut self, max_bytes: usize) -> Self {
        self.max_bytes = (max_bytes > 0).then_some(max_bytes);
        self
    }

    pub fn acquire(&mut self, role: BufferRole, required_bytes: usize) -> Result<BufferHandle> {
        if let Some(entry) = self.entries.get(&role) {
            if entry.capacity >= required_bytes {
                return Ok(entry.handle.clone());
            }
        }

        if let Some(max_bytes) = self.max_bytes {
            let others: usize = self
                .entries
                .iter()
                .filter(|(r, _)| **r != role)
                .map(|(_, entry)| entry.capacity)
                .sum();
            if others + required_bytes > max_bytes {
                return Err(PipelineError::AllocationFailed {
                    role: role.as_str().to_string(),
                    bytes: required_bytes,
                });
            }
        }

        let memory = self
            .backend
            .allocate(required_bytes)
            .map_err(|_| PipelineError::AllocationFailed {
                role: role.as_str().to_string(),
                bytes: required_bytes,
            })?;
        let previous = self.entries.get(&role).map(|entry| entry.capacity);
        debug!(
            role = role.as_str(),
            bytes = required_bytes,
            previous_bytes = ?previous,
            "Allocated scratch buffer"
        );

        let handle = memory.into_handle();
        self.entries.insert(
            role,
            CachedBuffer {
                capacity: required_bytes,
                handle: handle.clone(),
            },
        );
        self.allocations += 1;
        Ok(handle)
    }

    /// Drops every cached buffer. Called when the model or the expected
    /// frame dimensions change.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(
                buffers = self.entries.len(),
                bytes = self.total_bytes(),
                "Clearing scratch buffers"
            );
        }
        self.entries.clear();
    }

    pub fn capacity(&self, role: BufferRole) -> Option<usize> {
        self.entries.get(&role).map(|entry| entry.capacity)
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.values().map(|entry| entry.capacity).sum()
    }

    /// Number of allocations performed since construction.
    pub fn allocation_count(&self) -> u64 {
        self.allocations
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::CpuComputeBackend;

    fn cache() -> BufferCache {
        BufferCache::new(Arc::new(CpuComputeBackend::default()))
    }

    #[test]
    fn smaller_request_reuses_existing_buffer() {
        let mut cache = cache();
        let first = cache.acquire(BufferRole::Preprocess, 1024).unwrap();
        let second = cache.acquire(BufferRole::Preprocess, 512).unwrap();
        let third = cache.acquire(BufferRole::Preprocess, 1024).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
        assert_eq!(cache.capacity(BufferRole::Preprocess), Some(1024));
        assert_eq!(cache.allocation_count(), 1);
    }

    #[test]
    fn larger_request_reallocates_to_exact_size() {
        let mut cache = cache();
        let first = cache.acquire(BufferRole::Postprocess, 1024).unwrap();
        let grown = cache.acquire(BufferRole::Postprocess, 1025).unwrap();

        assert!(!Arc::ptr_eq(&first, &grown));
        assert_eq!(cache.capacity(BufferRole::Postprocess), Some(1025));
        assert_eq!(lock_scratch(&grown).capacity(), 1025);
        assert_eq!(lock_scratch(&grown).as_bytes().len(), 1025);
    }

    #[test]
    fn roles_are_independent() {
        let mut cache = cache();
        let pre = cache.acquire(BufferRole::Preprocess, 64).unwrap();
        let post = cache.acquire(BufferRole::Postprocess, 64).unwrap();
        assert!(!Arc::ptr_eq(&pre, &post));
        assert_eq!(cache.total_bytes(), 128);
    }

    #[test]
    fn clear_releases_everything() {
        let mut cache = cache();
        let before = cache.acquire(BufferRole::Widen, 256).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        let after = cache.acquire(BufferRole::Widen, 16).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(cache.capacity(BufferRole::Widen), Some(16));
    }

    #[test]
    fn budget_rejects_growth_past_limit() {
        let mut cache = cache().with_budget(1000);
        cache.acquire(BufferRole::Preprocess, 600).unwrap();
        let err = cache.acquire(BufferRole::Postprocess, 500).unwrap_err();
        assert_eq!(
            err,
            PipelineError::AllocationFailed {
                role: "postprocess".into(),
                bytes: 500
            }
        );
        // Replacing a role's own buffer only counts the new size.
        cache.acquire(BufferRole::Preprocess, 1000).unwrap();
    }

    #[test]
    fn scratch_views_alias_the_same_bytes() {
        let mut memory = ScratchMemory::try_allocate(10).unwrap();
        assert_eq!(memory.as_bytes().len(), 10);
        assert!(memory.as_f32().len() >= 2);
        memory.as_f32_mut()[0] = 1.0;
        assert_eq!(&memory.as_bytes()[..4], &1.0f32.to_ne_bytes());
        memory.as_f16_mut()[2] = f16::ONE;
        assert_eq!(memory.as_f16()[2], f16::ONE);
    }
}
