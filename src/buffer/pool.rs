//! Bounded pool of reusable byte buffers.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BufferConfig;

/// Buffer size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// Socket reads.
    Standard,
    /// Serialized responses.
    Large,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("buffer pool exhausted after waiting {0:?}")]
    Exhausted(Duration),

    #[error("buffer pool closed")]
    Closed,
}

/// Point-in-time pool accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub total_allocated: usize,
    pub in_use: usize,
    pub free: usize,
}

#[derive(Default)]
struct FreeLists {
    standard: Vec<BytesMut>,
    large: Vec<BytesMut>,
    total_allocated: usize,
    in_use: usize,
}

impl FreeLists {
    fn list(&mut self, class: SizeClass) -> &mut Vec<BytesMut> {
        match class {
            SizeClass::Standard => &mut self.standard,
            SizeClass::Large => &mut self.large,
        }
    }
}

struct PoolInner {
    permits: Arc<Semaphore>,
    free: Mutex<FreeLists>,
    standard_size: usize,
    large_size: usize,
    capacity: usize,
    acquire_timeout: Duration,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, FreeLists> {
        // The lists are consistent after every critical section, so a
        // poisoned lock is still usable.
        self.free.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn class_size(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Standard => self.standard_size,
            SizeClass::Large => self.large_size,
        }
    }
}

/// Shared handle to a worker's buffer pool.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new(config: &BufferConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                permits: Arc::new(Semaphore::new(config.pool_capacity)),
                free: Mutex::new(FreeLists::default()),
                standard_size: config.buffer_size,
                large_size: config.large_buffer_size,
                capacity: config.pool_capacity,
                acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            }),
        }
    }

    /// Borrow a buffer, waiting up to the configured timeout for one to free up.
    pub async fn acquire(&self, class: SizeClass) -> Result<BufferHandle, PoolError> {
        let timeout = self.inner.acquire_timeout;
        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => {
                metrics::counter!("buffer_pool_exhausted_total").increment(1);
                tracing::warn!(
                    capacity = self.inner.capacity,
                    waited_ms = timeout.as_millis() as u64,
                    "Buffer pool exhausted"
                );
                return Err(PoolError::Exhausted(timeout));
            }
        };

        Ok(self.take(class, permit))
    }

    /// Borrow a buffer only if one is available right now.
    pub fn try_acquire(&self, class: SizeClass) -> Result<BufferHandle, PoolError> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.take(class, permit)),
            Err(tokio::sync::TryAcquireError::Closed) => Err(PoolError::Closed),
            Err(tokio::sync::TryAcquireError::NoPermits) => {
                metrics::counter!("buffer_pool_exhausted_total").increment(1);
                Err(PoolError::Exhausted(Duration::ZERO))
            }
        }
    }

    fn take(&self, class: SizeClass, permit: OwnedSemaphorePermit) -> BufferHandle {
        let size = self.inner.class_size(class);
        let mut lists = self.inner.lock();

        let buffer = match lists.list(class).pop() {
            Some(buffer) => buffer,
            None => {
                if lists.total_allocated == self.inner.capacity {
                    // Holding a permit means at least one buffer is free, so
                    // it must be of the other class.
                    let other = match class {
                        SizeClass::Standard => SizeClass::Large,
                        SizeClass::Large => SizeClass::Standard,
                    };
                    lists.list(other).pop();
                } else {
                    lists.total_allocated += 1;
                }
                BytesMut::with_capacity(size)
            }
        };
        lists.in_use += 1;
        drop(lists);

        BufferHandle {
            buffer: Some(buffer),
            class,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    pub fn stats(&self) -> PoolStats {
        let lists = self.inner.lock();
        PoolStats {
            capacity: self.inner.capacity,
            total_allocated: lists.total_allocated,
            in_use: lists.in_use,
            free: lists.standard.len() + lists.large.len(),
        }
    }

    /// Refuse all future and pending acquisitions.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool").field("stats", &self.stats()).finish()
    }
}

/// A buffer on loan from the pool. Returned, cleared, when dropped.
pub struct BufferHandle {
    buffer: Option<BytesMut>,
    class: SizeClass,
    pool: Arc<PoolInner>,
    // Dropped after the buffer is back on the free list.
    _permit: OwnedSemaphorePermit,
}

impl BufferHandle {
    pub fn class(&self) -> SizeClass {
        self.class
    }
}

impl Deref for BufferHandle {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buffer.as_ref().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl DerefMut for BufferHandle {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buffer.as_mut().unwrap_or_else(|| unreachable!("buffer taken before drop"))
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        let Some(mut buffer) = self.buffer.take() else {
            return;
        };
        let size = self.pool.class_size(self.class);
        buffer.clear();
        if buffer.capacity() != size {
            // Grew while in use, or shrank because chunks were split off.
            buffer = BytesMut::with_capacity(size);
        }

        let mut lists = self.pool.lock();
        lists.in_use -= 1;
        lists.list(self.class).push(buffer);
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("class", &self.class)
            .field("len", &self.len())
            .finish()
    }
}
