//! Pooled byte buffers for serialization hot paths.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Rents buffers of at least the requested size. Buffers return to the
/// pool when the guard drops, on every exit path.
pub trait BufferPool: Send + Sync {
    fn rent(&self, min_size: usize) -> PooledBuffer;
}

/// Scoped buffer guard. Dereferences to `BytesMut`; dropping it hands the
/// buffer back to its pool.
pub struct PooledBuffer {
    buf: Option<BytesMut>,
    reclaim: Option<Box<dyn FnOnce(BytesMut) + Send>>,
}

impl PooledBuffer {
    pub fn detached(buf: BytesMut) -> Self {
        Self {
            buf: Some(buf),
            reclaim: None,
        }
    }

    fn pooled(buf: BytesMut, reclaim: Box<dyn FnOnce(BytesMut) + Send>) -> Self {
        Self {
            buf: Some(buf),
            reclaim: Some(reclaim),
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(buf), Some(reclaim)) = (self.buf.take(), self.reclaim.take()) {
            reclaim(buf);
        }
    }
}

#[derive(Debug, Clone)]
pub struct SizedBufferPoolConfig {
    /// Ascending size classes; a rent request takes the smallest class that
    /// fits, or an unpooled allocation above the largest.
    pub size_classes: Vec<usize>,
    /// Buffers kept per class.
    pub max_per_class: usize,
}

impl Default for SizedBufferPoolConfig {
    fn default() -> Self {
        Self {
            size_classes: vec![1024, 4096, 16384, 65536],
            max_per_class: 32,
        }
    }
}

struct PoolShelves {
    shelves: Vec<Vec<BytesMut>>,
}

/// Size-classed buffer pool.
pub struct SizedBufferPool {
    config: SizedBufferPoolConfig,
    shelves: Arc<Mutex<PoolShelves>>,
}

impl SizedBufferPool {
    pub fn new(config: SizedBufferPoolConfig) -> Self {
        let shelves = PoolShelves {
            shelves: config.size_classes.iter().map(|_| Vec::new()).collect(),
        };
        Self {
            config,
            shelves: Arc::new(Mutex::new(shelves)),
        }
    }

    fn class_for(&self, min_size: usize) -> Option<usize> {
        self.config
            .size_classes
            .iter()
            .position(|&size| size >= min_size)
    }
}

impl Default for SizedBufferPool {
    fn default() -> Self {
        Self::new(SizedBufferPoolConfig::default())
    }
}

impl BufferPool for SizedBufferPool {
    fn rent(&self, min_size: usize) -> PooledBuffer {
        let Some(class) = self.class_for(min_size) else {
            // Oversized requests bypass the pool.
            return PooledBuffer::detached(BytesMut::with_capacity(min_size));
        };

        let class_size = self.config.size_classes[class];
        let buf = {
            let mut shelves = self.shelves.lock();
            shelves.shelves[class]
                .pop()
                .unwrap_or_else(|| BytesMut::with_capacity(class_size))
        };

        let shelves = Arc::clone(&self.shelves);
        let max_per_class = self.config.max_per_class;
        PooledBuffer::pooled(
            buf,
            Box::new(move |mut buf| {
                buf.clear();
                let mut shelves = shelves.lock();
                if shelves.shelves[class].len() < max_per_class {
                    shelves.shelves[class].push(buf);
                }
            }),
        )
    }
}
