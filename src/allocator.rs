use rustc_hash::FxHashMap;

/// Injection point for the endpoint's transient buffers: per-send transmit scratch and
///  per-packet reassembly storage. The default is plain heap allocation; applications with
///  allocation-rate concerns can plug in [`PooledAllocator`] or their own implementation.
pub trait BufferAllocator {
    /// Returns a zeroed buffer of exactly `size` bytes.
    fn allocate(&mut self, size: usize) -> Vec<u8>;

    /// Takes back a buffer previously handed out by `allocate`.
    fn free(&mut self, buffer: Vec<u8>);
}

/// Plain heap allocation, the default.
pub struct HeapAllocator;

impl BufferAllocator for HeapAllocator {
    fn allocate(&mut self, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    fn free(&mut self, _buffer: Vec<u8>) {}
}

/// Keeps freed buffers in size-keyed free lists and hands them out again, bounding the
///  number of retained buffers per size. Buffers returned while a free list is full are
///  dropped.
pub struct PooledAllocator {
    pools: FxHashMap<usize, Vec<Vec<u8>>>,
    max_pooled_per_size: usize,
}

impl PooledAllocator {
    pub fn new(max_pooled_per_size: usize) -> PooledAllocator {
        PooledAllocator {
            pools: FxHashMap::default(),
            max_pooled_per_size,
        }
    }
}

impl BufferAllocator for PooledAllocator {
    fn allocate(&mut self, size: usize) -> Vec<u8> {
        if let Some(mut buffer) = self.pools.get_mut(&size).and_then(|pool| pool.pop()) {
            // allocate promises zeroed buffers
            buffer.fill(0);
            buffer
        }
        else {
            vec![0; size]
        }
    }

    fn free(&mut self, buffer: Vec<u8>) {
        let pool = self.pools.entry(buffer.len()).or_default();
        if pool.len() < self.max_pooled_per_size {
            pool.push(buffer);
        }
    }
}
