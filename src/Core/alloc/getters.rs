use super::*;

/// Introspection helpers for FramePool, mainly for tests and monitoring.
impl FramePool {
    /// Number of frames currently sitting in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Total number of frames owned by the pool.
    pub fn num_frames(&self) -> usize {
        self.inner.num_frames
    }

    /// Size of each frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.inner.frame_words * 4
    }

    /// Socket every frame of this pool is transmitted on.
    pub fn socket(&self) -> RawFd {
        self.inner.socket
    }
}
