use parking_lot::{Condvar, Mutex};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
mod debug;
mod getters;

/// Largest frame the pool will hand out (jumbo frame plus slack).
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Ownership state of an acquired frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferState {
    /// Exclusively owned by the acquirer, contents undefined.
    Acquired,
    /// Length fixed by `commit`, waiting for transmission.
    Committed,
}

pub(crate) struct PoolInner {
    free: Mutex<Vec<Box<[u32]>>>,
    available: Condvar,
    frame_words: usize,
    num_frames: usize,
    socket: RawFd,
}

/// Fixed set of pre-allocated send frames bound to one socket.
///
/// Frames leave the pool as [`SendBuffer`]s and come back when the buffer is
/// released or dropped, so steady-state streaming never allocates.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

/// A frame on loan from a [`FramePool`].
///
/// Acquisition yields exclusive ownership, `commit` is a state transition and
/// dropping the buffer returns the frame to its pool.
pub struct SendBuffer {
    frame: Option<Box<[u32]>>,
    committed_bytes: usize,
    state: BufferState,
    pool: Arc<PoolInner>,
}

impl FramePool {
    /// Create a pool of `num_frames` frames of `frame_size` bytes writing to `socket`.
    pub fn new(socket: RawFd, frame_size: usize, num_frames: usize) -> io::Result<Self> {
        if frame_size == 0 || frame_size > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "FramePool::new(): frame size must be in 1..={}, got {}",
                    MAX_FRAME_SIZE, frame_size
                ),
            ));
        }
        if num_frames == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "FramePool::new(): at least one frame is required",
            ));
        }

        // Frames are word addressed; round the byte size up
        let frame_words = (frame_size + 3) / 4;
        let free = (0..num_frames)
            .map(|_| vec![0u32; frame_words].into_boxed_slice())
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                available: Condvar::new(),
                frame_words,
                num_frames,
                socket,
            }),
        })
    }

    /// Take a frame, waiting up to `timeout` for one to be released.
    /// Returns `None` on timeout.
    pub fn get_buff(&self, timeout: Duration) -> Option<SendBuffer> {
        let deadline = Instant::now() + timeout;
        let mut free = self.inner.free.lock();

        loop {
            if let Some(frame) = free.pop() {
                return Some(SendBuffer {
                    frame: Some(frame),
                    committed_bytes: 0,
                    state: BufferState::Acquired,
                    pool: Arc::clone(&self.inner),
                });
            }
            if self.inner.available.wait_until(&mut free, deadline).timed_out() && free.is_empty() {
                return None;
            }
        }
    }
}

impl SendBuffer {
    /// Whole frame as 32-bit words, header region first.
    #[inline]
    pub fn as_words_mut(&mut self) -> &mut [u32] {
        match self.frame.as_deref_mut() {
            Some(frame) => frame,
            None => &mut [],
        }
    }

    /// Frame capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.pool.frame_words * 4
    }

    /// Fix the number of bytes to transmit. Clamped to the frame capacity.
    pub fn commit(&mut self, num_bytes: usize) {
        self.committed_bytes = num_bytes.min(self.capacity());
        self.state = BufferState::Committed;
    }

    /// The committed prefix of the frame, as it goes on the wire.
    pub fn as_committed_bytes(&self) -> &[u8] {
        match self.frame.as_deref() {
            Some(frame) => {
                // Safety: a u32 slice is always a valid byte slice of 4x its length
                let bytes = unsafe {
                    std::slice::from_raw_parts(frame.as_ptr() as *const u8, frame.len() * 4)
                };
                &bytes[..self.committed_bytes]
            }
            None => &[],
        }
    }

    /// Socket the frame is destined for.
    #[inline]
    pub fn socket(&self) -> RawFd {
        self.pool.socket
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Return the frame to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for SendBuffer {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            self.pool.free.lock().push(frame);
            self.pool.available.notify_one();
        }
    }
}
