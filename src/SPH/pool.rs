// Conversion Worker Pool
//
// Channels are split into contiguous groups of `channels_per_worker`. The
// calling thread converts group 0 itself; every further group has a
// persistent worker thread. Each packet is one episode:
//   1. the caller stages one acquired buffer per channel,
//   2. publishes an immutable ConversionJob and bumps the generation,
//   3. converts its own group inline,
//   4. waits on a counting completion signal until every worker reported.

use super::batch::TransmissionBatch;
use super::channel::ChannelTable;
use crate::Convert::{Converter, MAX_INTERLEAVE};
use crate::Core::alloc::SendBuffer;
use crate::Core::futex::{futex_wait_for, futex_wake_all};
use crate::Packet::{FramePacker, PacketInfo};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Channels converted by one worker (and by the calling thread).
pub const DEFAULT_CHANNELS_PER_WORKER: usize = 8;

/// Upper bound on one wait for worker completion; teardown is observed
/// at this granularity.
const JOIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Split `0..num_channels` into contiguous groups of `per_group`.
///
/// Always returns at least one group; the first may be empty when there are
/// no channels.
pub fn partition(num_channels: usize, per_group: usize) -> Vec<Range<usize>> {
    let per_group = per_group.max(1);
    if num_channels == 0 {
        return vec![0..0];
    }
    (0..num_channels)
        .step_by(per_group)
        .map(|start| start..(start + per_group).min(num_channels))
        .collect()
}

/// Read-only view of one source buffer for the duration of an episode.
#[derive(Copy, Clone)]
pub(crate) struct SourceSlice {
    ptr: *const u8,
    len: usize,
}

// Safety: a SourceSlice is only dereferenced while the send call that
// borrowed the underlying slice is blocked in `ConversionPool::run`.
unsafe impl Send for SourceSlice {}
unsafe impl Sync for SourceSlice {}

impl SourceSlice {
    pub(crate) fn new(src: &[u8]) -> Self {
        Self {
            ptr: src.as_ptr(),
            len: src.len(),
        }
    }

    /// # Safety
    /// The slice this view was created from must still be borrowed.
    unsafe fn as_slice<'a>(self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}

/// Everything a worker needs to convert one packet, fixed for the episode.
pub(crate) struct ConversionJob {
    /// `channel * num_inputs + input`, already advanced to the fragment offset.
    pub(crate) sources: Vec<SourceSlice>,
    pub(crate) num_inputs: usize,
    pub(crate) nsamps: usize,
    pub(crate) info: PacketInfo,
    pub(crate) header_offset_words32: usize,
    pub(crate) channels: Arc<ChannelTable>,
    pub(crate) converter: Arc<dyn Converter>,
    pub(crate) packer: Arc<dyn FramePacker>,
}

impl ConversionJob {
    /// Pack, convert, commit and queue one channel's buffer.
    fn process_channel(&self, shared: &PoolShared, index: usize) {
        let Some(mut buff) = shared.staged[index].lock().take() else {
            return;
        };
        let binding = self.channels.get(index);

        let mut info = self.info;
        if let Some(binding) = binding {
            info.has_sid = binding.has_sid;
            info.sid = binding.sid;
        }

        let offset = self.header_offset_words32;
        let frame = buff.as_words_mut();
        let needed = offset
            + self.packer.max_header_words32()
            + info.num_payload_words32
            + info.has_tlr as usize;
        if needed > frame.len() {
            tracing::error!(
                channel = index,
                needed_words = needed,
                frame_words = frame.len(),
                "send frame too small for packet, dropped"
            );
            shared.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.packer.pack(&mut frame[offset..], &mut info);

        let mut inputs: [&[u8]; MAX_INTERLEAVE] = [&[]; MAX_INTERLEAVE];
        for (k, input) in inputs.iter_mut().take(self.num_inputs).enumerate() {
            // Safety: see SourceSlice
            *input = unsafe { self.sources[index * self.num_inputs + k].as_slice() };
        }
        let payload = offset + info.num_header_words32;
        self.converter
            .convert(&inputs[..self.num_inputs], &mut frame[payload..], self.nsamps);

        buff.commit((offset + info.num_packet_words32) * 4);
        shared.batch.push(index, info.packet_count, buff);

        if let Some(cb) = binding.and_then(|b| b.post_send.as_ref()) {
            cb();
        }
    }

    /// Process `group`, reporting a panic instead of unwinding into the caller.
    fn process_group(&self, shared: &PoolShared, group: Range<usize>) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            for index in group.clone() {
                self.process_channel(shared, index);
            }
        }));
        if result.is_err() {
            tracing::error!(
                channels = ?group,
                seq = self.info.packet_count,
                "conversion panicked, rest of the group skipped"
            );
            shared.panicked.store(true, Ordering::Release);
        }
    }
}

struct PoolState {
    generation: u64,
    terminate: bool,
    job: Option<Arc<ConversionJob>>,
}

pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    ready: Condvar,
    /// Workers still converting in the current episode.
    remaining: CachePadded<AtomicU32>,
    /// Set when any group panicked during the current episode.
    panicked: AtomicBool,
    /// Packets dropped because a frame could not hold them.
    dropped: AtomicU64,
    /// Buffer acquired for each channel, taken by the channel's owner.
    staged: Vec<CachePadded<Mutex<Option<SendBuffer>>>>,
    batch: TransmissionBatch,
}

/// Decrements the completion count when dropped, including on unwind.
struct DoneSignal<'a>(&'a AtomicU32);

impl Drop for DoneSignal<'_> {
    fn drop(&mut self) {
        if self.0.fetch_sub(1, Ordering::AcqRel) == 1 {
            futex_wake_all(self.0);
        }
    }
}

/// Blocks until every worker finished the episode, then retires the job.
struct EpisodeGuard<'a>(&'a PoolShared);

impl Drop for EpisodeGuard<'_> {
    fn drop(&mut self) {
        let remaining = &self.0.remaining;
        loop {
            let current = remaining.load(Ordering::Acquire);
            if current == 0 {
                break;
            }
            futex_wait_for(remaining, current, JOIN_POLL_INTERVAL);
        }
        self.0.state.lock().job = None;
    }
}

/// Fixed pool of conversion workers for one channel count.
pub struct ConversionPool {
    shared: Arc<PoolShared>,
    groups: Vec<Range<usize>>,
    workers: Vec<JoinHandle<()>>,
    channels_per_worker: usize,
}

impl ConversionPool {
    /// Spawn `ceil(num_channels / channels_per_worker) - 1` workers.
    pub fn new(num_channels: usize, channels_per_worker: usize) -> io::Result<Self> {
        if channels_per_worker == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Channels per conversion worker must be at least 1",
            ));
        }

        let groups = partition(num_channels, channels_per_worker);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                generation: 0,
                terminate: false,
                job: None,
            }),
            ready: Condvar::new(),
            remaining: CachePadded::new(AtomicU32::new(0)),
            panicked: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            staged: (0..num_channels)
                .map(|_| CachePadded::new(Mutex::new(None)))
                .collect(),
            batch: TransmissionBatch::new(num_channels),
        });

        let mut pool = Self {
            shared,
            groups,
            workers: Vec::new(),
            channels_per_worker,
        };

        for (i, group) in pool.groups.iter().enumerate().skip(1) {
            let shared = Arc::clone(&pool.shared);
            let group = group.clone();
            let handle = std::thread::Builder::new()
                .name(format!("sph-convert-{}", i))
                .spawn(move || worker_loop(shared, group));
            match handle {
                Ok(handle) => pool.workers.push(handle),
                // Drop joins whatever was already spawned
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(
            channels = num_channels,
            workers = pool.workers.len(),
            channels_per_worker,
            "conversion pool started"
        );
        Ok(pool)
    }

    pub fn num_channels(&self) -> usize {
        self.shared.staged.len()
    }

    /// Background workers, excluding the calling thread.
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn channels_per_worker(&self) -> usize {
        self.channels_per_worker
    }

    /// Channel groups; group 0 belongs to the calling thread.
    pub fn groups(&self) -> &[Range<usize>] {
        &self.groups
    }

    pub fn batch(&self) -> &TransmissionBatch {
        &self.shared.batch
    }

    /// Hand `buff` to `channel` for the next episode.
    pub(crate) fn stage(&self, channel: usize, buff: SendBuffer) {
        *self.shared.staged[channel].lock() = Some(buff);
    }

    /// Release every staged buffer without sending it.
    pub(crate) fn clear_staged(&self) {
        for slot in &self.shared.staged {
            slot.lock().take();
        }
    }

    /// Packets dropped for undersized frames since the last call.
    pub(crate) fn take_dropped(&self) -> u64 {
        self.shared.dropped.swap(0, Ordering::Relaxed)
    }

    /// Run one episode. Returns once every channel has been processed.
    ///
    /// A panic on any channel is caught on the thread that hit it; the
    /// episode still completes and reports an error. Whatever the other
    /// channels committed stays queued in the batch.
    pub(crate) fn run(&self, job: ConversionJob) -> io::Result<()> {
        let job = Arc::new(job);
        let guard = EpisodeGuard(&self.shared);

        if !self.workers.is_empty() {
            self.shared
                .remaining
                .store(self.workers.len() as u32, Ordering::Release);
            {
                let mut state = self.shared.state.lock();
                state.job = Some(Arc::clone(&job));
                state.generation += 1;
            }
            self.shared.ready.notify_all();
        }

        job.process_group(&self.shared, self.groups[0].clone());

        drop(guard);
        if self.shared.panicked.swap(false, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("Conversion panicked for packet {}", job.info.packet_count),
            ));
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.state.lock().terminate = true;
        self.shared.ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("conversion worker panicked");
            }
        }
        tracing::debug!(channels = self.num_channels(), "conversion pool stopped");
    }
}

impl Drop for ConversionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<PoolShared>, group: Range<usize>) {
    let mut seen = 0u64;
    loop {
        let job = {
            let mut state = shared.state.lock();
            while !state.terminate && state.generation == seen {
                shared.ready.wait(&mut state);
            }
            if state.terminate {
                break;
            }
            seen = state.generation;
            state.job.clone()
        };

        let _done = DoneSignal(&shared.remaining);
        // rebound after `_done` so the job is released before completion is signalled
        let job = job;
        if let Some(job) = job {
            job.process_group(&shared, group.clone());
        }
    }
}

impl std::fmt::Debug for ConversionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_conversion_pool(self, f)
    }
}
