use crate::Core::alloc::SendBuffer;
use crate::Core::socket;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;

/// Outcome of one flush.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Batched transmit calls issued, one per socket.
    pub transmit_calls: u64,
    /// Transmit calls that reported an error.
    pub failures: u64,
    /// Datagrams accepted by the kernel.
    pub packets_sent: u64,
    /// Datagrams released without being accepted.
    pub packets_dropped: u64,
}

/// Committed buffers waiting for transmission.
///
/// Each channel owns one slot; a slot is only appended to by the worker that
/// owns that channel in the current episode, so slots never contend. The
/// flush groups everything by socket and issues one batched call per socket.
pub struct TransmissionBatch {
    pending: Vec<CachePadded<Mutex<Vec<(u64, SendBuffer)>>>>,
}

impl TransmissionBatch {
    pub fn new(num_channels: usize) -> Self {
        Self {
            pending: (0..num_channels)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect(),
        }
    }

    /// Queue a committed buffer carrying packet `seq` for `channel`.
    pub fn push(&self, channel: usize, seq: u64, buff: SendBuffer) {
        self.pending[channel].lock().push((seq, buff));
    }

    /// Number of buffers waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.pending.iter().map(|slot| slot.lock().len()).sum()
    }

    /// Transmit every pending buffer and release them all.
    ///
    /// Sockets are served in order of first appearance by channel index and
    /// each socket's datagrams go out in sequence order. Failures are
    /// reported through `tracing` and are not retried.
    pub fn flush(&self) -> BatchStats {
        let mut groups: Vec<(RawFd, Vec<(u64, SendBuffer)>)> = Vec::new();
        for slot in &self.pending {
            let mut queued = slot.lock();
            for (seq, buff) in queued.drain(..) {
                let fd = buff.socket();
                match groups.iter_mut().find(|(g, _)| *g == fd) {
                    Some((_, bufs)) => bufs.push((seq, buff)),
                    None => groups.push((fd, vec![(seq, buff)])),
                }
            }
        }

        let mut stats = BatchStats::default();
        for (fd, mut bufs) in groups {
            bufs.sort_by_key(|(seq, _)| *seq);
            let datagrams: Vec<&[u8]> = bufs.iter().map(|(_, b)| b.as_committed_bytes()).collect();

            stats.transmit_calls += 1;
            match socket::send_batch(fd, &datagrams) {
                Ok(sent) => {
                    stats.packets_sent += sent as u64;
                    stats.packets_dropped += (datagrams.len() - sent) as u64;
                    if sent < datagrams.len() {
                        tracing::warn!(
                            fd,
                            packets = datagrams.len(),
                            sent,
                            "batched transmit was short"
                        );
                    }
                }
                Err(e) => {
                    stats.failures += 1;
                    stats.packets_dropped += datagrams.len() as u64;
                    tracing::warn!(
                        fd,
                        packets = datagrams.len(),
                        error = %e,
                        "batched transmit failed, packets dropped"
                    );
                }
            }
            // buffers go back to their pools whatever the outcome
        }
        stats
    }
}
