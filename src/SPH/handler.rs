use super::batch::BatchStats;
use super::channel::{ChannelTable, GetBuffFn, PostSendFn};
use super::pool::{ConversionJob, ConversionPool, SourceSlice, DEFAULT_CHANNELS_PER_WORKER};
use super::Structs::Metadata_Structs::{AsyncMetadata, TimeSpec, TxMetadata};
use crate::Convert::{get_converter, Converter, ConvertId, CpuFormat};
use crate::Packet::{FramePacker, PacketInfo, PacketType, VrtPacker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_MAX_SAMPS: usize = 1000;
pub const DEFAULT_TICK_RATE: f64 = 100e6;
pub const DEFAULT_SAMP_RATE: f64 = 1e6;

/// Source used for the single padded sample of an empty packet. Wide enough
/// for one complex sample of any CPU format.
static ZERO_SAMPLE: [u8; 16] = [0; 16];

/// When committed buffers are handed to the sockets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BatchPolicy {
    /// Flush after every packet.
    #[default]
    PerPacket,
    /// Flush once per `send`, after its last fragment. Buffer providers must
    /// be able to hand out one frame per fragment.
    PerSend,
}

/// Asynchronous message source: a message, or `None` on timeout.
pub type AsyncRecvFn = Arc<dyn Fn(Duration) -> Option<AsyncMetadata> + Send + Sync>;

/// Cloneable handle on the asynchronous feedback path.
///
/// Polled from a different thread than the one sending.
#[derive(Clone, Default)]
pub struct AsyncFeedback {
    recv: Option<AsyncRecvFn>,
}

impl AsyncFeedback {
    pub fn is_bound(&self) -> bool {
        self.recv.is_some()
    }

    /// Wait up to `timeout` for a message. Unbound feedback sleeps for the
    /// full timeout and reports nothing.
    pub fn recv(&self, timeout: Duration) -> Option<AsyncMetadata> {
        match &self.recv {
            Some(recv) => recv(timeout),
            None => {
                std::thread::sleep(timeout);
                None
            }
        }
    }
}

/// Counters accumulated over the handler's lifetime.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Packets committed on every channel. Equals the sequence advance
    /// unless a conversion panicked.
    pub packets: u64,
    /// Samples per channel accepted by `send`.
    pub samples: u64,
    pub transmit_calls: u64,
    pub transmit_failures: u64,
    /// Datagrams never sent: rejected by the socket, or whose frame was
    /// too small for the packet.
    pub packets_dropped: u64,
    /// Packets abandoned because a channel had no buffer in time.
    pub acquisition_timeouts: u64,
}

/// Sample types accepted by [`SendPacketHandler::send_samples`].
pub trait CpuSample: Copy + Send + Sync + 'static {
    const FORMAT: CpuFormat;
}

impl CpuSample for [f64; 2] {
    const FORMAT: CpuFormat = CpuFormat::Fc64;
}

impl CpuSample for [f32; 2] {
    const FORMAT: CpuFormat = CpuFormat::Fc32;
}

impl CpuSample for [i16; 2] {
    const FORMAT: CpuFormat = CpuFormat::Sc16;
}

fn sample_bytes<T: CpuSample>(samples: &[T]) -> &[u8] {
    // Safety: every CpuSample is a plain array of primitives without padding
    unsafe {
        std::slice::from_raw_parts(samples.as_ptr() as *const u8, std::mem::size_of_val(samples))
    }
}

/// Multi-channel send packet handler.
///
/// All channels send in unison: one `send` produces the same number of
/// packets on every channel, with one shared sequence counter.
pub struct SendPacketHandler {
    channels: Arc<ChannelTable>,
    pool: ConversionPool,
    channels_per_worker: usize,

    convert_id: Option<ConvertId>,
    scale_factor: Option<f64>,
    converter: Option<Arc<dyn Converter>>,

    packer: Arc<dyn FramePacker>,
    header_offset_words32: usize,
    has_tlr: bool,

    tick_rate: f64,
    samp_rate: f64,
    max_samples_per_packet: usize,

    next_packet_seq: u64,
    metadata_cache: Option<TxMetadata>,
    batch_policy: BatchPolicy,
    fragment_time_advance: bool,

    async_feedback: AsyncFeedback,
    stats: HandlerStats,
}

impl SendPacketHandler {
    /// Create a handler for `num_channels`; a converter and a buffer provider
    /// per channel must be configured before the first `send`.
    pub fn new(num_channels: usize) -> io::Result<Self> {
        Ok(Self {
            channels: Arc::new(ChannelTable::new(num_channels)),
            pool: ConversionPool::new(num_channels, DEFAULT_CHANNELS_PER_WORKER)?,
            channels_per_worker: DEFAULT_CHANNELS_PER_WORKER,
            convert_id: None,
            scale_factor: None,
            converter: None,
            packer: Arc::new(VrtPacker::big_endian()),
            header_offset_words32: 0,
            has_tlr: true,
            tick_rate: DEFAULT_TICK_RATE,
            samp_rate: DEFAULT_SAMP_RATE,
            max_samples_per_packet: DEFAULT_MAX_SAMPS,
            next_packet_seq: 0,
            metadata_cache: None,
            batch_policy: BatchPolicy::default(),
            fragment_time_advance: false,
            async_feedback: AsyncFeedback::default(),
            stats: HandlerStats::default(),
        })
    }

    /// Change the channel count. Tears down and recreates the worker pool;
    /// surviving channels keep their bindings.
    pub fn resize(&mut self, num_channels: usize) -> io::Result<()> {
        if num_channels == self.size() {
            return Ok(());
        }
        self.pool.clear_staged();
        self.rebuild_pool(num_channels, self.channels_per_worker)?;
        Arc::make_mut(&mut self.channels).resize(num_channels);
        Ok(())
    }

    fn rebuild_pool(&mut self, num_channels: usize, channels_per_worker: usize) -> io::Result<()> {
        if channels_per_worker == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Channels per conversion worker must be at least 1",
            ));
        }
        // old workers are joined before the new ones start
        self.pool = ConversionPool::new(0, channels_per_worker)?;
        self.pool = ConversionPool::new(num_channels, channels_per_worker)?;
        self.channels_per_worker = channels_per_worker;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.channels.len()
    }

    pub fn get_num_channels(&self) -> usize {
        self.size()
    }

    pub fn get_max_samples_per_packet(&self) -> usize {
        self.max_samples_per_packet
    }

    pub fn set_max_samples_per_packet(&mut self, num_samps: usize) -> io::Result<()> {
        if num_samps == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Max samples per packet must be at least 1",
            ));
        }
        self.max_samples_per_packet = num_samps;
        Ok(())
    }

    pub fn set_tick_rate(&mut self, rate: f64) -> io::Result<()> {
        self.tick_rate = positive_rate("Tick", rate)?;
        Ok(())
    }

    pub fn set_samp_rate(&mut self, rate: f64) -> io::Result<()> {
        self.samp_rate = positive_rate("Sample", rate)?;
        Ok(())
    }

    pub fn tick_rate(&self) -> f64 {
        self.tick_rate
    }

    pub fn samp_rate(&self) -> f64 {
        self.samp_rate
    }

    pub fn set_enable_trailer(&mut self, enable: bool) {
        self.has_tlr = enable;
    }

    /// Select the conversion routine. The scale factor set earlier (or the
    /// wire format's full scale) is applied to the new converter.
    pub fn set_converter(&mut self, id: ConvertId) -> io::Result<()> {
        let scalar = self
            .scale_factor
            .unwrap_or_else(|| id.output_format.full_scale());
        self.converter = Some(get_converter(&id, scalar)?);
        self.convert_id = Some(id);
        Ok(())
    }

    /// Gain applied by the converter. May be set before `set_converter`.
    pub fn set_scale_factor(&mut self, scale_factor: f64) -> io::Result<()> {
        if let Some(id) = self.convert_id {
            self.converter = Some(get_converter(&id, scale_factor)?);
        } else if !scale_factor.is_finite() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Scale factor must be finite, got {}", scale_factor),
            ));
        }
        self.scale_factor = Some(scale_factor);
        Ok(())
    }

    pub fn converter(&self) -> Option<&Arc<dyn Converter>> {
        self.converter.as_ref()
    }

    /// Framing strategy plus the number of words reserved in front of each header.
    pub fn set_vrt_packer(&mut self, packer: Arc<dyn FramePacker>, header_offset_words32: usize) {
        self.packer = packer;
        self.header_offset_words32 = header_offset_words32;
    }

    pub fn packer(&self) -> &Arc<dyn FramePacker> {
        &self.packer
    }

    pub fn set_channels_per_worker(&mut self, channels_per_worker: usize) -> io::Result<()> {
        if channels_per_worker == self.channels_per_worker {
            return Ok(());
        }
        self.rebuild_pool(self.size(), channels_per_worker)
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    pub fn set_batch_policy(&mut self, policy: BatchPolicy) {
        self.batch_policy = policy;
    }

    /// Advance the timestamp of each fragment by the samples already sent.
    /// Off by default: every fragment carries the request's timestamp.
    pub fn set_fragment_time_advance(&mut self, enable: bool) {
        self.fragment_time_advance = enable;
    }

    pub fn set_xport_chan_get_buff(&mut self, channel: usize, get_buff: GetBuffFn) -> io::Result<()> {
        Arc::make_mut(&mut self.channels).set_get_buff(channel, get_buff)
    }

    pub fn set_xport_chan_post_send_cb(&mut self, channel: usize, cb: PostSendFn) -> io::Result<()> {
        Arc::make_mut(&mut self.channels).set_post_send(channel, cb)
    }

    pub fn set_xport_chan_sid(&mut self, channel: usize, has_sid: bool, sid: u32) -> io::Result<()> {
        Arc::make_mut(&mut self.channels).set_sid(channel, has_sid, sid)
    }

    pub fn channels(&self) -> &ChannelTable {
        &self.channels
    }

    pub fn set_async_receiver(&mut self, recv: AsyncRecvFn) {
        self.async_feedback = AsyncFeedback { recv: Some(recv) };
    }

    pub fn async_feedback(&self) -> AsyncFeedback {
        self.async_feedback.clone()
    }

    pub fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMetadata> {
        self.async_feedback.recv(timeout)
    }

    /// Sequence number the next packet will carry.
    pub fn next_packet_seq(&self) -> u64 {
        self.next_packet_seq
    }

    /// Start-of-burst metadata waiting for the first request with samples.
    pub fn pending_metadata(&self) -> Option<&TxMetadata> {
        self.metadata_cache.as_ref()
    }

    pub fn stats(&self) -> HandlerStats {
        self.stats
    }

    /// Typed entry point: one slice per source buffer.
    pub fn send_samples<T: CpuSample>(
        &mut self,
        buffs: &[&[T]],
        nsamps_per_buff: usize,
        metadata: &TxMetadata,
        timeout: Duration,
    ) -> io::Result<usize> {
        if let Some(id) = self.convert_id {
            if id.input_format != T::FORMAT {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "Sample type is {:?} but the converter expects {:?}",
                        T::FORMAT,
                        id.input_format
                    ),
                ));
            }
        }
        let bytes: Vec<&[u8]> = buffs.iter().map(|b| sample_bytes(b)).collect();
        self.send(&bytes, nsamps_per_buff, metadata, timeout)
    }

    /// Send `nsamps_per_buff` samples from every source buffer.
    ///
    /// `buffs` holds `num_channels * num_inputs` byte buffers in the
    /// converter's CPU format. Returns the samples per channel that were
    /// committed; fewer than requested means a buffer provider timed out.
    /// Fails for a time spec before the epoch, or when a conversion panicked.
    pub fn send(
        &mut self,
        buffs: &[&[u8]],
        nsamps_per_buff: usize,
        metadata: &TxMetadata,
        timeout: Duration,
    ) -> io::Result<usize> {
        let id = self.check_ready(buffs, nsamps_per_buff)?;
        let bytes_per_cpu_item = id.input_format.bytes_per_item();
        if metadata.has_time_spec && metadata.time_spec.to_ticks(self.tick_rate) < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Time spec {}s is before the device epoch",
                    metadata.time_spec.real_secs()
                ),
            ));
        }

        let mut md = *metadata;
        if nsamps_per_buff != 0 {
            if let Some(cached) = self.metadata_cache.take() {
                md.start_of_burst |= cached.start_of_burst;
                md.end_of_burst |= cached.end_of_burst;
                if !md.has_time_spec {
                    md.has_time_spec = cached.has_time_spec;
                    md.time_spec = cached.time_spec;
                }
            }
        }

        let mut info = PacketInfo {
            packet_type: PacketType::Data,
            has_tlr: self.has_tlr,
            has_tsf: md.has_time_spec,
            tsf: wire_ticks(md.time_spec, self.tick_rate),
            sob: md.start_of_burst,
            eob: md.end_of_burst,
            ..PacketInfo::default()
        };

        if nsamps_per_buff == 0 {
            if metadata.start_of_burst {
                if self.metadata_cache.is_some() {
                    tracing::debug!("pending start of burst metadata overwritten");
                }
                self.metadata_cache = Some(*metadata);
                tracing::debug!(has_time = metadata.has_time_spec, "start of burst metadata cached");
                return Ok(0);
            }
            // hardware needs at least one sample, so pad with zeros
            let zeros: Vec<&[u8]> = vec![&ZERO_SAMPLE[..bytes_per_cpu_item]; buffs.len()];
            self.send_one_packet(&zeros, 1, &mut info, timeout, 0)?;
            self.flush();
            tracing::trace!(nsamps = 0, sob = info.sob, eob = info.eob, "sent empty packet");
            return Ok(0);
        }

        if nsamps_per_buff <= self.max_samples_per_packet {
            let sent = self.send_one_packet(buffs, nsamps_per_buff, &mut info, timeout, 0)?;
            self.flush();
            tracing::trace!(
                nsamps = nsamps_per_buff,
                sent,
                sob = md.start_of_burst,
                eob = md.end_of_burst,
                has_time = md.has_time_spec,
                fragments = 1,
                "send"
            );
            return Ok(sent);
        }

        let max = self.max_samples_per_packet;
        let num_fragments = (nsamps_per_buff - 1) / max;
        let final_length = ((nsamps_per_buff - 1) % max) + 1;

        // false until the final fragment
        info.eob = false;

        let mut total_sent = 0;
        for _ in 0..num_fragments {
            let sent = self.send_one_packet(
                buffs,
                max,
                &mut info,
                timeout,
                total_sent * bytes_per_cpu_item,
            )?;
            total_sent += sent;
            if sent == 0 {
                self.flush();
                return Ok(total_sent);
            }

            info.tsf = self.fragment_time(&md, total_sent);
            info.sob = false;
        }

        info.eob = md.end_of_burst;
        total_sent += self.send_one_packet(
            buffs,
            final_length,
            &mut info,
            timeout,
            total_sent * bytes_per_cpu_item,
        )?;
        self.flush();

        tracing::trace!(
            nsamps = nsamps_per_buff,
            sent = total_sent,
            sob = md.start_of_burst,
            eob = md.end_of_burst,
            has_time = md.has_time_spec,
            fragments = num_fragments + 1,
            "send"
        );
        Ok(total_sent)
    }

    fn fragment_time(&self, md: &TxMetadata, samples_sent: usize) -> u64 {
        let time = if self.fragment_time_advance {
            md.time_spec + TimeSpec::from_ticks(samples_sent as i64, self.samp_rate)
        } else {
            md.time_spec
        };
        wire_ticks(time, self.tick_rate)
    }

    fn check_ready(&self, buffs: &[&[u8]], nsamps_per_buff: usize) -> io::Result<ConvertId> {
        let id = self.convert_id.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "No converter configured, call set_converter before send",
            )
        })?;
        if self.pool.num_channels() != self.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Conversion workers were not rebuilt after a failed resize",
            ));
        }
        if let Some(channel) = self.channels.first_unbound() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Channel {} has no buffer provider", channel),
            ));
        }

        let expected = self.size() * id.num_inputs;
        if buffs.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Expected {} source buffers ({} channels x {} inputs), got {}",
                    expected,
                    self.size(),
                    id.num_inputs,
                    buffs.len()
                ),
            ));
        }

        let needed = nsamps_per_buff * id.input_format.bytes_per_item();
        if let Some((i, b)) = buffs.iter().enumerate().find(|(_, b)| b.len() < needed) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Source buffer {} holds {} bytes, {} samples need {}",
                    i,
                    b.len(),
                    nsamps_per_buff,
                    needed
                ),
            ));
        }
        Ok(id)
    }

    /// Acquire, convert and commit one packet on every channel.
    ///
    /// Returns `nsamps_per_buff`, or 0 when any channel timed out, in which
    /// case nothing is committed and the sequence does not advance. A panic
    /// during conversion consumes the sequence slot, transmits what the
    /// other channels committed and is returned as an error.
    fn send_one_packet(
        &mut self,
        buffs: &[&[u8]],
        nsamps_per_buff: usize,
        info: &mut PacketInfo,
        timeout: Duration,
        buffer_offset_bytes: usize,
    ) -> io::Result<usize> {
        let (id, converter) = match (self.convert_id, &self.converter) {
            (Some(id), Some(converter)) => (id, Arc::clone(converter)),
            _ => return Ok(0),
        };

        info.num_payload_bytes =
            nsamps_per_buff * id.num_inputs * id.output_format.bytes_per_item();
        info.num_payload_words32 = (info.num_payload_bytes + 3) / 4;
        info.packet_count = self.next_packet_seq;

        for (channel, binding) in self.channels.iter().enumerate() {
            let buff = binding.get_buff.as_ref().and_then(|get_buff| get_buff(timeout));
            match buff {
                Some(buff) => self.pool.stage(channel, buff),
                None => {
                    self.pool.clear_staged();
                    self.stats.acquisition_timeouts += 1;
                    tracing::debug!(channel, seq = self.next_packet_seq, "buffer acquisition timed out");
                    return Ok(0);
                }
            }
        }

        let job = ConversionJob {
            sources: buffs
                .iter()
                .map(|b| SourceSlice::new(&b[buffer_offset_bytes..]))
                .collect(),
            num_inputs: id.num_inputs,
            nsamps: nsamps_per_buff,
            info: *info,
            header_offset_words32: self.header_offset_words32,
            channels: Arc::clone(&self.channels),
            converter,
            packer: Arc::clone(&self.packer),
        };
        let result = self.pool.run(job);

        self.next_packet_seq += 1;
        self.stats.packets_dropped += self.pool.take_dropped();
        if let Err(e) = result {
            self.pool.clear_staged();
            self.flush();
            return Err(e);
        }
        self.stats.packets += 1;
        self.stats.samples += nsamps_per_buff as u64;

        if self.batch_policy == BatchPolicy::PerPacket {
            self.flush();
        }
        Ok(nsamps_per_buff)
    }

    fn flush(&mut self) {
        let BatchStats {
            transmit_calls,
            failures,
            packets_dropped,
            ..
        } = self.pool.batch().flush();
        self.stats.transmit_calls += transmit_calls;
        self.stats.transmit_failures += failures;
        self.stats.packets_dropped += packets_dropped;
    }
}

/// Tick count for the header; negative times have been rejected by `send`.
fn wire_ticks(time: TimeSpec, tick_rate: f64) -> u64 {
    time.to_ticks(tick_rate).max(0) as u64
}

fn positive_rate(what: &str, rate: f64) -> io::Result<f64> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} rate must be positive, got {}", what, rate),
        ));
    }
    Ok(rate)
}

impl std::fmt::Debug for AsyncFeedback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_async_feedback(self, f)
    }
}

impl std::fmt::Debug for SendPacketHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        crate::Debug::StructDebug::debug_send_packet_handler(self, f)
    }
}
