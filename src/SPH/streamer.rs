use super::channel::{GetBuffFn, PostSendFn};
use super::handler::{BatchPolicy, SendPacketHandler, DEFAULT_MAX_SAMPS, DEFAULT_SAMP_RATE, DEFAULT_TICK_RATE};
use super::pool::DEFAULT_CHANNELS_PER_WORKER;
use super::Structs::Metadata_Structs::{AsyncMetadata, TxMetadata};
use crate::Convert::ConvertId;
use crate::Core::udp::UdpSendTransport;
use crate::Packet::{FramePacker, VrtPacker};
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Application-facing transmit stream.
pub trait TxStreamer {
    fn get_num_channels(&self) -> usize;

    fn get_max_num_samps(&self) -> usize;

    /// `buffs` holds one byte buffer per channel and converter input.
    fn send(
        &mut self,
        buffs: &[&[u8]],
        nsamps_per_buff: usize,
        metadata: &TxMetadata,
        timeout: Duration,
    ) -> io::Result<usize>;

    fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMetadata>;
}

/// Send packet handler with a fixed maximum send size.
pub struct SendPacketStreamer {
    handler: SendPacketHandler,
    max_num_samps: usize,
}

impl SendPacketStreamer {
    pub fn new(handler: SendPacketHandler, max_num_samps: usize) -> Self {
        Self {
            handler,
            max_num_samps,
        }
    }

    pub fn handler(&self) -> &SendPacketHandler {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut SendPacketHandler {
        &mut self.handler
    }

    pub fn into_handler(self) -> SendPacketHandler {
        self.handler
    }
}

impl TxStreamer for SendPacketStreamer {
    fn get_num_channels(&self) -> usize {
        self.handler.get_num_channels()
    }

    fn get_max_num_samps(&self) -> usize {
        self.max_num_samps
    }

    fn send(
        &mut self,
        buffs: &[&[u8]],
        nsamps_per_buff: usize,
        metadata: &TxMetadata,
        timeout: Duration,
    ) -> io::Result<usize> {
        self.handler.send(buffs, nsamps_per_buff, metadata, timeout)
    }

    fn recv_async_msg(&self, timeout: Duration) -> Option<AsyncMetadata> {
        self.handler.recv_async_msg(timeout)
    }
}

/// Builder for [`SendPacketStreamer`].
///
/// ```no_run
/// use sph_transmit::SPH::{StreamerBuilder, TxStreamer};
///
/// let streamer = StreamerBuilder::new()
///     .with_channels(4)
///     .with_max_samples_per_packet(1000)
///     .build()
///     .unwrap();
/// assert_eq!(streamer.get_num_channels(), 4);
/// ```
pub struct StreamerBuilder {
    num_channels: usize,
    max_samples_per_packet: usize,
    channels_per_worker: usize,
    tick_rate: f64,
    samp_rate: f64,
    trailer: bool,
    convert_id: ConvertId,
    scale_factor: Option<f64>,
    packer: Arc<dyn FramePacker>,
    header_offset_words32: usize,
    batch_policy: BatchPolicy,
    fragment_time_advance: bool,
    get_buffs: Vec<(usize, GetBuffFn)>,
    post_sends: Vec<(usize, PostSendFn)>,
    sids: Vec<(usize, u32)>,
}

impl Default for StreamerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamerBuilder {
    pub fn new() -> Self {
        Self {
            num_channels: 1,
            max_samples_per_packet: DEFAULT_MAX_SAMPS,
            channels_per_worker: DEFAULT_CHANNELS_PER_WORKER,
            tick_rate: DEFAULT_TICK_RATE,
            samp_rate: DEFAULT_SAMP_RATE,
            trailer: true,
            convert_id: ConvertId::default(),
            scale_factor: None,
            packer: Arc::new(VrtPacker::big_endian()),
            header_offset_words32: 0,
            batch_policy: BatchPolicy::default(),
            fragment_time_advance: false,
            get_buffs: Vec::new(),
            post_sends: Vec::new(),
            sids: Vec::new(),
        }
    }

    pub fn with_channels(mut self, num_channels: usize) -> Self {
        self.num_channels = num_channels;
        self
    }

    pub fn with_max_samples_per_packet(mut self, num_samps: usize) -> Self {
        self.max_samples_per_packet = num_samps;
        self
    }

    pub fn with_channels_per_worker(mut self, channels_per_worker: usize) -> Self {
        self.channels_per_worker = channels_per_worker;
        self
    }

    pub fn with_tick_rate(mut self, rate: f64) -> Self {
        self.tick_rate = rate;
        self
    }

    pub fn with_samp_rate(mut self, rate: f64) -> Self {
        self.samp_rate = rate;
        self
    }

    pub fn with_trailer(mut self, enable: bool) -> Self {
        self.trailer = enable;
        self
    }

    pub fn with_converter(mut self, id: ConvertId) -> Self {
        self.convert_id = id;
        self
    }

    pub fn with_scale_factor(mut self, scale_factor: f64) -> Self {
        self.scale_factor = Some(scale_factor);
        self
    }

    pub fn with_packer(mut self, packer: Arc<dyn FramePacker>, header_offset_words32: usize) -> Self {
        self.packer = packer;
        self.header_offset_words32 = header_offset_words32;
        self
    }

    pub fn with_batch_policy(mut self, policy: BatchPolicy) -> Self {
        self.batch_policy = policy;
        self
    }

    pub fn with_fragment_time_advance(mut self, enable: bool) -> Self {
        self.fragment_time_advance = enable;
        self
    }

    pub fn with_get_buff(mut self, channel: usize, get_buff: GetBuffFn) -> Self {
        self.get_buffs.push((channel, get_buff));
        self
    }

    pub fn with_post_send(mut self, channel: usize, cb: PostSendFn) -> Self {
        self.post_sends.push((channel, cb));
        self
    }

    pub fn with_sid(mut self, channel: usize, sid: u32) -> Self {
        self.sids.push((channel, sid));
        self
    }

    /// One channel per transport, channel `i` acquiring frames from
    /// `transports[i]`. Sets the channel count.
    pub fn with_transports(mut self, transports: &[Arc<UdpSendTransport>]) -> Self {
        self.num_channels = transports.len();
        for (channel, xport) in transports.iter().enumerate() {
            let xport = Arc::clone(xport);
            self.get_buffs
                .push((channel, Arc::new(move |timeout| xport.get_send_buff(timeout))));
        }
        self
    }

    pub fn build(self) -> io::Result<SendPacketStreamer> {
        let mut handler = SendPacketHandler::new(0)?;
        handler.set_channels_per_worker(self.channels_per_worker)?;
        handler.resize(self.num_channels)?;
        handler.set_max_samples_per_packet(self.max_samples_per_packet)?;
        handler.set_tick_rate(self.tick_rate)?;
        handler.set_samp_rate(self.samp_rate)?;
        handler.set_enable_trailer(self.trailer);
        if let Some(scale_factor) = self.scale_factor {
            handler.set_scale_factor(scale_factor)?;
        }
        handler.set_converter(self.convert_id)?;
        handler.set_vrt_packer(self.packer, self.header_offset_words32);
        handler.set_batch_policy(self.batch_policy);
        handler.set_fragment_time_advance(self.fragment_time_advance);

        for (channel, get_buff) in self.get_buffs {
            handler.set_xport_chan_get_buff(channel, get_buff)?;
        }
        for (channel, cb) in self.post_sends {
            handler.set_xport_chan_post_send_cb(channel, cb)?;
        }
        for (channel, sid) in self.sids {
            handler.set_xport_chan_sid(channel, true, sid)?;
        }

        let max_num_samps = handler.get_max_samples_per_packet();
        Ok(SendPacketStreamer::new(handler, max_num_samps))
    }
}
