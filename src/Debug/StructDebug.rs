use std::fmt;
use crate::Core::alloc::{FramePool, SendBuffer};
use crate::SPH::channel::ChannelBinding;
use crate::SPH::handler::{AsyncFeedback, SendPacketHandler};
use crate::SPH::pool::ConversionPool;

/// Debug function for FramePool
///
/// Shows:
/// - Destination socket
/// - Frame geometry
/// - Frames currently free
pub fn debug_frame_pool(pool: &FramePool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FramePool")
        .field("socket", &pool.socket())
        .field("frame_size", &pool.frame_size())
        .field("num_frames", &pool.num_frames())
        .field("available", &pool.available())
        .finish()
}

/// Debug function for SendBuffer
///
/// Frame contents are never printed, only the ownership state and lengths.
pub fn debug_send_buffer(buff: &SendBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SendBuffer")
        .field("socket", &buff.socket())
        .field("state", &buff.state())
        .field("capacity", &buff.capacity())
        .field("committed", &buff.as_committed_bytes().len())
        .finish()
}

/// Debug function for ChannelBinding
///
/// Callbacks are opaque, only their presence is shown.
pub fn debug_channel_binding(binding: &ChannelBinding, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ChannelBinding")
        .field("get_buff", &binding.has_get_buff())
        .field("post_send", &binding.has_post_send())
        .field("sid", &binding.sid())
        .finish()
}

pub fn debug_conversion_pool(pool: &ConversionPool, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ConversionPool")
        .field("channels", &pool.num_channels())
        .field("workers", &pool.num_workers())
        .field("channels_per_worker", &pool.channels_per_worker())
        .field("pending", &pool.batch().pending())
        .finish()
}

pub fn debug_async_feedback(feedback: &AsyncFeedback, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AsyncFeedback")
        .field("bound", &feedback.is_bound())
        .finish()
}

/// Debug function for SendPacketHandler
///
/// Shows configuration and counters; converter and packer by name only.
pub fn debug_send_packet_handler(handler: &SendPacketHandler, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SendPacketHandler")
        .field("channels", &handler.get_num_channels())
        .field("workers", &handler.num_workers())
        .field("max_samples_per_packet", &handler.get_max_samples_per_packet())
        .field("converter", &handler.converter().map(|c| c.id()))
        .field("packer", &handler.packer().name())
        .field("next_packet_seq", &handler.next_packet_seq())
        .field("pending_metadata", &handler.pending_metadata())
        .field("stats", &handler.stats())
        .finish_non_exhaustive()
}
