//! Packet descriptors and wire framing strategies.
//!
//! A [`PacketInfo`] describes one packet-to-be-sent. A [`FramePacker`] turns it
//! into header (and trailer) words in place at the front of a send frame; the
//! payload words in between are written by the converter.

mod vrt;

pub use vrt::{ByteOrder, VrtPacker, VRT_MAX_HEADER_WORDS32};

/// Kind of packet carried by a frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    #[default]
    Data,
    Extension,
    Context,
}

/// Framing metadata for one packet.
///
/// The handler fills the payload counts, sequence, burst and time fields;
/// the packer fills `num_header_words32` and `num_packet_words32`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketInfo {
    pub packet_type: PacketType,

    pub num_payload_bytes: usize,
    pub num_payload_words32: usize,
    pub num_header_words32: usize,
    pub num_packet_words32: usize,

    /// Per-handler sequence number of this packet.
    pub packet_count: u64,

    pub sob: bool,
    pub eob: bool,

    pub has_sid: bool,
    pub sid: u32,

    pub has_cid: bool,
    pub cid: u64,

    pub has_tsi: bool,
    pub tsi: u32,

    pub has_tsf: bool,
    pub tsf: u64,

    pub has_tlr: bool,
    pub tlr: u32,
}

/// Wire-protocol framing strategy.
///
/// Implementations must be pure: the same `info` always yields the same
/// words, and they may be called concurrently on disjoint frames.
pub trait FramePacker: Send + Sync {
    /// Write the header for `info` at `frame[0..]` and the trailer (if any)
    /// after the payload region, then record the header and total word
    /// counts in `info`.
    ///
    /// `frame` must hold at least `max_header_words32() + payload + 1` words.
    fn pack(&self, frame: &mut [u32], info: &mut PacketInfo);

    /// Upper bound on header words this packer can produce.
    fn max_header_words32(&self) -> usize;

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str;
}
