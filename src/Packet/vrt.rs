use super::{FramePacker, PacketInfo, PacketType};
use std::io;

/// Header word, stream id, two class id words, integer and two fractional timestamp words.
pub const VRT_MAX_HEADER_WORDS32: usize = 7;

const SID_FLAG: u32 = 0x1 << 28;
const CID_FLAG: u32 = 0x1 << 27;
const TLR_FLAG: u32 = 0x1 << 26;
const SOB_FLAG: u32 = 0x1 << 25;
const EOB_FLAG: u32 = 0x1 << 24;
const TSI_FIELD: u32 = 0x3 << 22;
const TSF_FIELD: u32 = 0x1 << 20;

/// Byte order of words on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    #[inline]
    pub(crate) fn encode(self, word: u32) -> u32 {
        match self {
            ByteOrder::Big => word.to_be(),
            ByteOrder::Little => word.to_le(),
        }
    }

    #[inline]
    pub(crate) fn decode(self, word: u32) -> u32 {
        match self {
            ByteOrder::Big => u32::from_be(word),
            ByteOrder::Little => u32::from_le(word),
        }
    }
}

/// VITA-49 IF data packer.
///
/// Layout: `[hdr][sid?][cid hi, cid lo?][tsi?][tsf hi, tsf lo?][payload..][tlr?]`.
/// The header carries a 4 bit packet count and the 16 bit packet size in words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VrtPacker {
    order: ByteOrder,
}

impl VrtPacker {
    pub const fn big_endian() -> Self {
        Self { order: ByteOrder::Big }
    }

    pub const fn little_endian() -> Self {
        Self { order: ByteOrder::Little }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.order
    }

    /// Parse a packet produced by this packer. Used by loopback receivers and tests.
    pub fn unpack(&self, words: &[u32]) -> io::Result<PacketInfo> {
        let o = self.order;
        let word = |i: usize| -> io::Result<u32> {
            words.get(i).map(|w| o.decode(*w)).ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "VRT packet truncated")
            })
        };

        let hdr = word(0)?;
        let mut info = PacketInfo {
            packet_type: match hdr >> 29 {
                0x0 => PacketType::Data,
                0x1 => PacketType::Extension,
                0x2 => PacketType::Context,
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("Unknown VRT packet type {}", other),
                    ))
                }
            },
            packet_count: ((hdr >> 16) & 0xf) as u64,
            num_packet_words32: (hdr & 0xffff) as usize,
            sob: hdr & SOB_FLAG != 0,
            eob: hdr & EOB_FLAG != 0,
            has_tlr: hdr & TLR_FLAG != 0,
            ..PacketInfo::default()
        };

        let mut n = 1;
        if hdr & SID_FLAG != 0 {
            info.has_sid = true;
            info.sid = word(n)?;
            n += 1;
        }
        if hdr & CID_FLAG != 0 {
            info.has_cid = true;
            info.cid = ((word(n)? as u64) << 32) | word(n + 1)? as u64;
            n += 2;
        }
        if hdr & TSI_FIELD != 0 {
            info.has_tsi = true;
            info.tsi = word(n)?;
            n += 1;
        }
        if hdr & TSF_FIELD != 0 {
            info.has_tsf = true;
            info.tsf = ((word(n)? as u64) << 32) | word(n + 1)? as u64;
            n += 2;
        }
        info.num_header_words32 = n;

        let trailer = info.has_tlr as usize;
        if info.num_packet_words32 > words.len() || info.num_packet_words32 < n + trailer {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "VRT packet size {} inconsistent with header ({} words) and buffer ({} words)",
                    info.num_packet_words32,
                    n,
                    words.len()
                ),
            ));
        }
        info.num_payload_words32 = info.num_packet_words32 - n - trailer;
        info.num_payload_bytes = info.num_payload_words32 * 4;
        if info.has_tlr {
            info.tlr = word(info.num_packet_words32 - 1)?;
        }
        Ok(info)
    }
}

impl Default for VrtPacker {
    fn default() -> Self {
        Self::big_endian()
    }
}

impl FramePacker for VrtPacker {
    fn pack(&self, frame: &mut [u32], info: &mut PacketInfo) {
        let o = self.order;
        let mut flags: u32 = match info.packet_type {
            PacketType::Data => 0x0,
            PacketType::Extension => 0x1,
            PacketType::Context => 0x2,
        } << 29;

        let mut n = 1;
        if info.has_sid {
            frame[n] = o.encode(info.sid);
            flags |= SID_FLAG;
            n += 1;
        }
        if info.has_cid {
            frame[n] = o.encode((info.cid >> 32) as u32);
            frame[n + 1] = o.encode(info.cid as u32);
            flags |= CID_FLAG;
            n += 2;
        }
        if info.has_tsi {
            frame[n] = o.encode(info.tsi);
            flags |= TSI_FIELD;
            n += 1;
        }
        if info.has_tsf {
            frame[n] = o.encode((info.tsf >> 32) as u32);
            frame[n + 1] = o.encode(info.tsf as u32);
            flags |= TSF_FIELD;
            n += 2;
        }
        if info.sob {
            flags |= SOB_FLAG;
        }
        if info.eob {
            flags |= EOB_FLAG;
        }

        info.num_header_words32 = n;
        info.num_packet_words32 = n + info.num_payload_words32;
        if info.has_tlr {
            frame[info.num_packet_words32] = o.encode(info.tlr);
            info.num_packet_words32 += 1;
            flags |= TLR_FLAG;
        }

        let hdr = flags
            | (((info.packet_count & 0xf) as u32) << 16)
            | (info.num_packet_words32 as u32 & 0xffff);
        frame[0] = o.encode(hdr);
    }

    fn max_header_words32(&self) -> usize {
        VRT_MAX_HEADER_WORDS32
    }

    fn name(&self) -> &'static str {
        match self.order {
            ByteOrder::Big => "vrt_be",
            ByteOrder::Little => "vrt_le",
        }
    }
}
