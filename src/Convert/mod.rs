//! Sample format conversion from application (CPU) formats to wire formats.
//!
//! A converter is selected once per handler from a [`ConvertId`] and is then
//! shared read-only by every conversion worker.

use crate::Packet::ByteOrder;
use std::io;
use std::sync::Arc;

/// Largest number of source buffers interleaved into one channel's payload.
pub const MAX_INTERLEAVE: usize = 4;

/// In-memory sample format of application buffers (native endian, complex).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum CpuFormat {
    Fc64,
    Fc32,
    Sc16,
}

/// Wire sample format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OtwFormat {
    Sc16Item32Le,
    Sc16Item32Be,
    Sc8Item32Le,
    Sc8Item32Be,
}

impl CpuFormat {
    pub fn bytes_per_item(self) -> usize {
        match self {
            CpuFormat::Fc64 => 16,
            CpuFormat::Fc32 => 8,
            CpuFormat::Sc16 => 4,
        }
    }

    pub fn from_name(name: &str) -> io::Result<Self> {
        match name {
            "fc64" => Ok(CpuFormat::Fc64),
            "fc32" => Ok(CpuFormat::Fc32),
            "sc16" => Ok(CpuFormat::Sc16),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported CPU format: {}", name),
            )),
        }
    }
}

impl OtwFormat {
    pub fn bytes_per_item(self) -> usize {
        match self {
            OtwFormat::Sc16Item32Le | OtwFormat::Sc16Item32Be => 4,
            OtwFormat::Sc8Item32Le | OtwFormat::Sc8Item32Be => 2,
        }
    }

    /// Largest magnitude of one component; the default float scale factor.
    pub fn full_scale(self) -> f64 {
        match self {
            OtwFormat::Sc16Item32Le | OtwFormat::Sc16Item32Be => 32767.0,
            OtwFormat::Sc8Item32Le | OtwFormat::Sc8Item32Be => 127.0,
        }
    }

    fn byte_order(self) -> ByteOrder {
        match self {
            OtwFormat::Sc16Item32Le | OtwFormat::Sc8Item32Le => ByteOrder::Little,
            OtwFormat::Sc16Item32Be | OtwFormat::Sc8Item32Be => ByteOrder::Big,
        }
    }

    pub fn from_name(name: &str) -> io::Result<Self> {
        match name {
            "sc16_item32_le" => Ok(OtwFormat::Sc16Item32Le),
            "sc16_item32_be" => Ok(OtwFormat::Sc16Item32Be),
            "sc8_item32_le" => Ok(OtwFormat::Sc8Item32Le),
            "sc8_item32_be" => Ok(OtwFormat::Sc8Item32Be),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Unsupported wire format: {}", name),
            )),
        }
    }
}

/// Selects a converter: input format and count, output format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConvertId {
    pub input_format: CpuFormat,
    pub num_inputs: usize,
    pub output_format: OtwFormat,
}

impl ConvertId {
    pub fn new(input_format: CpuFormat, output_format: OtwFormat) -> Self {
        Self {
            input_format,
            num_inputs: 1,
            output_format,
        }
    }

    pub fn with_num_inputs(mut self, num_inputs: usize) -> Self {
        self.num_inputs = num_inputs;
        self
    }
}

impl Default for ConvertId {
    fn default() -> Self {
        Self::new(CpuFormat::Fc32, OtwFormat::Sc16Item32Le)
    }
}

/// Stateless sample conversion routine.
///
/// `inputs` holds one byte slice per interleaved source, each starting at the
/// first sample to convert. `output` starts right after the packet header.
/// Safe to call concurrently on disjoint outputs.
pub trait Converter: Send + Sync {
    fn convert(&self, inputs: &[&[u8]], output: &mut [u32], nsamps: usize);

    fn id(&self) -> ConvertId;

    fn scalar(&self) -> f64;
}

/// Build the converter for `id` applying `scalar`.
///
/// Float inputs are multiplied by `scalar`; `sc16` inputs are rescaled by
/// `scalar / 32767` so the default scale leaves them untouched.
pub fn get_converter(id: &ConvertId, scalar: f64) -> io::Result<Arc<dyn Converter>> {
    if id.num_inputs == 0 || id.num_inputs > MAX_INTERLEAVE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "Converter inputs must be in 1..={}, got {}",
                MAX_INTERLEAVE, id.num_inputs
            ),
        ));
    }
    if !scalar.is_finite() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Scale factor must be finite, got {}", scalar),
        ));
    }

    let gain = match id.input_format {
        CpuFormat::Fc64 | CpuFormat::Fc32 => scalar,
        CpuFormat::Sc16 => scalar / 32767.0,
    };

    Ok(Arc::new(ItemConverter {
        id: *id,
        scalar,
        gain,
    }))
}

struct ItemConverter {
    id: ConvertId,
    scalar: f64,
    gain: f64,
}

#[inline]
fn read_sample(format: CpuFormat, src: &[u8], index: usize) -> (f64, f64) {
    let off = index * format.bytes_per_item();
    match format {
        CpuFormat::Fc64 => {
            let mut re = [0u8; 8];
            let mut im = [0u8; 8];
            re.copy_from_slice(&src[off..off + 8]);
            im.copy_from_slice(&src[off + 8..off + 16]);
            (f64::from_ne_bytes(re), f64::from_ne_bytes(im))
        }
        CpuFormat::Fc32 => {
            let mut re = [0u8; 4];
            let mut im = [0u8; 4];
            re.copy_from_slice(&src[off..off + 4]);
            im.copy_from_slice(&src[off + 4..off + 8]);
            (f32::from_ne_bytes(re) as f64, f32::from_ne_bytes(im) as f64)
        }
        CpuFormat::Sc16 => {
            let re = i16::from_ne_bytes([src[off], src[off + 1]]);
            let im = i16::from_ne_bytes([src[off + 2], src[off + 3]]);
            (re as f64, im as f64)
        }
    }
}

// `as` saturates out-of-range floats, so rounding is the only work left
#[inline]
fn to_i16(x: f64) -> u32 {
    (x.round() as i16) as u16 as u32
}

#[inline]
fn to_i8(x: f64) -> u32 {
    (x.round() as i8) as u8 as u32
}

impl Converter for ItemConverter {
    fn convert(&self, inputs: &[&[u8]], output: &mut [u32], nsamps: usize) {
        let fmt = self.id.input_format;
        let order = self.id.output_format.byte_order();
        let g = self.gain;
        let num_inputs = inputs.len();

        match self.id.output_format {
            OtwFormat::Sc16Item32Le | OtwFormat::Sc16Item32Be => {
                // one complex sample per word, I in the upper half
                let mut w = 0;
                for i in 0..nsamps {
                    for input in inputs {
                        let (re, im) = read_sample(fmt, input, i);
                        output[w] = order.encode((to_i16(re * g) << 16) | to_i16(im * g));
                        w += 1;
                    }
                }
            }
            OtwFormat::Sc8Item32Le | OtwFormat::Sc8Item32Be => {
                // two complex samples per word, earlier sample in the upper half
                let total = nsamps * num_inputs;
                let words = (total + 1) / 2;
                for t in 0..total {
                    let (re, im) = read_sample(fmt, inputs[t % num_inputs], t / num_inputs);
                    let half = (to_i8(re * g) << 8) | to_i8(im * g);
                    if t % 2 == 0 {
                        output[t / 2] = half << 16;
                    } else {
                        output[t / 2] |= half;
                    }
                }
                for word in &mut output[..words] {
                    *word = order.encode(*word);
                }
            }
        }
    }

    fn id(&self) -> ConvertId {
        self.id
    }

    fn scalar(&self) -> f64 {
        self.scalar
    }
}
