//! Multi-channel transmit packet handling.
//!
//! Application sample buffers for N synchronized channels are converted to a
//! wire format, framed into VRT packets with a shared sequence counter and
//! handed to the sockets in one batched call per socket.

// Module naming follows project convention (SPH = Send Packet Handler)
#[allow(non_snake_case)]
pub mod SPH {
    pub mod batch;
    pub mod channel;
    pub mod handler;
    pub mod pool;
    pub mod streamer;
    pub mod Structs {
        pub mod Metadata_Structs;
        pub use Metadata_Structs::{AsyncEventCode, AsyncMetadata, TimeSpec, TxMetadata}; // re-export for stable path
    }

    pub use batch::{BatchStats, TransmissionBatch};
    pub use channel::{ChannelBinding, ChannelTable, GetBuffFn, PostSendFn};
    pub use handler::{AsyncFeedback, AsyncRecvFn, BatchPolicy, CpuSample, HandlerStats, SendPacketHandler};
    pub use pool::{partition, ConversionPool, DEFAULT_CHANNELS_PER_WORKER};
    pub use streamer::{SendPacketStreamer, StreamerBuilder, TxStreamer};
}

#[allow(non_snake_case)]
pub mod Core;

#[allow(non_snake_case)]
pub mod Convert;

#[allow(non_snake_case)]
pub mod Packet;

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
