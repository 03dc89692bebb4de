pub mod alloc;
pub mod futex;
pub mod socket;
pub mod udp;

pub use alloc::{BufferState, FramePool, SendBuffer};
pub use udp::UdpSendTransport;
