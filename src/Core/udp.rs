use crate::Core::alloc::{FramePool, SendBuffer};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

/// Default number of in-flight send frames per transport.
pub const DEFAULT_NUM_FRAMES: usize = 32;

/// Default send frame size: a 9000 byte jumbo frame.
pub const DEFAULT_FRAME_SIZE: usize = 9000;

/// A connected UDP socket paired with a pool of send frames.
///
/// This is the buffer provider a channel binds with
/// `set_xport_chan_get_buff`; the batcher groups frames by this socket.
pub struct UdpSendTransport {
    socket: UdpSocket,
    pool: FramePool,
}

impl UdpSendTransport {
    /// Bind `local`, connect to `remote` and pre-allocate `num_frames` frames.
    pub fn connect(
        local: SocketAddr,
        remote: SocketAddr,
        frame_size: usize,
        num_frames: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(local)?;
        socket.connect(remote).map_err(|e| {
            io::Error::new(
                e.kind(),
                format!("Failed to connect transport to {}: {}", remote, e),
            )
        })?;
        Self::from_socket(socket, frame_size, num_frames)
    }

    /// Wrap an already connected socket.
    pub fn from_socket(socket: UdpSocket, frame_size: usize, num_frames: usize) -> io::Result<Self> {
        let pool = FramePool::new(socket.as_raw_fd(), frame_size, num_frames)?;
        Ok(Self { socket, pool })
    }

    /// Acquire a send frame, waiting up to `timeout`.
    pub fn get_send_buff(&self, timeout: Duration) -> Option<SendBuffer> {
        self.pool.get_buff(timeout)
    }

    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}
