#![allow(dead_code)]

use sph_transmit::Core::alloc::FramePool;
use sph_transmit::Packet::{PacketInfo, VrtPacker};
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

pub const FRAME_SIZE: usize = 8192;

/// A connected loopback socket pair with a frame pool on the sending side.
pub struct Loopback {
    pub tx: UdpSocket,
    pub rx: UdpSocket,
    pub pool: FramePool,
}

impl Loopback {
    pub fn new(num_frames: usize) -> Self {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
        tx.connect(rx.local_addr().unwrap()).unwrap();
        let pool = FramePool::new(tx.as_raw_fd(), FRAME_SIZE, num_frames).unwrap();
        Self { tx, rx, pool }
    }

    pub fn get_buff(&self) -> sph_transmit::SPH::GetBuffFn {
        let pool = self.pool.clone();
        Arc::new(move |timeout| pool.get_buff(timeout))
    }

    /// Receive `count` datagrams as raw wire words.
    pub fn recv_words(&self, count: usize) -> Vec<Vec<u32>> {
        (0..count).map(|_| self.recv_one()).collect()
    }

    pub fn recv_one(&self) -> Vec<u32> {
        let mut buf = [0u8; FRAME_SIZE];
        let n = self.rx.recv(&mut buf).expect("datagram expected");
        assert_eq!(n % 4, 0, "datagram not word aligned");
        buf[..n]
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// True when nothing arrives within a short window.
    pub fn is_quiet(&self) -> bool {
        self.rx
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = [0u8; FRAME_SIZE];
        let quiet = self.rx.recv(&mut buf).is_err();
        self.rx
            .set_read_timeout(Some(Duration::from_millis(500)))
            .unwrap();
        quiet
    }
}

pub fn unpack(words: &[u32]) -> PacketInfo {
    VrtPacker::big_endian().unpack(words).unwrap()
}

/// First fc32 -> sc16_item32_le payload sample of a packet as (I, Q).
pub fn first_sample(words: &[u32], info: &PacketInfo) -> (i16, i16) {
    let w = u32::from_le(words[info.num_header_words32]);
    ((w >> 16) as u16 as i16, w as u16 as i16)
}

/// `nsamps` fc32 samples of constant value.
pub fn fc32_const(nsamps: usize, re: f32, im: f32) -> Vec<u8> {
    (0..nsamps)
        .flat_map(|_| re.to_ne_bytes().into_iter().chain(im.to_ne_bytes()))
        .collect()
}

/// `nsamps` fc32 samples whose real part steps by `step` per sample.
pub fn fc32_ramp(nsamps: usize, step: f32) -> Vec<u8> {
    (0..nsamps)
        .flat_map(|i| {
            let re = i as f32 * step;
            re.to_ne_bytes().into_iter().chain(0f32.to_ne_bytes())
        })
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
