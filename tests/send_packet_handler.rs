mod common;

use common::{fc32_const, fc32_ramp, first_sample, init_tracing, unpack, Loopback};
use sph_transmit::Convert::ConvertId;
use sph_transmit::SPH::Structs::{TimeSpec, TxMetadata};
use sph_transmit::SPH::{BatchPolicy, SendPacketHandler};
use std::io;
use std::net::UdpSocket;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_millis(100);

fn handler_on(rig: &Loopback, num_channels: usize) -> SendPacketHandler {
    let mut handler = SendPacketHandler::new(num_channels).unwrap();
    handler.set_converter(ConvertId::default()).unwrap();
    for ch in 0..num_channels {
        handler.set_xport_chan_get_buff(ch, rig.get_buff()).unwrap();
        handler.set_xport_chan_sid(ch, true, ch as u32).unwrap();
    }
    handler
}

#[test]
fn single_packet_per_channel_advances_sequence_once() {
    init_tracing();
    let rig = Loopback::new(16);
    let mut handler = handler_on(&rig, 4);

    let src: &[u8] = &fc32_const(100, 0.5, -0.5);
    let buffs = vec![src; 4];
    let sent = handler.send(&buffs, 100, &TxMetadata::default(), TIMEOUT).unwrap();

    assert_eq!(sent, 100);
    assert_eq!(handler.next_packet_seq(), 1);

    let packets = rig.recv_words(4);
    for (ch, words) in packets.iter().enumerate() {
        let info = unpack(words);
        assert_eq!(info.sid, ch as u32);
        assert_eq!(info.packet_count, 0);
        assert_eq!(info.num_payload_words32, 100);
        assert!(info.has_tlr && !info.has_tsf && !info.sob && !info.eob);
        assert_eq!(first_sample(words, &info), (16384, -16384));
    }
    assert!(rig.is_quiet());
    assert_eq!(rig.pool.available(), 16);
}

#[test]
fn oversized_send_is_fragmented() {
    let rig = Loopback::new(16);
    let mut handler = handler_on(&rig, 4);
    assert_eq!(handler.get_max_samples_per_packet(), 1000);

    let src: &[u8] = &fc32_ramp(2500, 1.0 / 4096.0);
    let buffs = vec![src; 4];
    let md = TxMetadata {
        start_of_burst: true,
        end_of_burst: true,
        has_time_spec: true,
        time_spec: TimeSpec::new(2, 0.5),
    };
    let sent = handler.send(&buffs, 2500, &md, TIMEOUT).unwrap();
    assert_eq!(sent, 2500);
    assert_eq!(handler.next_packet_seq(), 3);
    assert_eq!(handler.stats().packets, 3);

    let packets = rig.recv_words(12);
    let expected_len = [1000, 1000, 500];
    for (i, words) in packets.iter().enumerate() {
        let fragment = i / 4;
        let info = unpack(words);
        assert_eq!(info.sid, (i % 4) as u32, "channel order within a fragment");
        assert_eq!(info.packet_count, fragment as u64);
        assert_eq!(info.num_payload_words32, expected_len[fragment]);
        assert_eq!(info.sob, fragment == 0);
        assert_eq!(info.eob, fragment == 2);
        assert!(info.has_tsf);
        // timestamp is held constant across fragments
        assert_eq!(info.tsf, 250_000_000);
    }

    // the second fragment starts at sample 1000 of the source
    let info = unpack(&packets[4]);
    let (re, _) = first_sample(&packets[4], &info);
    assert_eq!(re, (32767.0 * 1000.0 / 4096.0f64).round() as i16);
}

#[test]
fn fragment_count_and_lengths_hold_for_random_sizes() {
    let rig = Loopback::new(8);
    let mut rng = fastrand::Rng::with_seed(0xf7a9);
    // exact multiples, one past the limit and single-sample packets
    let mut cases = vec![(6, 3), (7, 3), (1, 1), (12, 1), (1001, 1000), (2000, 1000)];
    for _ in 0..40 {
        let max = rng.usize(1..=16);
        let n = rng.usize(1..=64);
        cases.push((n, max));
    }

    let src: &[u8] = &fc32_const(2000, 0.0, 0.0);
    let md = TxMetadata {
        start_of_burst: true,
        end_of_burst: true,
        ..TxMetadata::default()
    };
    for (n, max) in cases {
        let mut handler = handler_on(&rig, 1);
        handler.set_max_samples_per_packet(max).unwrap();
        assert_eq!(handler.send(&[src], n, &md, TIMEOUT).unwrap(), n);

        let expected = (n - 1) / max + 1;
        assert_eq!(handler.next_packet_seq(), expected as u64, "n={} max={}", n, max);
        for (i, words) in rig.recv_words(expected).iter().enumerate() {
            let info = unpack(words);
            let last = i + 1 == expected;
            let len = if last { (n - 1) % max + 1 } else { max };
            assert_eq!(info.num_payload_words32, len, "n={} max={} packet {}", n, max, i);
            assert_eq!(info.packet_count, i as u64 % 16);
            assert_eq!(info.sob, i == 0, "n={} max={} packet {}", n, max, i);
            assert_eq!(info.eob, last, "n={} max={} packet {}", n, max, i);
        }
    }
    assert!(rig.is_quiet());
    assert_eq!(rig.pool.available(), 8);
}

#[test]
fn fragment_timestamps_can_advance() {
    let rig = Loopback::new(8);
    let mut handler = handler_on(&rig, 1);
    handler.set_fragment_time_advance(true);
    handler.set_samp_rate(1e6).unwrap();
    handler.set_tick_rate(100e6).unwrap();

    let src: &[u8] = &fc32_const(2500, 0.0, 0.0);
    let md = TxMetadata::burst_at(TimeSpec::new(1, 0.0));
    assert_eq!(handler.send(&[src], 2500, &md, TIMEOUT).unwrap(), 2500);

    let tsf: Vec<u64> = rig.recv_words(3).iter().map(|w| unpack(w).tsf).collect();
    assert_eq!(tsf, vec![100_000_000, 100_100_000, 100_200_000]);
}

#[test]
fn zero_sample_start_of_burst_is_cached() {
    let rig = Loopback::new(8);
    let mut handler = handler_on(&rig, 2);
    let src: &[u8] = &fc32_const(100, 0.25, 0.0);

    let md = TxMetadata::burst_at(TimeSpec::new(0, 0.001));
    assert_eq!(handler.send(&[src, src], 0, &md, TIMEOUT).unwrap(), 0);
    assert!(rig.is_quiet());
    assert!(handler.pending_metadata().is_some());
    assert_eq!(handler.next_packet_seq(), 0);

    let sent = handler.send(&[src, src], 100, &TxMetadata::default(), TIMEOUT).unwrap();
    assert_eq!(sent, 100);
    assert!(handler.pending_metadata().is_none());

    for words in rig.recv_words(2) {
        let info = unpack(&words);
        assert!(info.sob && !info.eob && info.has_tsf);
        assert_eq!(info.tsf, 100_000);
        assert_eq!(info.num_payload_words32, 100);
    }
}

#[test]
fn cached_metadata_matches_single_merged_call() {
    let src: &[u8] = &fc32_ramp(300, 1.0 / 512.0);
    let when = TimeSpec::new(5, 0.125);

    let cached_rig = Loopback::new(8);
    let mut cached = handler_on(&cached_rig, 2);
    cached.send(&[src, src], 0, &TxMetadata::burst_at(when), TIMEOUT).unwrap();
    let eob = TxMetadata::end_of_burst();
    cached.send(&[src, src], 300, &eob, TIMEOUT).unwrap();

    let merged_rig = Loopback::new(8);
    let mut merged = handler_on(&merged_rig, 2);
    let md = TxMetadata {
        end_of_burst: true,
        ..TxMetadata::burst_at(when)
    };
    merged.send(&[src, src], 300, &md, TIMEOUT).unwrap();

    assert_eq!(cached_rig.recv_words(2), merged_rig.recv_words(2));
}

#[test]
fn second_cached_start_of_burst_overwrites_first() {
    let rig = Loopback::new(8);
    let mut handler = handler_on(&rig, 1);
    let src: &[u8] = &fc32_const(10, 0.0, 0.0);

    handler.send(&[src], 0, &TxMetadata::burst_at(TimeSpec::new(1, 0.0)), TIMEOUT).unwrap();
    handler.send(&[src], 0, &TxMetadata::burst_at(TimeSpec::new(2, 0.0)), TIMEOUT).unwrap();
    assert_eq!(handler.pending_metadata().unwrap().time_spec, TimeSpec::new(2, 0.0));

    handler.send(&[src], 10, &TxMetadata::default(), TIMEOUT).unwrap();
    assert_eq!(unpack(&rig.recv_one()).tsf, 200_000_000);
}

#[test]
fn zero_sample_without_start_of_burst_sends_padded_packet() {
    let rig = Loopback::new(8);
    let mut handler = handler_on(&rig, 3);
    let empty: &[u8] = &[];

    let sent = handler
        .send(&[empty, empty, empty], 0, &TxMetadata::end_of_burst(), TIMEOUT)
        .unwrap();
    assert_eq!(sent, 0);
    assert_eq!(handler.next_packet_seq(), 1);

    for words in rig.recv_words(3) {
        let info = unpack(&words);
        assert!(info.eob && !info.sob);
        assert_eq!(info.num_payload_words32, 1);
        assert_eq!(words[info.num_header_words32], 0);
    }
    assert!(rig.is_quiet());
}

#[test]
fn all_channels_timing_out_sends_nothing() {
    let mut handler = SendPacketHandler::new(3).unwrap();
    handler.set_converter(ConvertId::default()).unwrap();
    for ch in 0..3 {
        handler.set_xport_chan_get_buff(ch, Arc::new(|_| None)).unwrap();
    }

    let src: &[u8] = &fc32_const(10, 0.0, 0.0);
    let sent = handler
        .send(&[src, src, src], 10, &TxMetadata::default(), Duration::ZERO)
        .unwrap();
    assert_eq!(sent, 0);
    assert_eq!(handler.next_packet_seq(), 0);
    assert_eq!(handler.stats().acquisition_timeouts, 1);
}

#[test]
fn one_channel_timing_out_releases_the_others() {
    init_tracing();
    let rig = Loopback::new(4);
    let mut handler = handler_on(&rig, 2);
    handler.set_xport_chan_get_buff(1, Arc::new(|_| None)).unwrap();

    let src: &[u8] = &fc32_const(10, 0.0, 0.0);
    let sent = handler
        .send(&[src, src], 10, &TxMetadata::default(), Duration::ZERO)
        .unwrap();
    assert_eq!(sent, 0);
    assert_eq!(rig.pool.available(), 4);
    assert!(rig.is_quiet());
}

#[test]
fn timeout_mid_fragmentation_returns_partial_count() {
    let rig = Loopback::new(2);
    let mut handler = handler_on(&rig, 1);
    // buffers are held until the end of the send, so the third fragment starves
    handler.set_batch_policy(BatchPolicy::PerSend);
    handler.set_max_samples_per_packet(10).unwrap();

    let src: &[u8] = &fc32_const(35, 0.0, 0.0);
    let md = TxMetadata {
        end_of_burst: true,
        ..TxMetadata::default()
    };
    let sent = handler.send(&[src], 35, &md, Duration::from_millis(10)).unwrap();
    assert_eq!(sent, 20);
    assert_eq!(handler.next_packet_seq(), 2);
    assert_eq!(rig.pool.available(), 2);

    // no end of burst went out for the abandoned request
    for words in rig.recv_words(2) {
        assert!(!unpack(&words).eob);
    }
    assert!(rig.is_quiet());
}

#[test]
fn transmit_failure_still_counts_samples() {
    init_tracing();
    // bound but never connected, so every send fails
    let unconnected = UdpSocket::bind("127.0.0.1:0").unwrap();
    let pool = sph_transmit::Core::FramePool::new(unconnected.as_raw_fd(), 8192, 4).unwrap();

    let mut handler = SendPacketHandler::new(1).unwrap();
    handler.set_converter(ConvertId::default()).unwrap();
    let frames = pool.clone();
    handler
        .set_xport_chan_get_buff(0, Arc::new(move |t| frames.get_buff(t)))
        .unwrap();

    let src: &[u8] = &fc32_const(50, 0.0, 0.0);
    let sent = handler.send(&[src], 50, &TxMetadata::default(), TIMEOUT).unwrap();
    assert_eq!(sent, 50);
    assert_eq!(handler.next_packet_seq(), 1);

    let stats = handler.stats();
    assert_eq!(stats.transmit_failures, 1);
    assert_eq!(stats.packets_dropped, 1);
    assert_eq!(pool.available(), 4);
}

#[test]
fn channels_on_different_sockets_get_separate_calls() {
    let a = Loopback::new(4);
    let b = Loopback::new(4);
    let mut handler = SendPacketHandler::new(4).unwrap();
    handler.set_converter(ConvertId::default()).unwrap();
    for ch in 0..4 {
        let rig = if ch % 2 == 0 { &a } else { &b };
        handler.set_xport_chan_get_buff(ch, rig.get_buff()).unwrap();
        handler.set_xport_chan_sid(ch, true, ch as u32).unwrap();
    }

    let src: &[u8] = &fc32_const(20, 0.0, 0.0);
    handler
        .send(&[src, src, src, src], 20, &TxMetadata::default(), TIMEOUT)
        .unwrap();
    assert_eq!(handler.stats().transmit_calls, 2);

    let sids_a: Vec<u32> = a.recv_words(2).iter().map(|w| unpack(w).sid).collect();
    let sids_b: Vec<u32> = b.recv_words(2).iter().map(|w| unpack(w).sid).collect();
    assert_eq!(sids_a, vec![0, 2]);
    assert_eq!(sids_b, vec![1, 3]);
}

#[test]
fn worker_threads_convert_their_own_channels() {
    init_tracing();
    let rig = Loopback::new(64);
    let mut handler = handler_on(&rig, 20);
    assert_eq!(handler.num_workers(), 2);

    let commits = Arc::new(AtomicUsize::new(0));
    for ch in 0..20 {
        let commits = Arc::clone(&commits);
        handler
            .set_xport_chan_post_send_cb(ch, Arc::new(move || {
                commits.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
    }

    let sources: Vec<Vec<u8>> = (0..20)
        .map(|ch| fc32_const(64, ch as f32 / 100.0, 0.0))
        .collect();
    let buffs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();

    for round in 0..3u64 {
        let sent = handler.send(&buffs, 64, &TxMetadata::default(), TIMEOUT).unwrap();
        assert_eq!(sent, 64);

        let packets = rig.recv_words(20);
        for (ch, words) in packets.iter().enumerate() {
            let info = unpack(words);
            assert_eq!(info.sid, ch as u32);
            assert_eq!(info.packet_count, round);
            let expected = (32767.0 * ch as f64 / 100.0).round() as i16;
            let (re, _) = first_sample(words, &info);
            assert!((re - expected).abs() <= 1, "channel {} got {}", ch, re);
        }
    }
    assert_eq!(commits.load(Ordering::Relaxed), 60);
    assert_eq!(handler.next_packet_seq(), 3);
    assert_eq!(rig.pool.available(), 64);
}

#[test]
fn header_offset_reserves_leading_words() {
    let rig = Loopback::new(4);
    let mut handler = handler_on(&rig, 1);
    handler.set_vrt_packer(Arc::new(sph_transmit::Packet::VrtPacker::big_endian()), 2);
    handler.set_enable_trailer(false);

    let src: &[u8] = &fc32_const(8, 0.0, 0.0);
    handler.send(&[src], 8, &TxMetadata::default(), TIMEOUT).unwrap();

    let words = rig.recv_one();
    let info = unpack(&words[2..]);
    assert!(!info.has_tlr);
    assert_eq!(words.len(), 2 + info.num_packet_words32);
    assert_eq!(info.num_packet_words32, 2 + 8);
}

#[test]
fn misconfiguration_is_reported_at_the_call() {
    let mut handler = SendPacketHandler::new(2).unwrap();
    assert!(handler.set_xport_chan_sid(2, true, 1).is_err());
    assert!(handler.set_xport_chan_get_buff(7, Arc::new(|_| None)).is_err());

    let src: &[u8] = &fc32_const(1, 0.0, 0.0);
    assert!(handler
        .send(&[src, src], 1, &TxMetadata::default(), TIMEOUT)
        .is_err());

    handler.set_converter(ConvertId::default()).unwrap();
    handler.set_xport_chan_get_buff(0, Arc::new(|_| None)).unwrap();
    handler.set_xport_chan_get_buff(1, Arc::new(|_| None)).unwrap();
    // one buffer for two channels
    assert!(handler.send(&[src], 1, &TxMetadata::default(), TIMEOUT).is_err());
}

#[test]
fn panicking_worker_channel_fails_the_send_without_hanging() {
    init_tracing();
    let rig = Loopback::new(32);
    let mut handler = handler_on(&rig, 9);
    assert_eq!(handler.num_workers(), 1);

    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);
    handler
        .set_xport_chan_post_send_cb(8, Arc::new(move || {
            if flag.load(Ordering::Relaxed) {
                panic!("post send callback failed");
            }
        }))
        .unwrap();

    let src: &[u8] = &fc32_const(10, 0.0, 0.0);
    let buffs = vec![src; 9];
    for round in 0..2u64 {
        let err = handler
            .send(&buffs, 10, &TxMetadata::default(), TIMEOUT)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
        assert_eq!(handler.next_packet_seq(), round + 1);
        // the packet was queued before the callback ran
        assert_eq!(rig.recv_words(9).len(), 9);
    }

    failing.store(false, Ordering::Relaxed);
    assert_eq!(handler.send(&buffs, 10, &TxMetadata::default(), TIMEOUT).unwrap(), 10);
    for words in rig.recv_words(9) {
        assert_eq!(unpack(&words).packet_count, 2);
    }
    assert_eq!(handler.num_workers(), 1);
    assert_eq!(handler.stats().packets, 1);
    assert_eq!(rig.pool.available(), 32);
}

#[test]
fn undersized_frame_is_counted_as_dropped() {
    let rig = Loopback::new(1);
    let small = sph_transmit::Core::FramePool::new(rig.tx.as_raw_fd(), 64, 2).unwrap();
    let mut handler = SendPacketHandler::new(1).unwrap();
    handler.set_converter(ConvertId::default()).unwrap();
    let frames = small.clone();
    handler
        .set_xport_chan_get_buff(0, Arc::new(move |t| frames.get_buff(t)))
        .unwrap();

    let src: &[u8] = &fc32_const(100, 0.0, 0.0);
    assert_eq!(handler.send(&[src], 100, &TxMetadata::default(), TIMEOUT).unwrap(), 100);
    assert_eq!(handler.next_packet_seq(), 1);
    assert_eq!(handler.stats().packets_dropped, 1);
    assert_eq!(small.available(), 2);
    assert!(rig.is_quiet());
}

#[test]
fn time_before_epoch_is_rejected() {
    let rig = Loopback::new(4);
    let mut handler = handler_on(&rig, 1);
    let src: &[u8] = &fc32_const(10, 0.0, 0.0);
    let early = TxMetadata::burst_at(TimeSpec::new(-1, 0.5));

    let err = handler.send(&[src], 0, &early, TIMEOUT).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    assert!(handler.pending_metadata().is_none());
    assert!(handler.send(&[src], 10, &early, TIMEOUT).is_err());
    assert_eq!(handler.next_packet_seq(), 0);
    assert!(rig.is_quiet());

    // without a time spec the value is ignored
    let untimed = TxMetadata {
        has_time_spec: false,
        ..early
    };
    assert_eq!(handler.send(&[src], 10, &untimed, TIMEOUT).unwrap(), 10);
    assert!(!unpack(&rig.recv_one()).has_tsf);
}
