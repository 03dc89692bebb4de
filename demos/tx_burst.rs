// In demos/tx_burst.rs
//
// Transmit timed tone bursts on N loopback UDP channels until Ctrl+C.
//
// cargo run --example tx_burst -- <num_channels> <samples_per_burst> [--auto-exit]
use sph_transmit::Core::UdpSendTransport;
use sph_transmit::SPH::Structs::{TimeSpec, TxMetadata};
use sph_transmit::SPH::{StreamerBuilder, TxStreamer};
use std::env;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const SAMP_RATE: f64 = 1e6;
const TONE_HZ: f64 = 10e3;

fn tone(nsamps: usize) -> Vec<u8> {
    (0..nsamps)
        .flat_map(|i| {
            let phase = 2.0 * std::f64::consts::PI * TONE_HZ * i as f64 / SAMP_RATE;
            let re = (0.7 * phase.cos()) as f32;
            let im = (0.7 * phase.sin()) as f32;
            re.to_ne_bytes().into_iter().chain(im.to_ne_bytes())
        })
        .collect()
}

fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <num_channels> <samples_per_burst> [--auto-exit]", args[0]);
        std::process::exit(1);
    }
    let num_channels: usize = args[1].parse().expect("Invalid number of channels");
    let burst_len: usize = args[2].parse().expect("Invalid burst length");
    let auto_exit = args.get(3).map(|s| s == "--auto-exit").unwrap_or(false);

    // one sink per channel standing in for the radio
    let sinks: Vec<UdpSocket> = (0..num_channels)
        .map(|_| UdpSocket::bind("127.0.0.1:0"))
        .collect::<std::io::Result<_>>()?;
    let transports: Vec<Arc<UdpSendTransport>> = sinks
        .iter()
        .map(|sink| {
            UdpSendTransport::connect("127.0.0.1:0".parse().unwrap(), sink.local_addr()?, 9000, 64)
                .map(Arc::new)
        })
        .collect::<std::io::Result<_>>()?;

    let mut streamer = StreamerBuilder::new()
        .with_transports(&transports)
        .with_samp_rate(SAMP_RATE)
        .with_max_samples_per_packet(2000)
        .build()?;
    for ch in 0..num_channels {
        streamer.handler_mut().set_xport_chan_sid(ch, true, 0x1000 + ch as u32)?;
    }
    println!(
        "tx_burst: {} channels, {} workers, {} samples per burst",
        streamer.get_num_channels(),
        streamer.handler().num_workers(),
        burst_len
    );

    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_for_handler = Arc::clone(&keep_running);
    ctrlc::set_handler(move || {
        keep_running_for_handler.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl+C handler");

    let samples = tone(burst_len);
    let buffs: Vec<&[u8]> = vec![&samples[..]; num_channels];
    let timeout = Duration::from_millis(100);
    let start = Instant::now();
    let mut bursts = 0u64;

    while keep_running.load(Ordering::SeqCst) {
        // prime the burst time, then send the data and close the burst
        let at = TimeSpec::from_secs(start.elapsed().as_secs_f64() + 0.01);
        streamer.send(&buffs, 0, &TxMetadata::burst_at(at), timeout)?;
        let sent = streamer.send(&buffs, burst_len, &TxMetadata::default(), timeout)?;
        streamer.send(&buffs, 0, &TxMetadata::end_of_burst(), timeout)?;
        if sent < burst_len {
            eprintln!("Burst {} truncated: {} of {} samples", bursts, sent, burst_len);
        }

        bursts += 1;
        if bursts % 100 == 0 {
            println!("Sent {} bursts, stats {:?}", bursts, streamer.handler().stats());
        }
        if auto_exit && bursts >= 1000 {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    let elapsed = start.elapsed();
    let stats = streamer.handler().stats();
    println!("tx_burst: {} bursts in {:.2?}", bursts, elapsed);
    println!(
        "tx_burst: {} packets, {} transmit calls, {} failures",
        stats.packets, stats.transmit_calls, stats.transmit_failures
    );
    Ok(())
}
