use sph_transmit::SPH::{partition, ConversionPool, SendPacketHandler};

#[test]
fn random_channel_counts_partition_exactly() {
    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for _ in 0..500 {
        let n = rng.usize(0..200);
        let t = rng.usize(1..32);
        let groups = partition(n, t);

        let mut covered = vec![0u8; n];
        for g in &groups {
            for ch in g.clone() {
                covered[ch] += 1;
            }
        }
        assert!(covered.iter().all(|c| *c == 1), "n={} t={}", n, t);
        assert!(groups.windows(2).all(|w| w[0].end == w[1].start));
    }
}

#[test]
fn worker_count_is_groups_minus_one() {
    let mut rng = fastrand::Rng::with_seed(42);
    for _ in 0..20 {
        let n = rng.usize(0..40);
        let t = rng.usize(1..10);
        let pool = ConversionPool::new(n, t).unwrap();
        let expected = if n <= t { 0 } else { (n + t - 1) / t - 1 };
        assert_eq!(pool.num_workers(), expected, "n={} t={}", n, t);
        assert_eq!(pool.groups().len(), expected + 1);
    }
}

#[test]
fn handler_rebuilds_workers_on_resize() {
    let mut handler = SendPacketHandler::new(8).unwrap();
    assert_eq!(handler.num_workers(), 0);
    handler.resize(9).unwrap();
    assert_eq!(handler.num_workers(), 1);
    handler.resize(33).unwrap();
    assert_eq!(handler.num_workers(), 4);
    handler.resize(1).unwrap();
    assert_eq!(handler.num_workers(), 0);
    assert_eq!(handler.get_num_channels(), 1);
}
