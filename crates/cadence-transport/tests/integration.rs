//! # Integration tests: Sender → UDP loopback → Receiver
//!
//! Full pipeline over real sockets on 127.0.0.1, optionally through the
//! loss proxy. The sender writes a ramp signal; the receiver reads it back
//! in frames, skipping the silent lead-in, and compares sample by sample.

use std::net::IpAddr;
use std::thread;
use std::time::{Duration, Instant};

use cadence_transport::pool::{BufferPool, PacketPool};
use cadence_transport::{
    Address, Context, ContextConfig, Error, Flags, LifecycleState, LossModel, LossyProxy,
    Receiver, Role, Sender, SessionConfig,
};
use tracing_subscriber::EnvFilter;

const SOURCE_PACKETS: usize = 10;
const REPAIR_PACKETS: usize = 5;
const TOTAL_SAMPLES: usize = 5000;
const FRAME_SAMPLES: usize = 100;

// ─── Helpers ────────────────────────────────────────────────────────────────

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

fn localhost() -> IpAddr {
    IpAddr::from([127, 0, 0, 1])
}

fn loopback() -> Address {
    Address::parse("127.0.0.1:0").unwrap()
}

fn session(n_repair: usize) -> SessionConfig {
    SessionConfig {
        samples_per_packet: 50,
        channels: 2,
        n_source_packets: SOURCE_PACKETS,
        n_repair_packets: n_repair,
        latency: 2000,
        timeout: 30_000,
        flags: Flags {
            disable_interleaver: true,
            disable_resampler: true,
            enable_timer: true,
        },
        ..SessionConfig::default()
    }
}

/// `-1 + step, -1 + 2 * step, ...` with `step = 1 / 32768`, wrapping before 1.
fn ramp(len: usize) -> Vec<f32> {
    let step = 1.0f32 / 32768.0;
    let mut value = -1.0 + step;
    (0..len)
        .map(|_| {
            let out = value;
            value += step;
            if value >= 1.0 {
                value = -1.0 + step;
            }
            out
        })
        .collect()
}

fn is_zero(sample: f32) -> bool {
    (sample as f64).abs() < 1e-9
}

fn start_receiver(ctx: &Context, config: SessionConfig) -> Receiver {
    let receiver = Receiver::new(ctx, config).unwrap();
    receiver.bind(Role::Source, loopback()).unwrap();
    receiver.bind(Role::Repair, loopback()).unwrap();
    receiver.start().unwrap();
    receiver
}

fn start_sender(ctx: &Context, config: SessionConfig, source: Address, repair: Address) -> Sender {
    let sender = Sender::new(ctx, config).unwrap();
    sender.bind(loopback()).unwrap();
    sender.connect(Role::Source, source).unwrap();
    sender.connect(Role::Repair, repair).unwrap();
    sender.start().unwrap();
    sender
}

fn write_all(sender: &Sender, samples: &[f32]) {
    for chunk in samples.chunks(FRAME_SAMPLES) {
        assert_eq!(sender.write(chunk).unwrap(), chunk.len());
    }
}

/// How the received stream compared with what was sent.
#[derive(Debug, PartialEq)]
enum Comparison {
    /// Every sample matched and silence followed.
    Exact,
    /// First differing sample after the lead-in.
    Mismatch { at: usize },
}

/// Read frames until the expected stream has been seen in full or a sample
/// differs. Leading silence is skipped.
fn compare_stream(receiver: &Receiver, expected: &[f32]) -> Comparison {
    let mut frame = vec![0.0f32; FRAME_SAMPLES];
    let mut matched = 0;
    let mut seeking = true;
    let mut skipped = 0;
    loop {
        assert_eq!(receiver.read(&mut frame).unwrap(), FRAME_SAMPLES);
        let mut start = 0;
        if seeking {
            start = frame.iter().take_while(|&&s| is_zero(s)).count();
            skipped += start;
            assert!(skipped < 50 * expected.len(), "stream never started");
            if start == frame.len() {
                continue;
            }
            seeking = false;
        }
        for &sample in &frame[start..] {
            if matched == expected.len() {
                assert!(is_zero(sample), "trailing sample {sample} is not silence");
                return Comparison::Exact;
            }
            if !is_zero(expected[matched] - sample) {
                return Comparison::Mismatch { at: matched };
            }
            matched += 1;
        }
    }
}

// ─── Scenarios ──────────────────────────────────────────────────────────────

#[test]
fn scenario_a_lossless_round_trip() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let samples = ramp(TOTAL_SAMPLES);

    let receiver = start_receiver(&ctx, session(REPAIR_PACKETS));
    let sender = start_sender(
        &ctx,
        session(REPAIR_PACKETS),
        receiver.local_addr(Role::Source).unwrap(),
        receiver.local_addr(Role::Repair).unwrap(),
    );

    let outcome = thread::scope(|s| {
        s.spawn(|| write_all(&sender, &samples));
        compare_stream(&receiver, &samples)
    });
    assert_eq!(outcome, Comparison::Exact);

    let stats = receiver.stats();
    assert_eq!(stats.blocks_lost, 0);
    assert_eq!(stats.fec_restored, 0);
    assert_eq!(
        sender.stats().source_packets_sent,
        (TOTAL_SAMPLES / 100) as u64
    );

    sender.stop().unwrap();
    receiver.stop().unwrap();
}

#[test]
fn scenario_b_losses_repaired_by_fec() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let samples = ramp(TOTAL_SAMPLES);

    let receiver = start_receiver(&ctx, session(REPAIR_PACKETS));
    let proxy = LossyProxy::new(
        ctx.transceiver(),
        localhost(),
        receiver.local_addr(Role::Source).unwrap(),
        receiver.local_addr(Role::Repair).unwrap(),
        LossModel::one_per_block(SOURCE_PACKETS + REPAIR_PACKETS),
    )
    .unwrap();
    let sender = start_sender(
        &ctx,
        session(REPAIR_PACKETS),
        proxy.source_addr(),
        proxy.repair_addr(),
    );

    let outcome = thread::scope(|s| {
        s.spawn(|| write_all(&sender, &samples));
        compare_stream(&receiver, &samples)
    });
    assert_eq!(outcome, Comparison::Exact);

    assert!(proxy.stats().dropped >= 1);
    let stats = receiver.stats();
    assert!(stats.fec_restored >= 1, "{stats:?}");
    assert_eq!(stats.blocks_lost, 0);

    sender.stop().unwrap();
    proxy.stop();
    receiver.stop().unwrap();
}

#[test]
fn scenario_c_losses_without_fec_corrupt_output() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let samples = ramp(TOTAL_SAMPLES);

    let receiver = start_receiver(&ctx, session(0));
    let proxy = LossyProxy::new(
        ctx.transceiver(),
        localhost(),
        receiver.local_addr(Role::Source).unwrap(),
        receiver.local_addr(Role::Repair).unwrap(),
        LossModel::one_per_block(SOURCE_PACKETS + REPAIR_PACKETS),
    )
    .unwrap();
    let sender = start_sender(&ctx, session(0), proxy.source_addr(), proxy.repair_addr());

    let outcome = thread::scope(|s| {
        s.spawn(|| write_all(&sender, &samples));
        compare_stream(&receiver, &samples)
    });
    assert!(
        matches!(outcome, Comparison::Mismatch { .. }),
        "lossy stream without repair matched: {outcome:?}"
    );
    assert!(receiver.stats().blocks_lost >= 1);
    assert_eq!(sender.stats().repair_packets_sent, 0);

    sender.stop().unwrap();
    proxy.stop();
    receiver.stop().unwrap();
}

// ─── Resources and lifecycle ────────────────────────────────────────────────

#[test]
fn pool_exhaustion_is_reported_not_blocking() {
    let pool = PacketPool::new(2, BufferPool::new(2, 64));
    let a = pool.acquire(Role::Source).unwrap();
    let _b = pool.acquire(Role::Repair).unwrap();
    assert!(matches!(
        pool.acquire(Role::Source),
        Err(Error::ResourceExhausted(_))
    ));
    drop(a);
    assert!(pool.acquire(Role::Source).is_ok());
}

#[test]
fn stop_is_idempotent() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let receiver = start_receiver(&ctx, session(REPAIR_PACKETS));
    let sender = start_sender(
        &ctx,
        session(REPAIR_PACKETS),
        receiver.local_addr(Role::Source).unwrap(),
        receiver.local_addr(Role::Repair).unwrap(),
    );
    sender.write(&ramp(150)).unwrap();

    sender.stop().unwrap();
    sender.stop().unwrap();
    receiver.stop().unwrap();
    receiver.stop().unwrap();
    assert_eq!(sender.state(), LifecycleState::Stopped);
    assert_eq!(receiver.state(), LifecycleState::Stopped);

    assert!(matches!(sender.write(&[0.0; 4]), Err(Error::Closed)));
    let mut out = [0.0f32; 4];
    assert!(matches!(receiver.read(&mut out), Err(Error::Closed)));
    assert!(matches!(receiver.check_stream(), Err(Error::Closed)));

    // Stop-time flush completes the block: 2 packets written, 8 padded.
    let stats = sender.stats();
    assert_eq!(stats.source_packets_sent, SOURCE_PACKETS as u64);
    assert_eq!(stats.padding_packets, 8);
    assert_eq!(stats.repair_packets_sent, REPAIR_PACKETS as u64);
    drop(sender);
    drop(receiver);
}

#[test]
fn stop_unblocks_pending_read() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let config = SessionConfig {
        timeout: 44_100 * 30,
        ..session(REPAIR_PACKETS)
    };
    let receiver = start_receiver(&ctx, config);

    let started = Instant::now();
    let result = thread::scope(|s| {
        let reader = s.spawn(|| {
            let mut frame = [0.0f32; FRAME_SAMPLES];
            receiver.read(&mut frame)
        });
        thread::sleep(Duration::from_millis(50));
        receiver.stop().unwrap();
        reader.join().unwrap()
    });
    assert!(matches!(result, Err(Error::Closed)));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn read_times_out_with_silence() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();
    let config = SessionConfig {
        timeout: 441,
        ..session(REPAIR_PACKETS)
    };
    let receiver = start_receiver(&ctx, config);
    let mut frame = [1.0f32; FRAME_SAMPLES];
    assert_eq!(receiver.read(&mut frame).unwrap(), FRAME_SAMPLES);
    assert!(frame.iter().all(|&s| s == 0.0));
    // Nothing has arrived yet: pre-roll, not a stall.
    assert_eq!(receiver.stats().underruns, 0);
    assert!(receiver.check_stream().is_ok());
}

#[test]
fn lifecycle_misuse_is_rejected() {
    init_tracing();
    let ctx = Context::new(ContextConfig::default()).unwrap();

    let receiver = Receiver::new(&ctx, session(REPAIR_PACKETS)).unwrap();
    let mut frame = [0.0f32; 4];
    assert!(matches!(
        receiver.read(&mut frame),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(receiver.start(), Err(Error::InvalidState { .. })));
    let addr = receiver.bind(Role::Source, loopback()).unwrap();
    assert!(matches!(
        receiver.bind(Role::Source, loopback()),
        Err(Error::ConfigInvalid(_))
    ));

    let sender = Sender::new(&ctx, session(REPAIR_PACKETS)).unwrap();
    assert!(matches!(sender.write(&[0.0; 4]), Err(Error::InvalidState { .. })));
    sender.connect(Role::Source, addr).unwrap();
    // FEC is on but no repair destination.
    assert!(matches!(sender.start(), Err(Error::InvalidState { .. })));

    let bad = SessionConfig {
        samples_per_packet: 0,
        ..session(REPAIR_PACKETS)
    };
    assert!(matches!(
        Sender::new(&ctx, bad.clone()),
        Err(Error::ConfigInvalid(_))
    ));
    assert!(matches!(Receiver::new(&ctx, bad), Err(Error::ConfigInvalid(_))));
    assert!(matches!(
        Address::parse("not-an-address"),
        Err(Error::ConfigInvalid(_))
    ));
}
