//! End-to-end convolution runs against the software reference.

use matconv_emu::config::AcceleratorConfig;
use matconv_emu::device::{
    AckPacket, CommandPacket, CommandType, HostMemory, MemoryInterface, PacketRegion, Status,
};
use matconv_emu::emu::{ConvolutionController, Engine};
use matconv_emu::host::golden;
use matconv_emu::host::{run_convolution, CommandIssuer, HostPort, Matrix, MemoryLayout};
use rand::rngs::StdRng;
use rand::SeedableRng;

const SOBEL: [u8; 9] = [0x01, 0x00, 0xFF, 0x02, 0x00, 0xFE, 0x01, 0x00, 0xFF];

fn stage(engine: &mut Engine, layout: &MemoryLayout, kernel: &[u8], subject: &[u8]) {
    engine
        .memory_mut()
        .write_bytes(layout.kernel_addr, kernel)
        .unwrap();
    engine
        .memory_mut()
        .write_bytes(layout.subject_addr, subject)
        .unwrap();
}

fn output(engine: &mut Engine, layout: &MemoryLayout) -> Vec<u8> {
    engine
        .memory_mut()
        .read_vec(layout.output_addr, layout.subject_bytes())
        .unwrap()
}

fn read_ack(engine: &mut Engine, tx_addr: u32) -> AckPacket {
    let mut packets = [0u64; 4];
    for (i, p) in packets.iter_mut().enumerate() {
        *p = engine
            .memory_mut()
            .read_word(tx_addr as u64 + 8 * i as u64)
            .unwrap();
    }
    AckPacket::from_packets(packets)
}

/// Run a random `rows` x `cols` subject through the emulator and compare
/// with the reference.
fn check_random(config: AcceleratorConfig, dim: usize, rows: u16, cols: u16, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut kernel = Matrix::zeros(dim, dim);
    let mut subject = Matrix::zeros(rows as usize, cols as usize);
    kernel.randomize(&mut rng);
    subject.randomize(&mut rng);

    let layout = MemoryLayout::new(rows, cols);
    let mut engine = Engine::new(config).unwrap();
    stage(&mut engine, &layout, kernel.as_bytes(), subject.as_bytes());

    let mut issuer = CommandIssuer::new(config.max_wait_cycles);
    let status = run_convolution(&mut engine, &mut issuer, &layout, dim as u16).unwrap();
    assert_eq!(status, Status::OK);

    let expected = golden::convolve(
        subject.as_bytes(),
        rows as usize,
        cols as usize,
        kernel.as_bytes(),
        dim,
    );
    let actual = output(&mut engine, &layout);
    let mismatches = golden::compare(&expected, &actual, cols as usize);
    assert!(
        mismatches.is_empty(),
        "{} mismatches for {}x{} kernel {}, first {:?}",
        mismatches.len(),
        rows,
        cols,
        dim,
        mismatches.first()
    );
}

#[test]
fn test_sobel_on_flat_subject_is_zero() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[0x10; 64]);
    // Poison the output so every byte must be written
    engine
        .memory_mut()
        .write_bytes(layout.output_addr, &[0xAA; 64])
        .unwrap();

    let mut issuer = CommandIssuer::default();
    let status = run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
    assert_eq!(status, Status::OK);
    assert_eq!(output(&mut engine, &layout), vec![0; 64]);
    assert_eq!(engine.stats().words_written, 8);
}

#[test]
fn test_sobel_vertical_edge() {
    let (rows, cols) = (8u16, 16u16);
    let subject: Vec<u8> = (0..rows as usize * cols as usize)
        .map(|i| if i % cols as usize >= 8 { 0x10 } else { 0 })
        .collect();

    let layout = MemoryLayout::new(rows, cols);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &subject);

    let mut issuer = CommandIssuer::default();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();

    let expected = golden::convolve(&subject, rows as usize, cols as usize, &SOBEL, 3);
    assert_eq!(output(&mut engine, &layout), expected);
    // The edge itself shows up left and right of column 8
    assert_ne!(expected[cols as usize + 7], 0);
    assert_ne!(expected[cols as usize + 8], 0);
}

#[test]
fn test_random_3x3() {
    check_random(AcceleratorConfig::default(), 3, 16, 24, 1);
}

#[test]
fn test_random_5x5() {
    check_random(AcceleratorConfig::default(), 5, 16, 24, 2);
}

#[test]
fn test_random_7x7_wide() {
    check_random(AcceleratorConfig::default(), 7, 12, 64, 3);
}

#[test]
fn test_single_packet_wide_subject() {
    check_random(AcceleratorConfig::default(), 3, 10, 8, 4);
}

#[test]
fn test_identity_1x1() {
    check_random(AcceleratorConfig::default(), 1, 4, 16, 5);
}

fn large_kernel_config() -> AcceleratorConfig {
    AcceleratorConfig {
        n_clusters: 1,
        cores_per_cluster: 8 * 15,
        max_kernel_dim: 15,
        ..AcceleratorConfig::default()
    }
}

#[test]
fn test_9x9_on_single_packet_width() {
    // Carried overlap is wider than the packet itself
    check_random(large_kernel_config(), 9, 12, 8, 30);
}

#[test]
fn test_13x13() {
    check_random(large_kernel_config(), 13, 16, 16, 31);
}

#[test]
fn test_15x15_largest_kernel() {
    check_random(large_kernel_config(), 15, 20, 32, 32);
}

#[test]
fn test_other_cluster_layouts() {
    for n_clusters in [1, 4, 8] {
        let config = AcceleratorConfig {
            n_clusters,
            cores_per_cluster: (8 / n_clusters) * 7,
            ..AcceleratorConfig::default()
        };
        check_random(config, 5, 12, 32, 10 + n_clusters as u64);
    }
}

#[test]
fn test_minimum_compute_ticks() {
    let config = AcceleratorConfig {
        compute_ticks_per_packet: 2,
        ..AcceleratorConfig::default()
    };
    check_random(config, 3, 9, 8, 6);
    check_random(config, 5, 9, 24, 7);
}

#[test]
fn test_reset_gives_identical_output() {
    let layout = MemoryLayout::new(8, 16);
    let mut rng = StdRng::seed_from_u64(21);
    let mut subject = Matrix::zeros(8, 16);
    subject.randomize(&mut rng);

    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, subject.as_bytes());

    let mut issuer = CommandIssuer::default();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
    let first = output(&mut engine, &layout);
    let first_cycles = engine.total_cycles;

    engine.reset();
    engine
        .memory_mut()
        .write_bytes(layout.output_addr, &[0; 128])
        .unwrap();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();

    assert_eq!(output(&mut engine, &layout), first);
    assert_eq!(engine.total_cycles, first_cycles);
}

#[test]
fn test_corrupt_s_key_then_recovery() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[0x10; 64]);
    let tx = layout.ack_addr;

    let mut bad = CommandPacket::new(CommandType::Kernel, 3, 3, tx, 0, 1);
    bad.s_key = 0xCAFE_0000;
    bad.chksum = bad.expected_checksum();
    for (i, packet) in bad.to_packets().iter().enumerate() {
        engine
            .transmit(PacketRegion::Command.address(i as u64), *packet)
            .unwrap();
    }
    assert_eq!(engine.wait_for_interrupt(100).unwrap(), 0);

    let ack = read_ack(&mut engine, tx);
    assert_eq!(ack.status, Status::ERR_KEY);
    assert_eq!(ack.s_key, 0xCAFE_0000);
    assert!(ack.checksum_ok());

    // The accelerator is back in WAIT_SKEY and accepts a clean sequence
    let mut issuer = CommandIssuer::default();
    let status = run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
    assert_eq!(status, Status::OK);
    assert_eq!(output(&mut engine, &layout), vec![0; 64]);
}

#[test]
fn test_checksum_corruption_rejected() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    let tx = layout.ack_addr;

    let mut cmd = CommandPacket::new(CommandType::Kernel, 3, 3, tx, 0, 1);
    cmd.chksum ^= 0x8000_0000;
    for (i, packet) in cmd.to_packets().iter().enumerate() {
        engine
            .transmit(PacketRegion::Command.address(i as u64), *packet)
            .unwrap();
    }
    engine.wait_for_interrupt(100).unwrap();
    assert_eq!(read_ack(&mut engine, tx).status, Status::ERR_CHKSM);
    assert_eq!(engine.accel.clusters()[0].kernel_dim(), 0);
}

#[test]
fn test_unaligned_width_rejected() {
    let layout = MemoryLayout::new(8, 12);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[1; 96]);

    let mut issuer = CommandIssuer::default();
    let status = run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
    assert_eq!(status, Status::ERR_SIZE);
    assert_eq!(engine.stats().words_written, 0);
}

#[test]
fn test_oversized_kernel_rejected() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &[1; 81], &[1; 64]);

    let mut issuer = CommandIssuer::default();
    let status = run_convolution(&mut engine, &mut issuer, &layout, 9).unwrap();
    assert_eq!(status, Status::ERR_SIZE);
}

#[test]
fn test_output_outside_memory_reports_error() {
    let layout = MemoryLayout::new(8, 16);
    // Memory ends half-way through the output buffer
    let memory = HostMemory::with_limit(layout.output_addr + 64);
    let mut engine = Engine::with_memory(AcceleratorConfig::default(), memory).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[3; 128]);

    let mut issuer = CommandIssuer::default();
    let status = run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();
    assert_eq!(status, Status::ERR_OTHER);
    assert_eq!(engine.stats().words_written, 8);
}

#[test]
fn test_back_to_back_subjects_reuse_kernel() {
    let layout = MemoryLayout::new(8, 16);
    let mut rng = StdRng::seed_from_u64(99);
    let mut a = Matrix::zeros(8, 16);
    let mut b = Matrix::zeros(8, 16);
    a.randomize(&mut rng);
    b.randomize(&mut rng);

    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, a.as_bytes());
    let mut issuer = CommandIssuer::default();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();

    b.store(engine.memory_mut(), layout.subject_addr).unwrap();
    let status = issuer
        .send_cmd(
            &mut engine,
            CommandType::Subject,
            8,
            16,
            layout.ack_addr,
            layout.output_addr,
            layout.subject_addr,
        )
        .unwrap();
    assert_eq!(status, Status::OK);
    assert_eq!(issuer.last_cmd().unwrap().trans_id, 3);

    let expected = golden::convolve(b.as_bytes(), 8, 16, &SOBEL, 3);
    assert_eq!(output(&mut engine, &layout), expected);
}

#[test]
fn test_state_word_idle_after_run() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[0; 64]);

    let mut issuer = CommandIssuer::default();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();

    assert_eq!(engine.state_word(), 0);
    assert!(engine.accel.registers().status.ready);
    assert!(!engine.accel.registers().status.busy);
}

#[test]
fn test_region_traffic_and_ack_dump() {
    let layout = MemoryLayout::new(8, 8);
    let mut engine = Engine::new(AcceleratorConfig::default()).unwrap();
    layout.allocate(engine.memory_mut()).unwrap();
    stage(&mut engine, &layout, &SOBEL, &[0x20; 64]);

    let mut issuer = CommandIssuer::default();
    run_convolution(&mut engine, &mut issuer, &layout, 3).unwrap();

    let mem = engine.memory();
    // Eight output words, one per row
    assert_eq!(mem.region("output").unwrap().word_writes, 8);
    // Two acks per transaction, four words each
    assert_eq!(mem.region("ack").unwrap().word_writes, 2 * 2 * 4);
    assert!(mem.total_bytes_written() >= 9 + 64);

    // Last ack starts with s_key, little-endian
    let dump = mem.hexdump(layout.ack_addr as u64, 32);
    assert!(dump.starts_with(&format!("{:016x}: fe ca fe ca", layout.ack_addr)));
}
