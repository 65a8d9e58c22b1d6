// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! FEC Rebuild Benchmark
//!
//! Measures the row/column XOR-parity filter's steady-state cost:
//! - Sender-side `feed_source` + `pack_control_packet` framing overhead
//! - Receiver-side matrix fill-in with no loss (no rebuild triggered)
//! - Receiver-side single-packet rebuild once a row's parity has arrived
//!
//! Column widths are varied to show how XOR span length affects rebuild
//! cost; no socket I/O is involved.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use rudt::{FecReceiver, FecSender, FilterConfig};
use std::hint::black_box as bb;

const PAYLOAD_CAP: usize = 1316;

/// Benchmark sender-side `feed_source` + `pack_control_packet` over one
/// full row, for a range of column widths.
fn bench_sender_row_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_sender_row_framing");

    for cols in [4usize, 8, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(cols), &cols, |b, &cols| {
            let cfg = FilterConfig::parse(&format!("fec,cols:{cols}")).unwrap();
            let payload = vec![0x5Au8; PAYLOAD_CAP];
            b.iter(|| {
                let sender = FecSender::new(cfg, PAYLOAD_CAP, 1000);
                for i in 0..cols {
                    sender.feed_source(1000 + i as u32, bb(&payload), PAYLOAD_CAP as u16, 0, i as u32);
                }
                bb(sender.pack_control_packet().unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark receiver-side fill-in of a complete row (no loss, so no
/// rebuild runs) across column widths.
fn bench_receiver_no_loss(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_receiver_fill_no_loss");

    for cols in [4usize, 8, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(cols), &cols, |b, &cols| {
            let cfg = FilterConfig::parse(&format!("fec,cols:{cols}")).unwrap();
            let payload = vec![0x5Au8; PAYLOAD_CAP];
            let sender = FecSender::new(cfg, PAYLOAD_CAP, 1000);
            for i in 0..cols {
                sender.feed_source(1000 + i as u32, &payload, PAYLOAD_CAP as u16, 0, i as u32);
            }
            let ctrl = sender.pack_control_packet().unwrap();

            b.iter(|| {
                let recv = FecReceiver::new(cfg, PAYLOAD_CAP, 1000);
                for i in 0..cols {
                    recv.hang_horizontal(1000 + i as u32, Some(bb(&payload)), None, PAYLOAD_CAP as u16, 0, i as u32, 10_000);
                }
                recv.hang_horizontal(1000, None, Some(bb(&ctrl)), 0, 0, 0, 10_000);
                assert!(recv.take_rebuilt().is_empty());
            });
        });
    }

    group.finish();
}

/// Benchmark the rebuild path itself: one packet dropped per row, parity
/// arrives last and triggers XOR reconstruction.
fn bench_receiver_single_loss_rebuild(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_receiver_single_loss_rebuild");

    for cols in [4usize, 8, 16, 32] {
        group.bench_with_input(BenchmarkId::from_parameter(cols), &cols, |b, &cols| {
            let cfg = FilterConfig::parse(&format!("fec,cols:{cols}")).unwrap();
            let payload = vec![0x5Au8; PAYLOAD_CAP];
            let sender = FecSender::new(cfg, PAYLOAD_CAP, 1000);
            for i in 0..cols {
                sender.feed_source(1000 + i as u32, &payload, PAYLOAD_CAP as u16, 0, i as u32);
            }
            let ctrl = sender.pack_control_packet().unwrap();
            let lost_member = cols / 2;

            b.iter(|| {
                let recv = FecReceiver::new(cfg, PAYLOAD_CAP, 1000);
                for i in 0..cols {
                    if i == lost_member {
                        continue;
                    }
                    recv.hang_horizontal(1000 + i as u32, Some(bb(&payload)), None, PAYLOAD_CAP as u16, 0, i as u32, 10_000);
                }
                recv.hang_horizontal(1000, None, Some(bb(&ctrl)), 0, 0, 0, 10_000);
                bb(recv.take_rebuilt());
            });
        });
    }

    group.finish();
}

criterion_group!(
    fec_benches,
    bench_sender_row_framing,
    bench_receiver_no_loss,
    bench_receiver_single_loss_rebuild
);
criterion_main!(fec_benches);
