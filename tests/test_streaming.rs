//! Long-running streaming scenario
//!
//! Drives an encoder/decoder pair the way a transport would: originals flow
//! continuously with random loss, a recovery packet rides every eighth
//! original (recovery packets get lost too), and the decoder acks every
//! second received packet with a simulated 40-packet round trip. The
//! decoder must reach the end of the stream in order, and the recovery
//! traffic must stay under two delivered packets per lost original.

use std::collections::VecDeque;

use siamese::params::Pcg;
use siamese::{Decoder, Encoder, SiameseError};

const SEED: u64 = 1013;

const LOSS_PERCENT: u32 = 10;
const RECOVERY_LOSS_PERCENT: u32 = 5;
const RECOVERY_INTERVAL: u32 = 8;
const ACK_EVERY_RECEIVES: u32 = 2;
const ACK_DELAY_PACKETS: u32 = 40;

fn payload_for(column: u32) -> Vec<u8> {
    let mut prng = Pcg::new(SEED, column as u64);
    let len = 2 + (prng.next() % 1199) as usize;
    (0..len).map(|_| prng.next() as u8).collect()
}

fn drain_decoder(decoder: &mut Decoder) {
    loop {
        match decoder.is_ready() {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => panic!("is_ready failed: {e}"),
        }
        match decoder.decode() {
            Ok(recovered) => {
                for packet in recovered {
                    assert_eq!(
                        packet.data,
                        payload_for(packet.column),
                        "recovered bytes diverge at column {}",
                        packet.column
                    );
                }
            }
            Err(SiameseError::NeedMoreData) => return,
            Err(e) => panic!("decode failed: {e}"),
        }
    }
}

fn run_stream(total_packets: u32) {
    // RUST_LOG=debug narrates admission, solves, and window removal
    let _ = env_logger::builder().is_test(true).try_init();

    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    let mut prng_loss = Pcg::new(SEED, 1);
    let mut prng_recovery_loss = Pcg::new(SEED, 2);

    let mut lost_originals = 0u64;
    let mut recoveries_delivered = 0u64;
    let mut receives_since_ack = 0u32;
    let mut pending_acks: VecDeque<(u32, Vec<u8>)> = VecDeque::new();

    for loop_index in 0..total_packets {
        // Acks from the simulated round trip come due
        while pending_acks
            .front()
            .is_some_and(|(due, _)| *due <= loop_index)
        {
            let (_, ack) = pending_acks.pop_front().unwrap();
            encoder.acknowledge(&ack).expect("stale ack rejected");
        }

        let payload = payload_for(loop_index);
        let column = encoder.add(&payload).expect("encoder window overflow");
        assert_eq!(column, loop_index);

        if prng_loss.next() % 100 < LOSS_PERCENT {
            lost_originals += 1;
        } else {
            match decoder.add_original(column, &payload) {
                Ok(()) | Err(SiameseError::DuplicateData) => {}
                Err(e) => panic!("add_original failed: {e}"),
            }

            receives_since_ack += 1;
            if receives_since_ack >= ACK_EVERY_RECEIVES {
                receives_since_ack = 0;
                let mut buf = [0u8; 1400];
                match decoder.acknowledgement(&mut buf) {
                    Ok(used) => {
                        pending_acks.push_back((loop_index + ACK_DELAY_PACKETS, buf[..used].to_vec()));
                    }
                    Err(SiameseError::NeedMoreData) => {}
                    Err(e) => panic!("acknowledgement failed: {e}"),
                }
            }
        }

        if loop_index > 0 && loop_index % RECOVERY_INTERVAL == 0 {
            match encoder.encode() {
                Ok(recovery) => {
                    if prng_recovery_loss.next() % 100 >= RECOVERY_LOSS_PERCENT {
                        decoder.add_recovery(&recovery).expect("add_recovery failed");
                        recoveries_delivered += 1;
                        drain_decoder(&mut decoder);
                    }
                }
                Err(SiameseError::NeedMoreData) => {}
                Err(e) => panic!("encode failed: {e}"),
            }
        }
    }

    // Tail flush: keep recovery flowing (losslessly now) until the decoder
    // has delivered the entire stream in order
    let mut flush_rounds = 0;
    while decoder.next_expected_column() < total_packets {
        flush_rounds += 1;
        assert!(flush_rounds < 10_000, "stream never finished draining");

        match encoder.encode() {
            Ok(recovery) => {
                decoder.add_recovery(&recovery).expect("add_recovery failed");
                recoveries_delivered += 1;
            }
            Err(SiameseError::NeedMoreData) => break,
            Err(e) => panic!("encode failed: {e}"),
        }
        drain_decoder(&mut decoder);
    }

    assert_eq!(decoder.next_expected_column(), total_packets);
    assert!(lost_originals > 0, "loss schedule produced no losses");

    // Under one extra recovery packet per lost original on average
    let overhead_limit = 2.0 * lost_originals as f64 + 64.0;
    assert!(
        (recoveries_delivered as f64) < overhead_limit,
        "recovery overhead too high: {} delivered for {} losses",
        recoveries_delivered,
        lost_originals
    );
}

#[test]
fn stream_fifty_thousand_packets() {
    run_stream(50_000);
}

#[test]
#[ignore = "long; run with --ignored for the full-scale pass"]
fn stream_one_million_packets() {
    run_stream(1_000_000);
}
