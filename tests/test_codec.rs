//! End-to-end encode/decode scenarios
//!
//! Payloads are generated deterministically per column so verification can
//! regenerate them instead of storing a million buffers.

use siamese::buffer::GrowingBuffer;
use siamese::galois::gf_add_mem;
use siamese::params::{Pcg, COLUMN_MASK};
use siamese::serializers::{
    write_count_footer, write_length, write_num_footer, write_recovery_metadata,
};
use siamese::{Decoder, Encoder, RecoveryMetadata, SiameseError};

const SEED: u64 = 1013;

fn payload_for(column: u32) -> Vec<u8> {
    let mut prng = Pcg::new(SEED, column as u64);
    let len = 2 + (prng.next() % 1199) as usize;
    (0..len).map(|_| prng.next() as u8).collect()
}

#[test]
fn burst_of_fifty_losses_recovers_everything() {
    let n: u32 = 1000;
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for column in 0..n {
        assert_eq!(encoder.add(&payload_for(column)).unwrap(), column);
    }

    // The first 50 originals never arrive
    for column in 50..n {
        decoder.add_original(column, &payload_for(column)).unwrap();
    }

    for _ in 0..255 {
        let recovery = encoder.encode().unwrap();
        decoder.add_recovery(&recovery).unwrap();
    }

    assert!(decoder.is_ready().unwrap());
    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 50);

    // Output is ordered by column and byte-identical
    for (i, packet) in recovered.iter().enumerate() {
        assert_eq!(packet.column, i as u32);
        assert_eq!(packet.data, payload_for(packet.column));
    }
    for column in 0..n {
        assert_eq!(decoder.get(column).unwrap(), payload_for(column).as_slice());
    }
    assert_eq!(decoder.stats().solve_successes, 1);
}

#[test]
fn long_burst_solves_once_recovery_covers_remaining_losses() {
    let n: u32 = 1000;
    let k = 255usize;
    let burst: u32 = 510;

    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for column in 0..n {
        encoder.add(&payload_for(column)).unwrap();
    }

    // Receives only the tail, then every recovery packet
    for column in burst..n {
        decoder.add_original(column, &payload_for(column)).unwrap();
    }
    for _ in 0..k {
        let recovery = encoder.encode().unwrap();
        decoder.add_recovery(&recovery).unwrap();
    }
    assert!(!decoder.is_ready().unwrap());

    // The burst now drains in original order; solving becomes possible
    // once the remaining losses fit the stored recovery count
    let mut solved_after = None;
    for column in 0..burst {
        match decoder.add_original(column, &payload_for(column)) {
            Ok(()) => {}
            Err(SiameseError::DuplicateData) => {
                assert!(solved_after.is_some(), "duplicate before any solve");
            }
            Err(other) => panic!("unexpected error: {other}"),
        }

        if solved_after.is_none() && decoder.is_ready().unwrap() {
            let recovered = decoder.decode().unwrap();
            assert!(!recovered.is_empty());
            solved_after = Some(column + 1);
        }
    }

    let solved_after = solved_after.expect("burst drain never became solvable");
    assert!(
        (255..=270).contains(&solved_after),
        "first solve after {} arrivals",
        solved_after
    );

    for column in 0..n {
        assert_eq!(decoder.get(column).unwrap(), payload_for(column).as_slice());
    }
}

#[test]
fn windowed_encoder_recovers_after_removal() {
    // Columns 0 and 1 are forgotten before the recovery is produced, so
    // its metadata starts at column 2 and any single loss among 2..=4 is
    // recoverable
    for lost in 2u32..=4 {
        let mut encoder = Encoder::new();
        for column in 0..3u32 {
            encoder.add(&payload_for(column)).unwrap();
        }
        encoder.remove_before(2).unwrap();
        for column in 3..5u32 {
            encoder.add(&payload_for(column)).unwrap();
        }

        let recovery = encoder.encode().unwrap();

        let mut decoder = Decoder::new();
        for column in 2..5u32 {
            if column != lost {
                decoder.add_original(column, &payload_for(column)).unwrap();
            }
        }
        decoder.add_recovery(&recovery).unwrap();

        let recovered = decoder.decode().unwrap();
        assert_eq!(recovered.len(), 1, "lost column {}", lost);
        assert_eq!(recovered[0].column, lost);
        assert_eq!(recovered[0].data, payload_for(lost));

        for column in 2..5u32 {
            assert_eq!(decoder.get(column).unwrap(), payload_for(column).as_slice());
        }
    }
}

#[test]
fn corrupt_recovery_footer_disables_the_decoder() {
    let mut decoder = Decoder::new();
    decoder.add_original(0, &[1, 2, 3]).unwrap();

    // A footer claiming more tap columns than sum columns cannot have been
    // produced by any encoder
    let mut bad = vec![0x11, 0x22, 0x33];
    bad.push(5); // row
    write_count_footer(6, &mut bad); // ldpc_count
    write_count_footer(3, &mut bad); // sum_count
    write_num_footer(0, &mut bad); // column_start

    assert_eq!(decoder.add_recovery(&bad), Err(SiameseError::Disabled));

    // Disabled is sticky across every entry point
    assert_eq!(decoder.add_original(1, &[4]), Err(SiameseError::Disabled));
    assert_eq!(decoder.add_recovery(&[0]), Err(SiameseError::Disabled));
    assert_eq!(decoder.get(0), Err(SiameseError::Disabled));
    assert_eq!(decoder.is_ready(), Err(SiameseError::Disabled));
    assert_eq!(decoder.decode(), Err(SiameseError::Disabled));
    let mut ack = [0u8; 32];
    assert_eq!(decoder.acknowledgement(&mut ack), Err(SiameseError::Disabled));
}

#[test]
fn replayed_recovery_changes_nothing() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for column in 0..20u32 {
        encoder.add(&payload_for(column)).unwrap();
        if column != 7 {
            decoder.add_original(column, &payload_for(column)).unwrap();
        }
    }

    let recovery = encoder.encode().unwrap();
    decoder.add_recovery(&recovery).unwrap();
    // Spare rows so the solve never hinges on a single coefficient draw
    for _ in 0..2 {
        let extra = encoder.encode().unwrap();
        decoder.add_recovery(&extra).unwrap();
    }
    let ready_before = decoder.is_ready().unwrap();

    decoder.add_recovery(&recovery).unwrap();
    assert_eq!(decoder.stats().duped_recovery, 1);
    assert_eq!(decoder.is_ready().unwrap(), ready_before);

    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].column, 7);
    assert_eq!(recovered[0].data, payload_for(7));
}

#[test]
fn single_packet_window_ships_the_original() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    encoder.add(&payload_for(0)).unwrap();
    let recovery = encoder.encode().unwrap();

    decoder.add_recovery(&recovery).unwrap();
    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].column, 0);
    assert_eq!(recovered[0].data, payload_for(0));
    assert_eq!(decoder.get(0).unwrap(), payload_for(0).as_slice());
}

#[test]
fn column_numbering_recovers_across_the_wrap() {
    // Hand-build a parity recovery over four columns straddling the 2^22
    // wrap and let the decoder reconstruct the wrapped column
    let columns = [COLUMN_MASK - 1, COLUMN_MASK, 0, 1];
    let lost = 0u32;

    let payloads: Vec<Vec<u8>> = columns.iter().map(|&c| payload_for(c % 16)).collect();
    let mut prefixed: Vec<Vec<u8>> = Vec::new();
    for payload in &payloads {
        let mut buf = Vec::new();
        write_length(payload.len() as u32, &mut buf);
        buf.extend_from_slice(payload);
        prefixed.push(buf);
    }

    let longest = prefixed.iter().map(Vec::len).max().unwrap();
    let mut parity = GrowingBuffer::zeroed(longest);
    for buf in &prefixed {
        gf_add_mem(parity.as_mut_slice(), buf);
    }

    let mut recovery = parity.into_vec();
    write_recovery_metadata(
        &RecoveryMetadata {
            column_start: COLUMN_MASK - 1,
            sum_count: 4,
            ldpc_count: 4,
            row: 0,
        },
        &mut recovery,
    );

    let mut decoder = Decoder::new();
    // Recovery first: the window anchors just below the wrap
    decoder.add_recovery(&recovery).unwrap();
    for (i, &column) in columns.iter().enumerate() {
        if column != lost {
            decoder.add_original(column, &payloads[i]).unwrap();
        }
    }

    let recovered = decoder.decode().unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].column, lost);
    assert_eq!(recovered[0].data, payload_for(lost % 16));

    assert_eq!(decoder.column_start(), COLUMN_MASK - 1);
    for &column in &columns {
        assert!(decoder.get(column).is_ok(), "column {} missing", column);
    }
}

#[test]
fn in_order_delivery_tracks_first_gap() {
    let mut decoder = Decoder::new();
    decoder.add_original(0, &[1]).unwrap();
    decoder.add_original(1, &[2]).unwrap();
    decoder.add_original(3, &[3]).unwrap();
    assert_eq!(decoder.next_expected_column(), 2);

    decoder.add_original(2, &[9]).unwrap();
    assert_eq!(decoder.next_expected_column(), 4);

    // Re-delivery is reported, not stored
    assert_eq!(
        decoder.add_original(2, &[9]),
        Err(SiameseError::DuplicateData)
    );
    assert_eq!(decoder.stats().duped_originals, 1);
}

#[test]
fn ack_roundtrip_drives_encoder_window() {
    let mut encoder = Encoder::new();
    let mut decoder = Decoder::new();

    for column in 0..12u32 {
        encoder.add(&payload_for(column)).unwrap();
        // Columns 4 and 5 are lost
        if column != 4 && column != 5 {
            decoder.add_original(column, &payload_for(column)).unwrap();
        }
    }

    let mut buf = [0u8; 64];
    let used = decoder.acknowledgement(&mut buf).unwrap();
    assert!(used > 0);

    let next_expected = encoder.acknowledge(&buf[..used]).unwrap();
    assert_eq!(next_expected, 4);
    assert_eq!(encoder.column_start(), 4);
    assert_eq!(encoder.window_count(), 8);

    // The retransmit cycle offers the NACKed columns first
    let first = encoder.retransmit().unwrap().column;
    assert_eq!(first, 4);
    let second = encoder.retransmit().unwrap().column;
    assert_eq!(second, 5);
}
