//! Streaming FEC encoder
//!
//! The encoder assigns each application payload a monotonically increasing
//! column number, keeps everything unacknowledged in a sliding window, and
//! produces recovery packets over the current window on demand. Each
//! recovery row costs O(lanes · payload) work regardless of how many
//! packets the window holds, because the heavy lifting was prepaid into the
//! per-lane running sums as packets were added.

mod window;

pub use window::EncoderWindow;

use log::{debug, trace};

use crate::buffer::GrowingBuffer;
use crate::error::{Result, SiameseError};
use crate::galois::{gf_add_mem, gf_muladd_mem};
use crate::packet::RecoveryMetadata;
use crate::params::{
    add_columns, is_column_delta_negative, row_opcode, row_value, subtract_columns, Pcg,
    COLUMN_LANE_COUNT, COLUMN_SUM_COUNT, PAIR_ADD_RATE, ROW_PERIOD,
};
#[cfg(feature = "cauchy")]
use crate::params::{cauchy_element, CAUCHY_MAX_COLUMNS, CAUCHY_MAX_ROWS, CAUCHY_THRESHOLD};
use crate::serializers::{read_loss_range, read_num, write_recovery_metadata};

/// Counters describing encoder activity
#[derive(Debug, Default, Clone)]
pub struct EncoderStats {
    pub originals_added: u64,
    pub original_bytes: u64,
    pub recovery_packets: u64,
    pub recovery_bytes: u64,
    pub acks_received: u64,
    pub ack_bytes: u64,
    pub retransmits: u64,
}

/// A stored original offered for retransmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOriginal<'a> {
    pub column: u32,
    pub payload: &'a [u8],
}

/// Streaming FEC encoder over a sliding window of originals
#[derive(Debug, Default)]
pub struct Encoder {
    window: EncoderWindow,
    /// Row counter for sum-based recovery rows
    next_row: u32,
    /// Row counter for small-window parity/Cauchy rows
    #[cfg(feature = "cauchy")]
    next_cauchy_row: u32,
    /// Cursor for the retransmit cycle, as a window element index
    next_retransmit: usize,
    emergency_disabled: bool,
    stats: EncoderStats,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one payload to the stream; returns its assigned column
    pub fn add(&mut self, payload: &[u8]) -> Result<u32> {
        if self.emergency_disabled {
            return Err(SiameseError::Disabled);
        }

        let column = self.window.add(payload)?;
        self.stats.originals_added += 1;
        self.stats.original_bytes += payload.len() as u64;
        Ok(column)
    }

    /// Forget every original strictly before `column`
    ///
    /// Idempotent; recovery packets produced afterwards no longer protect
    /// the removed columns.
    pub fn remove_before(&mut self, column: u32) -> Result<()> {
        if self.emergency_disabled {
            return Err(SiameseError::Disabled);
        }

        let delta = subtract_columns(column, self.window.column_start());
        let removed = if is_column_delta_negative(delta) {
            0
        } else {
            self.window.count().min(delta as usize)
        };
        self.window.remove_before(column)?;

        // Keep the retransmit cursor pointing at the same packet
        self.next_retransmit = self.next_retransmit.saturating_sub(removed);
        Ok(())
    }

    /// Caller-driven trimming for flows that never send recovery data
    ///
    /// Identical to [`remove_before`](Self::remove_before); exists so
    /// applications with an out-of-band progress signal have a named entry
    /// point for bounding encoder memory.
    pub fn trim_to(&mut self, column: u32) -> Result<()> {
        self.remove_before(column)
    }

    /// Produce one recovery packet over the current window
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        if self.emergency_disabled {
            return Err(SiameseError::Disabled);
        }

        let count = self.window.count();
        if count == 0 {
            return Err(SiameseError::NeedMoreData);
        }

        let packet = if count == 1 {
            self.encode_single()
        } else {
            self.encode_window(count)
        };

        self.stats.recovery_packets += 1;
        self.stats.recovery_bytes += packet.len() as u64;
        Ok(packet)
    }

    #[cfg(feature = "cauchy")]
    fn encode_window(&mut self, count: usize) -> Vec<u8> {
        if count <= CAUCHY_THRESHOLD {
            self.encode_cauchy()
        } else {
            self.encode_siamese()
        }
    }

    #[cfg(not(feature = "cauchy"))]
    fn encode_window(&mut self, _count: usize) -> Vec<u8> {
        self.encode_siamese()
    }

    /// One-packet window: ship the stored original under a short footer
    fn encode_single(&mut self) -> Vec<u8> {
        let slot = self.window.slot(0);
        let mut out = slot.packet.buffer.as_slice().to_vec();
        let metadata = RecoveryMetadata {
            column_start: slot.packet.column,
            sum_count: 1,
            ldpc_count: 1,
            row: 0,
        };
        write_recovery_metadata(&metadata, &mut out);
        trace!("encode: single column {}", slot.packet.column);
        out
    }

    /// Sum-based recovery row over the full window
    fn encode_siamese(&mut self) -> Vec<u8> {
        let count = self.window.count() as u32;
        let row = self.next_row;
        self.next_row = (self.next_row + 1) % ROW_PERIOD;

        let recovery_bytes = self.window.longest_buffer();
        let mut recovery = GrowingBuffer::zeroed(recovery_bytes);
        let mut product = GrowingBuffer::zeroed(recovery_bytes);

        // Dense part: mix the 24 running sums per the row opcode. Bits 0-2
        // land directly, bits 3-5 collect into the product buffer that gets
        // one RX-scaled fold at the end.
        for lane in 0..COLUMN_LANE_COUNT {
            let opcode = row_opcode(lane, row);
            for k in 0..COLUMN_SUM_COUNT {
                if opcode & (1 << k) != 0 {
                    gf_add_mem(recovery.as_mut_slice(), self.window.sum(lane, k).as_slice());
                }
                if opcode & (1 << (k + COLUMN_SUM_COUNT)) != 0 {
                    gf_add_mem(product.as_mut_slice(), self.window.sum(lane, k).as_slice());
                }
            }
        }

        // Sparse part: paired taps over the LDPC suffix, one raw and one
        // through the product buffer
        let ldpc_count = count;
        let mut prng = Pcg::new(row as u64, ldpc_count as u64);
        let pair_count = ldpc_count.div_ceil(PAIR_ADD_RATE);
        for _ in 0..pair_count {
            let element1 = (prng.next() % ldpc_count) as usize;
            gf_add_mem(
                recovery.as_mut_slice(),
                self.window.slot(element1).packet.buffer.as_slice(),
            );

            let element2 = (prng.next() % ldpc_count) as usize;
            gf_add_mem(
                product.as_mut_slice(),
                self.window.slot(element2).packet.buffer.as_slice(),
            );
        }

        let rx = row_value(row);
        gf_muladd_mem(recovery.as_mut_slice(), rx, product.as_slice());

        let metadata = RecoveryMetadata {
            column_start: self.window.column_start(),
            sum_count: count,
            ldpc_count,
            row,
        };
        debug!(
            "encode: row {} start {} count {}",
            row,
            metadata.column_start,
            count
        );

        let mut out = recovery.into_vec();
        write_recovery_metadata(&metadata, &mut out);
        out
    }

    /// Small-window parity or Cauchy row
    #[cfg(feature = "cauchy")]
    fn encode_cauchy(&mut self) -> Vec<u8> {
        let count = self.window.count();
        let row = self.next_cauchy_row;
        self.next_cauchy_row = (self.next_cauchy_row + 1) % (CAUCHY_MAX_ROWS as u32 + 1);

        let recovery_bytes = (0..count)
            .map(|e| self.window.slot(e).packet.buffer.len())
            .max()
            .unwrap_or(0);
        let mut recovery = GrowingBuffer::zeroed(recovery_bytes);

        for element in 0..count {
            let packet = &self.window.slot(element).packet;
            if row == 0 {
                gf_add_mem(recovery.as_mut_slice(), packet.buffer.as_slice());
            } else {
                let y = cauchy_element(
                    row as usize - 1,
                    (packet.column as usize) % CAUCHY_MAX_COLUMNS,
                );
                gf_muladd_mem(recovery.as_mut_slice(), y, packet.buffer.as_slice());
            }
        }

        let metadata = RecoveryMetadata {
            column_start: self.window.column_start(),
            sum_count: count as u32,
            ldpc_count: count as u32,
            row,
        };
        debug!(
            "encode: {} row {} start {} count {}",
            if row == 0 { "parity" } else { "cauchy" },
            row,
            metadata.column_start,
            count
        );

        let mut out = recovery.into_vec();
        write_recovery_metadata(&metadata, &mut out);
        out
    }

    /// Next stored, unacknowledged original in column order
    ///
    /// Cycles through the window; each candidate is returned once per pass.
    pub fn retransmit(&mut self) -> Result<PendingOriginal<'_>> {
        if self.emergency_disabled {
            return Err(SiameseError::Disabled);
        }

        let count = self.window.count();
        if count == 0 {
            return Err(SiameseError::NeedMoreData);
        }

        if self.next_retransmit >= count {
            self.next_retransmit = 0;
        }
        let start = self.next_retransmit;

        for offset in 0..count {
            let element = (start + offset) % count;
            if !self.window.slot(element).acked {
                self.next_retransmit = element + 1;
                self.stats.retransmits += 1;
                let packet = &self.window.slot(element).packet;
                return Ok(PendingOriginal {
                    column: packet.column,
                    payload: packet.payload(),
                });
            }
        }

        Err(SiameseError::NeedMoreData)
    }

    /// Consume an acknowledgement from the decoder
    ///
    /// Removes everything before the peer's next expected column and marks
    /// columns implied received by the NACK ranges. Returns the peer's next
    /// expected column. Malformed input leaves the encoder untouched.
    pub fn acknowledge(&mut self, ack: &[u8]) -> Result<u32> {
        if self.emergency_disabled {
            return Err(SiameseError::Disabled);
        }

        let (next_expected, mut offset) = read_num(ack)?;

        // Reject acks for columns we never assigned
        let delta = subtract_columns(next_expected, self.window.column_start());
        if !is_column_delta_negative(delta) && delta as usize > self.window.count() {
            return Err(SiameseError::InvalidInput);
        }

        // Parse every range up front so a malformed tail cannot leave the
        // window partially updated
        let mut ranges = Vec::new();
        while offset < ack.len() {
            let (relative_start, loss_count_m1, used) = read_loss_range(&ack[offset..])?;
            ranges.push((relative_start, loss_count_m1));
            offset += used;
        }

        self.window.remove_before(next_expected)?;

        // Columns in the gaps between loss ranges were received; the column
        // terminating each loss run is implied received as well
        let mut cursor = next_expected;
        for (relative_start, loss_count_m1) in ranges {
            let loss_start = add_columns(cursor, relative_start);
            let loss_end = add_columns(loss_start, loss_count_m1 + 1);
            self.mark_received(cursor, loss_start);
            self.mark_received(loss_end, add_columns(loss_end, 1));
            cursor = add_columns(loss_end, 1);
        }

        self.stats.acks_received += 1;
        self.stats.ack_bytes += ack.len() as u64;
        trace!("acknowledge: next expected {}", next_expected);
        Ok(next_expected)
    }

    /// Mark columns in `[from, to)` acknowledged when inside the window
    fn mark_received(&mut self, from: u32, to: u32) {
        let span = subtract_columns(to, from);
        if is_column_delta_negative(span) {
            return;
        }
        for i in 0..span {
            let column = add_columns(from, i);
            let element = subtract_columns(column, self.window.column_start());
            if !is_column_delta_negative(element) && (element as usize) < self.window.count() {
                self.window.slot_mut(element as usize).acked = true;
            }
        }
    }

    /// Column the next added payload will receive
    pub fn next_column(&self) -> u32 {
        self.window.next_column()
    }

    /// Originals currently held in the window
    pub fn window_count(&self) -> usize {
        self.window.count()
    }

    /// First column still covered by the window
    pub fn column_start(&self) -> u32 {
        self.window.column_start()
    }

    /// Activity counters
    pub fn stats(&self) -> &EncoderStats {
        &self.stats
    }
}
