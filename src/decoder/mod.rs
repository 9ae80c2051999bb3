//! Streaming FEC decoder
//!
//! The decoder delivers originals in order and reconstructs losses once
//! enough recovery data has arrived. Work is deferred aggressively: received
//! packets just land in the window; the expensive solve runs only when the
//! checked region proves `recovery_count >= lost_count`, and every piece of
//! solver state (matrix, elimination progress, examined prefix) survives
//! across calls so new packets extend rather than restart the computation.

mod matrix;
mod recovery_list;
mod window;

pub use recovery_list::{CheckedRegion, InsertOutcome, RecoveryList, RecoveryPacket, RemovalPoint};
pub use window::{DecoderSubwindow, DecoderSum, DecoderWindow};

use log::{debug, error, info, trace, warn};

use crate::buffer::GrowingBuffer;
use crate::error::{Result, SiameseError};
use crate::galois::{gf_add_mem, gf_div_mem, gf_muladd_mem};
use crate::packet::{RecoveredPacket, RecoveryMetadata};
#[cfg(feature = "cauchy")]
use crate::params::{cauchy_element, CAUCHY_MAX_COLUMNS, CAUCHY_THRESHOLD};
use crate::params::{
    add_columns, is_column_delta_negative, row_opcode, row_value, Pcg, COLUMN_LANE_COUNT,
    COLUMN_SUM_COUNT, DECODER_REMOVE_THRESHOLD, PAIR_ADD_RATE, SUBWINDOW_SIZE,
};
use crate::serializers::{
    read_length, read_recovery_metadata, write_loss_range, write_num, ACK_MIN_BYTES,
    MAX_LOSS_RANGE_BYTES,
};

use matrix::RecoveryMatrix;

/// Counters describing decoder activity
#[derive(Debug, Default, Clone)]
pub struct DecoderStats {
    pub originals_received: u64,
    pub original_bytes: u64,
    pub recovery_received: u64,
    pub recovery_bytes: u64,
    pub duped_originals: u64,
    pub duped_recovery: u64,
    pub solve_successes: u64,
    pub solve_failures: u64,
    pub acks_produced: u64,
    pub ack_bytes: u64,
    /// Checked-region extensions where a packet ended before the region edge
    pub checked_region_clamps: u64,
}

/// Streaming FEC decoder reconstructing a column-numbered packet sequence
#[derive(Debug, Default)]
pub struct Decoder {
    window: DecoderWindow,
    recovery: RecoveryList,
    checked: CheckedRegion,
    matrix: RecoveryMatrix,
    /// Scratch for the RX-scaled half of sum elimination
    product: GrowingBuffer,
    /// Originals recovered outside a solve, reported by the next `decode`
    pending: Vec<RecoveredPacket>,
    stats: DecoderStats,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> Result<()> {
        if self.window.emergency_disabled {
            Err(SiameseError::Disabled)
        } else {
            Ok(())
        }
    }

    /// Accept one original packet from the wire
    pub fn add_original(&mut self, column: u32, payload: &[u8]) -> Result<()> {
        self.guard()?;
        if payload.is_empty() {
            return Err(SiameseError::InvalidInput);
        }

        let element = self.window.column_to_element(column);
        if is_column_delta_negative(element) {
            debug!("ignored packet before window start: {}", column);
            self.stats.duped_originals += 1;
            return Err(SiameseError::DuplicateData);
        }
        let element = element as usize;

        self.window.grow(element + 1);

        if self.window.element(element).is_present() {
            debug!("ignored packet already received: {}", column);
            self.stats.duped_originals += 1;
            return Err(SiameseError::DuplicateData);
        }

        self.window.element_mut(element).initialize(column, payload)?;
        self.window.mark_present(element);

        if element == self.window.next_expected_element {
            self.window.iterate_next_expected(element + 1);
            let next = self.window.next_expected_element;
            trace!("in-order progress reached element {}", next);
            self.delete_recovery_before(next);
        }

        if self.checked.contains_element(element) {
            // A filled hole shrinks the pending system; start the
            // examination over
            self.checked.reset();
            self.matrix.reset();
        }

        self.stats.originals_received += 1;
        self.stats.original_bytes += payload.len() as u64;
        Ok(())
    }

    /// Accept one recovery packet from the wire
    ///
    /// Recoveries that arrive too late to matter are counted and dropped.
    /// A corrupt footer permanently disables the decoder: there is no way
    /// to tell how much of the ciphered sum it damaged.
    pub fn add_recovery(&mut self, data: &[u8]) -> Result<()> {
        self.guard()?;

        let (metadata, footer_bytes) = match read_recovery_metadata(data) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.window.emergency_disabled = true;
                error!("corrupt recovery metadata");
                return Err(SiameseError::Disabled);
            }
        };

        self.stats.recovery_received += 1;
        self.stats.recovery_bytes += data.len() as u64;

        let element_start;
        let element_end;

        if self.window.count == 0 {
            info!(
                "first recovery packet: start {} sum {} ldpc {} row {}",
                metadata.column_start, metadata.sum_count, metadata.ldpc_count, metadata.row
            );
            self.window.column_start = metadata.column_start;
            self.window.grow(metadata.sum_count as usize);
            element_end = metadata.sum_count as usize;
            element_start = element_end - metadata.ldpc_count as usize;
            debug_assert_eq!(self.window.next_expected_element, 0);
        } else {
            let end = self
                .window
                .column_to_element(add_columns(metadata.column_start, metadata.sum_count));

            // Too old: the whole packet precedes the window
            if is_column_delta_negative(end) {
                debug!("recovery packet ends before the window starts");
                self.stats.duped_recovery += 1;
                return Ok(());
            }
            let end = end as usize;

            // The tap region was already clipped off
            if end < metadata.ldpc_count as usize {
                warn!("recovery packet tap region was already clipped");
                self.stats.duped_recovery += 1;
                return Ok(());
            }
            element_end = end;
            element_start = end - metadata.ldpc_count as usize;

            // Everything it protects was already received
            if element_end <= self.window.next_expected_element {
                debug!("recovery packet is redundant");
                if element_start >= DECODER_REMOVE_THRESHOLD {
                    self.recovery.last_recovery = Some(RemovalPoint {
                        first_kept_element: element_start,
                        initial_recovery_bytes: data.len() - footer_bytes,
                        sum_column_count: metadata.sum_count,
                        sum_start_column: metadata.column_start,
                    });
                    self.remove_elements();
                }
                self.stats.duped_recovery += 1;
                return Ok(());
            }

            // A sum row whose region begins before the window cannot be
            // used unless the running sums already start there
            if self.is_sum_row(&metadata)
                && (self.window.sum_column_count == 0
                    || self.window.sum_column_start != metadata.column_start)
            {
                let sum_start = self.window.column_to_element(metadata.column_start);
                if self.window.invalid_element(sum_start) {
                    info!("recovery packet sum region was already clipped");
                    self.stats.duped_recovery += 1;
                    return Ok(());
                }
            }

            self.window.grow(element_end);
        }

        if metadata.sum_count == 1 {
            return self.add_single_recovery(data, footer_bytes, &metadata);
        }

        let packet = RecoveryPacket {
            buffer: GrowingBuffer::from_vec(data[..data.len() - footer_bytes].to_vec()),
            metadata,
            element_start,
            element_end,
            lost_count: 0,
        };

        match self.recovery.insert(packet) {
            InsertOutcome::Duplicate => {
                self.stats.duped_recovery += 1;
                return Ok(());
            }
            InsertOutcome::Middle => {
                // A smaller solution may now exist to the left
                self.checked.reset();
                self.matrix.reset();
            }
            InsertOutcome::AtTail => {}
        }

        if element_start >= DECODER_REMOVE_THRESHOLD {
            self.remove_elements();
        }
        Ok(())
    }

    #[cfg(feature = "cauchy")]
    fn is_sum_row(&self, metadata: &RecoveryMetadata) -> bool {
        metadata.sum_count as usize > CAUCHY_THRESHOLD
    }

    #[cfg(not(feature = "cauchy"))]
    fn is_sum_row(&self, _metadata: &RecoveryMetadata) -> bool {
        true
    }

    /// A `sum_count == 1` packet carries one original outright
    fn add_single_recovery(
        &mut self,
        data: &[u8],
        footer_bytes: usize,
        metadata: &RecoveryMetadata,
    ) -> Result<()> {
        let element = self.window.column_to_element(metadata.column_start);
        if self.window.invalid_element(element) {
            self.window.emergency_disabled = true;
            error!("single recovery column fell outside the window");
            return Err(SiameseError::Disabled);
        }
        let element = element as usize;

        if self.window.element(element).is_present() {
            self.stats.duped_recovery += 1;
            return Ok(());
        }

        let prefixed = &data[..data.len() - footer_bytes];
        let (length, header_bytes) = match read_length(prefixed) {
            Ok(parsed) => parsed,
            Err(_) => {
                self.window.emergency_disabled = true;
                error!("single recovery carries a broken length field");
                return Err(SiameseError::Disabled);
            }
        };
        if header_bytes + length as usize != prefixed.len() {
            self.window.emergency_disabled = true;
            error!("single recovery length disagrees with its payload");
            return Err(SiameseError::Disabled);
        }

        self.window
            .element_mut(element)
            .initialize_prefixed(metadata.column_start, prefixed.to_vec())?;

        self.pending.push(RecoveredPacket {
            column: metadata.column_start,
            data: prefixed[header_bytes..].to_vec(),
        });
        self.window.recovered_columns.push(metadata.column_start);

        if self.checked.contains_element(element) {
            self.checked.reset();
            self.matrix.reset();
        }

        if self.window.mark_got_column(metadata.column_start)? {
            self.window.iterate_next_expected(element + 1);
            let next = self.window.next_expected_element;
            debug!("single recovery advanced in-order progress to {}", next);
            self.delete_recovery_before(next);
            if self.checked.next_check_start >= DECODER_REMOVE_THRESHOLD {
                self.remove_elements();
            }
        }

        Ok(())
    }

    fn delete_recovery_before(&mut self, element: usize) {
        let deleted = self.recovery.delete_packets_before(element);
        if deleted > 0 && self.checked.is_active() {
            // The examined prefix referenced deleted packets
            self.checked.reset();
            self.matrix.reset();
        }
    }

    /// Retrieve a received or recovered original by column
    pub fn get(&self, column: u32) -> Result<&[u8]> {
        self.guard()?;

        let element = self.window.column_to_element(column);
        if self.window.invalid_element(element) {
            return Err(SiameseError::NeedMoreData);
        }
        let original = self.window.element(element as usize);
        if !original.is_present() {
            return Err(SiameseError::NeedMoreData);
        }
        Ok(original.payload())
    }

    /// Whether a decode attempt could produce data right now
    ///
    /// Advances the checked region as a side effect, so the answer is
    /// incremental rather than recomputed.
    pub fn is_ready(&mut self) -> Result<bool> {
        self.guard()?;
        Ok(!self.pending.is_empty() || self.check_recovery_possible())
    }

    /// Extend the checked region until enough recovery covers its losses
    fn check_recovery_possible(&mut self) -> bool {
        if self.window.emergency_disabled {
            return false;
        }

        let mut index;
        let mut next_check_start;
        let mut recovery_count;
        let mut lost_count;

        if !self.checked.is_active() {
            // Leading packets whose span carries no losses are dead weight;
            // they arise when losses are filled while in-order progress is
            // pinned behind an unrecoverable prefix
            let (head_start, head_end) = loop {
                if self.recovery.is_empty() {
                    return false;
                }
                let head = self.recovery.packet(0);
                let span = (head.element_start, head.element_end);
                if self.window.range_lost(span.0, span.1) > 0 {
                    break span;
                }
                trace!("dropping recovery packet covering no losses");
                self.recovery.pop_front();
            };

            index = 0;
            self.checked.first_recovery = Some(0);
            self.checked.element_start = head_start;
            self.checked.solve_failed = false;
            recovery_count = 1;
            next_check_start = head_end;
            lost_count = self.window.range_lost(head_start, head_end);
            self.recovery.packet_mut(0).lost_count = lost_count;
        } else {
            recovery_count = self.checked.recovery_count;
            lost_count = self.checked.lost_count;
            if recovery_count >= lost_count && !self.checked.solve_failed {
                return true;
            }
            index = self.checked.last_recovery.unwrap_or(0);
            next_check_start = self.checked.next_check_start;
        }
        debug_assert!(lost_count > 0);

        while (recovery_count < lost_count || self.checked.solve_failed)
            && index + 1 < self.recovery.len()
        {
            index += 1;
            recovery_count += 1;

            let packet_end = self.recovery.packet(index).element_end;
            let element_end = if packet_end < next_check_start {
                // Interleaved small-window rows can end inside the region
                self.stats.checked_region_clamps += 1;
                warn!(
                    "checked region clamped: packet ends at {} inside region ending {}",
                    packet_end, next_check_start
                );
                next_check_start
            } else {
                packet_end
            };

            lost_count += self.window.range_lost(next_check_start, element_end);
            next_check_start = element_end;
            self.recovery.packet_mut(index).lost_count = lost_count;
            self.checked.solve_failed = false;
        }

        self.checked.last_recovery = Some(index);
        self.checked.recovery_count = recovery_count;
        self.checked.lost_count = lost_count;
        self.checked.next_check_start = next_check_start;

        trace!(
            "recovery possible? lost {} recovery {}",
            lost_count,
            recovery_count
        );
        recovery_count >= lost_count && !self.checked.solve_failed
    }

    /// Attempt to reconstruct every loss the checked region covers
    ///
    /// Returns the recovered originals in column order, or `NeedMoreData`
    /// when no solvable region exists yet.
    pub fn decode(&mut self) -> Result<Vec<RecoveredPacket>> {
        self.guard()?;

        if !self.pending.is_empty() {
            return Ok(std::mem::take(&mut self.pending));
        }

        if !self.check_recovery_possible() {
            return Err(SiameseError::NeedMoreData);
        }

        loop {
            if self.checked.recovery_count >= self.checked.lost_count {
                match self.decode_checked_region() {
                    Ok(recovered) => return Ok(recovered),
                    Err(SiameseError::NeedMoreData) => {}
                    Err(other) => return Err(other),
                }
            }

            // Pull one more recovery packet into the region and retry
            let index = self.checked.last_recovery.unwrap_or(0);
            if index + 1 >= self.recovery.len() {
                break;
            }
            let index = index + 1;

            let packet_end = self.recovery.packet(index).element_end;
            let mut next_check_start = self.checked.next_check_start;
            let element_end = if packet_end < next_check_start {
                self.stats.checked_region_clamps += 1;
                warn!(
                    "checked region clamped: packet ends at {} inside region ending {}",
                    packet_end, next_check_start
                );
                next_check_start
            } else {
                packet_end
            };

            self.checked.lost_count += self.window.range_lost(next_check_start, element_end);
            next_check_start = element_end;
            self.checked.next_check_start = next_check_start;
            self.checked.recovery_count += 1;
            self.checked.last_recovery = Some(index);
            let lost = self.checked.lost_count;
            self.recovery.packet_mut(index).lost_count = lost;
        }

        Err(SiameseError::NeedMoreData)
    }

    /// The four-phase solve over the current checked region
    fn decode_checked_region(&mut self) -> Result<Vec<RecoveredPacket>> {
        debug!(
            "attempting solve: {} losses, {} recovery rows",
            self.checked.lost_count, self.checked.recovery_count
        );

        self.matrix
            .generate(&mut self.window, &self.recovery, &self.checked)?;

        if !self.matrix.gaussian_elimination() {
            self.checked.solve_failed = true;
            self.stats.solve_failures += 1;
            return Err(SiameseError::NeedMoreData);
        }

        self.eliminate_original_data()?;
        self.multiply_lower_triangle();
        let recovered = self.back_substitution()?;

        self.checked.reset();
        self.matrix.reset();

        let next = self.window.next_expected_element;
        self.recovery.delete_packets_before(next);
        if next >= DECODER_REMOVE_THRESHOLD {
            self.remove_elements();
        }

        self.stats.solve_successes += 1;
        Ok(recovered)
    }

    /// Strip every received original's contribution out of the pivot rows'
    /// recovery buffers, leaving pure combinations of the lost columns
    ///
    /// Sum rows consume the window's running sums in encoder order; tap
    /// contributions are replayed from the same PRNG stream the encoder
    /// used.
    fn eliminate_original_data(&mut self) -> Result<()> {
        debug_assert_eq!(self.checked.lost_count, self.matrix.columns.len());
        let rows = self.checked.recovery_count;
        debug_assert_eq!(rows, self.matrix.rows.len());

        for matrix_row in 0..rows {
            if !self.matrix.rows[matrix_row].used_for_solution {
                continue;
            }
            let list_index = self.matrix.rows[matrix_row].recovery;
            let metadata = self.recovery.packet(list_index).metadata;
            let element_start = self.recovery.packet(list_index).element_start;
            let element_end = self.recovery.packet(list_index).element_end;

            #[cfg(feature = "cauchy")]
            if metadata.sum_count as usize <= CAUCHY_THRESHOLD {
                self.eliminate_cauchy_row(list_index, &metadata, element_start, element_end);
                continue;
            }

            self.eliminate_sum_row(list_index, &metadata, element_start, element_end)?;
        }

        if self.window.emergency_disabled {
            return Err(SiameseError::Disabled);
        }
        Ok(())
    }

    #[cfg(feature = "cauchy")]
    fn eliminate_cauchy_row(
        &mut self,
        list_index: usize,
        metadata: &RecoveryMetadata,
        element_start: usize,
        element_end: usize,
    ) {
        for element in element_start..element_end {
            let original = self.window.element(element);
            if !original.is_present() {
                continue;
            }
            let data = original.buffer.as_slice();
            let recovery = self.recovery.packet_mut(list_index);
            if metadata.row == 0 {
                gf_add_mem(recovery.buffer.as_mut_slice(), data);
            } else {
                let y = cauchy_element(
                    (metadata.row as usize - 1) % crate::params::CAUCHY_MAX_ROWS,
                    (original.column as usize) % CAUCHY_MAX_COLUMNS,
                );
                gf_muladd_mem(recovery.buffer.as_mut_slice(), y, data);
            }
        }
    }

    fn eliminate_sum_row(
        &mut self,
        list_index: usize,
        metadata: &RecoveryMetadata,
        element_start: usize,
        element_end: usize,
    ) -> Result<()> {
        let recovery_bytes = self.recovery.packet(list_index).buffer.len();

        self.product.grow_zero_padded(recovery_bytes);
        self.product.truncate(recovery_bytes);
        self.product.fill_zero();

        debug!(
            "eliminating sums for row {} start {} count {}",
            metadata.row, metadata.column_start, metadata.sum_count
        );

        let sum_start = self.window.column_to_element(metadata.column_start);
        let sum_element_start = if self.window.invalid_element(sum_start) {
            0
        } else {
            sum_start as usize
        };

        // Stale or shrinking sums cannot be resumed; rebuild from scratch
        if self.window.sum_column_count == 0
            || metadata.column_start != self.window.sum_column_start
            || metadata.sum_count < self.window.sum_column_count
        {
            self.window.reset_sums(sum_element_start);
            self.window.sum_column_start = metadata.column_start;
        } else {
            self.window.start_sums(sum_element_start, recovery_bytes);
        }
        self.window.sum_column_count = metadata.sum_count;

        // Dense part
        for lane in 0..COLUMN_LANE_COUNT {
            let opcode = row_opcode(lane, metadata.row);
            for k in 0..COLUMN_SUM_COUNT {
                if opcode & (1 << k) != 0 {
                    self.window.accumulate_sum(lane, k, element_end);
                    let recovery = self.recovery.packet_mut(list_index);
                    gf_add_mem(
                        recovery.buffer.as_mut_slice(),
                        self.window.sum_slice(lane, k),
                    );
                }
                if opcode & (1 << (k + COLUMN_SUM_COUNT)) != 0 {
                    self.window.accumulate_sum(lane, k, element_end);
                    gf_add_mem(self.product.as_mut_slice(), self.window.sum_slice(lane, k));
                }
            }
        }

        // Sparse part: replay the taps over received originals only
        let mut prng = Pcg::new(metadata.row as u64, metadata.ldpc_count as u64);
        let pair_count = metadata.ldpc_count.div_ceil(PAIR_ADD_RATE);
        debug_assert!(metadata.sum_count >= metadata.ldpc_count);

        for _ in 0..pair_count {
            let element1 = element_start + (prng.next() % metadata.ldpc_count) as usize;
            {
                let original = self.window.element(element1);
                if original.is_present() {
                    let data = original.buffer.as_slice();
                    let recovery = self.recovery.packet_mut(list_index);
                    gf_add_mem(recovery.buffer.as_mut_slice(), data);
                }
            }

            let element2 = element_start + (prng.next() % metadata.ldpc_count) as usize;
            let original = self.window.element(element2);
            if original.is_present() {
                gf_add_mem(self.product.as_mut_slice(), original.buffer.as_slice());
            }
        }

        let rx = row_value(metadata.row);
        let recovery = self.recovery.packet_mut(list_index);
        gf_muladd_mem(recovery.buffer.as_mut_slice(), rx, self.product.as_slice());

        Ok(())
    }

    /// Dense lower-triangle product in pivot order, left to right
    fn multiply_lower_triangle(&mut self) {
        let columns = self.checked.lost_count;

        for col_i in 0..columns.saturating_sub(1) {
            let row_i = self.matrix.pivots[col_i];
            let src_index = self.matrix.rows[row_i].recovery;

            for col_j in col_i + 1..columns {
                let row_j = self.matrix.pivots[col_j];
                let y = self.matrix.get(row_j, col_i);
                if y == 0 {
                    continue;
                }
                let dst_index = self.matrix.rows[row_j].recovery;

                let (src, dst) = self.recovery.pair_mut(src_index, dst_index);
                dst.buffer.grow_zero_padded(src.buffer.len());
                gf_muladd_mem(dst.buffer.as_mut_slice(), y, src.buffer.as_slice());
            }
        }
    }

    /// Back-substitute right to left, peeling each recovered original's
    /// length field as both output and validation
    fn back_substitution(&mut self) -> Result<Vec<RecoveredPacket>> {
        let columns = self.checked.lost_count;
        let mut recovered: Vec<Option<RecoveredPacket>> = (0..columns).map(|_| None).collect();
        let mut reached_next_expected = false;

        for col_i in (0..columns).rev() {
            let row_i = self.matrix.pivots[col_i];
            let list_index = self.matrix.rows[row_i].recovery;
            let y = self.matrix.get(row_i, col_i);
            debug_assert_ne!(y, 0);

            let element = self.matrix.columns[col_i].element;
            let column = self.matrix.columns[col_i].column;

            // Reveal the front, read the embedded length, then finish the
            // division over just the real extent
            let (header_bytes, total_bytes) = {
                let buffer = self.recovery.packet_mut(list_index).buffer.as_mut_slice();
                if buffer.is_empty() {
                    self.window.emergency_disabled = true;
                    error!("empty recovery buffer reached back-substitution");
                    return Err(SiameseError::Disabled);
                }
                let reveal = buffer.len().min(8);
                gf_div_mem(&mut buffer[..reveal], y);

                let parsed = read_length(&buffer[..reveal]);
                let (length, header_bytes) = match parsed {
                    Ok(v) => v,
                    Err(_) => (0, 0),
                };
                let total = header_bytes + length as usize;
                if header_bytes == 0 || length == 0 || total > buffer.len() {
                    // Recovery produced garbage: the stream is beyond
                    // saving because the sums cannot be rewound
                    self.window.emergency_disabled = true;
                    error!("back-substitution recovered a corrupt length field");
                    return Err(SiameseError::Disabled);
                }
                if total > reveal {
                    gf_div_mem(&mut buffer[reveal..total], y);
                }
                (header_bytes, total)
            };

            // Move the solved buffer into the window slot
            let mut data = self.recovery.packet_mut(list_index).buffer.take();
            data.truncate(total_bytes);

            let slot = self.window.element_mut(element);
            debug_assert!(!slot.is_present());
            slot.buffer = GrowingBuffer::from_vec(data);
            slot.header_bytes = header_bytes;
            slot.column = column;

            recovered[col_i] = Some(RecoveredPacket {
                column,
                data: slot.payload().to_vec(),
            });
            self.window.recovered_columns.push(column);

            trace!("recovered column {} at element {}", column, element);

            self.window.mark_present(element);
            reached_next_expected |= element == self.window.next_expected_element;

            // Eliminate from pivot rows above; the streaming upper
            // triangle is mostly zero so this is cheap
            for col_j in 0..col_i {
                let row_j = self.matrix.pivots[col_j];
                let x = self.matrix.get(row_j, col_i);
                if x == 0 {
                    continue;
                }
                let above_index = self.matrix.rows[row_j].recovery;
                let solved = self.window.element(element).buffer.as_slice();
                let above = self.recovery.packet_mut(above_index);
                gf_muladd_mem(above.buffer.as_mut_slice(), x, solved);
            }
        }

        // The next expected element must come out of any solve that spans
        // it; a solve may legitimately not reach it when in-order progress
        // is pinned behind losses that predate every stored recovery
        let next_in_region = self.window.next_expected_element >= self.checked.element_start
            && self.window.next_expected_element < self.checked.next_check_start;
        if next_in_region && !reached_next_expected {
            self.window.emergency_disabled = true;
            error!("solve completed without covering the next expected element");
            return Err(SiameseError::Disabled);
        }

        if reached_next_expected {
            self.window.iterate_next_expected(self.checked.next_check_start);
        }

        Ok(recovered.into_iter().map(|p| p.expect("every column solved")).collect())
    }

    /// Build an acknowledgement into `buffer`; returns bytes used
    ///
    /// Format: next expected column, then NACK ranges while space remains.
    /// Truncation after any complete range is harmless.
    pub fn acknowledgement(&mut self, buffer: &mut [u8]) -> Result<usize> {
        self.guard()?;

        if buffer.len() < ACK_MIN_BYTES {
            return Err(SiameseError::InvalidInput);
        }

        let window_count = self.window.count;
        if window_count == 0 {
            return Err(SiameseError::NeedMoreData);
        }

        let next_expected = self.window.next_expected_element;
        let next_column = self.window.element_to_column(next_expected);

        let mut out = Vec::with_capacity(buffer.len().min(64));
        write_num(next_column, &mut out);

        if next_expected < window_count {
            let mut range_offset = next_expected;

            while buffer.len() - out.len() >= MAX_LOSS_RANGE_BYTES {
                let range_start = self.window.find_next_lost(range_offset);
                if range_start >= window_count {
                    if window_count >= range_offset {
                        // Advertise the window edge so the peer learns how
                        // far reception has progressed
                        write_loss_range((window_count - range_offset) as u32, 0, &mut out);
                    }
                    break;
                }

                let range_end = self.window.find_next_got(range_start + 1);
                let loss_count_m1 = (range_end - range_start - 1) as u32;
                write_loss_range((range_start - range_offset) as u32, loss_count_m1, &mut out);

                // The element at range_end was received; resume after it
                range_offset = range_end + 1;
            }
        }

        buffer[..out.len()].copy_from_slice(&out);
        self.stats.acks_produced += 1;
        self.stats.ack_bytes += out.len() as u64;
        Ok(out.len())
    }

    // -- window removal -----------------------------------------------------

    /// Leftmost element that must be kept for future recovery
    fn identify_removal_point(&mut self) -> Option<RemovalPoint> {
        if self.window.next_expected_element < DECODER_REMOVE_THRESHOLD {
            return None;
        }

        if self.recovery.is_empty() {
            let point = self.recovery.last_recovery?;
            if point.first_kept_element >= DECODER_REMOVE_THRESHOLD {
                return Some(point);
            }
            return None;
        }

        let mut first_kept = usize::MAX;
        let mut initial_bytes = 0usize;
        let mut sum_start_column = 0u32;
        let mut sum_column_count = 0u32;
        let mut found_sum_row = false;

        for packet in self.recovery.iter() {
            first_kept = first_kept.min(packet.element_start);
            initial_bytes = initial_bytes.max(packet.buffer.len());
            if !found_sum_row && self.is_sum_row(&packet.metadata) {
                // The first sum row has the leftmost sum region; it pins
                // where the running sums must start
                sum_start_column = packet.metadata.column_start;
                sum_column_count = packet.metadata.sum_count;
                found_sum_row = true;
            }
        }

        if !found_sum_row {
            // Only parity/Cauchy rows are stored: the encoder restarted its
            // sums small, so ours are stale too
            self.window.sum_column_count = 0;
        }

        debug_assert!(!self.window.invalid_element(first_kept as u32));

        if first_kept >= DECODER_REMOVE_THRESHOLD {
            Some(RemovalPoint {
                first_kept_element: first_kept,
                initial_recovery_bytes: initial_bytes,
                sum_column_count,
                sum_start_column,
            })
        } else {
            None
        }
    }

    /// Shift the window forward past data no stored recovery needs
    fn remove_elements(&mut self) {
        let Some(point) = self.identify_removal_point() else {
            return;
        };

        let removed = (point.first_kept_element / SUBWINDOW_SIZE) * SUBWINDOW_SIZE;
        debug_assert!(removed >= SUBWINDOW_SIZE);
        debug_assert_eq!(removed % COLUMN_LANE_COUNT, 0);
        if removed > self.window.next_expected_element {
            // Every stored recovery starts past the first gap; the encoder
            // dropped data the peer never confirmed
            warn!("removal point beyond in-order progress; keeping window");
            return;
        }

        info!("removing {} elements from the window", removed);

        if self.window.is_running_sums() {
            if self.window.sum_column_start != point.sum_start_column {
                let element_start = self.window.column_to_element(point.sum_start_column);
                if self.window.invalid_element(element_start) {
                    self.window.emergency_disabled = true;
                    error!(
                        "removal point sum start {} is already clipped",
                        point.sum_start_column
                    );
                    return;
                }
                self.window.reset_sums(element_start as usize);
                self.window.sum_column_start = point.sum_start_column;
                self.window.sum_column_count = point.sum_column_count;
            } else {
                let sum_start = self.window.column_to_element(point.sum_start_column);
                let sum_element_start = if self.window.invalid_element(sum_start) {
                    0
                } else {
                    sum_start as usize
                };
                self.window
                    .start_sums(sum_element_start, point.initial_recovery_bytes);
            }

            // Roll every sum past the removal point so the prefix data can
            // be dropped without losing its contribution
            for lane in 0..COLUMN_LANE_COUNT {
                for k in 0..COLUMN_SUM_COUNT {
                    self.window.accumulate_sum(lane, k, removed);
                }
            }
        }

        self.window.shift_forward(removed);

        self.recovery.decrement_element_counters(removed);
        if self.checked.decrement_element_counters(removed) {
            self.matrix.reset();
        }
        self.matrix.decrement_element_counters(removed);
    }

    /// First column still covered by the window
    pub fn column_start(&self) -> u32 {
        self.window.column_start
    }

    /// Next column the in-order stream is waiting for
    pub fn next_expected_column(&self) -> u32 {
        self.window.element_to_column(self.window.next_expected_element)
    }

    /// Activity counters
    pub fn stats(&self) -> &DecoderStats {
        &self.stats
    }
}
