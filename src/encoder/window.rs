//! Encoder-side sliding window and running sums
//!
//! The window stores every original since the last acknowledged column,
//! length-prefixed, in send order. Each of the 8 lanes carries 3 running
//! sums over its columns: S0 = ⊕ data, S1 = ⊕ CX·data, S2 = ⊕ CX²·data.
//! Folding happens on `add`; `remove_before` applies the same fold again to
//! the dropped prefix, which cancels it (XOR is its own inverse). Recovery
//! rows are then formed from the 24 sums in time independent of the window
//! size.

use std::collections::VecDeque;

use crate::buffer::GrowingBuffer;
use crate::error::{Result, SiameseError};
use crate::galois::{gf_add_mem, gf_muladd_mem};
use crate::packet::OriginalPacket;
use crate::params::{
    add_columns, column_value, column_value_sqr, is_column_delta_negative, subtract_columns,
    COLUMN_LANE_COUNT, COLUMN_SUM_COUNT, MAX_PACKETS,
};

/// One stored original plus its acknowledgement state
#[derive(Debug, Default)]
pub struct EncoderSlot {
    pub packet: OriginalPacket,
    /// Set when an ack implies the peer holds this column
    pub acked: bool,
}

#[derive(Debug, Default)]
struct EncoderLane {
    sums: [GrowingBuffer; COLUMN_SUM_COUNT],
}

/// Sliding window of sent originals with per-lane running sums
#[derive(Debug)]
pub struct EncoderWindow {
    slots: VecDeque<EncoderSlot>,
    column_start: u32,
    lanes: [EncoderLane; COLUMN_LANE_COUNT],
    /// Longest stored buffer while the window has been non-empty
    longest_buffer: usize,
}

impl Default for EncoderWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl EncoderWindow {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            column_start: 0,
            lanes: Default::default(),
            longest_buffer: 0,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn column_start(&self) -> u32 {
        self.column_start
    }

    /// Column the next added original will receive
    #[inline]
    pub fn next_column(&self) -> u32 {
        add_columns(self.column_start, self.slots.len() as u32)
    }

    /// Longest length-prefixed buffer currently covered by the sums
    #[inline]
    pub fn longest_buffer(&self) -> usize {
        self.longest_buffer
    }

    #[inline]
    pub fn slot(&self, element: usize) -> &EncoderSlot {
        &self.slots[element]
    }

    #[inline]
    pub fn slot_mut(&mut self, element: usize) -> &mut EncoderSlot {
        &mut self.slots[element]
    }

    /// Running sum `k` for `lane`
    #[inline]
    pub fn sum(&self, lane: usize, k: usize) -> &GrowingBuffer {
        &self.lanes[lane].sums[k]
    }

    /// Store a payload, assign it the next column, and fold it into the sums
    pub fn add(&mut self, payload: &[u8]) -> Result<u32> {
        if self.slots.len() >= MAX_PACKETS {
            return Err(SiameseError::WindowFull);
        }

        let column = self.next_column();
        let mut slot = EncoderSlot::default();
        slot.packet.initialize(column, payload)?;

        Self::fold(&mut self.lanes, &slot.packet);
        if slot.packet.buffer.len() > self.longest_buffer {
            self.longest_buffer = slot.packet.buffer.len();
        }

        self.slots.push_back(slot);
        Ok(column)
    }

    /// Drop every original strictly before `column` and roll the sums forward
    ///
    /// Idempotent: columns at or before the current start are a no-op.
    pub fn remove_before(&mut self, column: u32) -> Result<()> {
        let delta = subtract_columns(column, self.column_start);
        if delta == 0 || is_column_delta_negative(delta) {
            return Ok(());
        }
        if delta as usize > self.slots.len() {
            return Err(SiameseError::InvalidInput);
        }

        for _ in 0..delta {
            let slot = self
                .slots
                .pop_front()
                .expect("window length checked above");
            // Same accumulation as add: XOR cancels the contribution
            Self::fold(&mut self.lanes, &slot.packet);
        }
        self.column_start = column;

        if self.slots.is_empty() {
            self.longest_buffer = 0;
            for lane in &mut self.lanes {
                for sum in &mut lane.sums {
                    sum.reset();
                }
            }
        }
        Ok(())
    }

    fn fold(lanes: &mut [EncoderLane; COLUMN_LANE_COUNT], packet: &OriginalPacket) {
        let column = packet.column;
        let lane = &mut lanes[(column as usize) % COLUMN_LANE_COUNT];
        let data = packet.buffer.as_slice();

        lane.sums[0].grow_zero_padded(data.len());
        gf_add_mem(lane.sums[0].as_mut_slice(), data);

        lane.sums[1].grow_zero_padded(data.len());
        gf_muladd_mem(lane.sums[1].as_mut_slice(), column_value(column), data);

        lane.sums[2].grow_zero_padded(data.len());
        gf_muladd_mem(lane.sums[2].as_mut_slice(), column_value_sqr(column), data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::galois::gf_mul;

    fn lane_xor(window: &EncoderWindow, lane: usize, k: usize) -> Vec<u8> {
        // Recompute the expected sum from stored packets
        let mut expected = vec![0u8; window.sum(lane, k).len()];
        for element in 0..window.count() {
            let packet = &window.slot(element).packet;
            if (packet.column as usize) % COLUMN_LANE_COUNT != lane {
                continue;
            }
            let scale = match k {
                0 => 1,
                1 => column_value(packet.column),
                _ => column_value_sqr(packet.column),
            };
            for (i, &b) in packet.buffer.as_slice().iter().enumerate() {
                expected[i] ^= gf_mul(scale, b);
            }
        }
        expected
    }

    #[test]
    fn test_sums_match_direct_accumulation() {
        let mut window = EncoderWindow::new();
        for i in 0..20usize {
            let payload: Vec<u8> = (0..(5 + i * 3)).map(|j| (i * 31 + j) as u8).collect();
            window.add(&payload).unwrap();
        }

        for lane in 0..COLUMN_LANE_COUNT {
            for k in 0..COLUMN_SUM_COUNT {
                assert_eq!(
                    window.sum(lane, k).as_slice(),
                    lane_xor(&window, lane, k).as_slice(),
                    "lane {} sum {}",
                    lane,
                    k
                );
            }
        }
    }

    #[test]
    fn test_remove_before_rolls_sums() {
        let mut window = EncoderWindow::new();
        for i in 0..24usize {
            let payload: Vec<u8> = (0..40).map(|j| (i * 7 + j) as u8).collect();
            window.add(&payload).unwrap();
        }

        window.remove_before(10).unwrap();
        assert_eq!(window.column_start(), 10);
        assert_eq!(window.count(), 14);

        for lane in 0..COLUMN_LANE_COUNT {
            for k in 0..COLUMN_SUM_COUNT {
                assert_eq!(
                    window.sum(lane, k).as_slice(),
                    lane_xor(&window, lane, k).as_slice(),
                    "lane {} sum {}",
                    lane,
                    k
                );
            }
        }
    }

    #[test]
    fn test_remove_before_is_idempotent() {
        let mut window = EncoderWindow::new();
        for _ in 0..8 {
            window.add(&[1, 2, 3]).unwrap();
        }
        window.remove_before(4).unwrap();
        let count = window.count();
        // Removing at the current start again changes nothing
        window.remove_before(4).unwrap();
        window.remove_before(2).unwrap();
        assert_eq!(window.count(), count);
        assert_eq!(window.column_start(), 4);
    }

    #[test]
    fn test_remove_past_end_is_invalid() {
        let mut window = EncoderWindow::new();
        window.add(&[1]).unwrap();
        assert_eq!(
            window.remove_before(5),
            Err(SiameseError::InvalidInput)
        );
    }

    #[test]
    fn test_window_full() {
        let mut window = EncoderWindow::new();
        for _ in 0..MAX_PACKETS {
            window.add(&[0xAB]).unwrap();
        }
        assert_eq!(window.add(&[0xCD]), Err(SiameseError::WindowFull));
    }
}
