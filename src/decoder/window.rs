//! Decoder-side receive window
//!
//! Elements live in a ring of fixed-size subwindows, each with a presence
//! bitmap and an O(1) got-count so loss counting over a span is a few
//! popcounts rather than a walk. The window also mirrors the encoder's
//! 8 lanes × 3 running sums; the decoder rebuilds them lazily from received
//! originals while eliminating known data out of recovery symbols.

use log::{debug, info};

use crate::bitfield::Bitfield;
use crate::buffer::GrowingBuffer;
use crate::error::{Result, SiameseError};
use crate::galois::gf_muladd_mem;
use crate::packet::OriginalPacket;
use crate::params::{
    add_columns, column_value, column_value_sqr, is_column_delta_negative, subtract_columns,
    COLUMN_LANE_COUNT, COLUMN_SUM_COUNT, SUBWINDOW_SIZE,
};

/// One block of the receive window
#[derive(Debug)]
pub struct DecoderSubwindow {
    pub originals: Vec<OriginalPacket>,
    pub got: Bitfield,
    pub got_count: usize,
}

impl Default for DecoderSubwindow {
    fn default() -> Self {
        Self {
            originals: (0..SUBWINDOW_SIZE).map(|_| OriginalPacket::default()).collect(),
            got: Bitfield::with_bits(SUBWINDOW_SIZE),
            got_count: 0,
        }
    }
}

impl DecoderSubwindow {
    fn reset(&mut self) {
        for original in &mut self.originals {
            original.reset();
        }
        self.got.clear_all();
        self.got_count = 0;
    }
}

/// One running sum: a buffer plus the lane-element range it covers
#[derive(Debug, Default)]
pub struct DecoderSum {
    pub buffer: GrowingBuffer,
    pub element_start: usize,
    pub element_end: usize,
}

#[derive(Debug, Default)]
struct DecoderLane {
    sums: [DecoderSum; COLUMN_SUM_COUNT],
}

/// Subwindowed receive window with lane sums
#[derive(Debug)]
pub struct DecoderWindow {
    subwindows: Vec<Box<DecoderSubwindow>>,
    pub column_start: u32,
    /// Elements covered by the window
    pub count: usize,
    /// Smallest element index whose presence bit is clear
    pub next_expected_element: usize,
    lanes: [DecoderLane; COLUMN_LANE_COUNT],
    /// First column of the running sums; meaningful when `sum_column_count != 0`
    pub sum_column_start: u32,
    /// Columns covered by the running sums; 0 means no sums are running
    pub sum_column_count: u32,
    /// Columns recovered since the sums were last reconciled
    pub recovered_columns: Vec<u32>,
    pub emergency_disabled: bool,
}

impl Default for DecoderWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderWindow {
    pub fn new() -> Self {
        Self {
            subwindows: Vec::new(),
            column_start: 0,
            count: 0,
            next_expected_element: 0,
            lanes: Default::default(),
            sum_column_start: 0,
            sum_column_count: 0,
            recovered_columns: Vec::new(),
            emergency_disabled: false,
        }
    }

    #[inline]
    pub fn column_to_element(&self, column: u32) -> u32 {
        subtract_columns(column, self.column_start)
    }

    #[inline]
    pub fn element_to_column(&self, element: usize) -> u32 {
        add_columns(self.column_start, element as u32)
    }

    /// Whether a masked element delta falls outside the window
    #[inline]
    pub fn invalid_element(&self, element: u32) -> bool {
        is_column_delta_negative(element) || element as usize >= self.count
    }

    #[inline]
    pub fn element(&self, element: usize) -> &OriginalPacket {
        &self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    #[inline]
    pub fn element_mut(&mut self, element: usize) -> &mut OriginalPacket {
        &mut self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    /// Ensure the window covers elements `[0, element_end)`
    pub fn grow(&mut self, element_end: usize) {
        // Lane-count headroom keeps sum accumulation from stepping past
        // the last allocated subwindow
        let needed = (element_end + COLUMN_LANE_COUNT).div_ceil(SUBWINDOW_SIZE);
        while self.subwindows.len() < needed {
            self.subwindows.push(Box::default());
        }
        if element_end > self.count {
            self.count = element_end;
        }
    }

    /// Record presence of `element` and bump the subwindow count
    pub fn mark_present(&mut self, element: usize) {
        let subwindow = &mut self.subwindows[element / SUBWINDOW_SIZE];
        subwindow.got.set(element % SUBWINDOW_SIZE);
        subwindow.got_count += 1;
    }

    /// Mark a column present; true when it was the next expected element
    pub fn mark_got_column(&mut self, column: u32) -> Result<bool> {
        let element = self.column_to_element(column);
        if self.invalid_element(element) {
            self.emergency_disabled = true;
            log::error!("mark_got_column: column {} outside window", column);
            return Err(SiameseError::Disabled);
        }
        let element = element as usize;
        self.mark_present(element);
        Ok(element == self.next_expected_element)
    }

    /// Count absent elements in `[element_start, element_end)`
    pub fn range_lost(&self, element_start: usize, element_end: usize) -> usize {
        if element_start >= element_end {
            return 0;
        }

        let mut lost = 0usize;
        let bit_start = element_start % SUBWINDOW_SIZE;

        // Leading partial subwindow
        let mut whole_start = element_start / SUBWINDOW_SIZE;
        if bit_start > 0 {
            let bit_end = (bit_start + element_end - element_start).min(SUBWINDOW_SIZE);
            let bits = bit_end - bit_start;
            lost += bits - self.subwindows[whole_start].got.range_popcount(bit_start, bit_end);
            whole_start += 1;
        }

        // Whole subwindows via their counts
        let whole_end = element_end / SUBWINDOW_SIZE;
        for i in whole_start..whole_end.max(whole_start) {
            lost += SUBWINDOW_SIZE - self.subwindows[i].got_count;
        }

        // Trailing partial subwindow
        if whole_end >= whole_start {
            let tail_bits = element_end - whole_end * SUBWINDOW_SIZE;
            if tail_bits > 0 {
                lost += tail_bits - self.subwindows[whole_end].got.range_popcount(0, tail_bits);
            }
        }

        lost
    }

    /// First absent element at or after `element_start`, or `count`
    pub fn find_next_lost(&self, element_start: usize) -> usize {
        self.scan(element_start, true)
    }

    /// First present element at or after `element_start`, or `count`
    pub fn find_next_got(&self, element_start: usize) -> usize {
        self.scan(element_start, false)
    }

    fn scan(&self, element_start: usize, lost: bool) -> usize {
        if element_start >= self.count {
            return self.count;
        }

        let subwindow_end = self.count.div_ceil(SUBWINDOW_SIZE);
        let mut subwindow_index = element_start / SUBWINDOW_SIZE;
        let mut bit_index = element_start % SUBWINDOW_SIZE;

        while subwindow_index < subwindow_end {
            let subwindow = &self.subwindows[subwindow_index];
            let may_match = if lost {
                subwindow.got_count < SUBWINDOW_SIZE
            } else {
                subwindow.got_count > 0
            };
            if may_match {
                let found = if lost {
                    subwindow.got.find_first_clear(bit_index)
                } else {
                    subwindow.got.find_first_set(bit_index)
                };
                if found < SUBWINDOW_SIZE {
                    let element = subwindow_index * SUBWINDOW_SIZE + found;
                    return element.min(self.count);
                }
            }
            bit_index = 0;
            subwindow_index += 1;
        }

        self.count
    }

    /// Advance `next_expected_element` to the first loss at or after
    /// `element_start`
    pub fn iterate_next_expected(&mut self, element_start: usize) {
        debug_assert!(element_start > self.next_expected_element);
        if self.next_expected_element >= self.count {
            return;
        }
        self.next_expected_element = self.find_next_lost(element_start);
    }

    // -- running sums -------------------------------------------------------

    /// Smallest element >= `element_start` whose column sits on `lane`
    #[inline]
    pub fn next_lane_element(&self, element_start: usize, lane: usize) -> usize {
        let start_lane = (self.column_start as usize + element_start) % COLUMN_LANE_COUNT;
        element_start + (lane + COLUMN_LANE_COUNT - start_lane) % COLUMN_LANE_COUNT
    }

    /// Restart every sum at `element_start` with empty buffers
    pub fn reset_sums(&mut self, element_start: usize) {
        info!("resetting all running sums to element {}", element_start);
        for lane in 0..COLUMN_LANE_COUNT {
            let lane_start = self.next_lane_element(element_start, lane);
            for sum in &mut self.lanes[lane].sums {
                sum.element_start = lane_start;
                sum.element_end = lane_start;
                sum.buffer.reset();
            }
        }
        self.recovered_columns.clear();
    }

    /// Align sums to `element_start` and pre-grow their buffers
    ///
    /// A sum whose start moved is restarted; one that merely lags keeps its
    /// accumulated prefix. Previously recovered packets are folded into any
    /// sums that skipped them while they were holes.
    pub fn start_sums(&mut self, element_start: usize, buffer_bytes: usize) {
        for lane in 0..COLUMN_LANE_COUNT {
            let lane_start = self.next_lane_element(element_start, lane);
            for sum in &mut self.lanes[lane].sums {
                if sum.buffer.is_empty() {
                    sum.element_end = lane_start;
                } else if sum.element_start != lane_start {
                    debug!(
                        "restarting sum at lane element {} (was {})",
                        lane_start, sum.element_start
                    );
                    sum.element_end = lane_start;
                    sum.buffer.reset();
                }
                sum.element_start = lane_start;
                sum.buffer.grow_zero_padded(buffer_bytes);

                debug_assert_eq!(
                    (sum.element_start + self.column_start as usize) % COLUMN_LANE_COUNT,
                    lane
                );
                debug_assert_eq!(
                    (sum.element_end + self.column_start as usize) % COLUMN_LANE_COUNT,
                    lane
                );
            }
        }

        if !self.recovered_columns.is_empty() {
            self.plug_sum_holes(element_start);
        }
    }

    /// Fold recently recovered packets into sums that already passed them
    fn plug_sum_holes(&mut self, element_start: usize) {
        let recovered = std::mem::take(&mut self.recovered_columns);
        for &column in &recovered {
            let element = self.column_to_element(column);
            if self.invalid_element(element) {
                continue;
            }
            let element = element as usize;
            let lane = (column as usize) % COLUMN_LANE_COUNT;
            let lane_start = self.next_lane_element(element_start, lane);

            for k in 0..COLUMN_SUM_COUNT {
                let covered = {
                    let sum = &self.lanes[lane].sums[k];
                    element >= lane_start && element < sum.element_end
                };
                if !covered {
                    continue;
                }

                let subwindow = &self.subwindows[element / SUBWINDOW_SIZE];
                let original = &subwindow.originals[element % SUBWINDOW_SIZE];
                debug_assert!(original.is_present());
                let scale = match k {
                    0 => 1,
                    1 => column_value(column),
                    _ => column_value_sqr(column),
                };

                let sum = &mut self.lanes[lane].sums[k];
                sum.buffer.grow_zero_padded(original.buffer.len());
                gf_muladd_mem(sum.buffer.as_mut_slice(), scale, original.buffer.as_slice());

                debug!(
                    "plugged sum hole: lane {} sum {} column {}",
                    lane, k, column
                );
            }
        }
    }

    /// Extend sum `(lane, k)` up to `element_end` by accumulating received
    /// originals along the lane
    pub fn accumulate_sum(&mut self, lane: usize, k: usize, element_end: usize) {
        let mut element = {
            let sum = &self.lanes[lane].sums[k];
            debug_assert!(sum.element_start <= sum.element_end);
            sum.element_end
        };
        if element >= element_end {
            return;
        }

        loop {
            debug_assert_eq!(
                (element + self.column_start as usize) % COLUMN_LANE_COUNT,
                lane
            );
            let (present, len) = {
                let original = self.element(element);
                (original.is_present(), original.buffer.len())
            };
            if present {
                let column = self.element_to_column(element);
                let scale = match k {
                    0 => 1,
                    1 => column_value(column),
                    _ => column_value_sqr(column),
                };
                let subwindow = &self.subwindows[element / SUBWINDOW_SIZE];
                let data = subwindow.originals[element % SUBWINDOW_SIZE].buffer.as_slice();
                // Split borrow: sums and subwindows are disjoint fields
                let sum = &mut self.lanes[lane].sums[k];
                sum.buffer.grow_zero_padded(len);
                gf_muladd_mem(sum.buffer.as_mut_slice(), scale, data);
            }

            element += COLUMN_LANE_COUNT;
            if element >= element_end {
                break;
            }
        }

        self.lanes[lane].sums[k].element_end = element;
    }

    /// Current bytes of sum `(lane, k)`
    #[inline]
    pub fn sum_slice(&self, lane: usize, k: usize) -> &[u8] {
        self.lanes[lane].sums[k].buffer.as_slice()
    }

    /// Whether any running sums are active
    #[inline]
    pub fn is_running_sums(&self) -> bool {
        self.sum_column_count != 0
    }

    /// Shift the subwindow ring forward by `removed` elements
    ///
    /// The caller has already rolled the sums past the removal point and
    /// adjusted every dependent element counter.
    pub fn shift_forward(&mut self, removed: usize) {
        debug_assert_eq!(removed % SUBWINDOW_SIZE, 0);
        debug_assert!(removed <= self.next_expected_element);
        let removed_subwindows = removed / SUBWINDOW_SIZE;

        for i in 0..removed_subwindows {
            self.subwindows[i].reset();
        }
        self.subwindows.rotate_left(removed_subwindows);

        self.count -= removed;
        self.column_start = self.element_to_column(removed);
        self.next_expected_element -= removed;

        let mut lane_base = [0usize; COLUMN_LANE_COUNT];
        for (lane, base) in lane_base.iter_mut().enumerate() {
            *base = self.next_lane_element(0, lane);
        }
        for lane in 0..COLUMN_LANE_COUNT {
            for sum in &mut self.lanes[lane].sums {
                if sum.element_start >= removed {
                    sum.element_start -= removed;
                } else {
                    sum.element_start = lane_base[lane];
                }
                debug_assert!(sum.element_end >= removed);
                sum.element_end = sum.element_end.saturating_sub(removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(window: &mut DecoderWindow, elements: &[usize]) {
        let max = elements.iter().copied().max().unwrap_or(0);
        window.grow(max + 1);
        for &e in elements {
            let column = window.element_to_column(e);
            window
                .element_mut(e)
                .initialize(column, &[e as u8, 1, 2])
                .unwrap();
            window.mark_present(e);
        }
    }

    #[test]
    fn test_range_lost_counts_holes() {
        let mut window = DecoderWindow::new();
        window.grow(200);
        fill(&mut window, &[0, 1, 2, 5, 70, 130, 199]);
        assert_eq!(window.range_lost(0, 200), 200 - 7);
        assert_eq!(window.range_lost(0, 3), 0);
        assert_eq!(window.range_lost(3, 6), 2);
        assert_eq!(window.range_lost(64, 128), 63);
        assert_eq!(window.range_lost(199, 200), 0);
    }

    #[test]
    fn test_find_next_lost_and_got() {
        let mut window = DecoderWindow::new();
        window.grow(100);
        fill(&mut window, &[0, 1, 2, 80]);
        assert_eq!(window.find_next_lost(0), 3);
        assert_eq!(window.find_next_lost(80), 81);
        assert_eq!(window.find_next_got(3), 80);
        assert_eq!(window.find_next_got(81), 100);
    }

    #[test]
    fn test_next_expected_advances_over_filled_prefix() {
        let mut window = DecoderWindow::new();
        fill(&mut window, &[0, 1, 2, 4]);
        window.iterate_next_expected(1);
        assert_eq!(window.next_expected_element, 3);
    }

    #[test]
    fn test_next_lane_element_alignment() {
        let mut window = DecoderWindow::new();
        window.column_start = 5;
        for lane in 0..COLUMN_LANE_COUNT {
            let e = window.next_lane_element(10, lane);
            assert!(e >= 10 && e < 10 + COLUMN_LANE_COUNT);
            assert_eq!((window.column_start as usize + e) % COLUMN_LANE_COUNT, lane);
        }
    }

    #[test]
    fn test_accumulate_sum_matches_direct() {
        let mut window = DecoderWindow::new();
        let elements: Vec<usize> = (0..32).collect();
        fill(&mut window, &elements);
        window.reset_sums(0);

        window.accumulate_sum(3, 1, 32);

        let mut expected = Vec::new();
        let mut e = window.next_lane_element(0, 3);
        while e < 32 {
            let original = window.element(e).buffer.as_slice().to_vec();
            if expected.len() < original.len() {
                expected.resize(original.len(), 0);
            }
            let cx = column_value(window.element_to_column(e));
            for (i, &b) in original.iter().enumerate() {
                expected[i] ^= crate::galois::gf_mul(cx, b);
            }
            e += COLUMN_LANE_COUNT;
        }
        assert_eq!(window.sum_slice(3, 1), expected.as_slice());
    }

    #[test]
    fn test_shift_forward_rebases_window() {
        let mut window = DecoderWindow::new();
        let elements: Vec<usize> = (0..130).collect();
        fill(&mut window, &elements);
        window.next_expected_element = 130;
        window.reset_sums(0);
        for lane in 0..COLUMN_LANE_COUNT {
            for k in 0..COLUMN_SUM_COUNT {
                window.accumulate_sum(lane, k, 128);
            }
        }

        window.shift_forward(64);
        assert_eq!(window.count, 66);
        assert_eq!(window.column_start, 64);
        assert_eq!(window.next_expected_element, 66);
        // Element 0 is old element 64
        assert_eq!(window.element(0).column, 64);
        assert!(window.element(0).is_present());
    }
}
