//! Dense GF(256) recovery matrix with incremental assembly and resumable
//! Gaussian elimination
//!
//! Rows are recovery packets, columns are lost originals inside the checked
//! region. The matrix grows as the region extends: only the new submatrix is
//! generated, and elimination resumes against already-settled pivots instead
//! of starting over. Row storage is row-major with an allocated stride so a
//! column extension does not reshuffle existing rows.

use log::trace;

use crate::error::{Result, SiameseError};
use crate::galois::{gf_div, gf_muladd_mem};
#[cfg(feature = "cauchy")]
use crate::params::{cauchy_element, CAUCHY_MAX_COLUMNS, CAUCHY_THRESHOLD};
use crate::params::{
    column_value, row_value, siamese_matrix_value, subtract_columns, Pcg, PAIR_ADD_RATE,
};

use super::recovery_list::{CheckedRegion, RecoveryList};
use super::window::DecoderWindow;

/// Matrix row bookkeeping
#[derive(Debug, Default, Clone)]
pub struct MatrixRow {
    /// Index into the recovery list
    pub recovery: usize,
    /// Whether Gaussian elimination selected this row as a pivot row
    pub used_for_solution: bool,
    /// Columns this row may have non-zero entries in
    pub column_count: usize,
}

/// Matrix column bookkeeping: one lost original
#[derive(Debug, Default, Clone)]
pub struct MatrixColumn {
    pub column: u32,
    pub element: usize,
    pub cx: u8,
}

/// Recovery matrix state carried across solve attempts
#[derive(Debug, Default)]
pub struct RecoveryMatrix {
    data: Vec<u8>,
    stride: usize,
    pub rows: Vec<MatrixRow>,
    pub columns: Vec<MatrixColumn>,
    pub pivots: Vec<usize>,
    /// Where column population resumes on the next extension
    previous_next_check_start: usize,
    /// First pivot column elimination could not settle; 0 when none failed
    ge_resume_pivot: usize,
}

impl RecoveryMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.stride = 0;
        self.rows.clear();
        self.columns.clear();
        self.pivots.clear();
        self.previous_next_check_start = 0;
        self.ge_resume_pivot = 0;
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> u8 {
        self.data[row * self.stride + col]
    }

    /// Rebase after the window shifted forward
    pub fn decrement_element_counters(&mut self, removed: usize) {
        self.previous_next_check_start = self.previous_next_check_start.saturating_sub(removed);
        for column in &mut self.columns {
            column.element = column.element.saturating_sub(removed);
        }
    }

    /// Grow storage to `rows` x `cols`, keeping previously generated entries
    fn resize_storage(&mut self, rows: usize, cols: usize) {
        if cols <= self.stride {
            let needed = rows * self.stride;
            if self.data.len() < needed {
                self.data.resize(needed, 0);
            }
            return;
        }

        // Column capacity grows with headroom so repeated extensions do not
        // recopy every row each time
        let new_stride = cols.next_power_of_two().max(8);
        let old_rows = if self.stride == 0 {
            0
        } else {
            self.data.len() / self.stride
        };
        let mut new_data = vec![0u8; rows.max(old_rows) * new_stride];
        for r in 0..old_rows {
            let src = &self.data[r * self.stride..r * self.stride + self.stride];
            new_data[r * new_stride..r * new_stride + self.stride].copy_from_slice(src);
        }
        self.data = new_data;
        self.stride = new_stride;
        let needed = rows * self.stride;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    /// Generate (or extend) the matrix for the current checked region
    ///
    /// Tags each lost window slot with its matrix column index so the LDPC
    /// tap replay can address columns directly.
    pub fn generate(
        &mut self,
        window: &mut DecoderWindow,
        recovery: &RecoveryList,
        checked: &CheckedRegion,
    ) -> Result<()> {
        let cols = checked.lost_count;
        let rows = checked.recovery_count;
        debug_assert!(rows >= cols && cols > 0);

        let mut old_rows = self.rows.len();
        let mut old_cols = self.columns.len();
        if rows < old_rows || cols < old_cols {
            // A reset was missed somewhere upstream
            log::error!("recovery matrix shrank without a reset");
            self.reset();
            old_rows = 0;
            old_cols = 0;
        }

        self.resize_storage(rows, cols);
        self.populate_columns(old_cols, cols, window, checked)?;
        self.populate_rows(old_rows, rows, recovery, checked);

        // New rows fill every column; old rows only the newly exposed ones
        let fill_start_row = if cols <= old_cols { old_rows } else { 0 };

        for i in fill_start_row..rows {
            let start_col = if i < old_rows { old_cols } else { 0 };
            self.fill_row(i, start_col, cols, window, recovery);
        }

        self.pivots.resize(rows, 0);
        for (i, pivot) in self.pivots.iter_mut().enumerate().take(rows).skip(old_rows) {
            *pivot = i;
        }

        if self.ge_resume_pivot > 0 {
            self.resume_ge(old_rows, rows);
        }

        Ok(())
    }

    /// Assign matrix columns to newly examined losses
    fn populate_columns(
        &mut self,
        old_cols: usize,
        new_cols: usize,
        window: &mut DecoderWindow,
        checked: &CheckedRegion,
    ) -> Result<()> {
        if old_cols >= new_cols {
            return Ok(());
        }

        self.columns.resize(new_cols, MatrixColumn::default());

        let element_end = checked.next_check_start;
        let mut element = self.previous_next_check_start.max(checked.element_start);
        self.previous_next_check_start = element_end;

        let mut col = old_cols;
        while col < new_cols {
            element = window.find_next_lost(element);
            if element >= element_end {
                // The region promised more losses than the bitmap shows
                window.emergency_disabled = true;
                log::error!("matrix column population ran past the checked region");
                return Err(SiameseError::Disabled);
            }

            let column = window.element_to_column(element);
            self.columns[col] = MatrixColumn {
                column,
                element,
                cx: column_value(column),
            };
            // Tag the lost slot with its matrix column for LDPC replay
            window.element_mut(element).column = col as u32;

            col += 1;
            element += 1;
        }

        Ok(())
    }

    /// Attach newly examined recovery packets as matrix rows
    fn populate_rows(
        &mut self,
        old_rows: usize,
        new_rows: usize,
        recovery: &RecoveryList,
        checked: &CheckedRegion,
    ) {
        if old_rows >= new_rows {
            return;
        }

        let first = checked.first_recovery.unwrap_or(0);
        self.rows.resize(new_rows, MatrixRow::default());
        for (i, row) in self.rows.iter_mut().enumerate().take(new_rows).skip(old_rows) {
            let list_index = first + i;
            row.recovery = list_index;
            row.used_for_solution = false;
            row.column_count = recovery.packet(list_index).lost_count;
            trace!(
                "matrix row {}: start {} sum {} ldpc {}",
                i,
                recovery.packet(list_index).metadata.column_start,
                recovery.packet(list_index).metadata.sum_count,
                recovery.packet(list_index).metadata.ldpc_count
            );
        }
    }

    /// Write coefficients for row `i` over columns `[start_col, cols)`
    fn fill_row(
        &mut self,
        i: usize,
        start_col: usize,
        cols: usize,
        window: &DecoderWindow,
        recovery: &RecoveryList,
    ) {
        let packet = recovery.packet(self.rows[i].recovery);
        let metadata = packet.metadata;
        let row_offset = i * self.stride;

        #[cfg(feature = "cauchy")]
        if metadata.sum_count as usize <= CAUCHY_THRESHOLD {
            for j in start_col..cols {
                let column = self.columns[j].column;
                let element = subtract_columns(column, metadata.column_start);
                let value = if element >= metadata.sum_count {
                    // Past the end of this packet's coverage
                    0
                } else if metadata.row == 0 {
                    1
                } else {
                    // Row identity wraps the same way the sender's counter does
                    cauchy_element(
                        (metadata.row as usize - 1) % crate::params::CAUCHY_MAX_ROWS,
                        (column as usize) % CAUCHY_MAX_COLUMNS,
                    )
                };
                self.data[row_offset + j] = value;
            }
            return;
        }

        // Dense part: the scalar image of the running-sum mix
        for j in start_col..cols {
            let column = self.columns[j].column;
            let element = subtract_columns(column, metadata.column_start);
            self.data[row_offset + j] = if element >= metadata.sum_count {
                0
            } else {
                siamese_matrix_value(column, metadata.row)
            };
        }

        // Sparse part: replay the LDPC taps; taps landing on lost columns
        // toggle the matrix, taps on received data are eliminated later
        let rx = row_value(metadata.row);
        let mut prng = Pcg::new(metadata.row as u64, metadata.ldpc_count as u64);
        let pair_count = metadata.ldpc_count.div_ceil(PAIR_ADD_RATE);
        for _ in 0..pair_count {
            let element1 = packet.element_start + (prng.next() % metadata.ldpc_count) as usize;
            let original1 = window.element(element1);
            if !original1.is_present() {
                let col = original1.column as usize;
                if col >= start_col && col < cols {
                    self.data[row_offset + col] ^= 1;
                }
            }

            let element2 = packet.element_start + (prng.next() % metadata.ldpc_count) as usize;
            let original2 = window.element(element2);
            if !original2.is_present() {
                let col = original2.column as usize;
                if col >= start_col && col < cols {
                    self.data[row_offset + col] ^= rx;
                }
            }
        }
    }

    /// Eliminate new rows against every settled pivot before resuming
    fn resume_ge(&mut self, old_rows: usize, rows: usize) {
        if old_rows >= rows {
            return;
        }

        for pivot_i in 0..self.ge_resume_pivot {
            let pivot_row = self.pivots[pivot_i];
            let val_i = self.get(pivot_row, pivot_i);
            debug_assert_ne!(val_i, 0);
            let pivot_cols = self.rows[pivot_row].column_count;

            for new_row in old_rows..rows {
                debug_assert_eq!(self.pivots[new_row], new_row);
                if self.eliminate_row(pivot_row, new_row, pivot_i, pivot_cols, val_i)
                    && self.rows[new_row].column_count < pivot_cols
                {
                    self.rows[new_row].column_count = pivot_cols;
                }
            }
        }
    }

    /// Reduce `target_row` against `pivot_row` at column `pivot_i`
    ///
    /// The multiplier is stored in place of the eliminated entry: the data
    /// pass later replays the same row operations on the recovery buffers
    /// by reading it back out of the lower triangle.
    ///
    /// Returns true when the target actually had a non-zero entry there.
    fn eliminate_row(
        &mut self,
        pivot_row: usize,
        target_row: usize,
        pivot_i: usize,
        col_limit: usize,
        val_i: u8,
    ) -> bool {
        debug_assert_ne!(pivot_row, target_row);
        let target_val = self.get(target_row, pivot_i);
        if target_val == 0 {
            return false;
        }

        let y = gf_div(target_val, val_i);
        let (pivot_offset, target_offset) = (pivot_row * self.stride, target_row * self.stride);
        self.data[target_offset + pivot_i] = y;

        // Two disjoint row views of the backing storage, past the pivot
        let (src, dst) = if pivot_offset < target_offset {
            let (left, right) = self.data.split_at_mut(target_offset);
            (
                &left[pivot_offset + pivot_i + 1..pivot_offset + col_limit],
                &mut right[pivot_i + 1..col_limit],
            )
        } else {
            let (left, right) = self.data.split_at_mut(pivot_offset);
            (
                &right[pivot_i + 1..col_limit],
                &mut left[target_offset + pivot_i + 1..target_offset + col_limit],
            )
        };

        gf_muladd_mem(dst, y, src);
        true
    }

    /// Solve the matrix; false means a pivot is missing and more recovery
    /// data is required (state is kept so the next attempt resumes)
    pub fn gaussian_elimination(&mut self) -> bool {
        if self.ge_resume_pivot > 0 {
            return self.pivoted_elimination(self.ge_resume_pivot);
        }

        // Fast pass: the matrix is dense, so the diagonal usually carries
        // non-zero values without any row swaps
        let cols = self.columns.len();
        let rows = self.rows.len();

        for pivot_i in 0..cols {
            let val_i = self.get(pivot_i, pivot_i);
            if val_i == 0 {
                return self.pivoted_elimination(pivot_i);
            }

            self.rows[pivot_i].used_for_solution = true;
            let pivot_cols = self.rows[pivot_i].column_count;

            for target in pivot_i + 1..rows {
                self.eliminate_row(pivot_i, target, pivot_i, pivot_cols, val_i);
            }
        }

        true
    }

    /// Elimination with an explicit pivot permutation, resuming at `start`
    fn pivoted_elimination(&mut self, start: usize) -> bool {
        let cols = self.columns.len();
        let rows = self.rows.len();

        for pivot_i in start..cols {
            let mut found = false;

            // The first attempt after the fast pass begins scanning below
            // the failed diagonal row; later columns scan from themselves
            let scan_from = if pivot_i == start && self.ge_resume_pivot == 0 {
                pivot_i + 1
            } else {
                pivot_i
            };

            for pivot_j in scan_from..rows {
                let row_j = self.pivots[pivot_j];
                let val_i = self.get(row_j, pivot_i);
                if val_i == 0 {
                    continue;
                }

                self.pivots.swap(pivot_i, pivot_j);
                self.rows[row_j].used_for_solution = true;
                let pivot_cols = self.rows[row_j].column_count;
                found = true;

                // Nothing below to eliminate once the last column settles
                if pivot_i + 1 >= cols {
                    break;
                }

                for pivot_k in pivot_i + 1..rows {
                    let row_k = self.pivots[pivot_k];
                    if self.eliminate_row(row_j, row_k, pivot_i, pivot_cols, val_i)
                        && self.rows[row_k].column_count < pivot_cols
                    {
                        self.rows[row_k].column_count = pivot_cols;
                    }
                }
                break;
            }

            if !found {
                self.ge_resume_pivot = pivot_i;
                return false;
            }
        }

        self.ge_resume_pivot = 0;
        true
    }
}
