//! Received recovery packets, sorted, plus the checked-region cache
//!
//! The list is kept ordered by ascending `(element_end, column_start)` with
//! the broader sum region (smaller start) sorting later on an end tie, so
//! the left and right edges of the sum regions are monotonic along the list.
//! That monotonicity is what lets elimination consume the running sums in
//! encoder order. Insertion walks from the tail because recovery packets
//! almost always arrive in order.

use log::debug;

use crate::buffer::GrowingBuffer;
use crate::packet::RecoveryMetadata;
use crate::params::{is_column_delta_negative, subtract_columns};

/// One recovery packet held for a future solve
#[derive(Debug)]
pub struct RecoveryPacket {
    /// Recovery symbol bytes (footer stripped)
    pub buffer: GrowingBuffer,
    pub metadata: RecoveryMetadata,
    /// Window element where the packet's tap region begins
    pub element_start: usize,
    /// One past the last window element the packet covers
    pub element_end: usize,
    /// Losses this packet faces, filled in as the checked region extends
    pub lost_count: usize,
}

/// Compact copy of the newest recovery packet's removal-relevant fields,
/// consulted when the list is empty
#[derive(Debug, Default, Clone, Copy)]
pub struct RemovalPoint {
    pub first_kept_element: usize,
    pub initial_recovery_bytes: usize,
    pub sum_column_count: u32,
    pub sum_start_column: u32,
}

/// Where an insertion landed
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Appended past every existing packet
    AtTail,
    /// Landed before at least one existing packet
    Middle,
    /// Identical packet already stored; nothing inserted
    Duplicate,
}

/// Sorted list of received recovery packets
#[derive(Debug, Default)]
pub struct RecoveryList {
    packets: Vec<RecoveryPacket>,
    /// Valid whenever at least one recovery packet has ever been accepted
    pub last_recovery: Option<RemovalPoint>,
}

impl RecoveryList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    #[inline]
    pub fn packet(&self, index: usize) -> &RecoveryPacket {
        &self.packets[index]
    }

    #[inline]
    pub fn packet_mut(&mut self, index: usize) -> &mut RecoveryPacket {
        &mut self.packets[index]
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &RecoveryPacket> {
        self.packets.iter()
    }

    /// Mutable access to two distinct packets at once
    pub fn pair_mut(&mut self, a: usize, b: usize) -> (&mut RecoveryPacket, &mut RecoveryPacket) {
        debug_assert_ne!(a, b);
        if a < b {
            let (left, right) = self.packets.split_at_mut(b);
            (&mut left[a], &mut right[0])
        } else {
            let (left, right) = self.packets.split_at_mut(a);
            (&mut right[0], &mut left[b])
        }
    }

    /// Insert in sorted position, walking from the tail
    ///
    /// Full `(element_end, column_start)` ties keep insertion order, so the
    /// earliest-received packet stays nearest the head and a replayed packet
    /// is recognized rather than stored twice.
    pub fn insert(&mut self, packet: RecoveryPacket) -> InsertOutcome {
        let end = packet.element_end;
        let start_column = packet.metadata.column_start;

        let mut position = self.packets.len();
        while position > 0 {
            let prev = &self.packets[position - 1];
            if end > prev.element_end {
                break;
            }
            if end == prev.element_end {
                let start_delta = subtract_columns(start_column, prev.metadata.column_start);
                if start_delta == 0 || is_column_delta_negative(start_delta) {
                    break;
                }
            }
            position -= 1;
        }

        // Equal-key packets form a contiguous run ending at `position`;
        // check it for an exact replay
        let mut probe = position;
        while probe > 0 {
            let prev = &self.packets[probe - 1];
            if prev.element_end != end || prev.metadata.column_start != start_column {
                break;
            }
            if prev.metadata == packet.metadata {
                debug!(
                    "ignoring replayed recovery packet: row {} start {}",
                    packet.metadata.row, start_column
                );
                return InsertOutcome::Duplicate;
            }
            probe -= 1;
        }

        self.last_recovery = Some(RemovalPoint {
            first_kept_element: packet.element_start,
            initial_recovery_bytes: packet.buffer.len(),
            sum_column_count: packet.metadata.sum_count,
            sum_start_column: packet.metadata.column_start,
        });

        let at_tail = position == self.packets.len();
        self.packets.insert(position, packet);
        if at_tail {
            InsertOutcome::AtTail
        } else {
            InsertOutcome::Middle
        }
    }

    /// Drop the head packet (the one with the smallest coverage end)
    pub fn pop_front(&mut self) {
        if !self.packets.is_empty() {
            self.packets.remove(0);
        }
    }

    /// Drop every packet whose coverage ends at or before `element`
    ///
    /// Returns how many packets were deleted.
    pub fn delete_packets_before(&mut self, element: usize) -> usize {
        let keep_from = self
            .packets
            .iter()
            .position(|p| p.element_end > element)
            .unwrap_or(self.packets.len());
        self.packets.drain(..keep_from);
        keep_from
    }

    /// Rebase element counters after the window shifted forward
    pub fn decrement_element_counters(&mut self, removed: usize) {
        for packet in &mut self.packets {
            debug_assert!(packet.element_start >= removed && packet.element_end >= removed);
            packet.element_start = packet.element_start.saturating_sub(removed);
            packet.element_end = packet.element_end.saturating_sub(removed);
        }

        if let Some(point) = &mut self.last_recovery {
            if point.first_kept_element >= removed {
                point.first_kept_element -= removed;
            } else {
                log::warn!("window removal clipped the cached removal point");
                self.last_recovery = None;
            }
        }
    }
}

/// Cached examination state over a prefix of the recovery list
///
/// `recovery_count` packets starting at list index `first_recovery` have
/// been walked, facing `lost_count` losses in
/// `[element_start, next_check_start)`. A solve is attempted only once
/// `recovery_count >= lost_count`, and `solve_failed` suppresses retries
/// until new data arrives.
#[derive(Debug, Default)]
pub struct CheckedRegion {
    pub element_start: usize,
    pub next_check_start: usize,
    pub first_recovery: Option<usize>,
    pub last_recovery: Option<usize>,
    pub recovery_count: usize,
    pub lost_count: usize,
    pub solve_failed: bool,
}

impl CheckedRegion {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.last_recovery.is_some()
    }

    /// Whether `element` lies inside the examined span
    #[inline]
    pub fn contains_element(&self, element: usize) -> bool {
        self.is_active() && element >= self.element_start && element < self.next_check_start
    }

    /// Rebase after the window shifted forward; resets when clipped
    pub fn decrement_element_counters(&mut self, removed: usize) -> bool {
        if !self.is_active() {
            return false;
        }
        if self.element_start < removed || self.next_check_start < removed {
            log::warn!("window removal clipped the checked region");
            self.reset();
            return true;
        }
        self.element_start -= removed;
        self.next_check_start -= removed;
        false
    }
}
