//! Siamese: streaming forward-error-correction over GF(256)
//!
//! A sliding-window FEC codec for delivering an unbounded, sequentially
//! numbered packet stream across a lossy, reordering channel. The sender
//! emits original packets plus on-demand recovery packets; the receiver
//! delivers originals in order and reconstructs losses once enough recovery
//! has arrived.
//!
//! # Why running sums
//!
//! Block codes pay O(window) work per recovery symbol. Here each of 8 lanes
//! maintains 3 running sums (data, CX·data, CX²·data) as originals are
//! added, so producing a recovery packet is O(lanes · payload) — independent
//! of how many packets the window covers. A sparse layer of pseudorandom
//! taps plus a per-row multiplier keeps the recovery rows linearly
//! independent enough to solve, and tiny windows can fall back to exact
//! parity/Cauchy rows (feature `cauchy`, on by default).
//!
//! # Example
//!
//! ```
//! use siamese::{Decoder, Encoder, SiameseError};
//!
//! let mut encoder = Encoder::new();
//! let mut decoder = Decoder::new();
//!
//! let columns: Vec<u32> = (0..4u8)
//!     .map(|i| encoder.add(&[i, i, i]).unwrap())
//!     .collect();
//!
//! // Lose packet 2; deliver the rest
//! for &column in &columns {
//!     if column != 2 {
//!         decoder.add_original(column, &[column as u8; 3]).unwrap();
//!     }
//! }
//!
//! // One recovery packet covers the single loss
//! let recovery = encoder.encode().unwrap();
//! decoder.add_recovery(&recovery).unwrap();
//!
//! let recovered = decoder.decode().unwrap();
//! assert_eq!(recovered.len(), 1);
//! assert_eq!(recovered[0].column, 2);
//! assert_eq!(recovered[0].data, vec![2, 2, 2]);
//! assert_eq!(decoder.get(2).unwrap(), &[2, 2, 2]);
//! assert_eq!(decoder.decode(), Err(SiameseError::NeedMoreData));
//! ```
//!
//! # Threading
//!
//! Encoder and decoder are single-threaded cooperative state machines with
//! no interior locking; wrap an instance in a mutex to share it. The only
//! process-wide state is the GF(256) table set, initialized once.

pub mod bitfield;
pub mod buffer;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod galois;
pub mod packet;
pub mod params;
pub mod serializers;

pub use decoder::{Decoder, DecoderStats};
pub use encoder::{Encoder, EncoderStats, PendingOriginal};
pub use error::{Result, SiameseError};
pub use packet::{RecoveredPacket, RecoveryMetadata};
