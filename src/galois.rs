//! Galois Field GF(2^8) arithmetic for recovery symbol generation
//!
//! This module implements 8-bit Galois Field arithmetic over the polynomial
//! 0x11D (x⁸ + x⁴ + x³ + x² + 1) with generator 2. Scalar operations go
//! through process-wide log/exp tables; buffer operations apply the same
//! arithmetic across byte slices, which is where nearly all of the codec's
//! cycles go (recovery rows are linear combinations of whole packets).

/// GF(2^8) reduction polynomial: 0x11D (x⁸ + x⁴ + x³ + x² + 1)
const GF_GENERATOR: u32 = 0x11D;

const FIELD_SIZE: usize = 256;
const FIELD_ORDER: usize = 255;

/// Precomputed logarithm and exponential tables
///
/// Log values are stored as u16 so `log(a) + log(b)` never overflows an
/// index; the exp table is doubled to skip the modulo.
pub struct GaloisField {
    log_table: [u16; FIELD_SIZE],
    exp_table: [u8; FIELD_ORDER * 2],
}

impl GaloisField {
    fn new() -> Self {
        let mut gf = GaloisField {
            log_table: [0; FIELD_SIZE],
            exp_table: [0; FIELD_ORDER * 2],
        };
        gf.build_tables();
        gf
    }

    fn build_tables(&mut self) {
        let mut value = 1u32;

        for i in 0..FIELD_ORDER {
            self.exp_table[i] = value as u8;
            self.log_table[value as usize] = i as u16;

            value <<= 1;
            if value & 0x100 != 0 {
                value ^= GF_GENERATOR;
            }
        }

        for i in FIELD_ORDER..FIELD_ORDER * 2 {
            self.exp_table[i] = self.exp_table[i - FIELD_ORDER];
        }

        // log(0) is undefined; park it on an unused sentinel
        self.log_table[0] = FIELD_ORDER as u16;
    }

    /// Add two elements - this is just XOR
    #[inline]
    pub fn add(&self, a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// Multiply two elements
    #[inline]
    pub fn mul(&self, a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }

        let log_a = self.log_table[a as usize] as usize;
        let log_b = self.log_table[b as usize] as usize;
        self.exp_table[log_a + log_b]
    }

    /// Divide two elements
    ///
    /// # Panics
    ///
    /// Panics when `b` is zero. The codec never divides by a zero pivot by
    /// construction, so reaching this is a logic error.
    #[inline]
    pub fn div(&self, a: u8, b: u8) -> u8 {
        if b == 0 {
            panic!("division by zero in Galois field");
        }
        if a == 0 {
            return 0;
        }

        let log_a = self.log_table[a as usize] as usize;
        let log_b = self.log_table[b as usize] as usize;
        let log_result = if log_a >= log_b {
            log_a - log_b
        } else {
            log_a + FIELD_ORDER - log_b
        };

        self.exp_table[log_result]
    }

    /// Square an element
    #[inline]
    pub fn sqr(&self, a: u8) -> u8 {
        self.mul(a, a)
    }

    /// Multiplicative inverse
    #[inline]
    pub fn inv(&self, a: u8) -> u8 {
        if a == 0 {
            panic!("cannot invert zero in Galois field");
        }

        let log_a = self.log_table[a as usize] as usize;
        self.exp_table[FIELD_ORDER - log_a]
    }
}

use std::sync::OnceLock;

/// Global field instance; initialization is idempotent
static GALOIS_FIELD: OnceLock<GaloisField> = OnceLock::new();

/// Get the global Galois Field instance
pub fn galois_field() -> &'static GaloisField {
    GALOIS_FIELD.get_or_init(GaloisField::new)
}

/// Convenience functions using the global field
#[inline]
pub fn gf_add(a: u8, b: u8) -> u8 {
    galois_field().add(a, b)
}

#[inline]
pub fn gf_mul(a: u8, b: u8) -> u8 {
    galois_field().mul(a, b)
}

#[inline]
pub fn gf_div(a: u8, b: u8) -> u8 {
    galois_field().div(a, b)
}

#[inline]
pub fn gf_sqr(a: u8) -> u8 {
    galois_field().sqr(a)
}

#[inline]
pub fn gf_inv(a: u8) -> u8 {
    galois_field().inv(a)
}

/// `dst[i] ^= src[i]` over the common prefix of the two slices
#[inline]
pub fn gf_add_mem(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    for i in 0..n {
        dst[i] ^= src[i];
    }
}

/// `dst[i] ^= c * src[i]` over the common prefix of the two slices
pub fn gf_muladd_mem(dst: &mut [u8], c: u8, src: &[u8]) {
    if c == 0 {
        return;
    }
    if c == 1 {
        gf_add_mem(dst, src);
        return;
    }

    let gf = galois_field();
    let log_c = gf.log_table[c as usize] as usize;
    let n = dst.len().min(src.len());
    for i in 0..n {
        let s = src[i];
        if s != 0 {
            dst[i] ^= gf.exp_table[log_c + gf.log_table[s as usize] as usize];
        }
    }
}

/// `dst[i] /= c` in place; `c` must be non-zero
pub fn gf_div_mem(dst: &mut [u8], c: u8) {
    if c == 1 {
        return;
    }

    let gf = galois_field();
    let inv_c = gf.inv(c);
    let log_inv = gf.log_table[inv_c as usize] as usize;
    for d in dst.iter_mut() {
        let v = *d;
        if v != 0 {
            *d = gf.exp_table[log_inv + gf.log_table[v as usize] as usize];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_basic_operations() {
        let gf = galois_field();

        assert_eq!(gf.add(5, 3), 5 ^ 3);

        // Multiplicative identity
        assert_eq!(gf.mul(1, 42), 42);
        assert_eq!(gf.mul(42, 1), 42);

        // Additive identity
        assert_eq!(gf.add(0, 42), 42);

        // Zero absorbs
        for a in 0..=255u8 {
            assert_eq!(gf.mul(a, 0), 0);
            assert_eq!(gf.mul(0, a), 0);
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let gf = galois_field();
        for a in 1..=255u8 {
            let inv = gf.inv(a);
            assert_eq!(gf.mul(a, inv), 1, "failed for a = {}", a);
        }
    }

    #[test]
    fn test_division() {
        let gf = galois_field();
        for a in 1..20u8 {
            for b in 1..20u8 {
                let q = gf.div(a, b);
                assert_eq!(gf.mul(q, b), a, "failed for a = {}, b = {}", a, b);
            }
        }
    }

    #[test]
    fn test_square_matches_mul() {
        let gf = galois_field();
        for a in 0..=255u8 {
            assert_eq!(gf.sqr(a), gf.mul(a, a));
        }
    }

    #[test]
    fn test_muladd_mem_matches_scalar() {
        let src: Vec<u8> = (0..64u8).map(|i| i.wrapping_mul(37).wrapping_add(5)).collect();
        let mut dst = vec![0x5Au8; 64];
        let expected: Vec<u8> = dst
            .iter()
            .zip(src.iter())
            .map(|(&d, &s)| d ^ gf_mul(0xC3, s))
            .collect();

        gf_muladd_mem(&mut dst, 0xC3, &src);
        assert_eq!(dst, expected);
    }

    #[test]
    fn test_muladd_mem_identity_scalar() {
        let src = vec![1u8, 2, 3, 4];
        let mut dst = vec![0u8; 4];
        gf_muladd_mem(&mut dst, 1, &src);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_div_mem_undoes_muladd() {
        let src: Vec<u8> = (0..32u8).map(|i| i.wrapping_mul(11).wrapping_add(1)).collect();
        let mut buf = vec![0u8; 32];
        gf_muladd_mem(&mut buf, 0x47, &src);
        gf_div_mem(&mut buf, 0x47);
        assert_eq!(buf, src);
    }
}
