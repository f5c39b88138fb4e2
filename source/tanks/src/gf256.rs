//! GF(2^8) arithmetic
//!
//! Exponent/logarithm table arithmetic over the primitive polynomial
//! `x^8 + x^4 + x^3 + x^2 + 1` (`0x11D`), with `alpha = 2` as generator.
//!
//! Both tables are computed at compile time and live in read-only memory.
//! The exponent table is doubled (512 entries) so that the sum of two
//! logarithms can index it without a modulo.

/// The primitive polynomial, including the `x^8` term.
pub const PRIMITIVE_POLY: u16 = 0x11D;

/// `EXP[i] == alpha^i`, for `i` in `0..512` (periodic with period 255).
pub static EXP: [u8; 512] = build_exp();

/// `LOG[alpha^i] == i`. `LOG[0]` is meaningless and never read.
pub static LOG: [u8; 256] = build_log();

const fn build_exp() -> [u8; 512] {
    let mut exp = [0u8; 512];
    let mut x: u16 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = x as u8;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= PRIMITIVE_POLY;
        }
        i += 1;
    }
    while i < 512 {
        exp[i] = exp[i - 255];
        i += 1;
    }
    exp
}

const fn build_log() -> [u8; 256] {
    let exp = build_exp();
    let mut log = [0u8; 256];
    let mut i = 0;
    while i < 255 {
        log[exp[i] as usize] = i as u8;
        i += 1;
    }
    log
}

/// Stateless namespace for the field operations
pub struct Gf256;

impl Gf256 {
    /// Addition, which is XOR in a field of characteristic 2
    #[inline]
    pub const fn add(a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// Subtraction, identical to addition
    #[inline]
    pub const fn sub(a: u8, b: u8) -> u8 {
        a ^ b
    }

    /// Multiplication
    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        EXP[LOG[a as usize] as usize + LOG[b as usize] as usize]
    }

    /// Division. Dividing by zero yields zero; callers must check the
    /// divisor beforehand when that matters.
    #[inline]
    pub fn div(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        EXP[LOG[a as usize] as usize + 255 - LOG[b as usize] as usize]
    }

    /// `a^n`
    #[inline]
    pub fn pow(a: u8, n: usize) -> u8 {
        if n == 0 {
            return 1;
        }
        if a == 0 {
            return 0;
        }
        EXP[(LOG[a as usize] as usize * n) % 255]
    }

    /// Multiplicative inverse. The inverse of zero is reported as zero.
    #[inline]
    pub fn inv(a: u8) -> u8 {
        if a == 0 {
            return 0;
        }
        EXP[255 - LOG[a as usize] as usize]
    }

    /// `alpha^i`, for any `i`
    #[inline]
    pub fn alpha_pow(i: usize) -> u8 {
        EXP[i % 255]
    }
}
