//! Reed-Solomon error correcting code
//!
//! A systematic RS code over [GF(2^8)][crate::gf256], with `ECC` parity
//! bytes computed over `DATA` message bytes. The generator polynomial has
//! the roots `alpha^0 ..= alpha^(ECC - 1)`.
//!
//! Up to `ECC / 2` corrupted bytes ("symbol errors") are corrected, anywhere
//! in the message or the parity. Beyond that, [`ReedSolomon::decode`] reports
//! [`Uncorrectable`] instead of guessing.
//!
//! ## Codeword layout
//!
//! The codeword polynomial has `data[0]` as its highest degree coefficient
//! and `parity[0]` as its constant term:
//!
//! ```text
//! degree:  N-1 ... ECC   ECC-1 ...   0
//!          data[0..DATA] parity[ECC-1..=0]
//! ```
//!
//! where `N = DATA + ECC`, which must not exceed 255.
//!
//! ## Concurrency
//!
//! The codec holds only its generator polynomial. Every scratch buffer used
//! by [`ReedSolomon::decode`] lives on the caller's stack, so any number of
//! tasks may encode and decode at the same time.

use crate::gf256::Gf256;

/// Largest supported parity length. Bounds the decoder's stack scratch.
pub const MAX_PARITY: usize = 64;

/// The received block holds more errors than the code can correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-logging", derive(defmt::Format))]
pub struct Uncorrectable;

/// Systematic Reed-Solomon codec for `DATA` message bytes and `ECC` parity bytes
pub struct ReedSolomon<const DATA: usize, const ECC: usize> {
    // Low order first. The monic `x^ECC` term is implied.
    generator: [u8; ECC],
}

impl<const DATA: usize, const ECC: usize> ReedSolomon<DATA, ECC> {
    /// Total block length, message plus parity
    pub const BLOCK_LEN: usize = DATA + ECC;

    /// Number of symbol errors the code is guaranteed to correct
    pub const CAPACITY: usize = ECC / 2;

    const PARAMS_OK: () = assert!(
        DATA > 0 && ECC > 0 && ECC % 2 == 0 && ECC <= MAX_PARITY && DATA + ECC <= 255,
        "invalid Reed-Solomon parameters",
    );

    /// Build the codec, expanding the generator polynomial
    /// `(x + alpha^0)(x + alpha^1)...(x + alpha^(ECC-1))`.
    pub fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::PARAMS_OK;

        let mut g = [0u8; MAX_PARITY + 1];
        g[0] = 1;
        for i in 0..ECC {
            let root = Gf256::alpha_pow(i);
            // g(x) <- g(x) * (x + root)
            for j in (1..=i + 1).rev() {
                g[j] = Gf256::add(g[j - 1], Gf256::mul(g[j], root));
            }
            g[0] = Gf256::mul(g[0], root);
        }

        let mut generator = [0u8; ECC];
        generator.copy_from_slice(&g[..ECC]);
        Self { generator }
    }

    /// Compute the parity of `data` into `parity`.
    pub fn encode(&self, data: &[u8; DATA], parity: &mut [u8; ECC]) {
        parity.fill(0);
        for &byte in data.iter() {
            let feedback = Gf256::add(byte, parity[ECC - 1]);
            parity.copy_within(0..ECC - 1, 1);
            parity[0] = 0;
            if feedback != 0 {
                parity
                    .iter_mut()
                    .zip(self.generator.iter())
                    .for_each(|(p, g)| *p = Gf256::add(*p, Gf256::mul(*g, feedback)));
            }
        }
    }

    /// Check `data` and `parity`, correcting them in place.
    ///
    /// Returns the number of corrected bytes (zero for an intact block), or
    /// [`Uncorrectable`]. On error, both buffers are left as received.
    pub fn decode(&self, data: &mut [u8; DATA], parity: &mut [u8; ECC]) -> Result<usize, Uncorrectable> {
        let mut syndromes = [0u8; MAX_PARITY];
        if !Self::syndromes(data, parity, &mut syndromes) {
            return Ok(0);
        }

        // Berlekamp-Massey: find the error locator lambda(x) of degree `len`
        let mut lambda = [0u8; MAX_PARITY + 1];
        let mut prev = [0u8; MAX_PARITY + 1];
        let mut scratch = [0u8; MAX_PARITY + 1];
        lambda[0] = 1;
        prev[0] = 1;
        let mut len = 0usize;
        let mut shift = 1usize;
        let mut prev_discrepancy = 1u8;

        for n in 0..ECC {
            let mut d = syndromes[n];
            for i in 1..=len {
                d = Gf256::add(d, Gf256::mul(lambda[i], syndromes[n - i]));
            }

            if d == 0 {
                shift += 1;
                continue;
            }

            let coef = Gf256::div(d, prev_discrepancy);
            if 2 * len <= n {
                scratch.copy_from_slice(&lambda);
                for i in 0..=ECC - shift {
                    lambda[i + shift] = Gf256::add(lambda[i + shift], Gf256::mul(coef, prev[i]));
                }
                len = n + 1 - len;
                prev.copy_from_slice(&scratch);
                prev_discrepancy = d;
                shift = 1;
            } else {
                for i in 0..=ECC - shift {
                    lambda[i + shift] = Gf256::add(lambda[i + shift], Gf256::mul(coef, prev[i]));
                }
                shift += 1;
            }
        }

        if len == 0 || len > Self::CAPACITY {
            return Err(Uncorrectable);
        }

        // Chien search: position `p` is in error iff lambda(alpha^-p) == 0
        let mut positions = [0u8; MAX_PARITY];
        let mut found = 0usize;
        for p in 0..Self::BLOCK_LEN {
            let x_inv = Gf256::alpha_pow(255 - p);
            if Self::eval(&lambda[..=len], x_inv) == 0 {
                if found == len {
                    return Err(Uncorrectable);
                }
                positions[found] = p as u8;
                found += 1;
            }
        }
        if found != len {
            return Err(Uncorrectable);
        }

        // Error evaluator omega(x) = S(x) * lambda(x) mod x^ECC
        let mut omega = [0u8; MAX_PARITY];
        for i in 0..ECC {
            let mut acc = 0u8;
            for j in 0..=len.min(i) {
                acc = Gf256::add(acc, Gf256::mul(syndromes[i - j], lambda[j]));
            }
            omega[i] = acc;
        }

        // Forney: e = X * omega(X^-1) / lambda'(X^-1). The leading X comes from
        // the first generator root being alpha^0.
        let mut magnitudes = [0u8; MAX_PARITY];
        for (k, &pos) in positions[..found].iter().enumerate() {
            let x = Gf256::alpha_pow(pos as usize);
            let x_inv = Gf256::inv(x);

            let num = Self::eval(&omega[..ECC], x_inv);
            let mut den = 0u8;
            for i in (1..=len).step_by(2) {
                den = Gf256::add(den, Gf256::mul(lambda[i], Gf256::pow(x_inv, i - 1)));
            }
            if den == 0 {
                return Err(Uncorrectable);
            }
            magnitudes[k] = Gf256::div(Gf256::mul(x, num), den);
        }

        Self::apply(data, parity, &positions[..found], &magnitudes[..found]);

        // Never hand back a block that is still not a codeword
        if Self::syndromes(data, parity, &mut syndromes) {
            Self::apply(data, parity, &positions[..found], &magnitudes[..found]);
            return Err(Uncorrectable);
        }

        Ok(found)
    }

    /// Computes the syndromes, returns `true` if any of them is nonzero.
    fn syndromes(data: &[u8; DATA], parity: &[u8; ECC], out: &mut [u8; MAX_PARITY]) -> bool {
        let mut any = false;
        for (i, s) in out.iter_mut().take(ECC).enumerate() {
            let alpha_i = Gf256::alpha_pow(i);
            let mut val = 0u8;
            for &b in data.iter().chain(parity.iter().rev()) {
                val = Gf256::add(Gf256::mul(val, alpha_i), b);
            }
            *s = val;
            any |= val != 0;
        }
        any
    }

    /// Evaluates a low-order-first polynomial at `x` (Horner)
    fn eval(poly: &[u8], x: u8) -> u8 {
        poly.iter()
            .rev()
            .fold(0u8, |acc, &c| Gf256::add(Gf256::mul(acc, x), c))
    }

    /// XORs each magnitude into the byte at the matching codeword degree
    fn apply(data: &mut [u8; DATA], parity: &mut [u8; ECC], positions: &[u8], magnitudes: &[u8]) {
        for (&pos, &mag) in positions.iter().zip(magnitudes.iter()) {
            let pos = pos as usize;
            if pos < ECC {
                parity[pos] ^= mag;
            } else {
                data[Self::BLOCK_LEN - 1 - pos] ^= mag;
            }
        }
    }
}

impl<const DATA: usize, const ECC: usize> Default for ReedSolomon<DATA, ECC> {
    fn default() -> Self {
        Self::new()
    }
}
