//! Room code allocation.
//!
//! A code is 7 random symbols plus a checksum symbol, all drawn from a
//! 33-symbol alphabet without the easily confused `I`, `O` and `U`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::types::RoomCode;

pub const ALPHABET: &[u8; 33] = b"0123456789ABCDEFGHJKLMNPQRSTVWXYZ";
pub const BASE_LEN: usize = 7;
pub const CODE_LEN: usize = BASE_LEN + 1;

/// Modulus of the rolling checksum. Prime, and smaller than the alphabet
/// so every result maps to a symbol.
const CHECKSUM_MOD: usize = 31;

/// Position of `symbol` in the alphabet.
#[inline]
pub fn symbol_index(symbol: u8) -> Option<usize> {
    ALPHABET.iter().position(|&c| c == symbol)
}

/// Checksum symbol of a base: a rolling weighted sum of symbol indices.
///
/// Symbols outside the alphabet weigh zero; parsed codes never contain any.
pub fn checksum(base: &[u8; BASE_LEN]) -> u8 {
    let sum = base.iter().fold(0usize, |acc, &symbol| {
        let index = symbol_index(symbol).unwrap_or(0);
        (acc * ALPHABET.len() + index) % CHECKSUM_MOD
    });
    ALPHABET[sum % ALPHABET.len()]
}

/// Draws collision-free room codes.
pub struct CodeAllocator {
    rng: StdRng,
}

impl Default for CodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeAllocator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    /// Deterministic allocator, for tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws bases until one is not `taken` by an open room, then appends its checksum.
    pub fn allocate(&mut self, taken: impl Fn(&[u8; BASE_LEN]) -> bool) -> RoomCode {
        loop {
            let base = self.draw_base();
            if !taken(&base) {
                return RoomCode::from_base(base);
            }
        }
    }

    fn draw_base(&mut self) -> [u8; BASE_LEN] {
        let mut base = [0u8; BASE_LEN];
        for symbol in &mut base {
            *symbol = ALPHABET[self.rng.random_range(0..ALPHABET.len())];
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn alphabet_has_no_ambiguous_symbols() {
        assert_eq!(ALPHABET.len(), 33);
        for c in [b'I', b'O', b'U'] {
            assert!(!ALPHABET.contains(&c));
        }
        let unique: HashSet<_> = ALPHABET.iter().collect();
        assert_eq!(unique.len(), ALPHABET.len());
    }

    #[test]
    fn allocated_codes_are_well_formed() {
        let mut allocator = CodeAllocator::new();
        for _ in 0..500 {
            let code = allocator.allocate(|_| false);
            let s = code.as_str().as_bytes();
            assert_eq!(s.len(), CODE_LEN);
            assert!(s.iter().all(|c| ALPHABET.contains(c)));

            let mut base = [0u8; BASE_LEN];
            base.copy_from_slice(&s[..BASE_LEN]);
            assert_eq!(s[BASE_LEN], independent_checksum(&base));
        }
    }

    #[test]
    fn checksum_is_pure() {
        let base = *b"7KQ2ZX9";
        assert_eq!(checksum(&base), checksum(&base));
    }

    #[test]
    fn checksum_of_all_zero_base_is_zero() {
        assert_eq!(checksum(b"0000000"), b'0');
    }

    #[test]
    fn checksum_detects_single_symbol_change() {
        assert_ne!(checksum(b"ABCDEFG"), checksum(b"ABCDEFH"));
    }

    #[test]
    fn allocate_redraws_on_taken_base() {
        let first = CodeAllocator::with_seed(42).allocate(|_| false);
        let taken = first.base();

        let second = CodeAllocator::with_seed(42).allocate(|base| *base == taken);
        assert_ne!(second, first);
        assert_ne!(second.base(), taken);
    }

    #[test]
    fn allocate_avoids_every_open_room() {
        let mut allocator = CodeAllocator::with_seed(7);
        let mut open = HashSet::new();
        for _ in 0..1000 {
            let code = allocator.allocate(|base| open.contains(base));
            assert!(open.insert(code.base()));
        }
    }

    /// Recomputes the checksum with plain integer arithmetic.
    fn independent_checksum(base: &[u8; BASE_LEN]) -> u8 {
        let digits = "0123456789ABCDEFGHJKLMNPQRSTVWXYZ";
        let mut a: u64 = 0;
        for &c in base {
            let idx = digits.find(c as char).unwrap() as u64;
            a = (a * 33 + idx) % 31;
        }
        digits.as_bytes()[a as usize]
    }
}
