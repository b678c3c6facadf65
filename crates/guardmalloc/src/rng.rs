//! Per-arena random byte source. A 32-byte buffer refilled from the OS
//! cryptographic RNG; on each refill a randomized prefix is discarded so two
//! arenas seeded from the same entropy observation diverge immediately.

use crate::platform;

const RNG_BYTES: usize = 32;

#[repr(C)]
pub struct ArenaRng {
    bytes: [u8; RNG_BYTES],
    used: usize,
}

impl ArenaRng {
    pub const fn new() -> Self {
        ArenaRng {
            bytes: [0; RNG_BYTES],
            used: RNG_BYTES,
        }
    }

    /// Refill the buffer and discard a randomized prefix (the +1 accounts for
    /// consuming `bytes[0]` as the prefix length).
    pub fn refill(&mut self) {
        platform::random_bytes(&mut self.bytes);
        self.used = 1 + (self.bytes[0] as usize) % (RNG_BYTES / 2);
    }

    /// One random byte.
    #[inline]
    pub fn byte(&mut self) -> u8 {
        if self.used >= RNG_BYTES {
            self.refill();
        }
        let x = self.bytes[self.used];
        self.used += 1;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refill_discards_randomized_prefix() {
        let mut rng = ArenaRng::new();
        rng.refill();
        assert!(rng.used >= 1);
        assert!(rng.used <= RNG_BYTES / 2);
    }

    #[test]
    fn byte_draws_advance_and_rerefill() {
        let mut rng = ArenaRng::new();
        // Far more draws than one buffer holds; must never panic or repeat
        // the exhausted state.
        for _ in 0..1000 {
            let _ = rng.byte();
            assert!(rng.used <= RNG_BYTES);
        }
    }
}
