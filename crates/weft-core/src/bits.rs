// Copyright 2025 eraflo
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bit-scan primitives on fixed-width words.
//!
//! Every lock-free structure in the runtime (chunk areas, task rings, delay
//! sectors) tracks occupancy in 64-bit words and claims entries by scanning
//! for a clear bit and publishing it with a compare-and-swap.

use std::sync::atomic::{AtomicU64, Ordering};

/// Scan and mask operations on an unsigned machine word.
///
/// Bit `0` is the least significant bit. Scans return `None` when no bit
/// matches instead of an out-of-range sentinel.
pub trait BitWord: Copy + Eq {
    /// Width of the word in bits.
    const WIDTH: u32;

    /// Index of the lowest set bit.
    fn find_lsb_set(self) -> Option<u32>;
    /// Index of the highest set bit.
    fn find_msb_set(self) -> Option<u32>;
    /// Index of the lowest clear bit.
    fn find_lsb_zero(self) -> Option<u32>;
    /// Index of the highest clear bit.
    fn find_msb_zero(self) -> Option<u32>;
    /// Returns the word with `bit` set.
    fn with_bit(self, bit: u32) -> Self;
    /// Returns the word with `bit` cleared.
    fn without_bit(self, bit: u32) -> Self;
    /// Whether `bit` is set.
    fn has_bit(self, bit: u32) -> bool;
}

macro_rules! impl_bit_word {
    ($($ty:ty),* $(,)?) => {
        $(
            impl BitWord for $ty {
                const WIDTH: u32 = <$ty>::BITS;

                #[inline]
                fn find_lsb_set(self) -> Option<u32> {
                    (self != 0).then(|| self.trailing_zeros())
                }

                #[inline]
                fn find_msb_set(self) -> Option<u32> {
                    (self != 0).then(|| Self::WIDTH - 1 - self.leading_zeros())
                }

                #[inline]
                fn find_lsb_zero(self) -> Option<u32> {
                    (!self).find_lsb_set()
                }

                #[inline]
                fn find_msb_zero(self) -> Option<u32> {
                    (!self).find_msb_set()
                }

                #[inline]
                fn with_bit(self, bit: u32) -> Self {
                    debug_assert!(bit < Self::WIDTH);
                    self | (1 << bit)
                }

                #[inline]
                fn without_bit(self, bit: u32) -> Self {
                    debug_assert!(bit < Self::WIDTH);
                    self & !(1 << bit)
                }

                #[inline]
                fn has_bit(self, bit: u32) -> bool {
                    bit < Self::WIDTH && self & (1 << bit) != 0
                }
            }
        )*
    };
}

impl_bit_word!(u8, u16, u32, u64);

/// A mask with the lowest `count` bits set. `count` may be the full width.
#[inline]
pub fn low_mask(count: u32) -> u64 {
    match count {
        0 => 0,
        n if n >= 64 => u64::MAX,
        n => (1u64 << n) - 1,
    }
}

/// Claims the lowest clear bit of `word` that is not also set in `skip`.
///
/// Optimistic claim loop: load, pick a bit, publish it with a CAS and retry
/// on contention. Each failed CAS means another thread changed the word, so
/// the loop ends either with a claimed bit or once no eligible clear bit is
/// left (`None`).
pub fn claim_lowest_zero(word: &AtomicU64, skip: u64) -> Option<u32> {
    let mut current = word.load(Ordering::Relaxed);
    loop {
        let bit = (current | skip).find_lsb_zero()?;
        match word.compare_exchange_weak(
            current,
            current.with_bit(bit),
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return Some(bit),
            Err(actual) => current = actual,
        }
    }
}

/// Sets `bit` in `word`, returning `true` if this call set it.
#[inline]
pub fn try_claim_bit(word: &AtomicU64, bit: u32) -> bool {
    let mask = 1u64 << bit;
    word.fetch_or(mask, Ordering::AcqRel) & mask == 0
}

/// Clears `bit` in `word`, returning whether it was set.
#[inline]
pub fn release_bit(word: &AtomicU64, bit: u32) -> bool {
    let mask = 1u64 << bit;
    word.fetch_and(!mask, Ordering::AcqRel) & mask != 0
}
