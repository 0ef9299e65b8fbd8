//! Solo mining nonce utilities for 256-bit nonces
//!
//! Collision avoidance without cross-thread coordination: each owner draws a
//! random 256-bit starting point, then enumerates candidates inside a
//! reserved low-order region.
//!
//! Layout of an initialized nonce (little-endian byte order):
//! - bytes 0..2 cleared — increment space local to the owner
//! - bytes 2..30 random — ~224 bits of per-owner uniqueness
//! - bytes 30..32 cleared — margin so a carry out of an exhausted increment
//!   space cannot reach another owner's random region

use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng, TryRngCore};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 32;

/// Number of increment steps available before the reserved low region
/// is exhausted
pub const INCREMENT_SPACE: u64 = 1 << 16;

/// Initialize a 256-bit nonce with random bytes, clearing the increment
/// space and safety margin.
///
/// Prefers the platform CSPRNG. If it is unavailable the nonce falls back
/// to a time/pid-seeded PRNG rather than failing: uniqueness, not
/// unpredictability, is the property that matters here.
pub fn initialize(nonce: &mut [u8; NONCE_SIZE]) {
    if let Err(err) = OsRng.try_fill_bytes(nonce) {
        warn!("secure random source unavailable ({err}), using seeded fallback");
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
            ^ u64::from(std::process::id()).rotate_left(32);
        StdRng::seed_from_u64(seed).fill_bytes(nonce);
    }

    // Bytes 0-1: increment space, bytes 30-31: carry safety margin
    nonce[0] = 0;
    nonce[1] = 0;
    nonce[30] = 0;
    nonce[31] = 0;
}

/// Increment a 256-bit nonce in little-endian byte order.
///
/// Carry propagation stops at the first byte that does not wrap to zero.
pub fn increment(nonce: &mut [u8; NONCE_SIZE]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Copy a 256-bit nonce into a blob at the specified offset.
///
/// Panics if the blob cannot hold 32 bytes at `offset`; callers size the
/// blob from a fixed header layout.
pub fn copy_to_blob(blob: &mut [u8], offset: usize, nonce: &[u8; NONCE_SIZE]) {
    blob[offset..offset + NONCE_SIZE].copy_from_slice(nonce);
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn increment_matches_wide_integer_addition(bytes in prop::array::uniform32(any::<u8>())) {
            let mut nonce = bytes;
            increment(&mut nonce);

            // Model the nonce as two u128 halves of one 256-bit integer
            let lo = u128::from_le_bytes(bytes[..16].try_into().unwrap());
            let hi = u128::from_le_bytes(bytes[16..].try_into().unwrap());
            let (expected_lo, carry) = lo.overflowing_add(1);
            let expected_hi = if carry { hi.wrapping_add(1) } else { hi };

            prop_assert_eq!(u128::from_le_bytes(nonce[..16].try_into().unwrap()), expected_lo);
            prop_assert_eq!(u128::from_le_bytes(nonce[16..].try_into().unwrap()), expected_hi);
        }

        #[test]
        fn copy_to_blob_leaves_surroundings_intact(
            offset in 0usize..64,
            nonce in prop::array::uniform32(any::<u8>())
        ) {
            let mut blob = vec![0x55u8; 128];
            copy_to_blob(&mut blob, offset, &nonce);

            prop_assert_eq!(&blob[offset..offset + NONCE_SIZE], &nonce[..]);
            prop_assert!(blob[..offset].iter().all(|b| *b == 0x55));
            prop_assert!(blob[offset + NONCE_SIZE..].iter().all(|b| *b == 0x55));
        }
    }
}
