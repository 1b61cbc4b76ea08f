// Copyright keyvault contributors.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Cryptographic interfaces.
//!
//! The AES engine itself lives outside this crate; the core drives it
//! through [`Cipher`] to keep credential contents opaque at rest. Keys are
//! derived from the smartcard at unlock time and pushed into the engine via
//! [`Cipher::rekey`]; individual fields are enciphered in counter mode with
//! a 3-byte per-record counter, so encrypt and decrypt are the same
//! keystream operation.
//!
//! This module also hosts [`guarded_eq`], the minimum-duration comparison
//! used for every password-like check. The duration bound is a security
//! property (it masks early-mismatch timing), not an optimization detail.

use static_assertions::assert_obj_safe;

use crate::hardware::Clock;
use crate::hardware::KEY_LENGTH;

/// Length in bytes of the per-record counter fed to the CTR keystream.
pub const CTR_LENGTH: usize = 3;

/// Length in bytes of the nonce that, with a counter, forms the CTR IV.
pub const NONCE_LENGTH: usize = 16;

/// Minimum duration, in milliseconds, of any password-like comparison.
pub const COMPARE_FLOOR_MS: u32 = 1000;

/// A keystream engine for credential fields.
///
/// Implementations wrap the hardware AES block primitive. The engine holds
/// exactly one key/nonce pair at a time; [`Cipher::rekey`] replaces both,
/// and is called whenever a card unlock derives fresh key material.
pub trait Cipher {
    /// Replaces the engine's key and nonce.
    fn rekey(&mut self, key: &[u8; KEY_LENGTH], nonce: &[u8; NONCE_LENGTH]);

    /// Applies the keystream for `ctr` to `buf` in place, enciphering it.
    fn encrypt_ctr(&mut self, ctr: &[u8; CTR_LENGTH], buf: &mut [u8]);

    /// Applies the keystream for `ctr` to `buf` in place, deciphering it.
    ///
    /// In counter mode this is the same operation as
    /// [`Cipher::encrypt_ctr`]; both names exist so call sites read
    /// correctly.
    fn decrypt_ctr(&mut self, ctr: &[u8; CTR_LENGTH], buf: &mut [u8]) {
        self.encrypt_ctr(ctr, buf);
    }
}
assert_obj_safe!(Cipher);

/// Adds `n` to a 3-byte big-endian counter, wrapping.
pub fn ctr_add(ctr: &[u8; CTR_LENGTH], n: u32) -> [u8; CTR_LENGTH] {
    let value = (u32::from(ctr[0]) << 16)
        | (u32::from(ctr[1]) << 8)
        | u32::from(ctr[2]);
    let value = value.wrapping_add(n) & 0x00ff_ffff;
    [(value >> 16) as u8, (value >> 8) as u8, value as u8]
}

/// Compares two byte strings under a minimum-duration guard.
///
/// The deadline is armed *before* the comparison and waited out *after* it,
/// whatever the result, so a caller observing the response time learns
/// nothing about where a mismatch occurred. The comparison itself visits
/// every byte. Callers are responsible for zeroing any secret buffers once
/// done.
pub fn guarded_eq<C: Clock>(clock: &mut C, a: &[u8], b: &[u8]) -> bool {
    let deadline = clock.deadline(COMPARE_FLOOR_MS);

    let mut diff = a.len() ^ b.len();
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= usize::from(x ^ y);
    }

    clock.wait_until(deadline);
    diff == 0
}


#[cfg(test)]
mod test {
    use super::fake::XorCipher;
    use super::*;
    use crate::hardware::fake::TestClock;

    #[test]
    fn ctr_add_wraps() {
        assert_eq!(ctr_add(&[0, 0, 0xff], 1), [0, 1, 0]);
        assert_eq!(ctr_add(&[0xff, 0xff, 0xff], 1), [0, 0, 0]);
        assert_eq!(ctr_add(&[0, 0, 0], 4), [0, 0, 4]);
    }

    #[test]
    fn cipher_round_trips() {
        let mut cipher = XorCipher::new();
        cipher.rekey(&[7; KEY_LENGTH], &[3; NONCE_LENGTH]);

        let mut buf = *b"correct horse battery staple\0\0\0\0";
        let plain = buf;
        cipher.encrypt_ctr(&[0, 0, 1], &mut buf);
        assert_ne!(buf, plain);
        cipher.decrypt_ctr(&[0, 0, 1], &mut buf);
        assert_eq!(buf, plain);

        // A different counter yields a different ciphertext.
        let mut other = plain;
        cipher.encrypt_ctr(&[0, 0, 2], &mut other);
        cipher.decrypt_ctr(&[0, 0, 1], &mut other);
        assert_ne!(other, plain);
    }

    #[test]
    fn guarded_eq_compares() {
        let mut clock = TestClock::default();
        assert!(guarded_eq(&mut clock, b"sesame", b"sesame"));
        assert!(!guarded_eq(&mut clock, b"sesame", b"sEsame"));
        assert!(!guarded_eq(&mut clock, b"sesame", b"sesam"));
    }

    #[test]
    fn guarded_eq_waits_out_the_floor() {
        // A mismatch in the first byte must still burn the full deadline:
        // the tick count proves the wait loop ran.
        let mut clock = TestClock::default();
        assert!(!guarded_eq(&mut clock, b"aaaaaaaa", b"zaaaaaaa"));
        assert!(clock.ticks > 0);
        assert!(clock.now >= u64::from(COMPARE_FLOOR_MS));
    }
}
