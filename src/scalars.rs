// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Scalar tooling
//!
//! Utilities not provided by `bls12_381`, including some not so safe
//! utilities for wiping scalars and points that do not implement
//! `Zeroize` themselves.

use core::sync::atomic::{compiler_fence, Ordering};

use bls12_381::Scalar;
use ff::Field;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::errors::{Error, Result};

const PIN_SCALAR_DOMAIN: &[u8] = b"pinproof-pin-scalar-v1";

/// Derive the PIN scalar bound to an identity.
///
/// Both `identity` and `pin` are length prefixed, so `("ab", "1")` and
/// `("a", "b1")` never collide.  The result is never zero.
pub(crate) fn pin_scalar(identity: &[u8], pin: &[u8]) -> Result<Scalar> {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(
        &Sha512::new()
            .chain_update(PIN_SCALAR_DOMAIN)
            .chain_update((identity.len() as u64).to_le_bytes())
            .chain_update(identity)
            .chain_update((pin.len() as u64).to_le_bytes())
            .chain_update(pin)
            .finalize(),
    );
    let s = Scalar::from_bytes_wide(&wide);
    wide.zeroize();
    if bool::from(s.is_zero()) {
        return Err(Error::CryptoPrimitiveFailure("zero PIN scalar"));
    }
    Ok(s)
}

/// Overwrite a value with its default through a volatile write.
///
/// Used on group elements and scalars, which are `Copy` and so cannot be
/// wiped on drop.
pub(crate) fn wipe<T: Copy + Default>(value: &mut T) {
    // SAFETY: `value` is a valid, aligned, exclusive reference.
    unsafe { core::ptr::write_volatile(value, T::default()) };
    compiler_fence(Ordering::SeqCst);
}
