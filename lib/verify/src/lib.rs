// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Verifier (spec §4.4, component C4): metadata signature checks,
//! the two fragment acceptance methods, and the SHA-512 hash-chain
//! cache that makes chained verification cheap for in-order arrivals.
//!
//! This crate does not own a transport or a [`flash_if::MemoryRegion`];
//! callers that need to backfill the hash-chain cache across a restart
//! supply a `fetch_prev` closure reading the previous fragment, keeping
//! the Verifier decoupled from any particular Fragment Area instance.

#![cfg_attr(not(test), no_std)]

use ed25519_dalek::{Signature, VerifyingKey};
use ringbuf::{ringbuf, ringbuf_entry};
use sha2::{Digest, Sha512};
use update_abi::{Fragment, Metadata, VerifyMethod};

/// Exposes the three public keys the Verifier checks signatures against.
/// The reference deployment uses one key across all three roles; distinct
/// keys are supported by implementing this trait with three different
/// values.
pub trait KeyStore {
    fn metadata_pub_key(&self) -> &VerifyingKey;
    fn firmware_pub_key(&self) -> &VerifyingKey;
    fn fragment_pub_key(&self) -> &VerifyingKey;
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trace {
    MetadataRejected,
    FragmentRejected(u32),
    ChainBackfill(u32),
    ChainCacheInvalidated,
}

ringbuf!(Trace, 16, Trace::ChainCacheInvalidated);

/// `validateMetadata` (spec §4.4): single-shot Ed25519 over
/// `metadata.signed_bytes()` under `keys.metadata_pub_key()`.
pub fn validate_metadata(keys: &impl KeyStore, metadata: &Metadata) -> bool {
    if !metadata.magic_ok() {
        ringbuf_entry!(Trace::MetadataRejected);
        return false;
    }
    let signature = Signature::from_bytes(&metadata.metadata_signature);
    let ok = keys
        .metadata_pub_key()
        .verify_strict(metadata.signed_bytes(), &signature)
        .is_ok();
    if !ok {
        ringbuf_entry!(Trace::MetadataRejected);
    }
    ok
}

/// The address-range half of spec §3.1's metadata invariants:
/// `[startAddress, startAddress+firmwareSize) ⊆ [first, last]`. Kept
/// separate from [`validate_metadata`] because the flash bounds it
/// checks against are a board property, not something the Verifier's
/// `KeyStore` carries — callers combine both before accepting metadata
/// (testable property 1).
pub fn metadata_in_bounds(metadata: &Metadata, first: u32, last: u32) -> bool {
    let range = metadata.image_range();
    range.start >= first && range.end <= last && range.start <= range.end
}

/// In-RAM cache of the hash-chain state for the fragment most recently
/// verified, so in-order arrivals don't each re-read their predecessor
/// (spec §4.4, §3.6).
#[derive(Clone, Copy, Debug)]
pub struct HashChainCache {
    last_hash: [u8; 64],
    last_index: u32,
    firmware_id: u32,
    valid: bool,
}

impl HashChainCache {
    pub fn new() -> Self {
        Self { last_hash: [0u8; 64], last_index: 0, firmware_id: 0, valid: false }
    }

    /// Drops the cached hash. Callers must invalidate on anything that
    /// could make `last_hash` stale for the next fragment presented —
    /// notably `putMetadata` (spec §4.5 `putMetadata` "drops hash-chain
    /// cache").
    pub fn invalidate(&mut self) {
        ringbuf_entry!(Trace::ChainCacheInvalidated);
        self.valid = false;
    }
}

impl Default for HashChainCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `validateFragment` (spec §4.4). `fetch_prev(n)` should return fragment
/// `n` read via `readFragmentForce` (no validation hook), used only to
/// backfill the chain cache on a miss.
pub fn validate_fragment(
    cache: &mut HashChainCache,
    keys: &impl KeyStore,
    metadata: &Metadata,
    fragment: &Fragment,
    fetch_prev: impl FnMut(u32) -> Option<Fragment>,
) -> bool {
    let ok = match fragment.verify_method() {
        Ok(VerifyMethod::LeafEd25519) => verify_leaf(keys, fragment),
        Ok(VerifyMethod::Sha512Chained) => verify_chained(cache, metadata, fragment, fetch_prev),
        Err(_) => false,
    };
    if !ok {
        ringbuf_entry!(Trace::FragmentRejected(fragment.number));
    }
    ok
}

/// Single-shot leaf Ed25519 check (`verifyMethod == 0`), exposed so
/// callers that only need the stateless half of fragment validation
/// (e.g. a structural gate bound to a `FragmentArea`) don't have to
/// thread a [`HashChainCache`] through for it.
pub fn verify_leaf(keys: &impl KeyStore, fragment: &Fragment) -> bool {
    let signature = Signature::from_bytes(&fragment.signature);
    keys.fragment_pub_key()
        .verify_strict(fragment.signed_bytes(), &signature)
        .is_ok()
}

fn verify_chained(
    cache: &mut HashChainCache,
    metadata: &Metadata,
    fragment: &Fragment,
    mut fetch_prev: impl FnMut(u32) -> Option<Fragment>,
) -> bool {
    if fragment.firmware_id != metadata.firmware_id {
        return false;
    }

    let Some(prev_hash) = prev_hash(cache, metadata, fragment, &mut fetch_prev) else {
        return false;
    };

    let mut hasher = Sha512::new();
    hasher.update(prev_hash);
    hasher.update(fragment.signed_bytes());
    let digest = hasher.finalize();

    if digest.as_slice() != fragment.signature {
        return false;
    }

    cache.last_hash.copy_from_slice(digest.as_slice());
    cache.last_index = fragment.number;
    cache.firmware_id = fragment.firmware_id;
    cache.valid = true;
    true
}

/// `H_{n-1}` for `fragment`'s index `n`: the cached value if fresh,
/// otherwise a backfill (spec §4.4 cache-miss rule).
fn prev_hash(
    cache: &HashChainCache,
    metadata: &Metadata,
    fragment: &Fragment,
    fetch_prev: &mut impl FnMut(u32) -> Option<Fragment>,
) -> Option<[u8; 64]> {
    if cache.valid
        && cache.firmware_id == fragment.firmware_id
        && cache.last_index.wrapping_add(1) == fragment.number
    {
        return Some(cache.last_hash);
    }

    ringbuf_entry!(Trace::ChainBackfill(fragment.number));
    if fragment.number == 0 {
        return Some(metadata.metadata_signature);
    }

    let prev = fetch_prev(fragment.number - 1)?;
    if prev.firmware_id != fragment.firmware_id {
        return None;
    }
    Some(prev.signature)
}

/// Drives the whole-image Ed25519ph (prehashed) signature check the
/// Installer runs at boot (spec §4.6 step 3): feed every fragment's
/// in-range content in order, then check the accumulated digest against
/// `metadata.firmwareSignature`.
pub struct MultipartVerifier {
    hasher: Sha512,
}

impl MultipartVerifier {
    pub fn new() -> Self {
        Self { hasher: Sha512::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// `multipart_end` (spec §4.6 step 4).
    pub fn finish(self, keys: &impl KeyStore, firmware_signature: &[u8; 64]) -> bool {
        let signature = Signature::from_bytes(firmware_signature);
        keys.firmware_pub_key()
            .verify_prehashed(self.hasher, None, &signature)
            .is_ok()
    }
}

impl Default for MultipartVerifier {
    fn default() -> Self {
        Self::new()
    }
}
