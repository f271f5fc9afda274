// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side (`std`) fakes for the "external collaborators" spec.md §1
//! declares out of scope: a byte-addressable flash device, an Ed25519
//! signer for building fixtures, and a SHA-512 incremental hasher. Used
//! only by cross-crate scenario tests and `sim/bootctl`; nothing in
//! `lib/*`/`drv/*` depends on this crate.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use flash_if::{FlashError, MemoryRegion};
use sha2::{Digest, Sha512};
use update_abi::{Fragment, Metadata, VerifyMethod, FRAGMENT_CONTENT_MAX, METADATA_MAGIC};
use update_verify::KeyStore;
use zerocopy::{AsBytes, FromZeroes};

/// An in-memory stand-in for a byte-addressable flash device with
/// sector-granularity erase (spec §1 "external collaborators", §4.1).
/// Every `write` is a plain overwrite; `MemoryRegion::write`'s
/// read-back loop (in `flash-if`) is what actually exercises the
/// integrity property this fake is meant to support testing.
pub struct FakeFlash {
    base: u32,
    sector_size: u32,
    data: Vec<u8>,
}

impl FakeFlash {
    pub fn new(base: u32, sector_size: u32, len: u32) -> Self {
        Self { base, sector_size, data: vec![0xFFu8; len as usize] }
    }

    /// Raw bytes, for assertions in scenario tests that want to inspect
    /// what actually landed on "flash" without going through a typed
    /// accessor.
    pub fn raw(&self) -> &[u8] {
        &self.data
    }
}

impl MemoryRegion for FakeFlash {
    fn base_address(&self) -> u32 {
        self.base
    }
    fn region_len(&self) -> u32 {
        self.data.len() as u32
    }
    fn sector_size(&self) -> u32 {
        self.sector_size
    }
    fn erase_value(&self) -> u8 {
        0xFF
    }
    fn hw_read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError> {
        let off = (addr - self.base) as usize;
        out.copy_from_slice(&self.data[off..off + out.len()]);
        Ok(())
    }
    fn hw_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let off = (addr - self.base) as usize;
        self.data[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }
    fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        let off = (addr - self.base) as usize;
        self.data[off..off + len as usize].fill(0xFF);
        Ok(())
    }
}

/// A `KeyStore` backed by one real Ed25519 keypair, used for every role
/// — matching the reference deployment's "single key across all roles"
/// choice noted in spec §4.4.
pub struct SingleKey {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl SingleKey {
    pub fn new(signing: SigningKey) -> Self {
        let verifying = signing.verifying_key();
        Self { signing, verifying }
    }

    /// Deterministic keypair for fixtures/demos that don't need a fresh
    /// random key every run.
    pub fn deterministic(seed: u8) -> Self {
        Self::new(SigningKey::from_bytes(&[seed; 32]))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying
    }
}

impl KeyStore for SingleKey {
    fn metadata_pub_key(&self) -> &VerifyingKey {
        &self.verifying
    }
    fn firmware_pub_key(&self) -> &VerifyingKey {
        &self.verifying
    }
    fn fragment_pub_key(&self) -> &VerifyingKey {
        &self.verifying
    }
}

/// A thin wrapper around the incremental SHA-512 hasher the multipart
/// Ed25519ph check and the fragment hash chain both build on — the
/// concrete instantiation of the "SHA-512 incremental hasher" external
/// collaborator named in spec §1.
#[derive(Clone, Default)]
pub struct IncrementalSha512(Sha512);

impl IncrementalSha512 {
    pub fn new() -> Self {
        Self(Sha512::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out.copy_from_slice(self.0.finalize().as_slice());
        out
    }
}

/// Builds a signed `Metadata` plus its fragments for scenario tests and
/// the demo CLI, so fixture construction doesn't need to be
/// hand-rolled at every call site (cf. the teacher's `packager` host
/// tool assembling signed images for flashing).
pub struct ImageBuilder<'k> {
    key: &'k SingleKey,
    firmware_id: u32,
    image_type: u32,
    version: u32,
    rollback_number: u32,
    start_address: u32,
    fragment_size: u32,
    verify_method: VerifyMethod,
}

impl<'k> ImageBuilder<'k> {
    pub fn new(key: &'k SingleKey, firmware_id: u32, start_address: u32) -> Self {
        Self {
            key,
            firmware_id,
            image_type: update_abi::FirmwareType::Firmware as u32,
            version: 0,
            rollback_number: 0,
            start_address,
            fragment_size: 16,
            verify_method: VerifyMethod::Sha512Chained,
        }
    }

    pub fn rescue(mut self) -> Self {
        self.image_type = update_abi::FirmwareType::Rescue as u32;
        self
    }

    /// Informational `version` field (spec §3.1) — distinguishes two
    /// otherwise-identical builds (e.g. same `rollback_number`) so a
    /// caller can tell them apart byte-for-byte.
    pub fn version(mut self, n: u32) -> Self {
        self.version = n;
        self
    }

    pub fn rollback_number(mut self, n: u32) -> Self {
        self.rollback_number = n;
        self
    }

    pub fn fragment_size(mut self, n: u32) -> Self {
        assert!(n as usize <= FRAGMENT_CONTENT_MAX && n % 4 == 0);
        self.fragment_size = n;
        self
    }

    pub fn verify_method(mut self, m: VerifyMethod) -> Self {
        self.verify_method = m;
        self
    }

    /// Builds `num_fragments` fragments of `fragment_size` bytes each,
    /// filled with a byte pattern derived from `firmware_id`, and signs
    /// both the image and the metadata record under `self.key`.
    pub fn build(self, num_fragments: u32) -> (Metadata, Vec<Fragment>) {
        let firmware_size = self.fragment_size * num_fragments;
        let mut metadata = Metadata::new_zeroed();
        metadata.magic = METADATA_MAGIC;
        metadata.image_type = self.image_type;
        metadata.version = self.version;
        metadata.rollback_number = self.rollback_number;
        metadata.firmware_id = self.firmware_id;
        metadata.start_address = self.start_address;
        metadata.firmware_size = firmware_size;

        let mut fragments = Vec::with_capacity(num_fragments as usize);
        let mut image = Vec::with_capacity(firmware_size as usize);
        for i in 0..num_fragments {
            let mut f = Fragment::new_zeroed();
            f.firmware_id = self.firmware_id;
            f.number = i;
            f.verify_method = self.verify_method as u32;
            f.start_address = self.start_address + i * self.fragment_size;
            f.size = self.fragment_size;
            for (j, b) in f.content[..self.fragment_size as usize].iter_mut().enumerate() {
                *b = (self.firmware_id as u8).wrapping_add(i as u8).wrapping_add(j as u8);
            }
            image.extend_from_slice(&f.content[..self.fragment_size as usize]);
            fragments.push(f);
        }

        let mut prehash = Sha512::new();
        prehash.update(&image);
        metadata.firmware_signature = self.key.signing.sign_prehashed(prehash, None).unwrap().to_bytes();
        let digest_input = metadata.signed_bytes().to_vec();
        metadata.metadata_signature = self.key.signing.sign(&digest_input).to_bytes();

        match self.verify_method {
            VerifyMethod::LeafEd25519 => {
                for f in fragments.iter_mut() {
                    let digest_input = f.signed_bytes().to_vec();
                    f.signature = self.key.signing.sign(&digest_input).to_bytes();
                }
            }
            VerifyMethod::Sha512Chained => {
                let mut prev_hash = metadata.metadata_signature;
                for f in fragments.iter_mut() {
                    let mut hasher = Sha512::new();
                    hasher.update(prev_hash);
                    hasher.update(f.signed_bytes());
                    f.signature.copy_from_slice(hasher.finalize().as_slice());
                    prev_hash = f.signature;
                }
            }
        }

        (metadata, fragments)
    }
}
