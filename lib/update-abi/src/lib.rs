// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire and on-flash types shared by the update server and the installer.
//!
//! `Metadata` and `Fragment` are the two fixed-size records that cross
//! both the transport (as update-server inputs) and flash (as the
//! persisted staging format). Everything else here is small enums and a
//! CRC helper used by both the Command Area and the warm-reset scratch.

#![cfg_attr(not(test), no_std)]

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Literal magic stamped at the front of every `Metadata` record.
pub const METADATA_MAGIC: [u8; 16] = *b"_M_E_T_A_D_A_T_A";

/// Length of the `name` field including its trailing NUL.
pub const NAME_FIELD_LEN: usize = 32;

/// Length of an Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Maximum bytes of image data carried by one fragment. Word-aligned.
pub const FRAGMENT_CONTENT_MAX: usize = 1024;

/// Number of staging slots the Fragment Area provides.
pub const NUM_SLOTS: usize = 3;

const_assert!(FRAGMENT_CONTENT_MAX % 4 == 0);
const_assert!(NAME_FIELD_LEN % 4 == 0);

/// `type` field of a [`Metadata`] record.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareType {
    Firmware = 1,
    Rescue = 2,
}

impl TryFrom<u32> for FirmwareType {
    type Error = AbiError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Firmware),
            2 => Ok(Self::Rescue),
            _ => Err(AbiError::BadDiscriminant),
        }
    }
}

/// `verifyMethod` field of a [`Fragment`].
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMethod {
    /// Fragment carries its own leaf Ed25519 signature.
    LeafEd25519 = 0,
    /// Fragment's signature is the next link of the per-image SHA-512 chain.
    Sha512Chained = 1,
}

impl TryFrom<u32> for VerifyMethod {
    type Error = AbiError;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::LeafEd25519),
            1 => Ok(Self::Sha512Chained),
            _ => Err(AbiError::BadDiscriminant),
        }
    }
}

/// Errors produced while interpreting raw ABI bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    BadDiscriminant,
    BadMagic,
    TooShort,
}

/// Firmware/rescue image metadata, as defined in spec §3.1.
///
/// Field order is load-bearing: every field is naturally aligned with no
/// padding, so `as_bytes()`/`read_from()` round-trip exactly what's on
/// flash or the wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, AsBytes, FromBytes, FromZeroes)]
pub struct Metadata {
    pub magic: [u8; 16],
    pub image_type: u32,
    pub version: u32,
    pub rollback_number: u32,
    pub firmware_id: u32,
    pub start_address: u32,
    pub firmware_size: u32,
    pub name: [u8; NAME_FIELD_LEN],
    pub firmware_signature: [u8; SIGNATURE_LEN],
    pub metadata_signature: [u8; SIGNATURE_LEN],
}

const_assert!(core::mem::size_of::<Metadata>() <= 512);

impl Metadata {
    /// Offset of `metadata_signature` within the record — everything
    /// before this offset is what `metadataSignature` signs.
    pub const SIGNED_PREFIX_LEN: usize =
        core::mem::size_of::<Metadata>() - SIGNATURE_LEN;

    pub fn magic_ok(&self) -> bool {
        self.magic == METADATA_MAGIC
    }

    pub fn image_type(&self) -> Result<FirmwareType, AbiError> {
        FirmwareType::try_from(self.image_type)
    }

    /// Bytes that `metadataSignature` is computed over.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.as_bytes()[..Self::SIGNED_PREFIX_LEN]
    }

    /// `[start_address, start_address + firmware_size)`.
    pub fn image_range(&self) -> core::ops::Range<u32> {
        self.start_address..self.start_address.wrapping_add(self.firmware_size)
    }

    /// A record consisting entirely of the flash erase value is "empty",
    /// i.e. no metadata has ever been written to this sector.
    pub fn is_erased(buf: &[u8], erase_value: u8) -> bool {
        buf.iter().all(|&b| b == erase_value)
    }
}

/// One contiguous chunk of a staged image, as defined in spec §3.2.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct Fragment {
    pub firmware_id: u32,
    pub number: u32,
    pub verify_method: u32,
    pub start_address: u32,
    pub size: u32,
    pub content: [u8; FRAGMENT_CONTENT_MAX],
    pub signature: [u8; SIGNATURE_LEN],
}

const_assert!(core::mem::size_of::<Fragment>() % 4 == 0);

impl core::fmt::Debug for Fragment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fragment")
            .field("firmware_id", &self.firmware_id)
            .field("number", &self.number)
            .field("verify_method", &self.verify_method)
            .field("start_address", &self.start_address)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl Fragment {
    /// Offset of `signature` within the record.
    pub const SIGNED_PREFIX_LEN: usize =
        core::mem::size_of::<Fragment>() - SIGNATURE_LEN;

    pub fn verify_method(&self) -> Result<VerifyMethod, AbiError> {
        VerifyMethod::try_from(self.verify_method)
    }

    /// Bytes a leaf signature or chain hash is computed over — everything
    /// but the trailing `signature` field.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.as_bytes()[..Self::SIGNED_PREFIX_LEN]
    }

    /// The portion of `content` actually in use (`size` may be less than
    /// `FRAGMENT_CONTENT_MAX`).
    pub fn used_content(&self) -> Option<&[u8]> {
        self.content.get(..self.size as usize)
    }

    pub fn end_address(&self) -> u32 {
        self.start_address.wrapping_add(self.size)
    }

    pub fn is_erased(buf: &[u8], erase_value: u8) -> bool {
        buf.iter().all(|&b| b == erase_value)
    }
}

/// Data IDs recognized by `readDataById` (spec §4.5, §6.1).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadDataId {
    FirmwareVersion = 1,
    FirmwareType = 2,
    FirmwareName = 3,
}

impl TryFrom<u8> for ReadDataId {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::FirmwareVersion),
            2 => Ok(Self::FirmwareType),
            3 => Ok(Self::FirmwareName),
            _ => Err(()),
        }
    }
}

/// Data IDs recognized by `writeDataById` (spec §4.5, §6.1).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteDataId {
    FirmwareUpdate = 0x10,
    FirmwareRollback = 0x11,
    Reset = 0x12,
    EraseSlot = 0x13,
}

impl TryFrom<u8> for WriteDataId {
    type Error = ();

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0x10 => Ok(Self::FirmwareUpdate),
            0x11 => Ok(Self::FirmwareRollback),
            0x12 => Ok(Self::Reset),
            0x13 => Ok(Self::EraseSlot),
            _ => Err(()),
        }
    }
}

/// Acknowledgement codes returned to the transport (spec §6.1).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckCode {
    Ok = 0,
    NackInvalidRequest = 1,
    NackRequestOutOfRange = 2,
    NackRequestFailed = 3,
    NackBusyRepeatRequest = 4,
    NackInternalError = 5,
}

/// `type` field of an install command (spec §3.4).
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    Install = 1,
    Rollback = 2,
}

/// Monotonic install-progress ledger states (spec §3.4, §4.6, §4.8).
///
/// Ordinal order is the durable monotonic order: `None < HistoryWritten <
/// FirmwareWritten`. `Failed` is a distinguished terminal state reachable
/// from any of the others.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Status {
    None = 0,
    HistoryWritten = 1,
    FirmwareWritten = 2,
    Failed = 3,
}

impl Status {
    /// Whether progressing from `self` to `next` is a legal durable
    /// transition. Regressions are refused; `Failed` is reachable from
    /// any non-failed state.
    pub fn can_advance_to(self, next: Status) -> bool {
        match (self, next) {
            (Status::Failed, _) => false,
            (_, Status::Failed) => true,
            (a, b) => b as u8 == a as u8 + 1,
        }
    }
}

/// A static, immutable description of one erasable region of flash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorDescriptor {
    pub address: u32,
    pub size: u32,
}

impl SectorDescriptor {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.address && addr < self.address + self.size
    }

    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// An ordered, non-overlapping table of sectors covering a flash device.
/// Internal flash sector sizes vary (boot sectors are smaller), so this
/// cannot be a uniform stride — it must be an explicit table, not a
/// formula.
#[derive(Clone, Copy)]
pub struct SectorMap<'a>(pub &'a [SectorDescriptor]);

impl<'a> SectorMap<'a> {
    /// Sectors that must be erased to make `[target, target + len)`
    /// writable: start at the sector containing `target`, stop after the
    /// sector containing `target + len - 1` (spec §4.6 `installFrom`
    /// step 3, `EraseRequiredSectors`).
    pub fn erase_range(
        &self,
        target: u32,
        highest_addr: u32,
    ) -> impl Iterator<Item = SectorDescriptor> + 'a {
        let end_inclusive = highest_addr.saturating_sub(1);
        self.0
            .iter()
            .copied()
            .skip_while(move |s| !s.contains(target))
            .take_while(move |s| s.address <= end_inclusive)
    }

    pub fn sector_containing(&self, addr: u32) -> Option<SectorDescriptor> {
        self.0.iter().copied().find(|s| s.contains(addr))
    }
}

/// Geometry of the external staging flash: `NUM_SLOTS` fixed-size
/// fragment areas followed by a 3-sector command area, contiguous from
/// offset 0 (spec §6.2). Handed to both cores as a value at
/// construction rather than baked in as linker-derived constants, so
/// they run identically on host and target.
#[derive(Clone, Copy, Debug)]
pub struct ExternalFlashLayout {
    pub slot_size: u32,
}

impl ExternalFlashLayout {
    pub fn slot_offset(&self, slot: usize) -> u32 {
        slot as u32 * self.slot_size
    }

    pub fn command_area_offset(&self) -> u32 {
        self.slot_offset(NUM_SLOTS)
    }
}

/// CRC-32 used by both the Command Area ledger and the warm-reset
/// scratch's integrity check.
pub fn crc32(data: &[u8]) -> u32 {
    const ALGO: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    ALGO.checksum(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_has_no_padding() {
        assert_eq!(
            core::mem::size_of::<Metadata>(),
            16 + 4 * 6 + NAME_FIELD_LEN + SIGNATURE_LEN * 2
        );
    }

    #[test]
    fn fragment_has_no_padding() {
        assert_eq!(
            core::mem::size_of::<Fragment>(),
            4 * 5 + FRAGMENT_CONTENT_MAX + SIGNATURE_LEN
        );
    }

    #[test]
    fn status_transitions() {
        assert!(Status::None.can_advance_to(Status::HistoryWritten));
        assert!(Status::HistoryWritten.can_advance_to(Status::FirmwareWritten));
        assert!(!Status::FirmwareWritten.can_advance_to(Status::HistoryWritten));
        assert!(!Status::None.can_advance_to(Status::FirmwareWritten));
        assert!(Status::HistoryWritten.can_advance_to(Status::Failed));
        assert!(!Status::Failed.can_advance_to(Status::None));
    }

    #[test]
    fn sector_erase_range_spans_target_through_highest() {
        let sectors = [
            SectorDescriptor { address: 0, size: 0x1000 },
            SectorDescriptor { address: 0x1000, size: 0x1000 },
            SectorDescriptor { address: 0x2000, size: 0x1000 },
            SectorDescriptor { address: 0x3000, size: 0x1000 },
        ];
        let map = SectorMap(&sectors);
        let erased: Vec<_> =
            map.erase_range(0x1000, 0x2800).map(|s| s.address).collect();
        assert_eq!(erased, vec![0x1000, 0x2000]);
    }

    #[test]
    fn crc32_is_stable() {
        assert_eq!(crc32(b"hello"), crc32(b"hello"));
        assert_ne!(crc32(b"hello"), crc32(b"hellp"));
    }
}
