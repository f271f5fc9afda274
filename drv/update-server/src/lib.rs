// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Update Server Core (spec §4.5, component C5): the stateful
//! service behind the wire protocol's four handlers. Consumes decoded
//! frames; does not own the transport itself (spec §4.5 "does not own
//! the transport").
//!
//! Owns one external-flash [`MemoryRegion`] sliced by [`ExternalFlashLayout`]
//! into three staging slots and a command area, via short-lived
//! [`Window`]s constructed per operation — never more than one `&mut`
//! borrow of the backing chip is alive at a time.

#![cfg_attr(not(test), no_std)]

use core::sync::atomic::{AtomicU32, Ordering};

use command_area::{CaError, CommandArea};
use flash_if::{MemoryRegion, Window};
use fragment_area::{FaError, FragmentArea, FragmentValidator, MetadataValidator};
use ringbuf::{ringbuf, ringbuf_entry};
use update_abi::{
    AckCode, CommandType, ExternalFlashLayout, Fragment, FirmwareType, Metadata, ReadDataId,
    WriteDataId, NAME_FIELD_LEN, NUM_SLOTS,
};
use update_verify::{metadata_in_bounds, validate_fragment, validate_metadata, HashChainCache, KeyStore};
use zerocopy::{AsBytes, FromBytes};

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trace {
    PutMetadataStaged(u8),
    PutMetadataAlreadyStaged,
    PutFragmentAccepted(u32),
    PutFragmentRejected(u32),
    EraseSlot(u8),
    ResetLatched,
}

ringbuf!(Trace, 16, Trace::ResetLatched);

struct MetadataGate<'k, K> {
    keys: &'k K,
    flash_bounds: (u32, u32),
}

impl<'k, K: KeyStore> MetadataValidator for MetadataGate<'k, K> {
    fn validate(&mut self, m: &Metadata) -> bool {
        validate_metadata(self.keys, m) && metadata_in_bounds(m, self.flash_bounds.0, self.flash_bounds.1)
    }
}

/// `write_fragment`/`read_fragment_force`/`erase_area` never invoke the
/// bound `FragmentValidator` hook, so this core only ever needs a
/// placeholder that satisfies the type parameter.
struct NeverCalledFragmentValidator;

impl FragmentValidator for NeverCalledFragmentValidator {
    fn validate(&mut self, _fragment: &Fragment) -> bool {
        true
    }
}

/// Slot-assignment outcome of [`UpdateServerCore::put_metadata`]'s
/// policy (spec §4.5 `putMetadata`).
enum SlotSelection {
    AlreadyStaged,
    Slot(usize),
    None,
}

/// Builds a [`FragmentArea`] over one slot's window. A free function
/// rather than a method on `UpdateServerCore`, so it only ever borrows
/// the `region`/`keys` fields the caller passes in — a method taking
/// `&mut self` here would tie up the whole struct for as long as the
/// returned area lives, which `put_fragment` can't afford since it
/// still needs `self.chain_cache` afterward.
fn open_slot<'r, R, K>(
    region: &'r mut R,
    layout: ExternalFlashLayout,
    keys: &'r K,
    flash_bounds: (u32, u32),
    slot: usize,
) -> FragmentArea<Window<'r, R>, MetadataGate<'r, K>, NeverCalledFragmentValidator>
where
    R: MemoryRegion,
    K: KeyStore,
{
    let base = layout.slot_offset(slot);
    let len = layout.slot_size;
    let window = Window::new(region, base, len);
    FragmentArea::new(window, MetadataGate { keys, flash_bounds }, NeverCalledFragmentValidator)
}

fn open_command_area<'r, R: MemoryRegion>(
    region: &'r mut R,
    layout: ExternalFlashLayout,
) -> CommandArea<Window<'r, R>> {
    let base = layout.command_area_offset();
    let sector = region.sector_size();
    let window = Window::new(region, base, sector * 3);
    CommandArea::new(window)
}

pub struct UpdateServerCore<'a, R, K> {
    region: &'a mut R,
    layout: ExternalFlashLayout,
    keys: &'a K,
    /// `(FIRST_FLASH_ADDRESS, LAST_FLASH_ADDRESS)` of the internal flash
    /// an accepted image must target (spec §3.1, testable property 1).
    flash_bounds: (u32, u32),
    /// Metadata of the application this device currently boots, used by
    /// the slot-assignment policy to recognize "a copy of the
    /// currently-running firmware". `None` if no app has ever validated.
    current_app: Option<Metadata>,
    /// In-RAM mirror of each slot's staged metadata, kept in lockstep
    /// with flash so slot-assignment and `putFragment` routing don't
    /// need a flash read on every request.
    mirror: [Option<Metadata>; NUM_SLOTS],
    chain_cache: HashChainCache,
    reset_latched: bool,
    /// Idempotent counter bumped once per accepted fragment, readable
    /// from any task context (spec §5 "client-progress callback").
    client_progress: AtomicU32,
}

impl<'a, R: MemoryRegion, K: KeyStore> UpdateServerCore<'a, R, K> {
    /// Binds the external flash and key container, then reads each
    /// slot's metadata back into the RAM mirror.
    pub fn init(
        region: &'a mut R,
        layout: ExternalFlashLayout,
        keys: &'a K,
        flash_bounds: (u32, u32),
        current_app: Option<Metadata>,
    ) -> Self {
        let mut core = Self {
            region,
            layout,
            keys,
            flash_bounds,
            current_app,
            mirror: [None; NUM_SLOTS],
            chain_cache: HashChainCache::new(),
            reset_latched: false,
            client_progress: AtomicU32::new(0),
        };
        core.refresh_mirror();
        core
    }

    fn refresh_mirror(&mut self) {
        for slot in 0..NUM_SLOTS {
            self.mirror[slot] =
                open_slot(&mut *self.region, self.layout, self.keys, self.flash_bounds, slot).read_metadata().ok();
        }
    }

    /// `readDataById` (spec §4.5). `out.len()` stands in for the
    /// spec's separate `maxSize` parameter.
    pub fn read_data_by_id(&mut self, id: u8, out: &mut [u8]) -> (AckCode, usize) {
        if out.len() < 16 {
            return (AckCode::NackInternalError, 0);
        }
        let Ok(id) = ReadDataId::try_from(id) else {
            return (AckCode::NackRequestOutOfRange, 0);
        };
        let Some(app) = self.current_app else {
            return (AckCode::NackRequestFailed, 0);
        };
        match id {
            ReadDataId::FirmwareVersion => {
                out[..4].copy_from_slice(&app.version.to_be_bytes());
                (AckCode::Ok, 4)
            }
            ReadDataId::FirmwareType => {
                out[..4].copy_from_slice(&app.image_type.to_be_bytes());
                (AckCode::Ok, 4)
            }
            ReadDataId::FirmwareName => {
                if out.len() < NAME_FIELD_LEN {
                    return (AckCode::NackInternalError, 0);
                }
                out[..NAME_FIELD_LEN].copy_from_slice(&app.name);
                (AckCode::Ok, NAME_FIELD_LEN)
            }
        }
    }

    /// `writeDataById` (spec §4.5).
    pub fn write_data_by_id(&mut self, id: u8, data: &[u8]) -> AckCode {
        let Ok(id) = WriteDataId::try_from(id) else {
            return AckCode::NackRequestOutOfRange;
        };
        match id {
            WriteDataId::FirmwareUpdate => self.write_update_command(data, CommandType::Install),
            WriteDataId::FirmwareRollback => {
                if data.is_empty() {
                    self.issue_install_command(CommandType::Rollback, None)
                } else {
                    self.write_update_command(data, CommandType::Rollback)
                }
            }
            WriteDataId::Reset => {
                ringbuf_entry!(Trace::ResetLatched);
                self.reset_latched = true;
                AckCode::Ok
            }
            WriteDataId::EraseSlot => {
                if data.len() != 1 || data[0] as usize >= NUM_SLOTS {
                    return AckCode::NackInvalidRequest;
                }
                match self.erase_slot(data[0] as usize) {
                    Ok(()) => AckCode::Ok,
                    Err(_) => AckCode::NackInternalError,
                }
            }
        }
    }

    fn write_update_command(&mut self, data: &[u8], command: CommandType) -> AckCode {
        if data.len() != core::mem::size_of::<Metadata>() {
            return AckCode::NackInvalidRequest;
        }
        let Some(metadata) = Metadata::read_from(data) else {
            return AckCode::NackInvalidRequest;
        };
        if !validate_metadata(self.keys, &metadata)
            || !metadata_in_bounds(&metadata, self.flash_bounds.0, self.flash_bounds.1)
        {
            return AckCode::NackInvalidRequest;
        }
        self.issue_install_command(command, Some(&metadata))
    }

    fn issue_install_command(&mut self, command: CommandType, metadata: Option<&Metadata>) -> AckCode {
        match open_command_area(&mut *self.region, self.layout).write_install_command(command, metadata) {
            Ok(()) => AckCode::Ok,
            Err(CaError::Busy) => AckCode::NackBusyRepeatRequest,
            Err(_) => AckCode::NackInternalError,
        }
    }

    fn erase_slot(&mut self, slot: usize) -> Result<(), FaError> {
        ringbuf_entry!(Trace::EraseSlot(slot as u8));
        open_slot(&mut *self.region, self.layout, self.keys, self.flash_bounds, slot).erase_area()?;
        self.mirror[slot] = None;
        Ok(())
    }

    /// `putMetadata` (spec §4.5): slot-assignment policy, then
    /// `FA.writeMetadata` and mirror update.
    pub fn put_metadata(&mut self, data: &[u8]) -> AckCode {
        if data.len() != core::mem::size_of::<Metadata>() {
            return AckCode::NackInvalidRequest;
        }
        let Some(metadata) = Metadata::read_from(data) else {
            return AckCode::NackInvalidRequest;
        };
        if !validate_metadata(self.keys, &metadata)
            || !metadata_in_bounds(&metadata, self.flash_bounds.0, self.flash_bounds.1)
        {
            return AckCode::NackInvalidRequest;
        }
        self.chain_cache.invalidate();

        let slot = match self.select_slot(&metadata) {
            SlotSelection::AlreadyStaged => {
                ringbuf_entry!(Trace::PutMetadataAlreadyStaged);
                return AckCode::Ok;
            }
            SlotSelection::Slot(slot) => slot,
            SlotSelection::None => return AckCode::NackInternalError,
        };

        match open_slot(&mut *self.region, self.layout, self.keys, self.flash_bounds, slot).write_metadata(&metadata) {
            Ok(()) => {
                ringbuf_entry!(Trace::PutMetadataStaged(slot as u8));
                self.mirror[slot] = Some(metadata);
                AckCode::Ok
            }
            Err(FaError::Busy) => AckCode::NackBusyRepeatRequest,
            Err(_) => AckCode::NackInternalError,
        }
    }

    fn select_slot(&self, metadata: &Metadata) -> SlotSelection {
        match metadata.image_type() {
            Ok(FirmwareType::Rescue) => {
                if let Some(slot) = self.slot_holding_rescue() {
                    return SlotSelection::Slot(slot);
                }
                for slot in 0..NUM_SLOTS {
                    if !self.slot_is_current_app(slot) {
                        return SlotSelection::Slot(slot);
                    }
                }
                SlotSelection::None
            }
            Ok(FirmwareType::Firmware) => {
                if self.mirror.iter().any(|m| *m == Some(*metadata)) {
                    return SlotSelection::AlreadyStaged;
                }
                for slot in 0..NUM_SLOTS {
                    if !self.slot_is_current_app(slot) && !self.slot_is_rescue(slot) {
                        return SlotSelection::Slot(slot);
                    }
                }
                SlotSelection::None
            }
            Err(_) => SlotSelection::None,
        }
    }

    fn slot_holding_rescue(&self) -> Option<usize> {
        (0..NUM_SLOTS).find(|&slot| self.slot_is_rescue(slot))
    }

    fn slot_is_rescue(&self, slot: usize) -> bool {
        matches!(self.mirror[slot].and_then(|m| m.image_type().ok()), Some(FirmwareType::Rescue))
    }

    fn slot_is_current_app(&self, slot: usize) -> bool {
        match (self.mirror[slot], self.current_app) {
            (Some(m), Some(app)) => m == app,
            _ => false,
        }
    }

    /// `putFragment` (spec §4.5): routes by the slot whose mirrored
    /// metadata shares the fragment's `firmwareId`, writes it, then runs
    /// the authoritative per-fragment check (including hash-chain
    /// backfill) before acknowledging.
    pub fn put_fragment(&mut self, data: &[u8]) -> AckCode {
        if data.len() != core::mem::size_of::<Fragment>() {
            return AckCode::NackInvalidRequest;
        }
        let Some(fragment) = Fragment::read_from(data) else {
            return AckCode::NackInvalidRequest;
        };

        let found = self
            .mirror
            .iter()
            .enumerate()
            .find_map(|(i, m)| m.filter(|m| m.firmware_id == fragment.firmware_id).map(|m| (i, m)));
        let Some((slot, metadata)) = found else {
            return AckCode::NackRequestFailed;
        };

        match open_slot(&mut *self.region, self.layout, self.keys, self.flash_bounds, slot)
            .write_fragment(fragment.number, &fragment)
        {
            Ok(()) => {}
            Err(FaError::Busy) => return AckCode::NackBusyRepeatRequest,
            Err(_) => return AckCode::NackRequestFailed,
        }

        let mut area = open_slot(&mut *self.region, self.layout, self.keys, self.flash_bounds, slot);
        let accepted = validate_fragment(&mut self.chain_cache, self.keys, &metadata, &fragment, |idx| {
            area.read_fragment_force(idx).ok()
        });

        if accepted {
            ringbuf_entry!(Trace::PutFragmentAccepted(fragment.number));
            self.client_progress.fetch_add(1, Ordering::Relaxed);
            AckCode::Ok
        } else {
            ringbuf_entry!(Trace::PutFragmentRejected(fragment.number));
            AckCode::NackRequestFailed
        }
    }

    /// Whether `WRITE_DATA_BY_ID(RESET, ...)` has been requested.
    pub fn reset_requested(&self) -> bool {
        self.reset_latched
    }

    /// Consumes the latched reset request; the caller should tear down
    /// the transport and reset only after the response carrying this
    /// request's ack has been sent (spec §4.5 "Reset latch").
    pub fn take_reset_request(&mut self) -> bool {
        core::mem::take(&mut self.reset_latched)
    }

    pub fn client_progress(&self) -> u32 {
        self.client_progress.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
    use update_abi::{VerifyMethod, METADATA_MAGIC};
    use zerocopy::FromZeroes;

    struct RamRegion {
        base: u32,
        sector_size: u32,
        data: std::vec::Vec<u8>,
    }

    impl RamRegion {
        fn new(base: u32, sector_size: u32, sectors: u32) -> Self {
            Self { base, sector_size, data: vec![0xFFu8; (sector_size * sectors) as usize] }
        }
    }

    impl MemoryRegion for RamRegion {
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
        fn hw_read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), flash_if::FlashError> {
            let off = (addr - self.base) as usize;
            out.copy_from_slice(&self.data[off..off + out.len()]);
            Ok(())
        }
        fn hw_write(&mut self, addr: u32, data: &[u8]) -> Result<(), flash_if::FlashError> {
            let off = (addr - self.base) as usize;
            self.data[off..off + data.len()].copy_from_slice(data);
            Ok(())
        }
        fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), flash_if::FlashError> {
            let off = (addr - self.base) as usize;
            self.data[off..off + len as usize].fill(0xFF);
            Ok(())
        }
    }

    struct OneKey(VerifyingKey);
    impl KeyStore for OneKey {
        fn metadata_pub_key(&self) -> &VerifyingKey {
            &self.0
        }
        fn firmware_pub_key(&self) -> &VerifyingKey {
            &self.0
        }
        fn fragment_pub_key(&self) -> &VerifyingKey {
            &self.0
        }
    }

    const FIRST_FLASH: u32 = 0x8000;
    const LAST_FLASH: u32 = 0xC000;
    const SLOT_SIZE: u32 = 0x1000;
    const EXT_SECTOR: u32 = 0x100;

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[3u8; 32])
    }

    fn layout() -> ExternalFlashLayout {
        ExternalFlashLayout { slot_size: SLOT_SIZE }
    }

    fn external_region() -> RamRegion {
        RamRegion::new(0, EXT_SECTOR, (SLOT_SIZE * NUM_SLOTS as u32 + EXT_SECTOR * 3) / EXT_SECTOR)
    }

    fn signed_metadata(signing: &SigningKey, firmware_id: u32, rollback_number: u32) -> Metadata {
        let mut m = Metadata::new_zeroed();
        m.magic = METADATA_MAGIC;
        m.image_type = FirmwareType::Firmware as u32;
        m.rollback_number = rollback_number;
        m.firmware_id = firmware_id;
        m.start_address = FIRST_FLASH;
        m.firmware_size = 16;
        let digest_input = m.signed_bytes().to_vec();
        m.metadata_signature = signing.sign(&digest_input).to_bytes();
        m
    }

    fn leaf_fragment(signing: &SigningKey, firmware_id: u32, number: u32) -> Fragment {
        let mut f = Fragment::new_zeroed();
        f.firmware_id = firmware_id;
        f.number = number;
        f.verify_method = VerifyMethod::LeafEd25519 as u32;
        f.start_address = FIRST_FLASH + number * 16;
        f.size = 16;
        let digest_input = f.signed_bytes().to_vec();
        f.signature = signing.sign(&digest_input).to_bytes();
        f
    }

    #[test]
    fn fresh_put_metadata_then_fragment_then_update_command() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        let m = signed_metadata(&signing, 7, 1);
        assert_eq!(server.put_metadata(m.as_bytes()), AckCode::Ok);

        let f = leaf_fragment(&signing, 7, 0);
        assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        assert_eq!(server.client_progress(), 1);

        assert_eq!(
            server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, m.as_bytes()),
            AckCode::Ok
        );
    }

    #[test]
    fn duplicate_put_metadata_is_idempotent() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        let m = signed_metadata(&signing, 7, 1);
        assert_eq!(server.put_metadata(m.as_bytes()), AckCode::Ok);
        assert_eq!(server.put_metadata(m.as_bytes()), AckCode::Ok);
    }

    #[test]
    fn put_fragment_for_unknown_firmware_id_fails() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        let f = leaf_fragment(&signing, 99, 0);
        assert_eq!(server.put_fragment(f.as_bytes()), AckCode::NackRequestFailed);
    }

    #[test]
    fn erase_slot_clears_mirror_so_fragment_is_then_rejected() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        let m = signed_metadata(&signing, 7, 1);
        assert_eq!(server.put_metadata(m.as_bytes()), AckCode::Ok);
        assert_eq!(server.write_data_by_id(WriteDataId::EraseSlot as u8, &[0]), AckCode::Ok);

        let f = leaf_fragment(&signing, 7, 0);
        assert_eq!(server.put_fragment(f.as_bytes()), AckCode::NackRequestFailed);
    }

    #[test]
    fn read_data_by_id_rejects_undersized_buffer_and_unknown_id() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let app = signed_metadata(&signing, 7, 1);
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), Some(app));

        let mut small = [0u8; 4];
        assert_eq!(
            server.read_data_by_id(ReadDataId::FirmwareVersion as u8, &mut small).0,
            AckCode::NackInternalError
        );

        let mut out = [0u8; 32];
        assert_eq!(server.read_data_by_id(0xEE, &mut out).0, AckCode::NackRequestOutOfRange);

        let (ack, len) = server.read_data_by_id(ReadDataId::FirmwareVersion as u8, &mut out);
        assert_eq!(ack, AckCode::Ok);
        assert_eq!(len, 4);
    }

    #[test]
    fn read_firmware_name_with_a_buffer_between_16_and_32_bytes_does_not_panic() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let app = signed_metadata(&signing, 7, 1);
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), Some(app));

        // 16 bytes clears the general `maxSize` floor but is still
        // shorter than NAME_FIELD_LEN (32); the name arm must reject it
        // rather than slice out of bounds.
        let mut out = [0u8; 16];
        assert_eq!(
            server.read_data_by_id(ReadDataId::FirmwareName as u8, &mut out).0,
            AckCode::NackInternalError
        );

        let mut out = [0u8; NAME_FIELD_LEN];
        let (ack, len) = server.read_data_by_id(ReadDataId::FirmwareName as u8, &mut out);
        assert_eq!(ack, AckCode::Ok);
        assert_eq!(len, NAME_FIELD_LEN);
    }

    #[test]
    fn reset_request_latches_and_is_consumed_once() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        assert!(!server.reset_requested());
        assert_eq!(server.write_data_by_id(WriteDataId::Reset as u8, &[]), AckCode::Ok);
        assert!(server.reset_requested());
        assert!(server.take_reset_request());
        assert!(!server.reset_requested());
    }

    #[test]
    fn rollback_with_empty_payload_issues_bare_rollback_command() {
        let signing = signing_key();
        let keys = OneKey(signing.verifying_key());
        let mut ext = external_region();
        let mut server = UpdateServerCore::init(&mut ext, layout(), &keys, (FIRST_FLASH, LAST_FLASH), None);

        assert_eq!(
            server.write_data_by_id(WriteDataId::FirmwareRollback as u8, &[]),
            AckCode::Ok
        );
    }
}
