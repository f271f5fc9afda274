// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Installer Core (spec §4.6, component C6): boot-time slot
//! re-verification, the crash-safe install/rollback state machine,
//! anti-rollback policy, and rescue fallback.
//!
//! Owns the external staging flash and the internal program flash as
//! two distinct [`MemoryRegion`]s, plus exclusive access to the
//! [`WarmResetScratch`] for the duration of boot (spec §5: "The
//! Installer runs single-threadedly before any other task starts").

#![cfg_attr(not(test), no_std)]

use command_area::{CaError, CommandArea};
use flash_if::{FlashError, MemoryRegion, Window};
use fragment_area::{FaError, FragmentArea, FragmentValidator, MetadataValidator};
use ringbuf::{ringbuf, ringbuf_entry};
use update_abi::{
    CommandType, ExternalFlashLayout, Fragment, FirmwareType, Metadata, SectorMap, Status,
    FRAGMENT_CONTENT_MAX, NUM_SLOTS,
};
use update_verify::{metadata_in_bounds, validate_fragment, validate_metadata, HashChainCache, KeyStore, MultipartVerifier};
use warm_scratch::{InstallTag, ScratchField, WarmResetScratch, TAG_INVALID};
use zerocopy::{AsBytes, FromZeroes};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallError {
    Ca(CaError),
    Flash(FlashError),
    /// No staging slot holds metadata byte-equal to the install target.
    NoStagedSlot,
    /// Target is a RESCUE image but this board has no rescue partition.
    NoRescuePartition,
    /// No currently-running application to repair.
    NoCurrentApp,
    /// `tryRepair` called but the current app's image already verified.
    RepairNotNeeded,
    /// No slot holds a valid RESCUE image.
    NoRescueAvailable,
    /// Anti-rollback policy denied the install; the ledger moves to `FAILED`.
    PolicyDenied,
    /// The ledger is already `FAILED`; installer refuses to retry.
    Terminal,
    /// Malformed command (e.g. `INSTALL` with no attached metadata).
    Param,
    /// A program-flash target fell outside `[APP_METADATA_ADDRESS, LAST_FLASH_ADDRESS]`.
    OutOfBounds,
}

impl From<CaError> for InstallError {
    fn from(e: CaError) -> Self {
        InstallError::Ca(e)
    }
}

impl From<FlashError> for InstallError {
    fn from(e: FlashError) -> Self {
        InstallError::Flash(e)
    }
}

impl From<FaError> for InstallError {
    fn from(e: FaError) -> Self {
        match e {
            FaError::Flash(fe) => InstallError::Flash(fe),
            FaError::Busy => InstallError::Flash(FlashError::Busy),
            FaError::Empty | FaError::Invalid | FaError::Param => InstallError::NoStagedSlot,
        }
    }
}

/// What [`InstallerCore::check_install_request`] (or a direct call to
/// [`InstallerCore::try_repair`] / [`InstallerCore::try_install_rescue_app`])
/// actually did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallOutcome {
    /// No install command was pending and no automatic rollback applied.
    NoAction,
    Installed,
    RolledBack,
    /// Rollback target byte-equals the currently running app; a no-op by
    /// design (spec §4.6 "Rollback specifics").
    RollbackRejectedNoOp,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trace {
    SlotVerified(u8, bool),
    CheckInstallRequest,
    AutomaticRollback,
    InstallDenied,
    InstallAdvance(Status),
    ProgramFlash(u32, u32),
}

ringbuf!(Trace, 24, Trace::CheckInstallRequest);

/// Board-specific addresses and the internal flash sector map, handed
/// to [`InstallerCore::init_areas`] as a value rather than baked in as
/// linker symbols, so the core runs identically on host and target
/// (spec §9 "Static sector map").
#[derive(Clone, Copy)]
pub struct BoardConfig<'a> {
    pub sector_map: SectorMap<'a>,
    pub first_flash_address: u32,
    pub last_flash_address: u32,
    pub app_metadata_address: u32,
    /// `None` when this board has no compiled-in rescue partition.
    pub rescue_metadata_address: Option<u32>,
    /// Base address RESCUE images are verified/installed from, distinct
    /// from `first_flash_address` used for regular FIRMWARE images
    /// (spec §4.6 `verifySlotContent` step 3).
    pub rescue_data_begin: u32,
}

/// What's known about an image already resident in internal flash —
/// either the running application or, if compiled in, the rescue
/// partition (spec §4.6 `installAllowed`'s `app`/`appValid`,
/// `RESCUE_STATUS_LastVerifyResult`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentImage {
    pub metadata: Metadata,
    /// Whether the full firmware body re-verified against
    /// `firmwareSignature`, not just the metadata signature.
    pub image_valid: bool,
}

/// Per-slot outcome of [`InstallerCore::verify_slot_content`].
#[derive(Clone, Copy, Debug, Default)]
struct SlotState {
    metadata: Option<Metadata>,
    valid: bool,
    last_index: Option<u32>,
    highest_addr: u32,
}

struct MetadataGate<'k, K> {
    keys: &'k K,
    flash_bounds: (u32, u32),
}

impl<'k, K: KeyStore> MetadataValidator for MetadataGate<'k, K> {
    fn validate(&mut self, m: &Metadata) -> bool {
        validate_metadata(self.keys, m) && metadata_in_bounds(m, self.flash_bounds.0, self.flash_bounds.1)
    }
}

/// Structural-only gate used while locating the highest non-erased
/// fragment (spec §4.2 `findLastFragment`): cheap checks that don't
/// need the hash-chain cache, since the authoritative cryptographic
/// pass happens afterward in [`InstallerCore::verify_slot_content`]'s
/// forward scan.
struct StructuralValidator {
    firmware_id: u32,
}

impl FragmentValidator for StructuralValidator {
    fn validate(&mut self, f: &Fragment) -> bool {
        f.firmware_id == self.firmware_id && f.size as usize <= FRAGMENT_CONTENT_MAX
    }
}

/// The Installer Core. Holds exclusive references to both flash
/// regions and the scratch record for the duration of boot.
pub struct InstallerCore<'a, ExtR, IntR, K> {
    external: &'a mut ExtR,
    internal: &'a mut IntR,
    layout: ExternalFlashLayout,
    board: BoardConfig<'a>,
    keys: &'a K,
    scratch: &'a mut WarmResetScratch,
    slots: [SlotState; NUM_SLOTS],
    current_app: Option<CurrentImage>,
}

impl<'a, ExtR, IntR, K> InstallerCore<'a, ExtR, IntR, K>
where
    ExtR: MemoryRegion,
    IntR: MemoryRegion,
    K: KeyStore,
{
    /// Initializes the warm-reset scratch, then a [`FragmentArea`] for
    /// each of the three staging slots followed by `verifySlotContent`
    /// (spec §4.6 "Boot-time initialization (`initAreas`)").
    pub fn init_areas(
        external: &'a mut ExtR,
        internal: &'a mut IntR,
        layout: ExternalFlashLayout,
        board: BoardConfig<'a>,
        keys: &'a K,
        scratch: &'a mut WarmResetScratch,
    ) -> Self {
        scratch.init();
        let mut core = Self {
            external,
            internal,
            layout,
            board,
            keys,
            scratch,
            slots: [SlotState::default(); NUM_SLOTS],
            current_app: None,
        };
        for slot in 0..NUM_SLOTS {
            core.slots[slot] = core.verify_slot_content(slot);
            ringbuf_entry!(Trace::SlotVerified(slot as u8, core.slots[slot].valid));
        }
        core.current_app = core.load_current_image(core.board.app_metadata_address);
        core
    }

    pub fn slot_valid(&self, slot: usize) -> bool {
        self.slots[slot].valid
    }

    pub fn current_app(&self) -> Option<CurrentImage> {
        self.current_app
    }

    /// `RESCUE_STATUS_LastVerifyResult` (spec §4.6, §9 Open Questions):
    /// `false` when no rescue partition is compiled in, per spec.md's
    /// own recommended resolution, rather than reusing app validity.
    pub fn rescue_last_verify_result(&mut self) -> bool {
        match self.board.rescue_metadata_address {
            None => false,
            Some(addr) => self.load_current_image(addr).map(|c| c.image_valid).unwrap_or(false),
        }
    }

    fn open_slot(&mut self, slot: usize, firmware_id: u32) -> FragmentArea<Window<'_, ExtR>, MetadataGate<'_, K>, StructuralValidator> {
        let base = self.layout.slot_offset(slot);
        let len = self.layout.slot_size;
        let window = Window::new(self.external, base, len);
        let bounds = (self.board.first_flash_address, self.board.last_flash_address);
        FragmentArea::new(window, MetadataGate { keys: self.keys, flash_bounds: bounds }, StructuralValidator { firmware_id })
    }

    fn open_command_area(&mut self) -> CommandArea<Window<'_, ExtR>> {
        let base = self.layout.command_area_offset();
        let sector = self.external.sector_size();
        CommandArea::new(Window::new(self.external, base, sector * 3))
    }

    /// `verifySlotContent` (spec §4.6): re-reads the metadata, locates
    /// the highest structurally-plausible fragment, then drives the
    /// Ed25519ph multipart check over fragments `0..=lastIdx` in order,
    /// checking `startAddress == expectedNextStart` at each step.
    fn verify_slot_content(&mut self, slot: usize) -> SlotState {
        let keys = self.keys;
        let metadata = {
            let mut probe = self.open_slot(slot, 0);
            match probe.read_metadata() {
                Ok(m) => m,
                Err(_) => return SlotState::default(),
            }
        };

        let last_idx = {
            let mut area = self.open_slot(slot, metadata.firmware_id);
            match area.find_last_fragment() {
                Ok(Some((idx, _))) => idx,
                _ => return SlotState::default(),
            }
        };

        let mut expected_start = match metadata.image_type() {
            Ok(FirmwareType::Rescue) => self.board.rescue_data_begin,
            _ => self.board.first_flash_address,
        };
        let mut cache = HashChainCache::new();
        let mut multipart = MultipartVerifier::new();
        let image_range = metadata.image_range();
        let mut highest_addr = 0u32;

        for idx in 0..=last_idx {
            let fragment = {
                let mut area = self.open_slot(slot, metadata.firmware_id);
                match area.read_fragment_force(idx) {
                    Ok(f) => f,
                    Err(_) => return SlotState::default(),
                }
            };
            if fragment.start_address != expected_start {
                return SlotState::default();
            }
            if !validate_fragment(&mut cache, keys, &metadata, &fragment, |_| None) {
                return SlotState::default();
            }

            let frag_range = fragment.start_address..fragment.end_address();
            let lo = frag_range.start.max(image_range.start);
            let hi = frag_range.end.min(image_range.end);
            if hi > lo {
                if let Some(content) = fragment.used_content() {
                    let start = (lo - fragment.start_address) as usize;
                    let end = (hi - fragment.start_address) as usize;
                    if let Some(slice) = content.get(start..end) {
                        multipart.update(slice);
                    }
                }
            }

            highest_addr = highest_addr.max(fragment.end_address());
            expected_start = fragment.end_address();
        }

        if !multipart.finish(keys, &metadata.firmware_signature) {
            return SlotState::default();
        }

        SlotState { metadata: Some(metadata), valid: true, last_index: Some(last_idx), highest_addr }
    }

    /// Finds the staging slot whose verified metadata byte-equals
    /// `target`, used by both `installFrom`'s caller and rollback.
    fn find_slot_matching(&self, target: &Metadata) -> Option<usize> {
        (0..NUM_SLOTS).find(|&slot| self.slots[slot].valid && self.slots[slot].metadata == Some(*target))
    }

    fn load_current_image(&mut self, metadata_addr: u32) -> Option<CurrentImage> {
        let mut m = Metadata::new_zeroed();
        self.internal.read(metadata_addr, m.as_bytes_mut()).ok()?;
        if !m.magic_ok() || !validate_metadata(self.keys, &m) {
            return None;
        }
        let image_valid = self.verify_installed_image(&m);
        Some(CurrentImage { metadata: m, image_valid })
    }

    fn verify_installed_image(&mut self, metadata: &Metadata) -> bool {
        let range = metadata.image_range();
        let mut multipart = MultipartVerifier::new();
        let mut addr = range.start;
        let mut buf = [0u8; 256];
        while addr < range.end {
            let n = core::cmp::min(buf.len() as u32, range.end - addr) as usize;
            if self.internal.read(addr, &mut buf[..n]).is_err() {
                return false;
            }
            multipart.update(&buf[..n]);
            addr += n as u32;
        }
        multipart.finish(self.keys, &metadata.firmware_signature)
    }

    /// `installAllowed(target, automatic)` (spec §4.6 anti-rollback
    /// policy).
    fn install_allowed(&self, target: &Metadata, automatic: bool) -> bool {
        let Some(app) = self.current_app.filter(|a| a.image_valid) else {
            return true;
        };
        let app = app.metadata;

        let same_type = target.image_type().ok() == app.image_type().ok();

        if automatic
            && same_type
            && self.scratch.install_tag().ok() == Some(InstallTag::Tryout)
        {
            return true;
        }
        if same_type && target.rollback_number >= app.rollback_number {
            return true;
        }
        if target.image_type() != Ok(FirmwareType::Rescue) && app.image_type() == Ok(FirmwareType::Rescue) {
            return true;
        }
        false
    }

    /// `programFlash(addr, data, len)` (spec §4.6): bounds-checked
    /// against `[APP_METADATA_ADDRESS, LAST_FLASH_ADDRESS]`, then split
    /// into an unaligned byte-wise prefix, a word-aligned middle, and a
    /// byte-wise tail, each programmed (and readback-verified, via
    /// `MemoryRegion::write`) as its own step.
    fn program_flash(&mut self, addr: u32, data: &[u8]) -> Result<(), InstallError> {
        let end = addr.checked_add(data.len() as u32).ok_or(InstallError::OutOfBounds)?;
        if addr < self.board.app_metadata_address || end > self.board.last_flash_address {
            return Err(InstallError::OutOfBounds);
        }
        ringbuf_entry!(Trace::ProgramFlash(addr, data.len() as u32));

        let prefix_len = (core::cmp::min(4 - (addr % 4), data.len() as u32) % 4) as usize;
        let mut offset = 0usize;
        if prefix_len > 0 {
            self.internal.write(addr, &data[..prefix_len])?;
            offset = prefix_len;
        }
        let word_len = (data.len() - offset) / 4 * 4;
        if word_len > 0 {
            self.internal.write(addr + offset as u32, &data[offset..offset + word_len])?;
            offset += word_len;
        }
        if offset < data.len() {
            self.internal.write(addr + offset as u32, &data[offset..])?;
        }
        Ok(())
    }

    /// `installFrom(slot)` (spec §4.6): re-validates metadata, erases
    /// exactly the sectors `EraseRequiredSectors` names, programs
    /// metadata at the target base, then re-reads and programs every
    /// fragment `0..=lastIdx` in order.
    fn install_from(&mut self, slot: usize, state: SlotState) -> Result<(), InstallError> {
        let metadata = state.metadata.ok_or(InstallError::NoStagedSlot)?;
        if !validate_metadata(self.keys, &metadata) {
            return Err(InstallError::NoStagedSlot);
        }
        let last_idx = state.last_index.ok_or(InstallError::NoStagedSlot)?;

        let target = match metadata.image_type() {
            Ok(FirmwareType::Rescue) => {
                self.board.rescue_metadata_address.ok_or(InstallError::NoRescuePartition)?
            }
            _ => self.board.app_metadata_address,
        };

        for sector in self.board.sector_map.erase_range(target, state.highest_addr) {
            self.internal.erase_sector(sector.address, sector.size)?;
        }

        self.program_flash(target, metadata.as_bytes())?;

        for idx in 0..=last_idx {
            let fragment = {
                let mut area = self.open_slot(slot, metadata.firmware_id);
                area.read_fragment_force(idx)?
            };
            let size = fragment.size as usize;
            self.program_flash(fragment.start_address, &fragment.content[..size])?;
        }
        Ok(())
    }

    fn fail(&mut self, err: InstallError) -> InstallError {
        ringbuf_entry!(Trace::InstallDenied);
        let _ = self.open_command_area().set_status(Status::Failed);
        err
    }

    /// Drives the crash-safe ladder (spec §4.6 "Crash-safe install
    /// state machine") from whatever status the ledger is currently at
    /// through to `FirmwareWritten` and the final command-erase,
    /// resuming cleanly on re-entry after a reset mid-sequence.
    fn run_ladder(
        &mut self,
        target: Metadata,
        automatic: bool,
        write_history: bool,
    ) -> Result<(), InstallError> {
        let mut status = self.open_command_area().get_status()?;
        if status == Status::Failed {
            return Err(InstallError::Terminal);
        }

        if status == Status::None {
            if !self.install_allowed(&target, automatic) {
                return Err(self.fail(InstallError::PolicyDenied));
            }
            if write_history {
                if let Some(app) = self.current_app.filter(|a| a.image_valid) {
                    self.open_command_area().write_history(&app.metadata).map_err(InstallError::from)?;
                }
            }
            self.open_command_area().set_status(Status::HistoryWritten)?;
            ringbuf_entry!(Trace::InstallAdvance(Status::HistoryWritten));
            status = Status::HistoryWritten;
        }

        if status == Status::HistoryWritten {
            let slot = match self.find_slot_matching(&target) {
                Some(s) => s,
                None => return Err(self.fail(InstallError::NoStagedSlot)),
            };
            let state = self.slots[slot];
            if let Err(e) = self.install_from(slot, state) {
                return Err(self.fail(e));
            }
            self.open_command_area().set_status(Status::FirmwareWritten)?;
            self.scratch.set_member(ScratchField::InstallTag(InstallTag::Tryout));
            ringbuf_entry!(Trace::InstallAdvance(Status::FirmwareWritten));
            status = Status::FirmwareWritten;
        }

        if status == Status::FirmwareWritten {
            self.open_command_area().erase_install_command()?;
        }

        Ok(())
    }

    /// `executeInstall` (spec §4.6).
    pub fn execute_install(&mut self, target: Metadata) -> Result<InstallOutcome, InstallError> {
        self.run_ladder(target, false, true)?;
        Ok(InstallOutcome::Installed)
    }

    /// `executeRollback` (spec §4.6 "Rollback specifics"): resolves an
    /// empty payload from history, rejects a target byte-equal to the
    /// running app as a no-op, and never writes history during its own
    /// run (the ledger still advances past `HISTORY_WRITTEN`, the write
    /// itself is simply skipped).
    pub fn execute_rollback(&mut self, metadata: Option<Metadata>, automatic: bool) -> Result<InstallOutcome, InstallError> {
        let target = match metadata {
            Some(m) => m,
            None => self.open_command_area().read_history().map_err(InstallError::from)?,
        };

        if self.current_app.map(|a| a.metadata) == Some(target) {
            return Ok(InstallOutcome::RollbackRejectedNoOp);
        }

        self.run_ladder(target, automatic, false)?;
        Ok(InstallOutcome::RolledBack)
    }

    /// `checkInstallRequest` (spec §4.6): the boot-time dispatcher.
    /// Reads the pending install command; absent one, falls back to an
    /// automatic rollback when the scratch's `appTag` marks the running
    /// app invalid and history names a prior-good image.
    pub fn check_install_request(&mut self) -> Result<InstallOutcome, InstallError> {
        ringbuf_entry!(Trace::CheckInstallRequest);
        if let Some(cmd) = self.open_command_area().read_install_command()? {
            return match cmd.command_type {
                CommandType::Install => {
                    let target = cmd.metadata.ok_or(InstallError::Param)?;
                    self.execute_install(target)
                }
                CommandType::Rollback => self.execute_rollback(cmd.metadata, false),
            };
        }

        if self.scratch.app_tag != TAG_INVALID {
            return Ok(InstallOutcome::NoAction);
        }

        let Ok(history) = self.open_command_area().read_history() else {
            return Ok(InstallOutcome::NoAction);
        };
        ringbuf_entry!(Trace::AutomaticRollback);
        if self.open_command_area().get_status()? != Status::Failed {
            self.open_command_area().erase_install_command()?;
        }
        self.execute_rollback(Some(history), true)
    }

    /// `tryRepair` (spec §4.6): when the running app's metadata
    /// validated but its image did not, re-enters the ladder targeting
    /// the currently-installed metadata, searching staging for a slot
    /// that still holds it.
    pub fn try_repair(&mut self) -> Result<InstallOutcome, InstallError> {
        let app = self.current_app.ok_or(InstallError::NoCurrentApp)?;
        if app.image_valid {
            return Err(InstallError::RepairNotNeeded);
        }
        self.execute_install(app.metadata)
    }

    /// `tryInstallRescueApp` (spec §4.6): installs the first slot
    /// holding a verified RESCUE image.
    pub fn try_install_rescue_app(&mut self) -> Result<Metadata, InstallError> {
        let slot = (0..NUM_SLOTS)
            .find(|&s| {
                self.slots[s].valid && self.slots[s].metadata.and_then(|m| m.image_type().ok()) == Some(FirmwareType::Rescue)
            })
            .ok_or(InstallError::NoRescueAvailable)?;
        let metadata = self.slots[slot].metadata.ok_or(InstallError::NoRescueAvailable)?;
        self.execute_install(metadata)?;
        Ok(metadata)
    }
}
