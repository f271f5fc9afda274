// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Command Area (spec §4.3, component C3) and the durable job ledger
//! it hosts (component C8): three fixed sectors of one [`MemoryRegion`]
//! holding the pending install command, the last-installed metadata
//! history, and a monotonic progress bitmap.

#![cfg_attr(not(test), no_std)]

use flash_if::{FlashError, MemoryRegion};
use ringbuf::{ringbuf, ringbuf_entry};
use update_abi::{crc32, CommandType, Metadata, Status};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaError {
    /// Sector holds nothing but erase-value bytes.
    Empty,
    /// CRC or discriminant check failed.
    Invalid,
    /// A concurrent flash operation is in progress; retry.
    Busy,
    /// Argument out of range for this area.
    Param,
    /// Requested status transition would regress the ledger.
    InvalidTransition,
    Flash(FlashError),
}

impl From<FlashError> for CaError {
    fn from(e: FlashError) -> Self {
        match e {
            FlashError::Busy => CaError::Busy,
            other => CaError::Flash(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trace {
    WriteInstallCommand(u8),
    EraseInstallCommand,
    WriteHistory,
    SetStatus(Status),
}

ringbuf!(Trace, 16, Trace::EraseInstallCommand);

/// On-flash layout of the install command record. `has_metadata` and the
/// padding exist so `metadata` lands on a 4-byte boundary without
/// `zerocopy` inferring implicit padding.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct CommandRecord {
    command_type: u8,
    has_metadata: u8,
    _pad: [u8; 2],
    metadata: Metadata,
    crc32: u32,
}

impl CommandRecord {
    const CRC_PREFIX_LEN: usize = core::mem::size_of::<Self>() - 4;
}

/// A decoded install command: what the installer should do on next boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallCommand {
    pub command_type: CommandType,
    pub metadata: Option<Metadata>,
}

/// Durable progress bitmap: one byte per rung, cleared from the
/// erase-value background as the ladder advances (spec §4.3, §4.8).
/// Field order is the bit order: `history_written`, `firmware_written`,
/// `failed`.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct StatusLedger {
    history_written: u8,
    firmware_written: u8,
    failed: u8,
    _reserved: u8,
}

const OFFSET_HISTORY_WRITTEN: u32 = 0;
const OFFSET_FIRMWARE_WRITTEN: u32 = 1;
const OFFSET_FAILED: u32 = 2;

/// Marker written into a ledger byte to move it off the erase-value
/// background. NOR flash can only clear bits on a plain `write`, so this
/// is the only value a ladder rung can durably become without erasing.
const RUNG_SET: u8 = 0x00;

/// The Command Area: three sectors of `region`, in order
/// `[install command][history][status]`.
///
/// `R` is held by value (see `fragment_area::FragmentArea`'s doc comment
/// for why) so a caller can hand in a short-lived `flash_if::Window`
/// rather than a persistent `&mut` borrow.
pub struct CommandArea<R> {
    region: R,
}

impl<R: MemoryRegion> CommandArea<R> {
    pub fn new(region: R) -> Self {
        Self { region }
    }

    fn command_sector_addr(&self) -> u32 {
        self.region.base_address()
    }

    fn history_sector_addr(&self) -> u32 {
        self.region.base_address() + self.region.sector_size()
    }

    fn status_sector_addr(&self) -> u32 {
        self.region.base_address() + 2 * self.region.sector_size()
    }

    /// Erases the command sector, then writes `{type, metadata?, crc32}`
    /// as a single durable record (spec §4.3 `writeInstallCommand`).
    pub fn write_install_command(
        &mut self,
        command_type: CommandType,
        metadata: Option<&Metadata>,
    ) -> Result<(), CaError> {
        let mut rec = CommandRecord::new_zeroed();
        rec.command_type = command_type as u8;
        if let Some(m) = metadata {
            rec.has_metadata = 1;
            rec.metadata = *m;
        }
        rec.crc32 = crc32(&rec.as_bytes()[..CommandRecord::CRC_PREFIX_LEN]);

        ringbuf_entry!(Trace::WriteInstallCommand(command_type as u8));
        let addr = self.command_sector_addr();
        let sector = self.region.sector_size();
        self.region.erase_sector(addr, sector)?;
        self.region.write(addr, rec.as_bytes())?;
        Ok(())
    }

    /// Reads back the install command. `Ok(None)` when the sector is
    /// blank (no command pending); `Err(Invalid)` on a CRC mismatch.
    pub fn read_install_command(&mut self) -> Result<Option<InstallCommand>, CaError> {
        let addr = self.command_sector_addr();
        let mut rec = CommandRecord::new_zeroed();
        self.region.read(addr, rec.as_bytes_mut())?;

        let ev = self.region.erase_value();
        if rec.as_bytes().iter().all(|&b| b == ev) {
            return Ok(None);
        }

        let expected = crc32(&rec.as_bytes()[..CommandRecord::CRC_PREFIX_LEN]);
        if expected != rec.crc32 {
            return Err(CaError::Invalid);
        }

        let command_type = if rec.command_type == CommandType::Install as u8 {
            CommandType::Install
        } else if rec.command_type == CommandType::Rollback as u8 {
            CommandType::Rollback
        } else {
            return Err(CaError::Invalid);
        };

        let metadata = if rec.has_metadata != 0 { Some(rec.metadata) } else { None };
        Ok(Some(InstallCommand { command_type, metadata }))
    }

    /// Mirrors `metadata` into the history sector (erase then write).
    pub fn write_history(&mut self, metadata: &Metadata) -> Result<(), CaError> {
        ringbuf_entry!(Trace::WriteHistory);
        let addr = self.history_sector_addr();
        let sector = self.region.sector_size();
        self.region.erase_sector(addr, sector)?;
        self.region.write(addr, metadata.as_bytes())?;
        Ok(())
    }

    pub fn read_history(&mut self) -> Result<Metadata, CaError> {
        let addr = self.history_sector_addr();
        let mut m = Metadata::new_zeroed();
        self.region.read(addr, m.as_bytes_mut())?;
        if Metadata::is_erased(m.as_bytes(), self.region.erase_value()) {
            return Err(CaError::Empty);
        }
        if !m.magic_ok() {
            return Err(CaError::Invalid);
        }
        Ok(m)
    }

    /// Scans the status bitmap and returns the highest-ordinal state
    /// present. `Failed` wins regardless of the other rungs (spec §4.3).
    pub fn get_status(&mut self) -> Result<Status, CaError> {
        let addr = self.status_sector_addr();
        let mut ledger = StatusLedger::new_zeroed();
        self.region.read(addr, ledger.as_bytes_mut())?;

        if ledger.failed == RUNG_SET {
            return Ok(Status::Failed);
        }
        if ledger.firmware_written == RUNG_SET {
            return Ok(Status::FirmwareWritten);
        }
        if ledger.history_written == RUNG_SET {
            return Ok(Status::HistoryWritten);
        }
        Ok(Status::None)
    }

    /// Advances the ledger to `status` by clearing exactly one rung byte
    /// (no erase). Refuses regressions via [`Status::can_advance_to`].
    pub fn set_status(&mut self, status: Status) -> Result<(), CaError> {
        let current = self.get_status()?;
        if !current.can_advance_to(status) {
            return Err(CaError::InvalidTransition);
        }

        let offset = match status {
            Status::HistoryWritten => OFFSET_HISTORY_WRITTEN,
            Status::FirmwareWritten => OFFSET_FIRMWARE_WRITTEN,
            Status::Failed => OFFSET_FAILED,
            Status::None => return Err(CaError::Param),
        };

        ringbuf_entry!(Trace::SetStatus(status));
        let addr = self.status_sector_addr() + offset;
        self.region.write(addr, &[RUNG_SET])?;
        Ok(())
    }

    /// Erases the command and status sectors, returning the ledger to
    /// `NONE`. History is retained (spec §4.3 `eraseInstallCommand`).
    pub fn erase_install_command(&mut self) -> Result<(), CaError> {
        let sector = self.region.sector_size();
        self.region.erase_sector(self.command_sector_addr(), sector)?;
        self.region.erase_sector(self.status_sector_addr(), sector)?;
        Ok(())
    }
}
