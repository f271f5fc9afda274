// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-crate scenario tests: [`InstallerCore`] booting against images
//! actually staged through [`UpdateServerCore`] and `sim-hw` fixtures,
//! rather than the crate's own hand-rolled unit-test doubles. Mirrors
//! how the teacher's `test-suite` crate drives a driver end to end
//! against the rest of the stack instead of isolated fakes.

use flash_if::MemoryRegion;
use installer_core::{BoardConfig, InstallOutcome, InstallerCore};
use sim_hw::{FakeFlash, ImageBuilder, SingleKey};
use update_abi::{AckCode, ExternalFlashLayout, SectorDescriptor, SectorMap, WriteDataId};
use update_server_core::UpdateServerCore;
use warm_scratch::WarmResetScratch;
use zerocopy::{AsBytes, FromZeroes};

const FIRST_FLASH: u32 = 0x1_0000;
const LAST_FLASH: u32 = 0x3_0000;
const APP_METADATA_ADDRESS: u32 = 0xf000;
const INTERNAL_SECTOR: u32 = 0x1000;
const SLOT_SIZE: u32 = 0x2000;
const EXT_SECTOR: u32 = 0x200;

fn sector_map() -> Vec<SectorDescriptor> {
    let mut sectors = vec![SectorDescriptor { address: APP_METADATA_ADDRESS, size: INTERNAL_SECTOR }];
    let mut addr = FIRST_FLASH;
    while addr < LAST_FLASH {
        sectors.push(SectorDescriptor { address: addr, size: INTERNAL_SECTOR });
        addr += INTERNAL_SECTOR;
    }
    sectors
}

fn board(map: &[SectorDescriptor]) -> BoardConfig<'_> {
    BoardConfig {
        sector_map: SectorMap(map),
        first_flash_address: FIRST_FLASH,
        last_flash_address: LAST_FLASH,
        app_metadata_address: APP_METADATA_ADDRESS,
        rescue_metadata_address: None,
        rescue_data_begin: FIRST_FLASH,
    }
}

fn layout() -> ExternalFlashLayout {
    ExternalFlashLayout { slot_size: SLOT_SIZE }
}

fn external_flash() -> FakeFlash {
    FakeFlash::new(0, EXT_SECTOR, layout().command_area_offset() + EXT_SECTOR * 3)
}

fn internal_flash() -> FakeFlash {
    FakeFlash::new(APP_METADATA_ADDRESS, INTERNAL_SECTOR, LAST_FLASH - APP_METADATA_ADDRESS)
}

fn read_app_metadata(internal: &mut FakeFlash) -> Option<update_abi::Metadata> {
    let mut m = update_abi::Metadata::new_zeroed();
    internal.read(APP_METADATA_ADDRESS, m.as_bytes_mut()).ok()?;
    m.magic_ok().then_some(m)
}

#[test]
fn staged_through_the_server_core_then_installed_at_boot() {
    let key = SingleKey::deterministic(7);
    let mut external = external_flash();
    let mut internal = internal_flash();
    let map = sector_map();

    let (metadata, fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(4);
    {
        let mut server = UpdateServerCore::init(&mut external, layout(), &key, (FIRST_FLASH, LAST_FLASH), None);
        assert_eq!(server.put_metadata(metadata.as_bytes()), AckCode::Ok);
        for f in &fragments {
            assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        }
        assert_eq!(server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, metadata.as_bytes()), AckCode::Ok);
    }

    {
        let mut scratch = WarmResetScratch::new_zeroed();
        let mut installer =
            InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
        assert!(installer.slot_valid(0));
        assert_eq!(installer.check_install_request(), Ok(InstallOutcome::Installed));
    }

    let mut readback = [0u8; core::mem::size_of::<update_abi::Metadata>()];
    internal.read(APP_METADATA_ADDRESS, &mut readback).unwrap();
    assert_eq!(&readback[..], metadata.as_bytes());
}

#[test]
fn firmware_install_over_a_running_rescue_image_ignores_rollback_number() {
    let key = SingleKey::deterministic(8);
    let mut external = external_flash();
    let mut internal = internal_flash();
    let map = sector_map();

    // Stage and install a RESCUE image with a high rollback_number onto
    // a fresh device (no current app yet, so `installAllowed` is
    // trivially satisfied).
    let (rescue, rescue_fragments) =
        ImageBuilder::new(&key, 50, FIRST_FLASH).rescue().rollback_number(9).build(2);
    {
        let mut server = UpdateServerCore::init(&mut external, layout(), &key, (FIRST_FLASH, LAST_FLASH), None);
        assert_eq!(server.put_metadata(rescue.as_bytes()), AckCode::Ok);
        for f in &rescue_fragments {
            assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        }
    }
    {
        let mut scratch = WarmResetScratch::new_zeroed();
        let mut installer =
            InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
        assert!(installer.try_install_rescue_app().is_ok());
    }

    // Confirm the rescue image is now the running, validated app.
    let current_app = {
        let mut scratch = WarmResetScratch::new_zeroed();
        let installer =
            InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
        let current = installer.current_app().expect("rescue image should be the current app");
        assert!(current.image_valid);
        read_app_metadata(&mut internal)
    };

    // Stage ordinary firmware with rollback_number 0 — lower than the
    // rescue image's 9 — and confirm it still installs: a non-rescue
    // target is never denied by the rollback ladder while the running
    // app is itself a rescue image (spec §4.6 `installAllowed`).
    let (firmware, firmware_fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(0).build(2);
    {
        let mut server =
            UpdateServerCore::init(&mut external, layout(), &key, (FIRST_FLASH, LAST_FLASH), current_app);
        assert_eq!(server.put_metadata(firmware.as_bytes()), AckCode::Ok);
        for f in &firmware_fragments {
            assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        }
        assert_eq!(server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, firmware.as_bytes()), AckCode::Ok);
    }

    let mut scratch = WarmResetScratch::new_zeroed();
    let mut installer =
        InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
    assert_eq!(installer.check_install_request(), Ok(InstallOutcome::Installed));
}

#[test]
fn a_second_install_after_one_completes_still_runs_the_ladder_cleanly() {
    let key = SingleKey::deterministic(9);
    let mut external = external_flash();
    let mut internal = internal_flash();
    let map = sector_map();

    let (metadata, fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(3);
    {
        let mut server = UpdateServerCore::init(&mut external, layout(), &key, (FIRST_FLASH, LAST_FLASH), None);
        assert_eq!(server.put_metadata(metadata.as_bytes()), AckCode::Ok);
        for f in &fragments {
            assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        }
        assert_eq!(server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, metadata.as_bytes()), AckCode::Ok);
    }

    let current_app = {
        let mut scratch = WarmResetScratch::new_zeroed();
        let mut installer =
            InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
        assert_eq!(installer.check_install_request(), Ok(InstallOutcome::Installed));
        read_app_metadata(&mut internal)
    };

    let (metadata2, fragments2) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(2).build(3);
    {
        let mut server =
            UpdateServerCore::init(&mut external, layout(), &key, (FIRST_FLASH, LAST_FLASH), current_app);
        assert_eq!(server.put_metadata(metadata2.as_bytes()), AckCode::Ok);
        for f in &fragments2 {
            assert_eq!(server.put_fragment(f.as_bytes()), AckCode::Ok);
        }
        assert_eq!(server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, metadata2.as_bytes()), AckCode::Ok);
    }

    let mut scratch = WarmResetScratch::new_zeroed();
    let mut installer =
        InstallerCore::init_areas(&mut external, &mut internal, layout(), board(&map), &key, &mut scratch);
    assert_eq!(installer.check_install_request(), Ok(InstallOutcome::Installed));

    let mut readback = [0u8; core::mem::size_of::<update_abi::Metadata>()];
    internal.read(APP_METADATA_ADDRESS, &mut readback).unwrap();
    assert_eq!(&readback[..], metadata2.as_bytes());
}
