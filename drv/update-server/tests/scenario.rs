// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cross-crate scenario tests driving [`UpdateServerCore`] against
//! `sim-hw`'s fake flash and signed fixtures instead of the crate's own
//! hand-rolled unit-test doubles, the way the teacher's `test-suite`
//! crate exercises a driver against the rest of the stack.

use sim_hw::{FakeFlash, ImageBuilder, SingleKey};
use update_abi::{AckCode, ExternalFlashLayout, WriteDataId};
use update_server_core::UpdateServerCore;
use zerocopy::AsBytes;

const FIRST_FLASH: u32 = 0x1000;
const LAST_FLASH: u32 = 0x9000;
const SLOT_SIZE: u32 = 0x1000;
const EXT_SECTOR: u32 = 0x100;

fn layout() -> ExternalFlashLayout {
    ExternalFlashLayout { slot_size: SLOT_SIZE }
}

fn flash(layout: ExternalFlashLayout) -> FakeFlash {
    FakeFlash::new(0, EXT_SECTOR, layout.command_area_offset() + EXT_SECTOR * 3)
}

#[test]
fn without_a_current_app_a_new_candidate_always_lands_in_slot_zero() {
    // Slot-assignment policy excludes only the current-app and rescue
    // slots, not "already holds a different candidate" (spec §4.5
    // `putMetadata` step 2) — with no current app yet, every distinct
    // FIRMWARE push is eligible for slot 0 and keeps reusing it.
    let key = SingleKey::deterministic(1);
    let layout = layout();
    let mut region = flash(layout);
    let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), None);

    let (v1, v1_fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(v1.as_bytes()), AckCode::Ok);
    assert_eq!(server.put_fragment(v1_fragments[0].as_bytes()), AckCode::Ok);

    let (v2, v2_fragments) = ImageBuilder::new(&key, 2, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(v2.as_bytes()), AckCode::Ok);

    // v1's slot was reused for v2, so v1's fragment is now routed nowhere.
    assert_eq!(server.put_fragment(v1_fragments[0].as_bytes()), AckCode::NackRequestFailed);
    assert_eq!(server.put_fragment(v2_fragments[0].as_bytes()), AckCode::Ok);
}

#[test]
fn current_app_and_rescue_occupancy_together_route_three_pushes_to_three_slots() {
    let key = SingleKey::deterministic(2);
    let layout = layout();
    let mut region = flash(layout);

    let (v1, v1_fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(1);
    {
        let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), None);
        assert_eq!(server.put_metadata(v1.as_bytes()), AckCode::Ok);
        assert_eq!(server.put_fragment(v1_fragments[0].as_bytes()), AckCode::Ok);
    }

    // Re-open as if `v1` is now the running application: its slot
    // becomes ineligible, so the next two distinct pushes fan out
    // across the remaining two slots instead of colliding in slot 0.
    let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), Some(v1));

    let (rescue, rescue_fragments) = ImageBuilder::new(&key, 99, FIRST_FLASH).rescue().rollback_number(1).build(1);
    assert_eq!(server.put_metadata(rescue.as_bytes()), AckCode::Ok);
    assert_eq!(server.put_fragment(rescue_fragments[0].as_bytes()), AckCode::Ok);

    let (v2, v2_fragments) = ImageBuilder::new(&key, 2, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(v2.as_bytes()), AckCode::Ok);
    assert_eq!(server.put_fragment(v2_fragments[0].as_bytes()), AckCode::Ok);

    // Both fragments were accepted into distinct slots rather than one
    // evicting the other.
    assert_eq!(server.client_progress(), 2);
}

#[test]
fn repeating_an_identical_metadata_push_is_a_no_op() {
    let key = SingleKey::deterministic(3);
    let layout = layout();
    let mut region = flash(layout);
    let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), None);

    let (metadata, _) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(metadata.as_bytes()), AckCode::Ok);
    // Byte-identical resend is recognized as already staged (spec §8
    // testable property 6 / scenario 4), not routed to a second slot.
    assert_eq!(server.put_metadata(metadata.as_bytes()), AckCode::Ok);
    assert_eq!(server.client_progress(), 0);
}

#[test]
fn a_later_command_overwrites_one_not_yet_consumed_by_the_installer() {
    let key = SingleKey::deterministic(4);
    let layout = layout();
    let mut region = flash(layout);
    let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), None);

    let (metadata, _) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.write_data_by_id(WriteDataId::FirmwareUpdate as u8, metadata.as_bytes()), AckCode::Ok);
    // Nothing has consumed the INSTALL command yet; a ROLLBACK request
    // simply replaces it rather than being turned away.
    assert_eq!(server.write_data_by_id(WriteDataId::FirmwareRollback as u8, &[]), AckCode::Ok);
}

#[test]
fn erase_slot_then_restaging_reuses_the_freed_slot() {
    let key = SingleKey::deterministic(5);
    let layout = layout();
    let mut region = flash(layout);
    let mut server = UpdateServerCore::init(&mut region, layout, &key, (FIRST_FLASH, LAST_FLASH), None);

    let (metadata, fragments) = ImageBuilder::new(&key, 1, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(metadata.as_bytes()), AckCode::Ok);
    assert_eq!(server.put_fragment(fragments[0].as_bytes()), AckCode::Ok);

    assert_eq!(server.write_data_by_id(WriteDataId::EraseSlot as u8, &[0]), AckCode::Ok);
    assert_eq!(server.put_fragment(fragments[0].as_bytes()), AckCode::NackRequestFailed);

    // The now-empty slot 0 is eligible again for a fresh push.
    let (metadata2, fragments2) = ImageBuilder::new(&key, 2, FIRST_FLASH).rollback_number(1).build(1);
    assert_eq!(server.put_metadata(metadata2.as_bytes()), AckCode::Ok);
    assert_eq!(server.put_fragment(fragments2[0].as_bytes()), AckCode::Ok);
}
