// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Warm-Reset Scratch (spec §3.5, §4.7, component C7): a small
//! CRC-protected record living in uninitialized RAM, so its contents
//! survive a warm reset but are checked for integrity on every boot.
//!
//! `setMember` in the spec is described as a bounded pointer write; Rust
//! has no safe equivalent to an arbitrary pointer-offset write into a
//! struct, so it's modeled here as [`ScratchField`], an enum naming
//! exactly the members that may be set. This also gets the spec's
//! "out-of-range writes are silently refused" requirement for free —
//! there's no way to name a field `ScratchField` doesn't declare.

#![cfg_attr(not(test), no_std)]

use update_abi::crc32;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// No live app / no live bootloader image to trust.
pub const TAG_INVALID: u32 = 0xDEAD_BEEF;
/// Image has been confirmed good by a prior boot.
pub const TAG_GOOD: u32 = 0x600D_F00D;
/// Freshly installed image awaiting confirmation; a warm reset while
/// still `TRYOUT` is a candidate for automatic rollback.
pub const TAG_TRYOUT: u32 = 0xC0FF_EE01;

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallTag {
    Good = TAG_GOOD,
    Invalid = TAG_INVALID,
    Tryout = TAG_TRYOUT,
}

impl TryFrom<u32> for InstallTag {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            TAG_GOOD => Ok(Self::Good),
            TAG_INVALID => Ok(Self::Invalid),
            TAG_TRYOUT => Ok(Self::Tryout),
            _ => Err(()),
        }
    }
}

/// The members [`WarmResetScratch::set_member`] is allowed to change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScratchField {
    ResetCount(u32),
    AppTag(u32),
    BootloaderTag(u32),
    InstallTag(InstallTag),
    ResetArg(u32),
}

/// The on-RAM record itself (spec §3.5). Field order matters: `crc32` is
/// computed over every byte that precedes it.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct WarmResetScratch {
    pub reset_count: u32,
    pub app_tag: u32,
    pub bootloader_tag: u32,
    pub install_tag: u32,
    pub reset_arg: u32,
    crc32: u32,
}

impl WarmResetScratch {
    const CRC_PREFIX_LEN: usize = core::mem::size_of::<Self>() - 4;

    fn computed_crc(&self) -> u32 {
        crc32(&self.as_bytes()[..Self::CRC_PREFIX_LEN])
    }

    /// A fully zeroed, internally-consistent record (all tags read as
    /// `0`, i.e. neither `GOOD` nor `TRYOUT` nor `INVALID` — callers
    /// should treat a freshly blanked scratch as "no live app").
    fn blank() -> Self {
        let mut s = Self::new_zeroed();
        s.crc32 = s.computed_crc();
        s
    }

    /// Recomputes the CRC over every field but `crc32`; if it doesn't
    /// match what's stored, the whole region is suspect (most likely a
    /// cold power-on with genuinely uninitialized RAM) and is zeroed
    /// (spec §4.7 `init`).
    pub fn init(&mut self) {
        if self.crc32 != self.computed_crc() {
            *self = Self::blank();
        }
    }

    pub fn install_tag(&self) -> Result<InstallTag, ()> {
        InstallTag::try_from(self.install_tag)
    }

    /// Bounded write of one declared member, then recomputes the CRC
    /// (spec §4.7 `setMember`).
    pub fn set_member(&mut self, field: ScratchField) {
        match field {
            ScratchField::ResetCount(v) => self.reset_count = v,
            ScratchField::AppTag(v) => self.app_tag = v,
            ScratchField::BootloaderTag(v) => self.bootloader_tag = v,
            ScratchField::InstallTag(tag) => self.install_tag = tag as u32,
            ScratchField::ResetArg(v) => self.reset_arg = v,
        }
        self.crc32 = self.computed_crc();
    }
}
