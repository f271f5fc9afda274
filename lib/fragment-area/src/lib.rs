// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Fragment Area (spec §4.2, component C2): one metadata record
//! followed by a fixed-stride table of fragments, backed by one
//! [`MemoryRegion`].

#![cfg_attr(not(test), no_std)]

use flash_if::{FlashError, MemoryRegion};
use ringbuf::{ringbuf, ringbuf_entry};
use update_abi::{Fragment, Metadata};
use zerocopy::FromZeroes;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaError {
    /// Requested slot is erased / has never been written.
    Empty,
    /// Record's magic, signature, or validation hook rejected it.
    Invalid,
    /// A concurrent flash operation is in progress; retry.
    Busy,
    /// Index or size argument is out of range for this area.
    Param,
    Flash(FlashError),
}

impl From<FlashError> for FaError {
    fn from(e: FlashError) -> Self {
        match e {
            // A read-back mismatch during a fresh write is a hardware
            // integrity failure, not a "try again" condition.
            FlashError::Busy => FaError::Busy,
            other => FaError::Flash(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Trace {
    WriteMetadata,
    WriteFragment(u32),
    FindLast(Option<u32>),
    EraseArea,
}

ringbuf!(Trace, 16, Trace::EraseArea);

/// Caller-supplied acceptance tests bound at [`FragmentArea::new`]. These
/// stand in for the Verifier (C4); `FragmentArea` never interprets
/// signatures itself.
pub trait MetadataValidator {
    fn validate(&mut self, metadata: &Metadata) -> bool;
}

pub trait FragmentValidator {
    fn validate(&mut self, fragment: &Fragment) -> bool;
}

/// One staging slot: a metadata sector followed by a fragment table.
///
/// `R` is held by value rather than as `&mut R` so a caller can hand in
/// either a concrete region (`R = &mut SomeRegion`, via the blanket
/// `MemoryRegion` impl on `&mut T`) or a short-lived view like
/// `flash_if::Window` constructed fresh for one call.
pub struct FragmentArea<R, MV, FV> {
    region: R,
    metadata_validator: MV,
    fragment_validator: FV,
}

impl<R, MV, FV> FragmentArea<R, MV, FV>
where
    R: MemoryRegion,
    MV: MetadataValidator,
    FV: FragmentValidator,
{
    /// Records `region` and binds the validation hooks. Performs no I/O
    /// (spec §4.2 `init`).
    pub fn new(region: R, metadata_validator: MV, fragment_validator: FV) -> Self {
        Self { region, metadata_validator, fragment_validator }
    }

    /// Bytes one metadata record occupies, rounded up to a whole number
    /// of sectors.
    fn metadata_span(&self) -> u32 {
        round_up(core::mem::size_of::<Metadata>() as u32, self.region.sector_size())
    }

    /// Fixed stride between fragment slots: `sizeof(Fragment)` rounded up
    /// to sector alignment (spec §4.2 "Layout discipline").
    fn fragment_stride(&self) -> u32 {
        round_up(core::mem::size_of::<Fragment>() as u32, self.region.sector_size())
    }

    fn fragment_address(&self, index: u32) -> u32 {
        self.region.base_address() + self.metadata_span() + index * self.fragment_stride()
    }

    /// Maximum number of fragment slots this area's region can hold.
    pub fn capacity(&self) -> u32 {
        (self.region.region_len() - self.metadata_span()) / self.fragment_stride()
    }

    pub fn read_metadata(&mut self) -> Result<Metadata, FaError> {
        let addr = self.region.base_address();
        let mut buf = Metadata::new_zeroed();
        self.region.read(addr, buf.as_bytes_mut())?;
        if Metadata::is_erased(buf.as_bytes(), self.region.erase_value()) {
            return Err(FaError::Empty);
        }
        if !buf.magic_ok() {
            return Err(FaError::Invalid);
        }
        if !self.metadata_validator.validate(&buf) {
            return Err(FaError::Invalid);
        }
        Ok(buf)
    }

    /// Requires `validate_metadata(in) == true`; erases the metadata
    /// sector first if it isn't already blank (spec §4.2 `writeMetadata`).
    pub fn write_metadata(&mut self, metadata: &Metadata) -> Result<(), FaError> {
        if !self.metadata_validator.validate(metadata) {
            return Err(FaError::Invalid);
        }
        ringbuf_entry!(Trace::WriteMetadata);
        let addr = self.region.base_address();
        let span = self.metadata_span();
        if !self.region.is_erased(addr, span)? {
            self.region.erase_sector(addr, span)?;
        }
        self.region.write(addr, metadata.as_bytes())?;
        Ok(())
    }

    /// Places `fragment` at slot `index`. Requires the destination
    /// fragment sector to already be erased (spec §4.2 `writeFragment`)
    /// — callers erase the whole area up front via [`Self::erase_area`]
    /// rather than this method erasing individual fragment slots, since a
    /// partially-populated image must never silently overwrite an
    /// earlier, already-verified fragment.
    pub fn write_fragment(&mut self, index: u32, fragment: &Fragment) -> Result<(), FaError> {
        if index >= self.capacity() {
            return Err(FaError::Param);
        }
        let addr = self.fragment_address(index);
        let stride = self.fragment_stride();
        if !self.region.is_erased(addr, stride)? {
            return Err(FaError::Busy);
        }
        ringbuf_entry!(Trace::WriteFragment(index));
        self.region.write(addr, fragment.as_bytes())?;
        Ok(())
    }

    /// Returns `Ok` only if `validate_fragment` accepts the stored bytes.
    pub fn read_fragment(&mut self, index: u32) -> Result<Fragment, FaError> {
        let fragment = self.read_fragment_force(index)?;
        if !self.fragment_validator.validate(&fragment) {
            return Err(FaError::Invalid);
        }
        Ok(fragment)
    }

    /// Returns the stored bytes without invoking the validation hook, for
    /// hash-chain reconstruction (spec §4.2 `readFragmentForce`).
    pub fn read_fragment_force(&mut self, index: u32) -> Result<Fragment, FaError> {
        if index >= self.capacity() {
            return Err(FaError::Param);
        }
        let addr = self.fragment_address(index);
        let mut buf = Fragment::new_zeroed();
        self.region.read(addr, buf.as_bytes_mut())?;
        if Fragment::is_erased(buf.as_bytes(), self.region.erase_value()) {
            return Err(FaError::Empty);
        }
        Ok(buf)
    }

    /// Scans slot indices from the top of this area's capacity downward
    /// and returns the first index whose slot is non-erased and passes
    /// validation (spec §4.2 `findLastFragment` tie-break).
    pub fn find_last_fragment(&mut self) -> Result<Option<(u32, Fragment)>, FaError> {
        let mut index = self.capacity();
        while index > 0 {
            index -= 1;
            match self.read_fragment(index) {
                Ok(fragment) => {
                    ringbuf_entry!(Trace::FindLast(Some(index)));
                    return Ok(Some((index, fragment)));
                }
                Err(FaError::Empty) | Err(FaError::Invalid) => continue,
                Err(other) => return Err(other),
            }
        }
        ringbuf_entry!(Trace::FindLast(None));
        Ok(None)
    }

    /// Erases the entire region: metadata sector and every fragment slot.
    pub fn erase_area(&mut self) -> Result<(), FaError> {
        ringbuf_entry!(Trace::EraseArea);
        self.region.erase_sector(self.region.base_address(), self.region.region_len())?;
        Ok(())
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    (value + align - 1) / align * align
}
