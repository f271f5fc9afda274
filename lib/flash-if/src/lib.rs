// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Memory Abstraction (spec §4.1, component C1).
//!
//! `MemoryRegion` is the capability set every flash-backed component
//! (Fragment Area, Command Area, Installer) is handed at construction,
//! rather than reaching for a hardware singleton. Implementors supply the
//! three unverified primitives (`hw_read`/`hw_write`/`hw_erase_sector`);
//! the trait's default `read`/`write`/`erase_sector` methods add bounds
//! checking, alignment checking, and — for `write` — the read-back
//! verification spec §4.1 and testable property 3 require.

#![cfg_attr(not(test), no_std)]

/// Size of the scratch buffer used to chunk the write-then-read-back
/// comparison. Chosen to be small enough for a stack buffer on a
/// constrained MCU while large enough to keep the comparison loop short.
const VERIFY_CHUNK: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashError {
    /// `[addr, addr+len)` isn't contained in this region.
    OutOfBounds,
    /// `addr` (for erase) wasn't sector-aligned, or `len` wasn't a
    /// multiple of the sector size.
    Unaligned,
    /// The underlying hardware reported a failure.
    HardwareFailure,
    /// A write's read-back did not match what was written.
    ReadbackMismatch,
    /// The region is mid-operation; retry later.
    Busy,
}

/// One readable/writable/erasable region of flash, with sector-granularity
/// erase.
pub trait MemoryRegion {
    fn base_address(&self) -> u32;
    fn region_len(&self) -> u32;
    fn sector_size(&self) -> u32;
    /// Byte value an erased cell reads as (conventionally `0xFF`).
    fn erase_value(&self) -> u8;

    /// Unverified primitive read. Callers should prefer [`Self::read`].
    fn hw_read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError>;
    /// Unverified primitive write. Callers should prefer [`Self::write`].
    fn hw_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError>;
    /// Erases every sector in `[addr, addr+len)`. `addr` must be
    /// sector-aligned and `len` a multiple of the sector size (checked by
    /// [`Self::erase_sector`] before delegating here).
    fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError>;

    fn in_bounds(&self, addr: u32, len: u32) -> bool {
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        addr >= self.base_address() && end <= self.base_address() + self.region_len()
    }

    /// Plain read, bounds-checked.
    fn read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError> {
        if !self.in_bounds(addr, out.len() as u32) {
            return Err(FlashError::OutOfBounds);
        }
        self.hw_read(addr, out)
    }

    /// Write `data` at `addr`, then read it back and compare. Any mismatch
    /// is reported as [`FlashError::ReadbackMismatch`] rather than
    /// silently accepted (testable property 3).
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        if !self.in_bounds(addr, data.len() as u32) {
            return Err(FlashError::OutOfBounds);
        }
        self.hw_write(addr, data)?;

        let mut checked = 0usize;
        let mut buf = [0u8; VERIFY_CHUNK];
        while checked < data.len() {
            let n = core::cmp::min(VERIFY_CHUNK, data.len() - checked);
            self.hw_read(addr + checked as u32, &mut buf[..n])?;
            if buf[..n] != data[checked..checked + n] {
                return Err(FlashError::ReadbackMismatch);
            }
            checked += n;
        }
        Ok(())
    }

    /// Erase every sector fully covered by `[addr, addr+len)`.
    fn erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        if !self.in_bounds(addr, len) {
            return Err(FlashError::OutOfBounds);
        }
        let sector = self.sector_size();
        if addr % sector != 0 || len % sector != 0 {
            return Err(FlashError::Unaligned);
        }
        self.hw_erase_sector(addr, len)
    }

    /// Is every byte in `[addr, addr+len)` at the erase value?
    fn is_erased(&mut self, addr: u32, len: u32) -> Result<bool, FlashError> {
        let mut buf = [0u8; VERIFY_CHUNK];
        let ev = self.erase_value();
        let mut checked = 0u32;
        while checked < len {
            let n = core::cmp::min(VERIFY_CHUNK as u32, len - checked) as usize;
            self.read(addr + checked, &mut buf[..n])?;
            if buf[..n].iter().any(|&b| b != ev) {
                return Ok(false);
            }
            checked += n as u32;
        }
        Ok(true)
    }
}

/// A sub-range of a larger [`MemoryRegion`], re-based so addresses
/// inside the window start at `window_base` instead of the backing
/// region's own base address.
///
/// The external flash layout (spec §6.2) is one physical chip sliced
/// into four logical regions (three staging slots plus the command
/// area); `Window` is how each of those is handed to a `FragmentArea`
/// or `CommandArea` without giving either persistent access to the
/// whole chip. Callers build one short-lived `Window` per operation
/// rather than holding several overlapping ones at once, so there's
/// never more than one `&mut` borrow of the backing region live.
pub struct Window<'a, R> {
    inner: &'a mut R,
    inner_offset: u32,
    window_base: u32,
    window_len: u32,
}

impl<'a, R: MemoryRegion> Window<'a, R> {
    pub fn new(inner: &'a mut R, inner_offset: u32, window_len: u32) -> Self {
        Self { inner, inner_offset, window_base: 0, window_len }
    }

    fn to_inner(&self, addr: u32) -> u32 {
        self.inner_offset + (addr - self.window_base)
    }
}

impl<'a, R: MemoryRegion> MemoryRegion for Window<'a, R> {
    fn base_address(&self) -> u32 {
        self.window_base
    }
    fn region_len(&self) -> u32 {
        self.window_len
    }
    fn sector_size(&self) -> u32 {
        self.inner.sector_size()
    }
    fn erase_value(&self) -> u8 {
        self.inner.erase_value()
    }
    fn hw_read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError> {
        let inner_addr = self.to_inner(addr);
        self.inner.hw_read(inner_addr, out)
    }
    fn hw_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        let inner_addr = self.to_inner(addr);
        self.inner.hw_write(inner_addr, data)
    }
    fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        let inner_addr = self.to_inner(addr);
        self.inner.hw_erase_sector(inner_addr, len)
    }
}

impl<'a, T: MemoryRegion + ?Sized> MemoryRegion for &'a mut T {
    fn base_address(&self) -> u32 {
        (**self).base_address()
    }
    fn region_len(&self) -> u32 {
        (**self).region_len()
    }
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }
    fn erase_value(&self) -> u8 {
        (**self).erase_value()
    }
    fn hw_read(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashError> {
        (**self).hw_read(addr, out)
    }
    fn hw_write(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashError> {
        (**self).hw_write(addr, data)
    }
    fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
        (**self).hw_erase_sector(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        base: u32,
        data: std::vec::Vec<u8>,
        fail_write: bool,
    }

    impl MemoryRegion for Fake {
        fn base_address(&self) -> u32 {
            self.base
        }
        fn region_len(&self) -> u32 {
            self.data.len() as u32
        }
        fn sector_size(&self) -> u32 {
            16
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
            if self.fail_write {
                self.data[off] ^= 0xFF;
            }
            Ok(())
        }
        fn hw_erase_sector(&mut self, addr: u32, len: u32) -> Result<(), FlashError> {
            let off = (addr - self.base) as usize;
            self.data[off..off + len as usize].fill(0xFF);
            Ok(())
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut f = Fake { base: 0x1000, data: vec![0xFFu8; 64], fail_write: false };
        f.write(0x1000, b"hello!!!").unwrap();
        let mut out = [0u8; 8];
        f.read(0x1000, &mut out).unwrap();
        assert_eq!(&out, b"hello!!!");
    }

    #[test]
    fn corrupted_write_is_rejected() {
        let mut f = Fake { base: 0x1000, data: vec![0xFFu8; 64], fail_write: true };
        assert_eq!(f.write(0x1000, b"hello!!!"), Err(FlashError::ReadbackMismatch));
    }

    #[test]
    fn unaligned_erase_is_rejected() {
        let mut f = Fake { base: 0x1000, data: vec![0xFFu8; 64], fail_write: false };
        assert_eq!(f.erase_sector(0x1001, 16), Err(FlashError::Unaligned));
        assert_eq!(f.erase_sector(0x1000, 15), Err(FlashError::Unaligned));
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let mut f = Fake { base: 0x1000, data: vec![0xFFu8; 64], fail_write: false };
        let mut out = [0u8; 8];
        assert_eq!(f.read(0x2000, &mut out), Err(FlashError::OutOfBounds));
    }

    #[test]
    fn window_rebases_addresses_into_the_backing_region() {
        let mut f = Fake { base: 0x1000, data: vec![0xFFu8; 64], fail_write: false };
        let mut window = Window::new(&mut f, 0x1020, 16);
        window.write(0, b"hi there").unwrap();
        let mut out = [0u8; 8];
        window.read(0, &mut out).unwrap();
        assert_eq!(&out, b"hi there");
        drop(window);
        let mut direct = [0u8; 8];
        f.read(0x1020, &mut direct).unwrap();
        assert_eq!(&direct, b"hi there");
    }
}
