// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A static ring buffer for instrumenting drivers and cores, adapted from
//! the Hubris `ringbuf` crate.
//!
//! Each subsystem in this workspace (spec §5) is a singleton owned by a
//! single cooperative task, so a ring buffer declared here never sees
//! concurrent writers — the only thing a `&'static` cell needs to survive
//! is being mutated repeatedly from the one task that owns it. Hubris's
//! original relies on `userlib::util::StaticCell`, which isn't available
//! outside a Hubris kernel; this adaptation keeps the same macro surface
//! (`ringbuf!`, `ringbuf_entry!`) backed by a small `Cell`-style holder
//! instead.

#![no_std]

use core::cell::UnsafeCell;

/// Holds a `T` that is mutated in place by a single owning task.
///
/// # Safety contract
///
/// Callers must not call [`StaticCell::borrow_mut`] from more than one
/// execution context at a time. This holds for every ring buffer in this
/// workspace because each core (Update Server, Installer) runs
/// single-threadedly (spec §5).
pub struct StaticCell<T>(UnsafeCell<T>);

unsafe impl<T> Sync for StaticCell<T> {}

impl<T> StaticCell<T> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// # Safety
    /// See the struct-level safety contract.
    pub unsafe fn borrow_mut(cell: &Self) -> &mut T {
        &mut *cell.0.get()
    }
}

/// Declares a ring buffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ring buffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all
/// initialized to `expr`. If you omit the name it defaults to
/// `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[used]
        static $name: $crate::StaticCell<$crate::Ringbuf<$t, $n>> =
            $crate::StaticCell::new($crate::Ringbuf {
                last: None,
                buffer: [$crate::RingbufEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {};
    ($t:ty, $n:expr, $init:expr) => {};
}

/// Inserts `payload` into the named ring buffer (declared with
/// [`ringbuf!`]). Without a name, defaults to `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let (p, buf) = ($payload, &$buf);
        // SAFETY: every ring buffer in this workspace is owned by exactly
        // one single-threaded task (spec §5).
        $crate::Ringbuf::entry(
            unsafe { $crate::StaticCell::borrow_mut(buf) },
            line!() as u16,
            p,
        );
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {};
    ($payload:expr) => {};
}

/// A single entry recorded in a [`Ringbuf`]. Repeated identical entries
/// (same `line` and `payload`) collapse into one with an incrementing
/// `count` rather than each taking a slot.
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

/// A ring buffer of parametrized entry type and capacity. Normally
/// instantiated via the [`ringbuf!`] macro rather than directly.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub fn entry(&mut self, line: u16, payload: T) {
        let ndx = match self.last {
            None => 0,
            Some(last) => {
                let ent = &mut self.buffer[last];
                if ent.line == line && ent.payload == payload {
                    if let Some(new_count) = ent.count.checked_add(1) {
                        ent.count = new_count;
                        return;
                    }
                }
                if last + 1 >= self.buffer.len() {
                    0
                } else {
                    last + 1
                }
            }
        };

        let ent = &mut self.buffer[ndx];
        ent.line = line;
        ent.payload = payload;
        ent.count = 1;
        ent.generation = ent.generation.wrapping_add(1);
        self.last = Some(ndx);
    }
}

#[cfg(test)]
mod tests {
    ringbuf!(u32, 4, 0);

    #[test]
    fn repeated_entries_coalesce() {
        ringbuf_entry!(1);
        ringbuf_entry!(1);
        ringbuf_entry!(2);
        let snapshot = unsafe { crate::StaticCell::borrow_mut(&__RINGBUF) };
        assert_eq!(snapshot.last, Some(1));
        assert_eq!(snapshot.buffer[0].count, 2);
        assert_eq!(snapshot.buffer[1].payload, 2);
    }
}
