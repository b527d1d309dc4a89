// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static ring buffers for instrumenting the firmware.
//!
//! A ring buffer declared with [`ringbuf!`] lives in a `static` and is
//! only ever read from outside the program, by a debugger walking the
//! symbol. Nothing here writes to a UART or any other external interface,
//! which is what makes this the one permissible form of diagnostics in a
//! firmware whose failure policy is silence.
//!
//! Declare a buffer (one per module if the name is left implicit):
//!
//! ```ignore
//! ringbuf!(Trace, 16, Trace::None);
//! ```
//!
//! and record entries with:
//!
//! ```ignore
//! ringbuf_entry!(Trace::ResponseTimeout);
//! ```
//!
//! Entries record the source line and a generation counter, and an entry
//! identical to the previous one (same line, same payload) bumps a
//! repeat count instead of consuming a slot, so a polling loop stuck on
//! one condition doesn't flush the history.

#![cfg_attr(not(test), no_std)]

/// Re-exported for the macros below.
pub use spin::Mutex;

/// One slot of a [`Ringbuf`].
#[derive(Debug, Copy, Clone)]
pub struct RingbufEntry<T: Copy> {
    pub line: u16,
    pub generation: u16,
    pub count: u16,
    pub payload: T,
}

/// Fixed-capacity trace buffer; see the crate docs. Instantiate through
/// [`ringbuf!`] rather than directly.
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, N> {
    pub const fn new(initial: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: initial,
            }; N],
        }
    }

    pub fn record(&mut self, line: u16, payload: T) {
        if let Some(last) = self.last {
            let entry = &mut self.buffer[last];
            if entry.line == line && entry.payload == payload {
                entry.count = entry.count.wrapping_add(1);
                return;
            }
        }

        let index = match self.last {
            Some(last) if last + 1 < N => last + 1,
            _ => 0,
        };
        let entry = &mut self.buffer[index];
        *entry = RingbufEntry {
            line,
            generation: entry.generation.wrapping_add(1),
            count: 1,
            payload,
        };
        self.last = Some(index);
    }
}

/// Declares a ring buffer in the current module.
///
/// `ringbuf!(NAME, Type, N, expr)` declares a buffer named `NAME` with
/// room for `N` entries of `Type`, initialized to `expr`. Omitting the
/// name declares the module's default buffer, `__RINGBUF`.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::Mutex<$crate::Ringbuf<$t, $n>> =
            $crate::Mutex::new($crate::Ringbuf::new($init));
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        #[allow(dead_code)]
        const _: $t = $init;
        static $name: () = ();
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Records an entry in a ring buffer declared with [`ringbuf!`]. With one
/// argument, records into the module's default buffer.
#[cfg(not(feature = "disabled"))]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let (payload, buf) = ($payload, &$buf);
        buf.lock().record(line!() as u16, payload);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

#[cfg(feature = "disabled")]
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        let _ = &$payload;
        let _ = &$buf;
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}
