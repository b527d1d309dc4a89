// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the free-running system tick counter.
//!
//! The counter serves two unrelated purposes, which is why both appear on
//! one trait: its instantaneous value is the only per-boot-varying input
//! available to the DRBG on a board with no RTC, and its reload/underflow
//! behavior provides the one-second windows used to bound receive loops.

#![no_std]

pub trait SysTick {
    /// Samples the current value of the down-counter. The value is only
    /// meaningful as an unpredictable-at-build-time quantity; callers must
    /// not interpret it as a time.
    fn now(&mut self) -> u32;

    /// Reloads the counter for one one-second window.
    fn arm(&mut self);

    /// True once the armed window has elapsed. Must be cheap to call in a
    /// tight polling loop.
    fn expired(&mut self) -> bool;
}
