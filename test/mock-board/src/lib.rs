// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory peripherals for exercising the firmware on the host.
//!
//! Everything here is cheaply cloneable; a clone is another handle onto
//! the same underlying device, so a test can keep one handle while the
//! firmware owns the other, and devices can be driven from a second
//! thread when a test needs both ends of a link making progress at once.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use drv_storage_api::{Eeprom, FlashSector, StorageError};
use drv_systick_api::SysTick;
use embedded_hal::blocking::delay::{DelayMs, DelayUs};
use embedded_hal::digital::v2::InputPin;
use embedded_hal::serial::{Read, Write};

/// One end of a serial line. Reads drain the receive queue; writes append
/// to the transmit queue.
#[derive(Clone)]
pub struct MockUart {
    rx: Arc<Mutex<VecDeque<u8>>>,
    tx: Arc<Mutex<VecDeque<u8>>>,
}

impl MockUart {
    /// A free-standing port: whatever the firmware writes piles up in
    /// `tx`, and the test injects into `rx`.
    pub fn new() -> Self {
        Self {
            rx: Arc::new(Mutex::new(VecDeque::new())),
            tx: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Two ports wired back to back, like the inter-board line.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(VecDeque::new()));
        let b = Arc::new(Mutex::new(VecDeque::new()));
        (
            Self {
                rx: a.clone(),
                tx: b.clone(),
            },
            Self { rx: b, tx: a },
        )
    }

    /// Queues bytes for the firmware to receive.
    pub fn inject(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes.iter().copied());
    }

    /// Takes everything the firmware has transmitted so far.
    pub fn take_output(&self) -> Vec<u8> {
        self.tx.lock().unwrap().drain(..).collect()
    }

    pub fn rx_is_empty(&self) -> bool {
        self.rx.lock().unwrap().is_empty()
    }
}

impl Default for MockUart {
    fn default() -> Self {
        Self::new()
    }
}

impl Read<u8> for MockUart {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        self.rx
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockUart {
    type Error = Infallible;

    fn write(&mut self, byte: u8) -> nb::Result<(), Infallible> {
        self.tx.lock().unwrap().push_back(byte);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        Ok(())
    }
}

/// Word-addressed EEPROM image.
#[derive(Clone)]
pub struct MockEeprom {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MockEeprom {
    pub fn new(image: Vec<u8>) -> Self {
        Self {
            data: Arc::new(Mutex::new(image)),
        }
    }

    /// A 2 KiB blank device.
    pub fn blank() -> Self {
        Self::new(vec![0xFF; 0x800])
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        self.data.lock().unwrap()[offset..offset + bytes.len()]
            .copy_from_slice(bytes);
    }
}

impl Eeprom for MockEeprom {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        if offset % 4 != 0 || buf.len() % 4 != 0 {
            return Err(StorageError::Misaligned);
        }
        let data = self.data.lock().unwrap();
        let end = offset.checked_add(buf.len()).ok_or(StorageError::OutOfRange)?;
        if end > data.len() {
            return Err(StorageError::OutOfRange);
        }
        buf.copy_from_slice(&data[offset..end]);
        Ok(())
    }
}

struct FlashInner {
    data: [u8; 1024],
    erase_count: usize,
    program_count: usize,
    fail_next_program: bool,
}

/// One 1 KiB flash sector with erase/program bookkeeping.
#[derive(Clone)]
pub struct MockFlash {
    inner: Arc<Mutex<FlashInner>>,
}

impl MockFlash {
    pub fn erased() -> Self {
        Self::with_contents(&[])
    }

    /// A sector programmed with `image` (padded with the erased pattern).
    pub fn with_contents(image: &[u8]) -> Self {
        let mut data = [0xFF; 1024];
        data[..image.len()].copy_from_slice(image);
        Self {
            inner: Arc::new(Mutex::new(FlashInner {
                data,
                erase_count: 0,
                program_count: 0,
                fail_next_program: false,
            })),
        }
    }

    pub fn contents(&self) -> [u8; 1024] {
        self.inner.lock().unwrap().data
    }

    pub fn erase_count(&self) -> usize {
        self.inner.lock().unwrap().erase_count
    }

    pub fn program_count(&self) -> usize {
        self.inner.lock().unwrap().program_count
    }

    /// Makes the next program attempt fail, leaving the sector erased,
    /// like a power cut between erase and program.
    pub fn fail_next_program(&self) {
        self.inner.lock().unwrap().fail_next_program = true;
    }
}

impl FlashSector for MockFlash {
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();
        let end = offset.checked_add(buf.len()).ok_or(StorageError::OutOfRange)?;
        if end > inner.data.len() {
            return Err(StorageError::OutOfRange);
        }
        buf.copy_from_slice(&inner.data[offset..end]);
        Ok(())
    }

    fn erase(&mut self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data = [0xFF; 1024];
        inner.erase_count += 1;
        Ok(())
    }

    fn program(&mut self, offset: usize, data: &[u8]) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_program {
            inner.fail_next_program = false;
            return Err(StorageError::ProgramFault);
        }
        if offset % 4 != 0 || data.len() % 4 != 0 {
            return Err(StorageError::Misaligned);
        }
        let end = offset.checked_add(data.len()).ok_or(StorageError::OutOfRange)?;
        if end > inner.data.len() {
            return Err(StorageError::OutOfRange);
        }
        inner.data[offset..end].copy_from_slice(data);
        inner.program_count += 1;
        Ok(())
    }
}

/// A tick counter whose one-second windows elapse after a fixed number of
/// `expired` polls, so timeout loops terminate promptly under test.
pub struct MockSysTick {
    counter: u32,
    window: u32,
    remaining: u32,
}

impl MockSysTick {
    pub fn new(polls_per_window: u32) -> Self {
        Self {
            counter: 0x00C0FFEE,
            window: polls_per_window,
            remaining: 0,
        }
    }
}

impl SysTick for MockSysTick {
    fn now(&mut self) -> u32 {
        self.counter = self.counter.wrapping_mul(2891336453).wrapping_add(1);
        self.counter
    }

    fn arm(&mut self) {
        self.remaining = self.window;
    }

    fn expired(&mut self) -> bool {
        if self.remaining == 0 {
            true
        } else {
            self.remaining -= 1;
            false
        }
    }
}

/// The unlock button. Active-low, like the real switch.
#[derive(Clone)]
pub struct MockButton {
    pressed: Arc<AtomicBool>,
}

impl MockButton {
    pub fn released() -> Self {
        Self {
            pressed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_pressed(&self, pressed: bool) {
        self.pressed.store(pressed, Ordering::SeqCst);
    }
}

impl InputPin for MockButton {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Infallible> {
        Ok(!self.pressed.load(Ordering::SeqCst))
    }

    fn is_low(&self) -> Result<bool, Infallible> {
        Ok(self.pressed.load(Ordering::SeqCst))
    }
}

/// Records requested delays instead of sleeping.
#[derive(Clone, Default)]
pub struct MockDelay {
    total_us: Arc<Mutex<u64>>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_ms(&self) -> u64 {
        *self.total_us.lock().unwrap() / 1000
    }
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        *self.total_us.lock().unwrap() += u64::from(ms) * 1000;
    }
}

impl DelayUs<u32> for MockDelay {
    fn delay_us(&mut self, us: u32) {
        *self.total_us.lock().unwrap() += u64::from(us);
    }
}
