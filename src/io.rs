//! The cabinet's I/O ports.
//!
//! `IN`/`OUT` go through the [`IoBus`] trait. [`PortBank`] is the Space
//! Invaders implementation: three input latches, the sound latches, the
//! watchdog and the 16-bit shift register used for sprite collision.
//!
//! The latches other threads touch live in [`SharedLatches`]. The input
//! thread owns the input bytes and the emulation thread owns the output
//! bytes, so no latch has two writers.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::metrics::record_port_write;

/// Port-mapped I/O as seen by the executor.
pub trait IoBus {
    fn input(&mut self, port: u8) -> u8;
    fn output(&mut self, port: u8, value: u8);
}

pub const PORT_SHIFT_RESULT: u8 = 3;
pub const PORT_SHIFT_AMOUNT: u8 = 2;
pub const PORT_SOUND_1: u8 = 3;
pub const PORT_SHIFT_DATA: u8 = 4;
pub const PORT_SOUND_2: u8 = 5;
pub const PORT_WATCHDOG: u8 = 6;

// Input latch values at power-on. Bits 1-3 of port 0 and bit 3 of port 1
// read as 1 on the real board.
pub const PORT0_RESET: u8 = 0b0000_1110;
pub const PORT1_RESET: u8 = 0b0000_1000;

/// Cabinet controls and the input bit each one drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Button {
    Credit,
    P1Start,
    P2Start,
    P1Fire,
    P1Left,
    P1Right,
    P2Fire,
    P2Left,
    P2Right,
    Tilt,
}

impl Button {
    pub const ALL: [Button; 10] = [
        Button::Credit,
        Button::P1Start,
        Button::P2Start,
        Button::P1Fire,
        Button::P1Left,
        Button::P1Right,
        Button::P2Fire,
        Button::P2Left,
        Button::P2Right,
        Button::Tilt,
    ];

    pub fn port(self) -> u8 {
        match self {
            Button::Credit
            | Button::P1Start
            | Button::P2Start
            | Button::P1Fire
            | Button::P1Left
            | Button::P1Right => 1,
            Button::P2Fire | Button::P2Left | Button::P2Right | Button::Tilt => 2,
        }
    }

    pub fn mask(self) -> u8 {
        match self {
            Button::Credit => 0x01,
            Button::P2Start => 0x02,
            Button::P1Start => 0x04,
            Button::Tilt => 0x04,
            Button::P1Fire | Button::P2Fire => 0x10,
            Button::P1Left | Button::P2Left => 0x20,
            Button::P1Right | Button::P2Right => 0x40,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Button::Credit => "credit",
            Button::P1Start => "p1_start",
            Button::P2Start => "p2_start",
            Button::P1Fire => "p1_fire",
            Button::P1Left => "p1_left",
            Button::P1Right => "p1_right",
            Button::P2Fire => "p2_fire",
            Button::P2Left => "p2_left",
            Button::P2Right => "p2_right",
            Button::Tilt => "tilt",
        }
    }
}

impl fmt::Display for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Button {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Button::ALL
            .iter()
            .copied()
            .find(|button| button.name() == s)
            .ok_or_else(|| format!("unknown button '{}'", s))
    }
}

// Port 3 sound bits
pub const SOUND_UFO: u8 = 0x01;
pub const SOUND_SHOT: u8 = 0x02;
pub const SOUND_PLAYER_DIE: u8 = 0x04;
pub const SOUND_INVADER_DIE: u8 = 0x08;
pub const SOUND_EXTENDED_PLAY: u8 = 0x10;
pub const SOUND_AMP_ENABLE: u8 = 0x20;

// Port 5 sound bits
pub const SOUND_FLEET_1: u8 = 0x01;
pub const SOUND_FLEET_2: u8 = 0x02;
pub const SOUND_FLEET_3: u8 = 0x04;
pub const SOUND_FLEET_4: u8 = 0x08;
pub const SOUND_UFO_HIT: u8 = 0x10;
pub const COCKTAIL_FLIP: u8 = 0x20;

/// The two sound-select output latches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SoundLatches {
    pub port3: u8,
    pub port5: u8,
}

impl SoundLatches {
    /// Bits set now that were clear in `previous`: the effects that just
    /// started.
    pub fn started_since(&self, previous: &SoundLatches) -> SoundLatches {
        SoundLatches {
            port3: self.port3 & !previous.port3,
            port5: self.port5 & !previous.port5,
        }
    }
}

/// Latches shared between the emulation thread and its collaborators.
pub struct SharedLatches {
    inputs: [AtomicU8; 3],
    watchdog: AtomicU8,
    sound: watch::Sender<SoundLatches>,
    dip_switches: u8,
}

impl SharedLatches {
    pub fn new(dip_switches: u8) -> Self {
        let (sound, _) = watch::channel(SoundLatches::default());
        SharedLatches {
            inputs: [
                AtomicU8::new(PORT0_RESET),
                AtomicU8::new(PORT1_RESET),
                AtomicU8::new(dip_switches),
            ],
            watchdog: AtomicU8::new(0),
            sound,
            dip_switches,
        }
    }

    pub fn press(&self, button: Button) {
        self.inputs[button.port() as usize].fetch_or(button.mask(), Ordering::Relaxed);
    }

    pub fn release(&self, button: Button) {
        self.inputs[button.port() as usize].fetch_and(!button.mask(), Ordering::Relaxed);
    }

    pub fn set_button(&self, button: Button, pressed: bool) {
        if pressed {
            self.press(button)
        } else {
            self.release(button)
        }
    }

    pub fn input(&self, port: u8) -> Option<u8> {
        self.inputs
            .get(port as usize)
            .map(|latch| latch.load(Ordering::Relaxed))
    }

    pub fn sound(&self) -> SoundLatches {
        *self.sound.borrow()
    }

    /// Receiver that wakes whenever a sound latch changes value.
    pub fn subscribe_sound(&self) -> watch::Receiver<SoundLatches> {
        self.sound.subscribe()
    }

    pub fn watchdog(&self) -> u8 {
        self.watchdog.load(Ordering::Relaxed)
    }

    pub fn dip_switches(&self) -> u8 {
        self.dip_switches
    }

    fn store_sound(&self, update: impl FnOnce(&mut SoundLatches) -> bool) {
        self.sound.send_if_modified(update);
    }

    pub fn reset(&self) {
        self.inputs[0].store(PORT0_RESET, Ordering::Relaxed);
        self.inputs[1].store(PORT1_RESET, Ordering::Relaxed);
        self.inputs[2].store(self.dip_switches, Ordering::Relaxed);
        self.watchdog.store(0, Ordering::Relaxed);
        self.store_sound(|latches| {
            let changed = *latches != SoundLatches::default();
            *latches = SoundLatches::default();
            changed
        });
    }
}

/// Port bank owned by the emulation thread.
pub struct PortBank {
    shift0: u8,
    shift1: u8,
    shift_amount: u8,
    latches: Arc<SharedLatches>,
}

impl PortBank {
    pub fn new(latches: Arc<SharedLatches>) -> Self {
        PortBank {
            shift0: 0,
            shift1: 0,
            shift_amount: 0,
            latches,
        }
    }

    pub fn latches(&self) -> &Arc<SharedLatches> {
        &self.latches
    }

    /// 8-bit window into the shift register selected by the shift amount.
    pub fn shift_result(&self) -> u8 {
        let register = (self.shift1 as u16) << 8 | self.shift0 as u16;
        (register >> (8 - self.shift_amount)) as u8
    }

    pub fn reset(&mut self) {
        self.shift0 = 0;
        self.shift1 = 0;
        self.shift_amount = 0;
        self.latches.reset();
    }
}

impl IoBus for PortBank {
    fn input(&mut self, port: u8) -> u8 {
        match port {
            0..=2 => self.latches.inputs[port as usize].load(Ordering::Relaxed),
            PORT_SHIFT_RESULT => self.shift_result(),
            _ => {
                debug!("IN from unmapped port {}", port);
                0
            }
        }
    }

    fn output(&mut self, port: u8, value: u8) {
        record_port_write(port);
        match port {
            PORT_SHIFT_AMOUNT => self.shift_amount = value & 0x07,
            PORT_SHIFT_DATA => {
                self.shift0 = self.shift1;
                self.shift1 = value;
            }
            PORT_SOUND_1 => self.latches.store_sound(|latches| {
                let changed = latches.port3 != value;
                latches.port3 = value;
                changed
            }),
            PORT_SOUND_2 => self.latches.store_sound(|latches| {
                let changed = latches.port5 != value;
                latches.port5 = value;
                changed
            }),
            PORT_WATCHDOG => self.latches.watchdog.store(value, Ordering::Relaxed),
            _ => debug!("OUT {:02x} to unmapped port {}", value, port),
        }
    }
}

/// Bus for tests: scripted inputs, recorded outputs.
#[derive(Debug, Default)]
pub struct DummyBus {
    pub inputs: [u8; 8],
    pub outputs: Vec<(u8, u8)>,
}

impl DummyBus {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IoBus for DummyBus {
    fn input(&mut self, port: u8) -> u8 {
        self.inputs.get(port as usize).copied().unwrap_or(0)
    }

    fn output(&mut self, port: u8, value: u8) {
        self.outputs.push((port, value));
    }
}
