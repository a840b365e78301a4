use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::EmulatorError;
use crate::metrics::record_rejected_write;

pub const MEMORY_SIZE: usize = 0x10000;

/// Memory map of the Space Invaders board.
///   0x0000-0x1fff  ROM (invaders.h, .g, .f, .e)
///   0x2000-0x23ff  work RAM
///   0x2400-0x3fff  video RAM, 224x256 at 1 bit per pixel
///   0x4000-        RAM mirror
pub const ROM_END: u16 = 0x2000;
pub const VIDEO_RAM_START: u16 = 0x2400;
pub const MIRROR_START: u16 = 0x4000;
pub const VIDEO_RAM_SIZE: usize = (MIRROR_START - VIDEO_RAM_START) as usize;

// Bytes are atomics so the render thread can read video RAM while the CPU
// thread writes it. Only `Memory` hands out write access.
type Cells = Arc<[AtomicU8]>;

pub struct Memory {
    data: Cells,
}

impl Memory {
    pub fn new() -> Self {
        let cells: Vec<AtomicU8> = (0..MEMORY_SIZE).map(|_| AtomicU8::new(0)).collect();
        Memory { data: cells.into() }
    }

    /// Memory with `rom` loaded at address 0. The image must fit in the ROM
    /// region and must not be empty.
    pub fn with_rom(rom: &[u8]) -> Result<Self, EmulatorError> {
        if rom.is_empty() {
            return Err(EmulatorError::ResourceInitialization(
                "ROM image is empty".to_string(),
            ));
        }
        if rom.len() > ROM_END as usize {
            return Err(EmulatorError::ResourceInitialization(format!(
                "ROM image is {} bytes, the ROM region holds {}",
                rom.len(),
                ROM_END
            )));
        }
        let mut memory = Memory::new();
        memory.load_rom(rom, 0)?;
        Ok(memory)
    }

    pub fn read(&self, address: u16) -> u8 {
        self.data[address as usize].load(Ordering::Relaxed)
    }

    /// The write guard. Every write made by emulated code comes through here;
    /// writes into ROM or the mirror are dropped and `false` is returned.
    pub fn write(&mut self, address: u16, value: u8) -> bool {
        if address < ROM_END {
            debug!("write to ROM rejected at {:04x}", address);
            record_rejected_write("rom");
            return false;
        }
        if address >= MIRROR_START {
            debug!("write to RAM mirror rejected at {:04x}", address);
            record_rejected_write("mirror");
            return false;
        }
        self.data[address as usize].store(value, Ordering::Relaxed);
        true
    }

    pub fn is_writable(address: u16) -> bool {
        (ROM_END..MIRROR_START).contains(&address)
    }

    // Bypasses the guard, so only `with_rom` may call it.
    fn load_rom(&mut self, data: &[u8], start_address: u16) -> Result<(), EmulatorError> {
        let start = start_address as usize;
        let end = start + data.len();
        if end > MEMORY_SIZE {
            return Err(EmulatorError::ResourceInitialization(format!(
                "{} bytes at {:04x} run past the end of memory",
                data.len(),
                start_address
            )));
        }
        for (cell, &byte) in self.data[start..end].iter().zip(data) {
            cell.store(byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Little-endian word at `address`; the high byte wraps to 0x0000.
    pub fn read_u16(&self, address: u16) -> u16 {
        let low = self.read(address) as u16;
        let high = self.read(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }

    /// Store a word low byte first. Each byte passes the guard on its own,
    /// so a word straddling 0x2000 keeps only its RAM half.
    pub fn write_u16(&mut self, address: u16, value: u16) {
        self.write(address, value as u8);
        self.write(address.wrapping_add(1), (value >> 8) as u8);
    }

    pub fn dump(&self, range: Range<u16>) -> Vec<u8> {
        range.map(|address| self.read(address)).collect()
    }

    /// Zero every writable byte; ROM is kept.
    pub fn clear_ram(&mut self) {
        for cell in &self.data[ROM_END as usize..MIRROR_START as usize] {
            cell.store(0, Ordering::Relaxed);
        }
    }

    pub fn video_ram(&self) -> VideoRam {
        VideoRam {
            data: Arc::clone(&self.data),
        }
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of video RAM for a render thread. Holding one keeps the
/// backing buffer alive; the view never sees a resize.
#[derive(Clone)]
pub struct VideoRam {
    data: Cells,
}

impl VideoRam {
    pub fn len(&self) -> usize {
        VIDEO_RAM_SIZE
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Byte `offset` into video RAM (0 is address 0x2400), or `None` past
    /// the end of the frame.
    pub fn read(&self, offset: usize) -> Option<u8> {
        self.cells()
            .get(offset)
            .map(|cell| cell.load(Ordering::Relaxed))
    }

    /// Copy the frame into `frame`, which must hold at least
    /// [`VIDEO_RAM_SIZE`] bytes. The copy may tear against a running CPU.
    pub fn copy_into(&self, frame: &mut [u8]) {
        for (dst, cell) in frame.iter_mut().zip(self.cells()) {
            *dst = cell.load(Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let mut frame = vec![0; VIDEO_RAM_SIZE];
        self.copy_into(&mut frame);
        frame
    }

    fn cells(&self) -> &[AtomicU8] {
        &self.data[VIDEO_RAM_START as usize..MIRROR_START as usize]
    }
}
