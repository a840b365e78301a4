//! # Intel 8080 Emulator
//!
//! A cycle-paced implementation of the Intel 8080 microprocessor in Rust,
//! built to run the unmodified Space Invaders arcade ROM.
//!
//! ## Features
//!
//! - All 256 opcodes, with undocumented encodings mapped to what the chip
//!   actually does
//! - Byte-exact flag semantics and the data-sheet cycle table
//! - Write-guarded memory map (ROM, work RAM, video RAM, mirror)
//! - Input latches, sound latches and the collision shift register
//! - A run loop throttled to 2 MHz that injects the two half-frame
//!   interrupts, with pause and single-step
//! - Prometheus metrics and a small HTTP debug surface
//!
//! ## Example
//!
//! ```rust
//! use i8080_emulator::config::EmulatorConfig;
//! use i8080_emulator::emulator::Emulator;
//!
//! // MVI A,5; ADI 3; HLT
//! let rom = [0x3E, 0x05, 0xC6, 0x03, 0x76];
//! let mut emulator = Emulator::new(EmulatorConfig::default(), &rom).unwrap();
//!
//! emulator.step().unwrap(); // MVI
//! emulator.step().unwrap(); // ADI
//!
//! assert_eq!(emulator.cpu.get_register_a(), 8);
//! assert!(!emulator.cpu.flags.carry);
//! ```

pub mod config;
pub mod cpu;
pub mod emulator;
pub mod error;
pub mod flags;
pub mod instruction;
pub mod io;
pub mod memory;
pub mod metrics;
pub mod scheduler;
pub mod server;

pub use cpu::CPU;
pub use emulator::{CpuSnapshot, Emulator};
pub use error::EmulatorError;
pub use memory::Memory;
pub use scheduler::{EmulatorHandle, RunState};
