use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::EmulatorConfig;
use crate::cpu::CPU;
use crate::error::EmulatorError;
use crate::flags::ConditionCodes;
use crate::io::{PortBank, SharedLatches};
use crate::memory::{Memory, VideoRam};
use crate::metrics::record_interrupt;
use crate::scheduler::{EmulatorHandle, SystemClock};

/// Register file at one instant, as published to other threads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CpuSnapshot {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub sp: u16,
    pub pc: u16,
    pub flags: ConditionCodes,
    pub interrupts_enabled: bool,
    pub halted: bool,
    pub cycles: u64,
}

/// One Space Invaders board: CPU, memory and ports, owned by a single
/// emulation thread once spawned.
pub struct Emulator {
    pub cpu: CPU,
    pub memory: Memory,
    pub ports: PortBank,
    config: EmulatorConfig,
    id: String,
}

impl Emulator {
    pub fn new(config: EmulatorConfig, rom: &[u8]) -> Result<Self, EmulatorError> {
        config.validate()?;
        let memory = Memory::with_rom(rom)?;
        let latches = Arc::new(SharedLatches::new(config.dip_switches()));
        let id = Uuid::new_v4().to_string();

        info!(
            "emulator {} created: {} byte ROM, {} Hz, dip switches {:08b}",
            id,
            rom.len(),
            config.clock_hz,
            config.dip_switches()
        );

        Ok(Emulator {
            cpu: CPU::with_strict_opcodes(config.strict_opcodes),
            memory,
            ports: PortBank::new(latches),
            config,
            id,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn step(&mut self) -> Result<u32, EmulatorError> {
        self.cpu.step(&mut self.memory, &mut self.ports)
    }

    /// Deliver hardware interrupt `vector`. Returns false if the CPU had
    /// interrupts disabled.
    pub fn interrupt(&mut self, vector: u8) -> bool {
        let fired = self.cpu.interrupt(&mut self.memory, vector);
        if fired {
            debug!("interrupt {} taken, pc now {:04x}", vector, self.cpu.pc);
            record_interrupt(vector);
        }
        fired
    }

    /// Back to power-on: registers, RAM, shifter and latches. The ROM stays.
    pub fn reset(&mut self) {
        self.cpu.reset();
        self.memory.clear_ram();
        self.ports.reset();
        info!("emulator {} reset", self.id);
    }

    pub fn snapshot(&self) -> CpuSnapshot {
        let cpu = &self.cpu;
        CpuSnapshot {
            a: cpu.a,
            b: cpu.b,
            c: cpu.c,
            d: cpu.d,
            e: cpu.e,
            h: cpu.h,
            l: cpu.l,
            sp: cpu.sp,
            pc: cpu.pc,
            flags: cpu.flags,
            interrupts_enabled: cpu.interrupts_enabled,
            halted: cpu.halted,
            cycles: cpu.cycles,
        }
    }

    pub fn latches(&self) -> Arc<SharedLatches> {
        Arc::clone(self.ports.latches())
    }

    pub fn video_ram(&self) -> VideoRam {
        self.memory.video_ram()
    }

    /// Move the emulator onto its own thread, paced by the wall clock.
    pub fn spawn(self) -> Result<EmulatorHandle, EmulatorError> {
        EmulatorHandle::spawn(self, SystemClock::new())
    }
}
