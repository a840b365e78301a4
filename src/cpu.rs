use std::fmt;

use tracing::trace;

use crate::error::EmulatorError;
use crate::flags::ConditionCodes;
use crate::instruction::{
    decode, is_undocumented, AluOp, Condition, Instruction, Reg, RegPair, StackPair,
    BRANCH_TAKEN_PENALTY, CYCLES,
};
use crate::io::IoBus;
use crate::memory::Memory;
use crate::metrics::record_instruction;

/// Cost charged for each tick spent halted, waiting for an interrupt.
pub const HALTED_CYCLES: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CPU {
    // Registers (public for snapshots and tests)
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

    // Internal state
    pub halted: bool,
    pub cycles: u64,
    /// Refuse undocumented encodings instead of running their aliases.
    pub strict: bool,
}

impl CPU {
    pub fn new() -> Self {
        CPU {
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            e: 0,
            h: 0,
            l: 0,
            sp: 0,
            pc: 0,
            flags: ConditionCodes::default(),
            interrupts_enabled: false,
            halted: false,
            cycles: 0,
            strict: false,
        }
    }

    pub fn with_strict_opcodes(strict: bool) -> Self {
        CPU {
            strict,
            ..CPU::new()
        }
    }

    /// Power-on state: everything zero, execution from 0x0000 with
    /// interrupts disabled. The strict setting survives.
    pub fn reset(&mut self) {
        *self = CPU::with_strict_opcodes(self.strict);
    }

    /// Execute one instruction and return the cycles it cost.
    ///
    /// A halted CPU executes nothing and is charged [`HALTED_CYCLES`].
    pub fn step<B: IoBus + ?Sized>(
        &mut self,
        memory: &mut Memory,
        bus: &mut B,
    ) -> Result<u32, EmulatorError> {
        if self.halted {
            self.cycles += HALTED_CYCLES as u64;
            return Ok(HALTED_CYCLES);
        }

        let address = self.pc;
        let opcode = memory.read(address);
        if self.strict && is_undocumented(opcode) {
            return Err(EmulatorError::UnimplementedOpcode { address, opcode });
        }
        self.pc = self.pc.wrapping_add(1);

        let instruction = decode(opcode);
        trace!(
            "{:04x}  {:<8}  {:<12}  {}",
            address,
            OpcodeBytes(memory, address, instruction.length()),
            instruction,
            self
        );

        let taken = self.execute(instruction, memory, bus);
        let mut cycles = CYCLES[opcode as usize] as u32;
        if taken {
            cycles += BRANCH_TAKEN_PENALTY;
        }

        self.cycles += cycles as u64;
        record_instruction(opcode, cycles);
        Ok(cycles)
    }

    /// Hardware interrupt: `RST vector` injected from outside. Ignored (and
    /// `false` returned) while interrupts are disabled.
    pub fn interrupt(&mut self, memory: &mut Memory, vector: u8) -> bool {
        if !self.interrupts_enabled {
            return false;
        }
        self.interrupts_enabled = false;
        self.halted = false;
        self.push_word(memory, self.pc);
        self.pc = 8 * (vector as u16 & 0x07);
        true
    }

    // Returns true when a conditional CALL or RET was taken.
    fn execute<B: IoBus + ?Sized>(
        &mut self,
        instruction: Instruction,
        memory: &mut Memory,
        bus: &mut B,
    ) -> bool {
        match instruction {
            Instruction::Nop => {}

            // Data move
            Instruction::Mov(dst, src) => {
                let value = self.reg(memory, src);
                self.set_reg(memory, dst, value);
            }
            Instruction::Mvi(r) => {
                let value = self.fetch_byte(memory);
                self.set_reg(memory, r, value);
            }
            Instruction::Lxi(rp) => {
                let value = self.fetch_word(memory);
                self.set_pair(rp, value);
            }
            Instruction::Lda => {
                let address = self.fetch_word(memory);
                self.a = memory.read(address);
            }
            Instruction::Sta => {
                let address = self.fetch_word(memory);
                memory.write(address, self.a);
            }
            Instruction::Lhld => {
                let address = self.fetch_word(memory);
                self.set_pair(RegPair::HL, memory.read_u16(address));
            }
            Instruction::Shld => {
                let address = self.fetch_word(memory);
                memory.write_u16(address, self.hl());
            }
            Instruction::Ldax(rp) => {
                self.a = memory.read(self.pair(rp));
            }
            Instruction::Stax(rp) => {
                memory.write(self.pair(rp), self.a);
            }
            Instruction::Xchg => {
                std::mem::swap(&mut self.h, &mut self.d);
                std::mem::swap(&mut self.l, &mut self.e);
            }

            // Arithmetic and logic
            Instruction::Alu(op, r) => {
                let value = self.reg(memory, r);
                self.alu(op, value);
            }
            Instruction::AluImmediate(op) => {
                let value = self.fetch_byte(memory);
                self.alu(op, value);
            }
            Instruction::Inr(r) => {
                let value = self.reg(memory, r).wrapping_add(1);
                self.flags.set_zsp(value);
                self.set_reg(memory, r, value);
            }
            Instruction::Dcr(r) => {
                let value = self.reg(memory, r).wrapping_sub(1);
                self.flags.set_zsp(value);
                self.set_reg(memory, r, value);
            }
            Instruction::Inx(rp) => {
                let value = self.pair(rp).wrapping_add(1);
                self.set_pair(rp, value);
            }
            Instruction::Dcx(rp) => {
                let value = self.pair(rp).wrapping_sub(1);
                self.set_pair(rp, value);
            }
            Instruction::Dad(rp) => {
                let sum = self.hl() as u32 + self.pair(rp) as u32;
                self.flags.carry = sum > 0xFFFF;
                self.set_pair(RegPair::HL, sum as u16);
            }
            Instruction::Daa => self.daa(),

            // Rotate and carry
            Instruction::Rlc => {
                let bit7 = self.a >> 7;
                self.a = self.a << 1 | bit7;
                self.flags.carry = bit7 == 1;
            }
            Instruction::Rrc => {
                let bit0 = self.a & 0x01;
                self.a = self.a >> 1 | bit0 << 7;
                self.flags.carry = bit0 == 1;
            }
            Instruction::Ral => {
                let carry_in = self.flags.carry as u8;
                self.flags.carry = self.a & 0x80 != 0;
                self.a = self.a << 1 | carry_in;
            }
            Instruction::Rar => {
                let carry_in = self.flags.carry as u8;
                self.flags.carry = self.a & 0x01 != 0;
                self.a = self.a >> 1 | carry_in << 7;
            }
            Instruction::Cma => self.a = !self.a,
            Instruction::Stc => self.flags.carry = true,
            Instruction::Cmc => self.flags.carry = !self.flags.carry,

            // Control flow
            Instruction::Jmp => {
                self.pc = self.fetch_word(memory);
            }
            Instruction::JmpIf(condition) => {
                let address = self.fetch_word(memory);
                if self.condition(condition) {
                    self.pc = address;
                }
            }
            Instruction::Call => {
                let address = self.fetch_word(memory);
                self.call(memory, address);
            }
            Instruction::CallIf(condition) => {
                let address = self.fetch_word(memory);
                if self.condition(condition) {
                    self.call(memory, address);
                    return true;
                }
            }
            Instruction::Ret => {
                self.pc = self.pop_word(memory);
            }
            Instruction::RetIf(condition) => {
                if self.condition(condition) {
                    self.pc = self.pop_word(memory);
                    return true;
                }
            }
            Instruction::Rst(n) => self.call(memory, 8 * n as u16),
            Instruction::Pchl => self.pc = self.hl(),

            // Stack
            Instruction::Push(pair) => {
                let value = match pair {
                    StackPair::BC => self.pair(RegPair::BC),
                    StackPair::DE => self.pair(RegPair::DE),
                    StackPair::HL => self.hl(),
                    StackPair::PSW => (self.a as u16) << 8 | self.flags.pack() as u16,
                };
                self.push_word(memory, value);
            }
            Instruction::Pop(pair) => {
                let value = self.pop_word(memory);
                match pair {
                    StackPair::BC => self.set_pair(RegPair::BC, value),
                    StackPair::DE => self.set_pair(RegPair::DE, value),
                    StackPair::HL => self.set_pair(RegPair::HL, value),
                    StackPair::PSW => {
                        self.a = (value >> 8) as u8;
                        self.flags = ConditionCodes::unpack(value as u8);
                    }
                }
            }
            Instruction::Xthl => {
                let top = memory.read_u16(self.sp);
                memory.write_u16(self.sp, self.hl());
                self.set_pair(RegPair::HL, top);
            }
            Instruction::Sphl => self.sp = self.hl(),

            // I/O and machine control
            Instruction::In => {
                let port = self.fetch_byte(memory);
                self.a = bus.input(port);
            }
            Instruction::Out => {
                let port = self.fetch_byte(memory);
                bus.output(port, self.a);
            }
            Instruction::Ei => self.interrupts_enabled = true,
            Instruction::Di => self.interrupts_enabled = false,
            Instruction::Hlt => self.halted = true,
        }
        false
    }

    fn alu(&mut self, op: AluOp, value: u8) {
        match op {
            AluOp::Add | AluOp::Adc => {
                let carry_in = (op == AluOp::Adc && self.flags.carry) as u8;
                let result = self.a as u16 + value as u16 + carry_in as u16;
                self.flags.aux_carry = (self.a & 0x0F) + (value & 0x0F) + carry_in > 0x0F;
                self.flags.set_arith(result);
                self.a = result as u8;
            }
            AluOp::Sub | AluOp::Sbb | AluOp::Cmp => {
                let borrow = (op == AluOp::Sbb && self.flags.carry) as u8;
                let result = (self.a as u16)
                    .wrapping_sub(value as u16)
                    .wrapping_sub(borrow as u16);
                // The chip subtracts by adding the complement.
                self.flags.aux_carry = (self.a & 0x0F) + (!value & 0x0F) + (1 - borrow) > 0x0F;
                self.flags.set_arith(result);
                if op != AluOp::Cmp {
                    self.a = result as u8;
                }
            }
            AluOp::Ana => {
                self.a &= value;
                self.flags.set_logic(self.a);
            }
            AluOp::Xra => {
                self.a ^= value;
                self.flags.set_logic(self.a);
            }
            AluOp::Ora => {
                self.a |= value;
                self.flags.set_logic(self.a);
            }
        }
    }

    fn daa(&mut self) {
        let low = self.a & 0x0F;
        let high = self.a >> 4;
        let mut correction = 0u8;
        let mut carry = self.flags.carry;

        if self.flags.aux_carry || low > 9 {
            correction |= 0x06;
        }
        if self.flags.carry || high > 9 || (high >= 9 && low > 9) {
            correction |= 0x60;
            carry = true;
        }

        let result = self.a.wrapping_add(correction);
        self.flags.aux_carry = low + (correction & 0x0F) > 0x0F;
        self.flags.set_zsp(result);
        self.flags.carry = carry;
        self.a = result;
    }

    fn condition(&self, condition: Condition) -> bool {
        match condition {
            Condition::NotZero => !self.flags.zero,
            Condition::Zero => self.flags.zero,
            Condition::NoCarry => !self.flags.carry,
            Condition::Carry => self.flags.carry,
            Condition::ParityOdd => !self.flags.parity,
            Condition::ParityEven => self.flags.parity,
            Condition::Plus => !self.flags.sign,
            Condition::Minus => self.flags.sign,
        }
    }

    fn call(&mut self, memory: &mut Memory, address: u16) {
        self.push_word(memory, self.pc);
        self.pc = address;
    }

    fn reg(&self, memory: &Memory, r: Reg) -> u8 {
        match r {
            Reg::B => self.b,
            Reg::C => self.c,
            Reg::D => self.d,
            Reg::E => self.e,
            Reg::H => self.h,
            Reg::L => self.l,
            Reg::M => memory.read(self.hl()),
            Reg::A => self.a,
        }
    }

    fn set_reg(&mut self, memory: &mut Memory, r: Reg, value: u8) {
        match r {
            Reg::B => self.b = value,
            Reg::C => self.c = value,
            Reg::D => self.d = value,
            Reg::E => self.e = value,
            Reg::H => self.h = value,
            Reg::L => self.l = value,
            Reg::M => {
                memory.write(self.hl(), value);
            }
            Reg::A => self.a = value,
        }
    }

    fn pair(&self, rp: RegPair) -> u16 {
        match rp {
            RegPair::BC => (self.b as u16) << 8 | self.c as u16,
            RegPair::DE => (self.d as u16) << 8 | self.e as u16,
            RegPair::HL => (self.h as u16) << 8 | self.l as u16,
            RegPair::SP => self.sp,
        }
    }

    fn set_pair(&mut self, rp: RegPair, value: u16) {
        let high = (value >> 8) as u8;
        let low = value as u8;
        match rp {
            RegPair::BC => {
                self.b = high;
                self.c = low;
            }
            RegPair::DE => {
                self.d = high;
                self.e = low;
            }
            RegPair::HL => {
                self.h = high;
                self.l = low;
            }
            RegPair::SP => self.sp = value,
        }
    }

    fn hl(&self) -> u16 {
        self.pair(RegPair::HL)
    }

    fn fetch_byte(&mut self, memory: &Memory) -> u8 {
        let value = memory.read(self.pc);
        self.pc = self.pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self, memory: &Memory) -> u16 {
        let low = self.fetch_byte(memory) as u16;
        let high = self.fetch_byte(memory) as u16;
        (high << 8) | low
    }

    // High byte goes to SP-1, low byte to SP-2.
    pub fn push_word(&mut self, memory: &mut Memory, value: u16) {
        self.sp = self.sp.wrapping_sub(1);
        memory.write(self.sp, (value >> 8) as u8);
        self.sp = self.sp.wrapping_sub(1);
        memory.write(self.sp, value as u8);
    }

    pub fn pop_word(&mut self, memory: &Memory) -> u16 {
        let low = memory.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        let high = memory.read(self.sp) as u16;
        self.sp = self.sp.wrapping_add(1);
        (high << 8) | low
    }

    // Getter methods for testing and external access
    pub fn get_register_a(&self) -> u8 { self.a }
    pub fn get_register_b(&self) -> u8 { self.b }
    pub fn get_register_c(&self) -> u8 { self.c }
    pub fn get_register_d(&self) -> u8 { self.d }
    pub fn get_register_e(&self) -> u8 { self.e }
    pub fn get_register_h(&self) -> u8 { self.h }
    pub fn get_register_l(&self) -> u8 { self.l }
    pub fn get_bc(&self) -> u16 { self.pair(RegPair::BC) }
    pub fn get_de(&self) -> u16 { self.pair(RegPair::DE) }
    pub fn get_hl(&self) -> u16 { self.hl() }
    pub fn get_pc(&self) -> u16 { self.pc }
    pub fn get_sp(&self) -> u16 { self.sp }
    pub fn get_psw(&self) -> u8 { self.flags.pack() }
    pub fn is_halted(&self) -> bool { self.halted }

    /// Test one of the `*_FLAG` bits from [`crate::flags`].
    pub fn get_flag(&self, flag: u8) -> bool {
        self.flags.pack() & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8, value: bool) {
        let psw = self.flags.pack();
        let psw = if value { psw | flag } else { psw & !flag };
        self.flags = ConditionCodes::unpack(psw);
    }
}

/// Register line for traces: `A=08 BC=0000 DE=0000 HL=0000 SP=2400 F=02 szpc`.
impl fmt::Display for CPU {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let flags = &self.flags;
        let flag = |set: bool, c: char| if set { c.to_ascii_uppercase() } else { c };
        write!(
            f,
            "A={:02x} BC={:04x} DE={:04x} HL={:04x} SP={:04x} F={:02x} {}{}{}{}{}",
            self.a,
            self.get_bc(),
            self.get_de(),
            self.hl(),
            self.sp,
            flags.pack(),
            flag(flags.sign, 's'),
            flag(flags.zero, 'z'),
            flag(flags.aux_carry, 'a'),
            flag(flags.parity, 'p'),
            flag(flags.carry, 'c'),
        )
    }
}

// The encoded bytes of the instruction at an address, space separated.
struct OpcodeBytes<'a>(&'a Memory, u16, u16);

impl fmt::Display for OpcodeBytes<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let OpcodeBytes(memory, address, length) = *self;
        let text: Vec<String> = (0..length)
            .map(|i| format!("{:02x}", memory.read(address.wrapping_add(i))))
            .collect();
        f.pad(&text.join(" "))
    }
}

impl Default for CPU {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{AUX_CARRY_FLAG, CARRY_FLAG, PARITY_FLAG, SIGN_FLAG, ZERO_FLAG};
    use crate::io::DummyBus;

    const STACK_TOP: u16 = 0x2400;

    fn setup(program: &[u8]) -> (CPU, Memory, DummyBus) {
        let mut cpu = CPU::new();
        cpu.sp = STACK_TOP;
        (cpu, Memory::with_rom(program).unwrap(), DummyBus::new())
    }

    #[test]
    fn test_mvi_then_add_immediate() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x3E, 0x05, // MVI A,5
            0xC6, 0x03, // ADI 3
        ]);
        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();

        assert_eq!(cpu.get_register_a(), 8);
        assert!(!cpu.get_flag(ZERO_FLAG));
        assert!(!cpu.get_flag(CARRY_FLAG));
        assert!(!cpu.get_flag(PARITY_FLAG));
        assert_eq!(cpu.get_pc(), 4);
    }

    #[test]
    fn test_mvi_then_add_register() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x3E, 0x05, // MVI A,5
            0x06, 0x03, // MVI B,3
            0x80, // ADD B
        ]);
        for _ in 0..3 {
            cpu.step(&mut memory, &mut bus).unwrap();
        }
        assert_eq!(cpu.get_register_a(), 8);
        assert!(!cpu.flags.zero);
        assert!(!cpu.flags.carry);
        assert!(!cpu.flags.parity);
    }

    #[test]
    fn test_add_carry_law() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x80]); // ADD B
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                cpu.pc = 0;
                cpu.a = a;
                cpu.b = b;
                cpu.step(&mut memory, &mut bus).unwrap();
                assert_eq!(cpu.flags.carry, a as u16 + b as u16 > 255, "{} + {}", a, b);
                assert_eq!(cpu.a, a.wrapping_add(b));
            }
        }
    }

    #[test]
    fn test_sub_carry_law() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x90]); // SUB B
        for a in 0..=255u8 {
            for b in 0..=255u8 {
                cpu.pc = 0;
                cpu.a = a;
                cpu.b = b;
                cpu.step(&mut memory, &mut bus).unwrap();
                assert_eq!(cpu.flags.carry, a < b, "{} - {}", a, b);
                assert_eq!(cpu.a, a.wrapping_sub(b));
                assert_eq!(cpu.flags.zero, a == b);
            }
        }
    }

    #[test]
    fn test_parity_law() {
        let (mut cpu, mut memory, mut bus) = setup(&[0xB7]); // ORA A
        for v in 0..=255u8 {
            cpu.pc = 0;
            cpu.a = v;
            cpu.step(&mut memory, &mut bus).unwrap();
            assert_eq!(cpu.flags.parity, v.count_ones() % 2 == 0, "value {:02x}", v);
            assert_eq!(cpu.flags.sign, v & 0x80 != 0);
        }
    }

    #[test]
    fn test_parity_uses_low_byte_of_sum() {
        let (mut cpu, mut memory, mut bus) = setup(&[0xC6, 0x01]); // ADI 1
        cpu.a = 0xFF;
        cpu.step(&mut memory, &mut bus).unwrap();
        // 0x100: low byte has no set bits
        assert_eq!(cpu.a, 0x00);
        assert!(cpu.flags.carry);
        assert!(cpu.flags.zero);
        assert!(cpu.flags.parity);
    }

    #[test]
    fn test_adc_and_sbb_use_carry() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xCE, 0x01, // ACI 1
            0xDE, 0x01, // SBI 1
        ]);
        cpu.a = 0x10;
        cpu.flags.carry = true;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x12);
        assert!(!cpu.flags.carry);

        cpu.flags.carry = true;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x10);
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_cmp_leaves_accumulator() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xFE, 0x40, // CPI 0x40
            0xFE, 0x20, // CPI 0x20
        ]);
        cpu.a = 0x20;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x20);
        assert!(cpu.flags.carry);
        assert!(!cpu.flags.zero);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(cpu.flags.zero);
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_logical_ops_clear_carries() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xE6, 0x0F, // ANI 0x0F
            0xEE, 0xFF, // XRI 0xFF
            0xB0, // ORA B
        ]);
        cpu.a = 0x3C;
        cpu.b = 0x01;
        cpu.flags.carry = true;
        cpu.flags.aux_carry = true;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x0C);
        assert!(!cpu.flags.carry);
        assert!(!cpu.flags.aux_carry);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0xF3);
        assert!(cpu.flags.sign);

        cpu.flags.carry = true;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0xF3);
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_aux_carry_on_add() {
        // AuxCarry is tracked the way the real chip does it, but only DAA
        // depends on it.
        let (mut cpu, mut memory, mut bus) = setup(&[0xC6, 0x01, 0xC6, 0x01]); // ADI 1; ADI 1
        cpu.a = 0x0F;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(cpu.get_flag(AUX_CARRY_FLAG));
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(!cpu.get_flag(AUX_CARRY_FLAG));
    }

    #[test]
    fn test_inr_dcr_leave_carry() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x04, // INR B
            0x0D, // DCR C
        ]);
        cpu.b = 0xFF;
        cpu.c = 0x00;
        cpu.flags.carry = false;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.b, 0x00);
        assert!(cpu.flags.zero);
        assert!(!cpu.flags.carry);

        cpu.flags.carry = true;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.c, 0xFF);
        assert!(cpu.flags.sign);
        assert!(cpu.flags.carry);
    }

    #[test]
    fn test_inr_m_goes_through_hl() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x21, 0x00, 0x21, // LXI H,0x2100
            0x34, // INR M
            0x36, 0x7F, // MVI M,0x7F
            0x35, // DCR M
        ]);
        memory.write(0x2100, 0x41);
        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(memory.read(0x2100), 0x42);
        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(memory.read(0x2100), 0x7E);
    }

    #[test]
    fn test_inx_dcx_wrap_without_flags() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x03, // INX B
            0x0B, // DCX B
        ]);
        cpu.b = 0xFF;
        cpu.c = 0xFF;
        cpu.flags = ConditionCodes::unpack(0x15);
        let flags = cpu.flags;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!((cpu.b, cpu.c), (0x00, 0x00));
        assert_eq!(cpu.flags, flags);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!((cpu.b, cpu.c), (0xFF, 0xFF));
        assert_eq!(cpu.flags, flags);
    }

    #[test]
    fn test_inx_sp_wraps() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x33]); // INX SP
        cpu.sp = 0xFFFF;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_sp(), 0x0000);
    }

    #[test]
    fn test_dad_sets_carry_only() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x09, // DAD B
            0x29, // DAD H
        ]);
        cpu.h = 0x80;
        cpu.l = 0x01;
        cpu.b = 0x80;
        cpu.c = 0x00;
        cpu.flags.zero = true;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_hl(), 0x0001);
        assert!(cpu.flags.carry);
        assert!(cpu.flags.zero);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_hl(), 0x0002);
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_push_pop_round_trip() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xC5, // PUSH B
            0xC1, // POP B
        ]);
        cpu.b = 0x12;
        cpu.c = 0x34;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_sp(), STACK_TOP - 2);
        assert_eq!(memory.read(STACK_TOP - 1), 0x12);
        assert_eq!(memory.read(STACK_TOP - 2), 0x34);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!((cpu.b, cpu.c), (0x12, 0x34));
        assert_eq!(cpu.get_sp(), STACK_TOP);
    }

    #[test]
    fn test_push_pop_psw_symmetric() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xF5, // PUSH PSW
            0xAF, // XRA A
            0x37, // STC
            0xF1, // POP PSW
        ]);
        cpu.a = 0x9C;
        cpu.flags = ConditionCodes {
            zero: false,
            sign: true,
            parity: true,
            carry: false,
            aux_carry: true,
        };
        let flags = cpu.flags;

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(memory.read(STACK_TOP - 1), 0x9C);
        assert_eq!(memory.read(STACK_TOP - 2), SIGN_FLAG | PARITY_FLAG | AUX_CARRY_FLAG);

        for _ in 0..3 {
            cpu.step(&mut memory, &mut bus).unwrap();
        }
        assert_eq!(cpu.a, 0x9C);
        assert_eq!(cpu.flags, flags);
    }

    #[test]
    fn test_pop_psw_reads_carry_from_bit_3() {
        let (mut cpu, mut memory, mut bus) = setup(&[0xF1]); // POP PSW
        cpu.sp = 0x2200;
        memory.write(0x2200, CARRY_FLAG);
        memory.write(0x2201, 0x00);
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(cpu.flags.carry);
        assert!(!cpu.flags.parity);
        assert!(!cpu.flags.zero);
    }

    #[test]
    fn test_call_and_ret() {
        let mut program = vec![0u8; 0x20];
        program[0x00..0x03].copy_from_slice(&[0xCD, 0x10, 0x00]); // CALL 0x0010
        program[0x10] = 0xC9; // RET
        let (mut cpu, mut memory, mut bus) = setup(&program);

        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 17);
        assert_eq!(cpu.get_pc(), 0x0010);
        assert_eq!(cpu.get_sp(), STACK_TOP - 2);
        assert_eq!(memory.read(STACK_TOP - 1), 0x00);
        assert_eq!(memory.read(STACK_TOP - 2), 0x03);

        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 10);
        assert_eq!(cpu.get_pc(), 0x0003);
        assert_eq!(cpu.get_sp(), STACK_TOP);
    }

    #[test]
    fn test_conditional_call_cycles() {
        let mut program = vec![0u8; 0x20];
        program[0x00..0x03].copy_from_slice(&[0xC4, 0x10, 0x00]); // CNZ 0x0010
        program[0x03..0x06].copy_from_slice(&[0xC4, 0x10, 0x00]); // CNZ 0x0010
        program[0x10] = 0xC0; // RNZ
        program[0x11] = 0xC0; // RNZ
        let (mut cpu, mut memory, mut bus) = setup(&program);

        cpu.flags.zero = true;
        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 11);
        assert_eq!(cpu.get_pc(), 0x0003);

        cpu.flags.zero = false;
        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 17);
        assert_eq!(cpu.get_pc(), 0x0010);

        cpu.flags.zero = true;
        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 5);
        assert_eq!(cpu.get_pc(), 0x0011);

        cpu.flags.zero = false;
        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 11);
        assert_eq!(cpu.get_pc(), 0x0006);
    }

    #[test]
    fn test_conditional_jumps() {
        let cases: [(u8, fn(&mut CPU), bool); 8] = [
            (0xC2, |cpu| cpu.flags.zero = false, true),  // JNZ
            (0xCA, |cpu| cpu.flags.zero = false, false), // JZ
            (0xD2, |cpu| cpu.flags.carry = true, false), // JNC
            (0xDA, |cpu| cpu.flags.carry = true, true),  // JC
            (0xE2, |cpu| cpu.flags.parity = true, false), // JPO
            (0xEA, |cpu| cpu.flags.parity = true, true), // JPE
            (0xF2, |cpu| cpu.flags.sign = true, false),  // JP
            (0xFA, |cpu| cpu.flags.sign = true, true),   // JM
        ];
        for (opcode, prepare, taken) in cases {
            let (mut cpu, mut memory, mut bus) = setup(&[opcode, 0x00, 0x20]);
            prepare(&mut cpu);
            assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 10);
            let expected = if taken { 0x2000 } else { 0x0003 };
            assert_eq!(cpu.get_pc(), expected, "opcode {:02x}", opcode);
        }
    }

    #[test]
    fn test_rst() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x00, 0xD7]); // NOP; RST 2
        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_pc(), 0x0010);
        assert_eq!(cpu.pop_word(&memory), 0x0002);
    }

    #[test]
    fn test_rotates() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x07, // RLC
            0x0F, // RRC
            0x17, // RAL
            0x1F, // RAR
        ]);
        cpu.a = 0x81;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x03);
        assert!(cpu.flags.carry);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x81);
        assert!(cpu.flags.carry);

        cpu.flags.carry = false;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x02);
        assert!(cpu.flags.carry);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x81);
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_cma_stc_cmc() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x2F, 0x37, 0x3F]);
        cpu.a = 0x5A;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0xA5);
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(cpu.flags.carry);
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(!cpu.flags.carry);
    }

    #[test]
    fn test_daa() {
        let cases = [
            // (a, carry, aux_carry) -> (a, carry)
            ((0x9B, false, false), (0x01, true)),
            ((0x7D, false, false), (0x83, false)),
            ((0x9A, false, false), (0x00, true)),
            ((0x42, false, true), (0x48, false)),
            ((0x15, true, false), (0x75, true)),
            ((0x25, false, false), (0x25, false)),
        ];
        for ((a, carry, aux_carry), (expected, expected_carry)) in cases {
            let (mut cpu, mut memory, mut bus) = setup(&[0x27]); // DAA
            cpu.a = a;
            cpu.flags.carry = carry;
            cpu.flags.aux_carry = aux_carry;
            cpu.step(&mut memory, &mut bus).unwrap();
            assert_eq!(cpu.a, expected, "DAA on {:02x}", a);
            assert_eq!(cpu.flags.carry, expected_carry, "carry after DAA on {:02x}", a);
            assert_eq!(cpu.flags.zero, expected == 0);
        }
    }

    #[test]
    fn test_memory_moves() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x3E, 0x77, // MVI A,0x77
            0x32, 0x00, 0x21, // STA 0x2100
            0x2A, 0x00, 0x21, // LHLD 0x2100
            0x22, 0x10, 0x21, // SHLD 0x2110
            0x01, 0x10, 0x21, // LXI B,0x2110
            0x0A, // LDAX B
            0x11, 0x20, 0x21, // LXI D,0x2120
            0x12, // STAX D
            0x3A, 0x01, 0x21, // LDA 0x2101
        ]);
        memory.write(0x2101, 0x66);
        for _ in 0..9 {
            cpu.step(&mut memory, &mut bus).unwrap();
        }
        assert_eq!(memory.read(0x2100), 0x77);
        assert_eq!(cpu.get_hl(), 0x6677);
        assert_eq!(memory.read(0x2110), 0x77);
        assert_eq!(memory.read(0x2111), 0x66);
        assert_eq!(memory.read(0x2120), 0x77);
        assert_eq!(cpu.a, 0x66);
    }

    #[test]
    fn test_word_moves_at_region_edges() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x21, 0x34, 0x12, // LXI H,0x1234
            0x22, 0xFF, 0x1F, // SHLD 0x1FFF
            0x2A, 0xFF, 0xFF, // LHLD 0xFFFF
        ]);
        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();
        // Only the byte landing in RAM is stored.
        assert_eq!(memory.read(0x1FFF), 0x00);
        assert_eq!(memory.read(0x2000), 0x12);

        cpu.step(&mut memory, &mut bus).unwrap();
        // L from 0xFFFF, H wraps to ROM byte 0x0000.
        assert_eq!(cpu.get_hl(), 0x2100);
    }

    #[test]
    fn test_xthl_at_rom_boundary() {
        let (mut cpu, mut memory, mut bus) = setup(&[0xE3]); // XTHL
        cpu.sp = 0x1FFF;
        cpu.h = 0xAB;
        cpu.l = 0xCD;
        memory.write(0x2000, 0x44);
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_hl(), 0x4400);
        assert_eq!(memory.read(0x1FFF), 0x00);
        assert_eq!(memory.read(0x2000), 0xAB);
    }

    #[test]
    fn test_register_line() {
        let (mut cpu, _, _) = setup(&[0x00]);
        cpu.a = 0x08;
        cpu.b = 0x12;
        cpu.c = 0x34;
        cpu.h = 0x20;
        cpu.flags.zero = true;
        cpu.flags.carry = true;
        assert_eq!(
            cpu.to_string(),
            "A=08 BC=1234 DE=0000 HL=2000 SP=2400 F=09 sZapC"
        );
    }

    #[test]
    fn test_opcode_bytes_follow_instruction_length() {
        let memory = Memory::with_rom(&[0xC3, 0x00, 0x10, 0x3E, 0x05, 0x80]).unwrap();
        let bytes = |address: u16| {
            OpcodeBytes(&memory, address, decode(memory.read(address)).length()).to_string()
        };
        assert_eq!(bytes(0), "c3 00 10");
        assert_eq!(bytes(3), "3e 05");
        assert_eq!(bytes(5), "80");
    }

    #[test]
    fn test_store_into_rom_is_dropped() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0x3E, 0xAA, // MVI A,0xAA
            0x32, 0x00, 0x01, // STA 0x0100
            0x32, 0x00, 0x40, // STA 0x4000
        ]);
        for _ in 0..3 {
            cpu.step(&mut memory, &mut bus).unwrap();
        }
        assert_eq!(memory.read(0x0100), 0x00);
        assert_eq!(memory.read(0x4000), 0x00);
        assert_eq!(cpu.get_pc(), 8);
    }

    #[test]
    fn test_exchanges() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xEB, // XCHG
            0xE3, // XTHL
            0xF9, // SPHL
            0xE9, // PCHL
        ]);
        cpu.d = 0x21;
        cpu.e = 0x80;
        cpu.h = 0x11;
        cpu.l = 0x22;
        cpu.sp = 0x2200;
        memory.write(0x2200, 0x00);
        memory.write(0x2201, 0x30);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_hl(), 0x2180);
        assert_eq!(cpu.get_de(), 0x1122);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_hl(), 0x3000);
        assert_eq!(memory.read(0x2200), 0x80);
        assert_eq!(memory.read(0x2201), 0x21);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_sp(), 0x3000);

        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.get_pc(), 0x3000);
    }

    #[test]
    fn test_in_out() {
        let (mut cpu, mut memory, mut bus) = setup(&[
            0xDB, 0x01, // IN 1
            0xD3, 0x05, // OUT 5
        ]);
        bus.inputs[1] = 0x5A;
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(cpu.a, 0x5A);
        cpu.step(&mut memory, &mut bus).unwrap();
        assert_eq!(bus.outputs, vec![(0x05, 0x5A)]);
    }

    #[test]
    fn test_hlt_stops_without_error() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x76, 0x3C]); // HLT; INR A
        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), 7);
        assert!(cpu.is_halted());
        assert_eq!(cpu.get_pc(), 1);

        assert_eq!(cpu.step(&mut memory, &mut bus).unwrap(), HALTED_CYCLES);
        assert_eq!(cpu.get_pc(), 1);
        assert_eq!(cpu.a, 0);
    }

    #[test]
    fn test_interrupt_requires_enable() {
        let (mut cpu, mut memory, mut bus) = setup(&[0xFB, 0x76]); // EI; HLT
        cpu.pc = 0;
        assert!(!cpu.interrupt(&mut memory, 1));
        assert_eq!(cpu.get_pc(), 0);

        cpu.step(&mut memory, &mut bus).unwrap();
        cpu.step(&mut memory, &mut bus).unwrap();
        assert!(cpu.is_halted());

        assert!(cpu.interrupt(&mut memory, 1));
        assert_eq!(cpu.get_pc(), 0x0008);
        assert!(!cpu.interrupts_enabled);
        assert!(!cpu.is_halted());
        assert_eq!(cpu.pop_word(&memory), 0x0002);
    }

    #[test]
    fn test_every_opcode_executes() {
        for opcode in 0..=255u8 {
            let (mut cpu, mut memory, mut bus) = setup(&[opcode, 0x00, 0x20]);
            let cycles = cpu.step(&mut memory, &mut bus).unwrap();
            assert!(
                cycles >= CYCLES[opcode as usize] as u32,
                "opcode {:02x} returned {} cycles",
                opcode,
                cycles
            );
        }
    }

    #[test]
    fn test_aliases_behave_identically() {
        let groups: [(u8, &[u8]); 4] = [
            (0x00, &[0x08, 0x10, 0x18, 0x20, 0x28, 0x30, 0x38]),
            (0xC3, &[0xCB]),
            (0xC9, &[0xD9]),
            (0xCD, &[0xDD, 0xED, 0xFD]),
        ];
        for (canonical, aliases) in groups {
            let run = |opcode: u8| {
                let (mut cpu, mut memory, mut bus) = setup(&[opcode, 0x34, 0x12]);
                cpu.a = 0x42;
                cpu.sp = 0x2300;
                memory.write(0x2300, 0x78);
                memory.write(0x2301, 0x56);
                let cycles = cpu.step(&mut memory, &mut bus).unwrap();
                (cpu, cycles, memory.dump(0x22f0..0x2310))
            };
            let expected = run(canonical);
            for &alias in aliases {
                assert_eq!(run(alias), expected, "alias {:02x} of {:02x}", alias, canonical);
            }
        }
    }

    #[test]
    fn test_strict_mode_rejects_undocumented() {
        let (mut cpu, mut memory, mut bus) = setup(&[0x00, 0x08]);
        cpu.strict = true;
        cpu.step(&mut memory, &mut bus).unwrap();

        match cpu.step(&mut memory, &mut bus) {
            Err(EmulatorError::UnimplementedOpcode { address, opcode }) => {
                assert_eq!(address, 0x0001);
                assert_eq!(opcode, 0x08);
            }
            other => panic!("expected UnimplementedOpcode, got {:?}", other),
        }
        assert_eq!(cpu.get_pc(), 0x0001);
    }

    #[test]
    fn test_reset_keeps_strict() {
        let mut cpu = CPU::with_strict_opcodes(true);
        cpu.a = 9;
        cpu.pc = 0x1234;
        cpu.interrupts_enabled = true;
        cpu.reset();
        assert_eq!(cpu.a, 0);
        assert_eq!(cpu.pc, 0);
        assert!(!cpu.interrupts_enabled);
        assert!(cpu.strict);
    }

    #[test]
    fn test_set_flag() {
        let mut cpu = CPU::new();
        cpu.set_flag(CARRY_FLAG, true);
        cpu.set_flag(ZERO_FLAG, true);
        assert!(cpu.flags.carry);
        assert!(cpu.flags.zero);
        cpu.set_flag(CARRY_FLAG, false);
        assert!(!cpu.get_flag(CARRY_FLAG));
        assert_eq!(cpu.get_psw(), ZERO_FLAG);
    }
}
