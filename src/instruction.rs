//! Opcode decoding for the 8080.
//!
//! Every byte value decodes to an [`Instruction`]; the match in [`decode`]
//! has no wildcard arm, so the compiler checks that all 256 encodings are
//! covered. Undocumented encodings decode to the operation the real chip
//! performs for them (NOP, JMP, RET or CALL).

use std::fmt;

/// Single-byte operand: six registers, memory at HL, or the accumulator.
/// Discriminants match the 3-bit register field of the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    B,
    C,
    D,
    E,
    H,
    L,
    M,
    A,
}

impl Reg {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Reg::B,
            1 => Reg::C,
            2 => Reg::D,
            3 => Reg::E,
            4 => Reg::H,
            5 => Reg::L,
            6 => Reg::M,
            _ => Reg::A,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Reg::B => "B",
            Reg::C => "C",
            Reg::D => "D",
            Reg::E => "E",
            Reg::H => "H",
            Reg::L => "L",
            Reg::M => "M",
            Reg::A => "A",
        }
    }
}

/// Register pair for LXI/INX/DCX/DAD/LDAX/STAX.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegPair {
    BC,
    DE,
    HL,
    SP,
}

impl RegPair {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => RegPair::BC,
            1 => RegPair::DE,
            2 => RegPair::HL,
            _ => RegPair::SP,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RegPair::BC => "B",
            RegPair::DE => "D",
            RegPair::HL => "H",
            RegPair::SP => "SP",
        }
    }
}

/// Register pair for PUSH/POP, where the fourth slot is A + flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPair {
    BC,
    DE,
    HL,
    PSW,
}

impl StackPair {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => StackPair::BC,
            1 => StackPair::DE,
            2 => StackPair::HL,
            _ => StackPair::PSW,
        }
    }

    fn name(self) -> &'static str {
        match self {
            StackPair::BC => "B",
            StackPair::DE => "D",
            StackPair::HL => "H",
            StackPair::PSW => "PSW",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    NotZero,
    Zero,
    NoCarry,
    Carry,
    ParityOdd,
    ParityEven,
    Plus,
    Minus,
}

impl Condition {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => Condition::NotZero,
            1 => Condition::Zero,
            2 => Condition::NoCarry,
            3 => Condition::Carry,
            4 => Condition::ParityOdd,
            5 => Condition::ParityEven,
            6 => Condition::Plus,
            _ => Condition::Minus,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Condition::NotZero => "NZ",
            Condition::Zero => "Z",
            Condition::NoCarry => "NC",
            Condition::Carry => "C",
            Condition::ParityOdd => "PO",
            Condition::ParityEven => "PE",
            Condition::Plus => "P",
            Condition::Minus => "M",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Adc,
    Sub,
    Sbb,
    Ana,
    Xra,
    Ora,
    Cmp,
}

impl AluOp {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => AluOp::Add,
            1 => AluOp::Adc,
            2 => AluOp::Sub,
            3 => AluOp::Sbb,
            4 => AluOp::Ana,
            5 => AluOp::Xra,
            6 => AluOp::Ora,
            _ => AluOp::Cmp,
        }
    }

    fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "ADD",
            AluOp::Adc => "ADC",
            AluOp::Sub => "SUB",
            AluOp::Sbb => "SBB",
            AluOp::Ana => "ANA",
            AluOp::Xra => "XRA",
            AluOp::Ora => "ORA",
            AluOp::Cmp => "CMP",
        }
    }

    fn immediate_mnemonic(self) -> &'static str {
        match self {
            AluOp::Add => "ADI",
            AluOp::Adc => "ACI",
            AluOp::Sub => "SUI",
            AluOp::Sbb => "SBI",
            AluOp::Ana => "ANI",
            AluOp::Xra => "XRI",
            AluOp::Ora => "ORI",
            AluOp::Cmp => "CPI",
        }
    }
}

/// The distinct semantic operations of the 8080.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Lxi(RegPair),
    Stax(RegPair),
    Ldax(RegPair),
    Inx(RegPair),
    Dcx(RegPair),
    Dad(RegPair),
    Inr(Reg),
    Dcr(Reg),
    Mvi(Reg),
    Mov(Reg, Reg),
    Hlt,
    Rlc,
    Rrc,
    Ral,
    Rar,
    Daa,
    Cma,
    Stc,
    Cmc,
    Shld,
    Lhld,
    Sta,
    Lda,
    Alu(AluOp, Reg),
    AluImmediate(AluOp),
    Jmp,
    JmpIf(Condition),
    Call,
    CallIf(Condition),
    Ret,
    RetIf(Condition),
    Rst(u8),
    Push(StackPair),
    Pop(StackPair),
    In,
    Out,
    Xthl,
    Xchg,
    Sphl,
    Pchl,
    Ei,
    Di,
}

pub fn decode(opcode: u8) -> Instruction {
    let ddd = opcode >> 3;
    let sss = opcode;
    let rp = opcode >> 4;

    match opcode {
        0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => Instruction::Nop,
        0x01 | 0x11 | 0x21 | 0x31 => Instruction::Lxi(RegPair::from_bits(rp)),
        0x02 | 0x12 => Instruction::Stax(RegPair::from_bits(rp)),
        0x22 => Instruction::Shld,
        0x32 => Instruction::Sta,
        0x03 | 0x13 | 0x23 | 0x33 => Instruction::Inx(RegPair::from_bits(rp)),
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
            Instruction::Inr(Reg::from_bits(ddd))
        }
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
            Instruction::Dcr(Reg::from_bits(ddd))
        }
        0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
            Instruction::Mvi(Reg::from_bits(ddd))
        }
        0x07 => Instruction::Rlc,
        0x0F => Instruction::Rrc,
        0x17 => Instruction::Ral,
        0x1F => Instruction::Rar,
        0x27 => Instruction::Daa,
        0x2F => Instruction::Cma,
        0x37 => Instruction::Stc,
        0x3F => Instruction::Cmc,
        0x09 | 0x19 | 0x29 | 0x39 => Instruction::Dad(RegPair::from_bits(rp)),
        0x0A | 0x1A => Instruction::Ldax(RegPair::from_bits(rp)),
        0x2A => Instruction::Lhld,
        0x3A => Instruction::Lda,
        0x0B | 0x1B | 0x2B | 0x3B => Instruction::Dcx(RegPair::from_bits(rp)),

        // MOV M,M is the encoding HLT occupies
        0x76 => Instruction::Hlt,
        0x40..=0x75 | 0x77..=0x7F => Instruction::Mov(Reg::from_bits(ddd), Reg::from_bits(sss)),

        0x80..=0xBF => Instruction::Alu(AluOp::from_bits(ddd), Reg::from_bits(sss)),

        0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
            Instruction::RetIf(Condition::from_bits(ddd))
        }
        0xC1 | 0xD1 | 0xE1 | 0xF1 => Instruction::Pop(StackPair::from_bits(rp)),
        0xC9 | 0xD9 => Instruction::Ret,
        0xE9 => Instruction::Pchl,
        0xF9 => Instruction::Sphl,
        0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
            Instruction::JmpIf(Condition::from_bits(ddd))
        }
        0xC3 | 0xCB => Instruction::Jmp,
        0xD3 => Instruction::Out,
        0xDB => Instruction::In,
        0xE3 => Instruction::Xthl,
        0xEB => Instruction::Xchg,
        0xF3 => Instruction::Di,
        0xFB => Instruction::Ei,
        0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
            Instruction::CallIf(Condition::from_bits(ddd))
        }
        0xC5 | 0xD5 | 0xE5 | 0xF5 => Instruction::Push(StackPair::from_bits(rp)),
        0xCD | 0xDD | 0xED | 0xFD => Instruction::Call,
        0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
            Instruction::AluImmediate(AluOp::from_bits(ddd))
        }
        0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => Instruction::Rst(ddd & 0x07),
    }
}

/// Encodings Intel never documented. They alias real instructions on
/// silicon; strict mode refuses them.
pub fn is_undocumented(opcode: u8) -> bool {
    matches!(
        opcode,
        0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 | 0xCB | 0xD9 | 0xDD | 0xED | 0xFD
    )
}

/// States per opcode from the 8080 data sheet. Conditional CALL and RET
/// list the not-taken cost; taking the branch adds [`BRANCH_TAKEN_PENALTY`].
#[rustfmt::skip]
pub const CYCLES: [u8; 256] = [
//   0   1   2   3   4   5   6   7   8   9   A   B   C   D   E   F
     4, 10,  7,  5,  5,  5,  7,  4,  4, 10,  7,  5,  5,  5,  7,  4, // 0x00
     4, 10,  7,  5,  5,  5,  7,  4,  4, 10,  7,  5,  5,  5,  7,  4, // 0x10
     4, 10, 16,  5,  5,  5,  7,  4,  4, 10, 16,  5,  5,  5,  7,  4, // 0x20
     4, 10, 13,  5, 10, 10, 10,  4,  4, 10, 13,  5,  5,  5,  7,  4, // 0x30
     5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 0x40
     5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 0x50
     5,  5,  5,  5,  5,  5,  7,  5,  5,  5,  5,  5,  5,  5,  7,  5, // 0x60
     7,  7,  7,  7,  7,  7,  7,  7,  5,  5,  5,  5,  5,  5,  7,  5, // 0x70
     4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x80
     4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0x90
     4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0xA0
     4,  4,  4,  4,  4,  4,  7,  4,  4,  4,  4,  4,  4,  4,  7,  4, // 0xB0
     5, 10, 10, 10, 11, 11,  7, 11,  5, 10, 10, 10, 11, 17,  7, 11, // 0xC0
     5, 10, 10, 10, 11, 11,  7, 11,  5, 10, 10, 10, 11, 17,  7, 11, // 0xD0
     5, 10, 10, 18, 11, 11,  7, 11,  5,  5, 10,  4, 11, 17,  7, 11, // 0xE0
     5, 10, 10,  4, 11, 11,  7, 11,  5,  5, 10,  4, 11, 17,  7, 11, // 0xF0
];

pub const BRANCH_TAKEN_PENALTY: u32 = 6;

impl Instruction {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::Nop => "NOP",
            Instruction::Lxi(_) => "LXI",
            Instruction::Stax(_) => "STAX",
            Instruction::Ldax(_) => "LDAX",
            Instruction::Inx(_) => "INX",
            Instruction::Dcx(_) => "DCX",
            Instruction::Dad(_) => "DAD",
            Instruction::Inr(_) => "INR",
            Instruction::Dcr(_) => "DCR",
            Instruction::Mvi(_) => "MVI",
            Instruction::Mov(_, _) => "MOV",
            Instruction::Hlt => "HLT",
            Instruction::Rlc => "RLC",
            Instruction::Rrc => "RRC",
            Instruction::Ral => "RAL",
            Instruction::Rar => "RAR",
            Instruction::Daa => "DAA",
            Instruction::Cma => "CMA",
            Instruction::Stc => "STC",
            Instruction::Cmc => "CMC",
            Instruction::Shld => "SHLD",
            Instruction::Lhld => "LHLD",
            Instruction::Sta => "STA",
            Instruction::Lda => "LDA",
            Instruction::Alu(op, _) => op.mnemonic(),
            Instruction::AluImmediate(op) => op.immediate_mnemonic(),
            Instruction::Jmp => "JMP",
            Instruction::JmpIf(_) => "Jcc",
            Instruction::Call => "CALL",
            Instruction::CallIf(_) => "Ccc",
            Instruction::Ret => "RET",
            Instruction::RetIf(_) => "Rcc",
            Instruction::Rst(_) => "RST",
            Instruction::Push(_) => "PUSH",
            Instruction::Pop(_) => "POP",
            Instruction::In => "IN",
            Instruction::Out => "OUT",
            Instruction::Xthl => "XTHL",
            Instruction::Xchg => "XCHG",
            Instruction::Sphl => "SPHL",
            Instruction::Pchl => "PCHL",
            Instruction::Ei => "EI",
            Instruction::Di => "DI",
        }
    }

    /// Instruction length in bytes, opcode included.
    pub fn length(&self) -> u16 {
        match self {
            Instruction::Lxi(_)
            | Instruction::Shld
            | Instruction::Lhld
            | Instruction::Sta
            | Instruction::Lda
            | Instruction::Jmp
            | Instruction::JmpIf(_)
            | Instruction::Call
            | Instruction::CallIf(_) => 3,
            Instruction::Mvi(_) | Instruction::AluImmediate(_) | Instruction::In | Instruction::Out => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Lxi(rp) => write!(f, "LXI {},d16", rp.name()),
            Instruction::Stax(rp) => write!(f, "STAX {}", rp.name()),
            Instruction::Ldax(rp) => write!(f, "LDAX {}", rp.name()),
            Instruction::Inx(rp) => write!(f, "INX {}", rp.name()),
            Instruction::Dcx(rp) => write!(f, "DCX {}", rp.name()),
            Instruction::Dad(rp) => write!(f, "DAD {}", rp.name()),
            Instruction::Inr(r) => write!(f, "INR {}", r.name()),
            Instruction::Dcr(r) => write!(f, "DCR {}", r.name()),
            Instruction::Mvi(r) => write!(f, "MVI {},d8", r.name()),
            Instruction::Mov(dst, src) => write!(f, "MOV {},{}", dst.name(), src.name()),
            Instruction::Shld | Instruction::Lhld | Instruction::Sta | Instruction::Lda => {
                write!(f, "{} a16", self.mnemonic())
            }
            Instruction::Alu(op, r) => write!(f, "{} {}", op.mnemonic(), r.name()),
            Instruction::AluImmediate(op) => write!(f, "{} d8", op.immediate_mnemonic()),
            Instruction::Jmp | Instruction::Call => write!(f, "{} a16", self.mnemonic()),
            Instruction::JmpIf(c) => write!(f, "J{} a16", c.suffix()),
            Instruction::CallIf(c) => write!(f, "C{} a16", c.suffix()),
            Instruction::RetIf(c) => write!(f, "R{}", c.suffix()),
            Instruction::Rst(n) => write!(f, "RST {}", n),
            Instruction::Push(sp) => write!(f, "PUSH {}", sp.name()),
            Instruction::Pop(sp) => write!(f, "POP {}", sp.name()),
            Instruction::In | Instruction::Out => write!(f, "{} d8", self.mnemonic()),
            _ => f.write_str(self.mnemonic()),
        }
    }
}
