//! 8080 condition codes and the shared flag-update policies.

use serde::{Deserialize, Serialize};

// Bit positions inside the flags byte pushed by `PUSH PSW`.
pub const ZERO_FLAG: u8 = 0x01;
pub const SIGN_FLAG: u8 = 0x02;
pub const PARITY_FLAG: u8 = 0x04;
pub const CARRY_FLAG: u8 = 0x08;
pub const AUX_CARRY_FLAG: u8 = 0x10;

/// True when `value` has an even number of set bits.
pub const fn parity(value: u8) -> bool {
    value.count_ones() % 2 == 0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionCodes {
    pub zero: bool,
    pub sign: bool,
    pub parity: bool,
    pub carry: bool,
    pub aux_carry: bool,
}

impl ConditionCodes {
    /// Pack into the PSW flags byte: Z | S<<1 | P<<2 | CY<<3 | AC<<4.
    pub fn pack(&self) -> u8 {
        let mut psw = 0;
        if self.zero {
            psw |= ZERO_FLAG;
        }
        if self.sign {
            psw |= SIGN_FLAG;
        }
        if self.parity {
            psw |= PARITY_FLAG;
        }
        if self.carry {
            psw |= CARRY_FLAG;
        }
        if self.aux_carry {
            psw |= AUX_CARRY_FLAG;
        }
        psw
    }

    /// Inverse of [`pack`](Self::pack). Bits 5-7 are ignored.
    pub fn unpack(psw: u8) -> Self {
        ConditionCodes {
            zero: psw & ZERO_FLAG != 0,
            sign: psw & SIGN_FLAG != 0,
            parity: psw & PARITY_FLAG != 0,
            carry: psw & CARRY_FLAG != 0,
            aux_carry: psw & AUX_CARRY_FLAG != 0,
        }
    }

    /// Zero/sign/parity only; used by INR, DCR and DAA.
    pub fn set_zsp(&mut self, value: u8) {
        self.zero = value == 0;
        self.sign = value & 0x80 != 0;
        self.parity = parity(value);
    }

    /// Arithmetic policy. `result` is the 16-bit intermediate of an 8-bit
    /// add or two's-complement subtract; anything above 0xFF is a carry
    /// (or borrow). Z/S/P look at the low byte only.
    pub fn set_arith(&mut self, result: u16) {
        self.carry = result > 0xFF;
        self.set_zsp(result as u8);
    }

    /// Logical policy: ANA/XRA/ORA clear both carries.
    pub fn set_logic(&mut self, value: u8) {
        self.carry = false;
        self.aux_carry = false;
        self.set_zsp(value);
    }
}
