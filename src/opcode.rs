//! VM instruction encoding.
//!
//! An instruction is an opcode byte followed by a fixed-per-opcode operand
//! layout drawn from a closed set. Lower-case single letters in the layout
//! names are 8-bit unsigned operands; an appended `x` widens to 16-bit
//! little-endian; an `s` prefix makes the operand signed. Instruction size
//! is therefore a pure function of the opcode.
//!
//! Addressing modes used in the per-opcode summaries: `R[x]` is register
//! `x` of the current frame, `c[x]` is constant `x` of the current
//! function, `sv[x]` is static variable `x` of the current module.

/// Operand layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum OperandLayout {
    /// No operands.
    L0,
    /// One 8-bit operand.
    A,
    /// One 16-bit operand.
    Ax,
    /// Two 8-bit operands.
    AB,
    /// Three 8-bit operands.
    ABC,
    /// Four 8-bit operands.
    ABCD,
    /// One signed 16-bit operand.
    SAx,
    /// 8-bit + 16-bit.
    ABx,
    /// 8-bit + signed 16-bit.
    ASBx,
    /// Two 16-bit operands.
    AxBx,
    /// 16-bit + signed 16-bit.
    AxSBx,
    /// Two 8-bit + one 16-bit.
    ABCx,
    /// Two 8-bit + one signed 16-bit.
    ABSCx,
    /// 8-bit + 16-bit + 16-bit.
    ABxCx,
    /// 8-bit + 16-bit + signed 16-bit.
    ABxSCx,
    /// Three 8-bit + one 16-bit.
    ABCDx,
    /// Three 8-bit + one signed 16-bit.
    ABCSDx,
}

impl OperandLayout {
    /// Instruction size in bytes, opcode byte included.
    pub fn size(self) -> usize {
        match self {
            OperandLayout::L0 => 1,
            OperandLayout::A => 2,
            OperandLayout::Ax | OperandLayout::AB | OperandLayout::SAx => 3,
            OperandLayout::ABC | OperandLayout::ABx | OperandLayout::ASBx => 4,
            OperandLayout::ABCD
            | OperandLayout::AxBx
            | OperandLayout::AxSBx
            | OperandLayout::ABCx
            | OperandLayout::ABSCx => 5,
            OperandLayout::ABxCx
            | OperandLayout::ABxSCx
            | OperandLayout::ABCDx
            | OperandLayout::ABCSDx => 6,
        }
    }
}

/// Decoded operand fields. Unused fields are zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct Operands {
    pub a: i32,
    pub b: i32,
    pub c: i32,
    pub d: i32,
}

fn o8(code: &[u8], i: usize) -> i32 {
    code[i] as i32
}

fn o16(code: &[u8], i: usize) -> i32 {
    u16::from_le_bytes([code[i], code[i + 1]]) as i32
}

fn os16(code: &[u8], i: usize) -> i32 {
    i16::from_le_bytes([code[i], code[i + 1]]) as i32
}

/// Decodes the operands at `pc` (which addresses the opcode byte).
/// Returns `None` if the instruction would run off the end of the code.
pub fn decode(code: &[u8], pc: usize, layout: OperandLayout) -> Option<Operands> {
    if pc + layout.size() > code.len() {
        return None;
    }
    let mut o = Operands::default();
    match layout {
        OperandLayout::L0 => {}
        OperandLayout::A => o.a = o8(code, pc + 1),
        OperandLayout::Ax => o.a = o16(code, pc + 1),
        OperandLayout::AB => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
        }
        OperandLayout::ABC => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = o8(code, pc + 3);
        }
        OperandLayout::ABCD => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = o8(code, pc + 3);
            o.d = o8(code, pc + 4);
        }
        OperandLayout::SAx => o.a = os16(code, pc + 1),
        OperandLayout::ABx => {
            o.a = o8(code, pc + 1);
            o.b = o16(code, pc + 2);
        }
        OperandLayout::ASBx => {
            o.a = o8(code, pc + 1);
            o.b = os16(code, pc + 2);
        }
        OperandLayout::AxBx => {
            o.a = o16(code, pc + 1);
            o.b = o16(code, pc + 3);
        }
        OperandLayout::AxSBx => {
            o.a = o16(code, pc + 1);
            o.b = os16(code, pc + 3);
        }
        OperandLayout::ABCx => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = o16(code, pc + 3);
        }
        OperandLayout::ABSCx => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = os16(code, pc + 3);
        }
        OperandLayout::ABxCx => {
            o.a = o8(code, pc + 1);
            o.b = o16(code, pc + 2);
            o.c = o16(code, pc + 4);
        }
        OperandLayout::ABxSCx => {
            o.a = o8(code, pc + 1);
            o.b = o16(code, pc + 2);
            o.c = os16(code, pc + 4);
        }
        OperandLayout::ABCDx => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = o8(code, pc + 3);
            o.d = o16(code, pc + 4);
        }
        OperandLayout::ABCSDx => {
            o.a = o8(code, pc + 1);
            o.b = o8(code, pc + 2);
            o.c = o8(code, pc + 3);
            o.d = os16(code, pc + 4);
        }
    }
    Some(o)
}

macro_rules! opcodes {
    ($(($name:ident, $layout:ident)),* $(,)?) => {
        /// VM opcodes, in dispatch order. `Illegal` is opcode 0 so that
        /// zeroed code traps.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
        #[repr(u8)]
        pub enum Opcode {
            $($name),*
        }

        /// Number of opcodes.
        pub const OPCODE_COUNT: usize = {
            let all: &[Opcode] = &[$(Opcode::$name),*];
            all.len()
        };

        /// All opcodes in numeric order.
        pub const ALL_OPCODES: [Opcode; OPCODE_COUNT] = [$(Opcode::$name),*];

        impl Opcode {
            /// Operand layout of this opcode.
            pub fn operands(self) -> OperandLayout {
                match self {
                    $(Opcode::$name => OperandLayout::$layout),*
                }
            }

            /// Mnemonic, as used by the disassembler.
            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }
    };
}

opcodes! {
    // Special
    (Illegal, L0),
    (Nop, L0),

    // Local flow control
    (Jump, SAx),       // PC += sAx
    (JumpZ, ASBx),     // if !R[A] then PC += sBx
    (JumpNZ, ASBx),    // if R[A] then PC += sBx
    (Switch, ABxSCx),  // try PC = c[Bx][R[A]], except PC += sCx
    (PreLoop, ABCSDx), // R[A,B,C] = real R[A,B,C]; skip loop if done
    (Loop, ABCSDx),    // R[A] += R[B]; branch back while in range

    // Argument stack
    (Push, A),
    (Push2, AB),
    (Push3, ABC),
    (Push4, ABCD),
    (PushI, SAx),
    (PhTrue, L0),
    (PhFalse, L0),
    (PushNil, L0),
    (PushC, Ax),
    (PushC2, AxBx),
    (PushIC, AxSBx),   // push sBx, c[Ax]
    (PushCI, AxSBx),   // push c[Ax], sBx
    (PhVar, Ax),       // push sv[Ax]
    (PhUVal, AB),      // push R[A] B levels up
    (PushTup, L0),     // push the variadic tuple tail
    (PhArgs, L0),      // push the entire argument vector

    // Function calls
    (Call, A),
    (CallR, AB),
    (CCall, ABx),      // call c[Bx]; A = scope nesting skip depth
    (CCallR, ABCx),    // call c[Cx] with result register B
    (Return, L0),
    (ReturnR, A),

    // Memory management
    (Clean, A),        // release clean-table entries > A

    // Optional/tuple argument checking
    (ArgC, A),
    (TupC, A),
    (Spec, AB),
    (TSpec, AB),

    // Immediate values and constants
    (LdI, ASBx),
    (LdTrue, A),
    (LdFalse, A),
    (LdNil, A),
    (LdC, ABx),

    // Register access
    (Move, AB),

    // Register variables
    (Init, AB),
    (InitI, ASBx),
    (InitNil, A),
    (InitC, ABx),
    (Assign, AB),
    (AssignI, ASBx),
    (AsnNil, A),
    (AssignC, ABx),

    // Upvalues
    (GetUVal, ABC),
    (SetUVal, ABC),

    // Static variables
    (GetVar, ABx),
    (SetVar, ABx),

    // Indexed access
    (IndSetI, ABC),
    (IndGetI, ABC),
    (IndSet, ABC),
    (IndGet, ABC),
    (IndSetC, ABCx),
    (IndGetC, ABCx),

    // Argument access
    (GetArgI, AB),
    (PhArgI, A),
    (PhArgI2, AB),
    (SetArgI, AB),

    // Tuple and upvalue argument access
    (GetTArgI, ABC),
    (GetUVArgI, ABC),
    (SetUVArgI, ABC),
    (GetUVTArgI, ABCD),

    // Operators
    (Bop, ABCD),       // R[A] = R[B] op[C] R[D]
    (PhBop, ABC),      // push R[A] op[B] R[C]
    (IpBop, ABCD),     // R[A] = R[B].op[C](R[D])
    (BopS, ABCSDx),    // R[A] = R[B] op[C] sv[Dx]
    (IpBopS, ABCSDx),
    (BopI, ABCSDx),    // R[A] = R[B] op[C] immediate D
    (PhBopI, ABSCx),
    (IpBopI, ABCSDx),
    (BopC, ABCDx),     // R[A] = R[B] op[C] c[Dx]

    (Neg, AB),
    (BNot, AB),
    (Not, AB),
    (CastR, AB),
    (CastI, AB),
    (CastB, AB),
    (Cast, ABC),       // R[A] = (R[C]) R[B]
    (TypeOf, AB),
    (SizeOf, AB),
    (WeakRef, AB),     // R[A] = unwired weakref to R[B]

    (Add, ABC),
    (Sub, ABC),
    (Mul, ABC),
    (Div, ABC),
    (Mod, ABC),
    (Power, ABC),

    (PhAdd, AB),
    (PhSub, AB),
    (PhMul, AB),
    (PhDiv, AB),
    (PhMod, AB),
    (PhPower, AB),

    // Constructors
    (New, AB),         // R[A] = new instance of class B
    (Clone, AB),

    // Exception handling
    (Try, AxBx),       // run try block c[Bx] with catcher c[Ax]
    (Untry, Ax),       // run try block c[Ax] without outer propagation
    (Throw, A),
    (Retry, L0),
    (RetX, L0),
    (RetXR, A),
}

impl Opcode {
    /// Looks an opcode up by its byte value.
    pub fn from_u8(b: u8) -> Option<Opcode> {
        ALL_OPCODES.get(b as usize).copied()
    }

    /// Instruction size in bytes.
    pub fn size(self) -> usize {
        self.operands().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn illegal_is_zero() {
        assert_eq!(Opcode::Illegal as u8, 0);
        assert_eq!(Opcode::from_u8(0), Some(Opcode::Illegal));
    }

    #[test]
    fn byte_round_trip() {
        for (i, op) in ALL_OPCODES.iter().enumerate() {
            assert_eq!(*op as usize, i);
            assert_eq!(Opcode::from_u8(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_u8(OPCODE_COUNT as u8), None);
    }

    #[test]
    fn sizes_follow_layout() {
        assert_eq!(Opcode::Nop.size(), 1);
        assert_eq!(Opcode::Push.size(), 2);
        assert_eq!(Opcode::Jump.size(), 3);
        assert_eq!(Opcode::LdC.size(), 4);
        assert_eq!(Opcode::Try.size(), 5);
        assert_eq!(Opcode::Bop.size(), 5);
        assert_eq!(Opcode::Switch.size(), 6);
    }

    #[test]
    fn decode_signed_sixteen() {
        // JUMP -3, little-endian.
        let code = [Opcode::Jump as u8, 0xFD, 0xFF];
        let o = decode(&code, 0, OperandLayout::SAx).unwrap();
        assert_eq!(o.a, -3);
    }

    #[test]
    fn decode_rejects_truncated_code() {
        let code = [Opcode::Jump as u8, 0x01];
        assert!(decode(&code, 0, OperandLayout::SAx).is_none());
    }
}
