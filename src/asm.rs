//! Bytecode construction and disassembly.
//!
//! The compiler is an external collaborator; what the core provides is the
//! [`FunctionBuilder`], which emits instructions and assembles a function
//! object attached to a module, and the disassembler that backs the
//! listing flags.

use std::rc::Rc;

use crate::class::ClassId;
use crate::error::{Exception, VmResult};
use crate::function::{BytecodeBody, Function, FunctionFlags, FunctionKind};
use crate::object::{CellAddr, Payload};
use crate::opcode::{decode, Opcode, OperandLayout};
use crate::value::{ObjId, Value};
use crate::vm::Vm;

/// Incremental builder for one bytecode function.
///
/// Operand widths are checked at emit time, so a mis-sized jump offset or
/// register number fails fast instead of producing corrupt code.
pub struct FunctionBuilder {
    name: String,
    code: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<u32>,
    current_line: u32,
    framesize: u16,
    cleansize: u16,
    results: u8,
    reqargs: u8,
    optargs: u8,
    tupargs: u8,
    flags: FunctionFlags,
}

impl FunctionBuilder {
    /// Starts a function named `name`.
    pub fn new(name: &str) -> Self {
        FunctionBuilder {
            name: name.to_string(),
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            current_line: 0,
            framesize: 0,
            cleansize: 0,
            results: 0,
            reqargs: 0,
            optargs: 0,
            tupargs: 0,
            flags: FunctionFlags::empty(),
        }
    }

    /// Number of work registers the function uses.
    pub fn framesize(mut self, n: u16) -> Self {
        self.framesize = n;
        self
    }

    /// Maximum clean-table occupancy.
    pub fn cleansize(mut self, n: u16) -> Self {
        self.cleansize = n;
        self
    }

    /// Declares a result.
    pub fn results(mut self, n: u8) -> Self {
        self.results = n;
        self
    }

    /// Declares argument arity: required, optional (255 = unbounded) and
    /// tuple size.
    pub fn args(mut self, reqargs: u8, optargs: u8, tupargs: u8) -> Self {
        self.reqargs = reqargs;
        self.optargs = optargs;
        self.tupargs = tupargs;
        self
    }

    /// Marks the function as an exception block (try body or catcher).
    pub fn xblock(mut self) -> Self {
        self.flags |= FunctionFlags::XBLOCK;
        self
    }

    /// Marks the function as using upvalues.
    pub fn upvalues(mut self) -> Self {
        self.flags |= FunctionFlags::UPVALUES;
        self
    }

    /// Sets the source line attributed to subsequently emitted code.
    pub fn line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// Adds a constant and returns its pool index. Plain-data constants are
    /// deduplicated.
    pub fn constant(&mut self, v: Value) -> u16 {
        if !v.is_objref() {
            if let Some(i) = self.constants.iter().position(|c| *c == v) {
                return i as u16;
            }
        }
        self.constants.push(v);
        (self.constants.len() - 1) as u16
    }

    /// Current code offset, for jump targets.
    pub fn here(&self) -> usize {
        self.code.len()
    }

    /// Emits one instruction. The operand slice must match the opcode's
    /// layout arity, and each operand must fit its field.
    pub fn emit(&mut self, op: Opcode, operands: &[i32]) -> VmResult<usize> {
        let at = self.code.len();
        let layout = op.operands();
        let fields: &[(bool, bool)] = match layout {
            // (wide, signed) per operand.
            OperandLayout::L0 => &[],
            OperandLayout::A => &[(false, false)],
            OperandLayout::Ax => &[(true, false)],
            OperandLayout::SAx => &[(true, true)],
            OperandLayout::AB => &[(false, false); 2],
            OperandLayout::ABC => &[(false, false); 3],
            OperandLayout::ABCD => &[(false, false); 4],
            OperandLayout::ABx => &[(false, false), (true, false)],
            OperandLayout::ASBx => &[(false, false), (true, true)],
            OperandLayout::AxBx => &[(true, false), (true, false)],
            OperandLayout::AxSBx => &[(true, false), (true, true)],
            OperandLayout::ABCx => &[(false, false), (false, false), (true, false)],
            OperandLayout::ABSCx => &[(false, false), (false, false), (true, true)],
            OperandLayout::ABxCx => &[(false, false), (true, false), (true, false)],
            OperandLayout::ABxSCx => &[(false, false), (true, false), (true, true)],
            OperandLayout::ABCDx => {
                &[(false, false), (false, false), (false, false), (true, false)]
            }
            OperandLayout::ABCSDx => {
                &[(false, false), (false, false), (false, false), (true, true)]
            }
        };
        if operands.len() != fields.len() {
            return Err(Exception::Arguments);
        }
        self.code.push(op as u8);
        for (&v, &(wide, signed)) in operands.iter().zip(fields) {
            match (wide, signed) {
                (false, _) => {
                    if !(0..=255).contains(&v) {
                        return Err(Exception::Overflow);
                    }
                    self.code.push(v as u8);
                }
                (true, false) => {
                    if !(0..=0xFFFF).contains(&v) {
                        return Err(Exception::Overflow);
                    }
                    self.code.extend_from_slice(&(v as u16).to_le_bytes());
                }
                (true, true) => {
                    if !(i16::MIN as i32..=i16::MAX as i32).contains(&v) {
                        return Err(Exception::Overflow);
                    }
                    self.code.extend_from_slice(&(v as i16).to_le_bytes());
                }
            }
        }
        while self.lines.len() < self.code.len() {
            self.lines.push(self.current_line);
        }
        Ok(at)
    }

    /// Patches a previously emitted signed 16-bit operand (jump offsets).
    pub fn patch_s16(&mut self, instr_at: usize, operand_offset: usize, v: i32) -> VmResult<()> {
        if !(i16::MIN as i32..=i16::MAX as i32).contains(&v) {
            return Err(Exception::Overflow);
        }
        let at = instr_at + operand_offset;
        if at + 1 >= self.code.len() {
            return Err(Exception::Arguments);
        }
        self.code[at..at + 2].copy_from_slice(&(v as i16).to_le_bytes());
        Ok(())
    }

    /// Assembles the function into an object owned by `module`. Object
    /// constants are owned by the constant pool.
    pub fn finish(self, vm: &mut Vm, module: ObjId) -> VmResult<ObjId> {
        let mut flags = self.flags;
        if self.results > 0 {
            flags |= FunctionFlags::RESULTS;
        }
        if self.reqargs > 0 || self.optargs > 0 || self.tupargs > 0 {
            flags |= FunctionFlags::ARGS;
        }
        let name = vm.intern(&self.name)?;
        let mut constants = Vec::with_capacity(self.constants.len());
        for c in &self.constants {
            // Unwired weakrefs make no sense in a pool; copy semantics
            // promote anything reference-shaped to an owned objref.
            let owned = vm.copy_value(*c, CellAddr::Heap(usize::MAX));
            constants.push(owned);
        }
        let f = Function {
            module: Some(module),
            name: Some(name),
            flags,
            results: self.results,
            reqargs: self.reqargs,
            optargs: self.optargs,
            tupargs: self.tupargs,
            kind: FunctionKind::Bytecode(BytecodeBody {
                framesize: self.framesize,
                cleansize: self.cleansize,
                constants,
                code: Rc::new(self.code),
                lines: if self.lines.is_empty() {
                    None
                } else {
                    Some(self.lines)
                },
            }),
        };
        let fo = vm.alloc_object(ClassId::FUNCTION, Payload::Function(f))?;
        vm.module_adopt(module, fo);
        Ok(fo)
    }
}

/// Renders one instruction at `pc`. Returns the text and the next pc.
pub fn disassemble_at(vm: &Vm, code: &[u8], constants: &[Value], pc: usize) -> (String, usize) {
    let Some(&opb) = code.get(pc) else {
        return (format!("{pc:6}: <end>"), pc + 1);
    };
    let Some(op) = Opcode::from_u8(opb) else {
        return (format!("{pc:6}: <bad opcode {opb:#04x}>"), pc + 1);
    };
    let Some(o) = decode(code, pc, op.operands()) else {
        return (format!("{pc:6}: {} <truncated>", op.name()), code.len());
    };
    let mut text = format!("{pc:6}: {:<10}", op.name());
    let args: &[i32] = match op.operands() {
        OperandLayout::L0 => &[],
        OperandLayout::A | OperandLayout::Ax | OperandLayout::SAx => &[o.a][..],
        OperandLayout::AB
        | OperandLayout::ABx
        | OperandLayout::ASBx
        | OperandLayout::AxBx
        | OperandLayout::AxSBx => &[o.a, o.b][..],
        OperandLayout::ABC
        | OperandLayout::ABCx
        | OperandLayout::ABSCx
        | OperandLayout::ABxCx
        | OperandLayout::ABxSCx => &[o.a, o.b, o.c][..],
        OperandLayout::ABCD | OperandLayout::ABCDx | OperandLayout::ABCSDx => {
            &[o.a, o.b, o.c, o.d][..]
        }
    };
    let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    text.push_str(&rendered.join(", "));

    // Decorate constant-referencing instructions with the constant value.
    let const_idx = match op {
        Opcode::PushC => Some(o.a),
        Opcode::LdC | Opcode::InitC | Opcode::AssignC | Opcode::CCall => Some(o.b),
        Opcode::IndGetC | Opcode::IndSetC | Opcode::CCallR => Some(o.c),
        Opcode::BopC => Some(o.d),
        _ => None,
    };
    if let Some(ci) = const_idx {
        if let Some(cv) = constants.get(ci as usize) {
            text.push_str(&format!("    ; c[{}] = {}", ci, vm.value_repr(cv)));
        }
    }
    (text, pc + op.size())
}

impl Vm {
    /// Disassembles a bytecode function, one instruction per line.
    pub fn disassemble(&self, fo: ObjId) -> VmResult<String> {
        let f = self.function(fo)?;
        let body = f.body().ok_or(Exception::NeedCallable)?;
        let code = Rc::clone(&body.code);
        let constants: Vec<Value> = body.constants.clone();
        let name = f
            .name
            .map(|n| String::from_utf8_lossy(self.string_bytes(n)).into_owned())
            .unwrap_or_else(|| "<anonymous>".into());
        let mut out = format!(
            "; function '{}': {} registers, {} clean slots, {} constants\n",
            name,
            body.framesize,
            body.cleansize,
            constants.len()
        );
        let mut pc = 0;
        while pc < code.len() {
            let (line, next) = disassemble_at(self, &code, &constants, pc);
            out.push_str(&line);
            out.push('\n');
            pc = next;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_checks_operand_arity() {
        let mut b = FunctionBuilder::new("t");
        assert!(b.emit(Opcode::Nop, &[]).is_ok());
        assert_eq!(b.emit(Opcode::Push, &[]), Err(Exception::Arguments));
        assert_eq!(b.emit(Opcode::Push, &[300]), Err(Exception::Overflow));
        assert!(b.emit(Opcode::Jump, &[-2]).is_ok());
    }

    #[test]
    fn emit_encodes_little_endian() {
        let mut b = FunctionBuilder::new("t");
        b.emit(Opcode::LdI, &[1, -2]).unwrap();
        assert_eq!(b.code, vec![Opcode::LdI as u8, 1, 0xFE, 0xFF]);
    }

    #[test]
    fn constants_deduplicate_plain_values() {
        let mut b = FunctionBuilder::new("t");
        let i = b.constant(Value::Integer(7));
        let j = b.constant(Value::Integer(7));
        let k = b.constant(Value::Integer(8));
        assert_eq!(i, j);
        assert_ne!(i, k);
    }
}
