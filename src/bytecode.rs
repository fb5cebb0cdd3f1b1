//! Bytecode definitions, module loading, and the disassembler.
//!
//! Instruction streams live in scratch data buffers. All multi-byte
//! operands are little-endian; jump targets are measured from the
//! owning function's start offset, not from the jump itself.
//!
//! Three opcodes have "relocatable" twins: `load-var`, `push-symbol`
//! and `lexical-def`. A precompiled module stores symbol names in its
//! own table and emits the relocatable forms carrying table indices;
//! loading a module interns each name and rewrites the instruction into
//! its resolved form, whose operand is the intern-region offset.
//!
//! Module blob wire format:
//!
//! ```text
//! u16  symbol_count      (little-endian)
//! u16  bytecode_length   (little-endian)
//! symbol_count NUL-terminated names
//! bytecode_length bytes of instructions
//! ```

use std::fmt;

use crate::interp::{FunctionView, Interp};
use crate::platform::{ScratchBufferRef, SCRATCH_BUFFER_SIZE};
use crate::value::{CellValue, ValueRef};

/// Instruction set of the stack VM. `Fatal` is zero so running off the
/// end of a zero-filled buffer halts.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Fatal = 0,
    PushNil,
    Push0,
    Push1,
    Push2,
    PushSmallInteger,
    PushInteger,
    PushSymbol,
    PushSymbolRelocatable,
    PushString,
    PushThis,
    PushList,
    PushLambda,
    LoadVar,
    LoadVarRelocatable,
    Arg,
    Arg0,
    Arg1,
    Arg2,
    Dup,
    Pop,
    Not,
    First,
    Rest,
    MakePair,
    Jump,
    SmallJump,
    JumpIfFalse,
    SmallJumpIfFalse,
    Funcall,
    Funcall1,
    Funcall2,
    Funcall3,
    TailCall,
    TailCall1,
    TailCall2,
    TailCall3,
    LexicalFramePush,
    LexicalFramePop,
    LexicalDef,
    LexicalDefRelocatable,
    LexicalVarLoad,
    EarlyRet,
    Ret,
}

impl Opcode {
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        Some(match byte {
            0 => Fatal,
            1 => PushNil,
            2 => Push0,
            3 => Push1,
            4 => Push2,
            5 => PushSmallInteger,
            6 => PushInteger,
            7 => PushSymbol,
            8 => PushSymbolRelocatable,
            9 => PushString,
            10 => PushThis,
            11 => PushList,
            12 => PushLambda,
            13 => LoadVar,
            14 => LoadVarRelocatable,
            15 => Arg,
            16 => Arg0,
            17 => Arg1,
            18 => Arg2,
            19 => Dup,
            20 => Pop,
            21 => Not,
            22 => First,
            23 => Rest,
            24 => MakePair,
            25 => Jump,
            26 => SmallJump,
            27 => JumpIfFalse,
            28 => SmallJumpIfFalse,
            29 => Funcall,
            30 => Funcall1,
            31 => Funcall2,
            32 => Funcall3,
            33 => TailCall,
            34 => TailCall1,
            35 => TailCall2,
            36 => TailCall3,
            37 => LexicalFramePush,
            38 => LexicalFramePop,
            39 => LexicalDef,
            40 => LexicalDefRelocatable,
            41 => LexicalVarLoad,
            42 => EarlyRet,
            43 => Ret,
            _ => return None,
        })
    }

    /// Total instruction length in bytes at `offset`, operands
    /// included. `PushString` carries its own length byte.
    pub fn instruction_len(self, code: &[u8], offset: usize) -> usize {
        use Opcode::*;
        match self {
            PushSmallInteger | PushList | SmallJump | SmallJumpIfFalse | Funcall | TailCall => 2,
            PushSymbol | PushSymbolRelocatable | LoadVar | LoadVarRelocatable | LexicalDef
            | LexicalDefRelocatable | Jump | JumpIfFalse | PushLambda => 3,
            PushInteger => 5,
            PushString => 2 + code.get(offset + 1).copied().unwrap_or(0) as usize,
            _ => 1,
        }
    }
}

// Bounds-checked buffer reads. Out-of-range reads produce zero, which
// decodes as Fatal.

pub(crate) fn buf_u8(data: &ScratchBufferRef, at: usize) -> u8 {
    data.data.borrow().get(at).copied().unwrap_or(0)
}

pub(crate) fn buf_u16(data: &ScratchBufferRef, at: usize) -> u16 {
    u16::from_le_bytes([buf_u8(data, at), buf_u8(data, at + 1)])
}

pub(crate) fn buf_i16(data: &ScratchBufferRef, at: usize) -> i16 {
    buf_u16(data, at) as i16
}

pub(crate) fn buf_i32(data: &ScratchBufferRef, at: usize) -> i32 {
    i32::from_le_bytes([
        buf_u8(data, at),
        buf_u8(data, at + 1),
        buf_u8(data, at + 2),
        buf_u8(data, at + 3),
    ])
}

pub(crate) fn read_u16_le(code: &[u8], at: usize) -> u16 {
    let lo = code.get(at).copied().unwrap_or(0);
    let hi = code.get(at + 1).copied().unwrap_or(0);
    u16::from_le_bytes([lo, hi])
}

/// Host-level failures while decoding a module blob. Distinct from
/// interpreter error values: a malformed blob never ran.
#[derive(Debug, PartialEq, Eq)]
pub enum ModuleError {
    TruncatedHeader,
    TruncatedSymbolTable,
    TruncatedBytecode,
    BytecodeTooLarge,
    BadSymbolIndex(i16),
    BadSymbolName,
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::TruncatedHeader => write!(f, "module blob shorter than its header"),
            ModuleError::TruncatedSymbolTable => write!(f, "module symbol table runs past the blob"),
            ModuleError::TruncatedBytecode => write!(f, "module bytecode runs past the blob"),
            ModuleError::BytecodeTooLarge => {
                write!(f, "module bytecode exceeds a scratch buffer")
            }
            ModuleError::BadSymbolIndex(index) => {
                write!(f, "relocatable instruction references symbol {index}")
            }
            ModuleError::BadSymbolName => write!(f, "module symbol name is not UTF-8"),
        }
    }
}

impl Interp {
    /// Load a precompiled module blob: copy its bytecode into a fresh
    /// data buffer, rewrite every relocatable instruction to its
    /// resolved form, and leave the resulting bytecode function on the
    /// operand stack.
    pub fn load_module(&mut self, blob: &[u8]) -> Result<ValueRef, ModuleError> {
        if blob.len() < 4 {
            return Err(ModuleError::TruncatedHeader);
        }
        let symbol_count = read_u16_le(blob, 0) as usize;
        let bytecode_length = read_u16_le(blob, 2) as usize;

        let mut symbols: Vec<&str> = Vec::with_capacity(symbol_count);
        let mut at = 4;
        for _ in 0..symbol_count {
            let rest = &blob[at.min(blob.len())..];
            let end = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(ModuleError::TruncatedSymbolTable)?;
            let name =
                std::str::from_utf8(&rest[..end]).map_err(|_| ModuleError::BadSymbolName)?;
            symbols.push(name);
            at += end + 1;
        }

        if bytecode_length > SCRATCH_BUFFER_SIZE {
            return Err(ModuleError::BytecodeTooLarge);
        }
        if at + bytecode_length > blob.len() {
            return Err(ModuleError::TruncatedBytecode);
        }
        let mut code = blob[at..at + bytecode_length].to_vec();

        // Resolve relocatable instructions in the working copy before
        // touching the pool, so errors leave no state behind.
        let mut depth = 0usize;
        let mut offset = 0usize;
        while offset < code.len() {
            let op = match Opcode::from_u8(code[offset]) {
                Some(op) => op,
                None => break,
            };
            match op {
                Opcode::PushLambda => depth += 1,
                Opcode::Ret => {
                    if depth == 0 {
                        break;
                    }
                    depth -= 1;
                }
                Opcode::LoadVarRelocatable
                | Opcode::PushSymbolRelocatable
                | Opcode::LexicalDefRelocatable => {
                    let index = read_u16_le(&code, offset + 1) as i16;
                    if index < 0 || index as usize >= symbols.len() {
                        return Err(ModuleError::BadSymbolIndex(index));
                    }
                    let name = symbols[index as usize].to_string();
                    let interned = self.intern(&name);
                    let resolved = match op {
                        Opcode::LoadVarRelocatable => Opcode::LoadVar,
                        Opcode::PushSymbolRelocatable => Opcode::PushSymbol,
                        _ => Opcode::LexicalDef,
                    };
                    code[offset] = resolved as u8;
                    code[offset + 1..offset + 3].copy_from_slice(&interned.0.to_le_bytes());
                }
                _ => {}
            }
            offset += op.instruction_len(&code, offset);
        }

        let buffer = self.make_databuffer();
        if buffer == self.oom() {
            self.push_op(buffer);
            return Ok(buffer);
        }
        self.gc_protect(buffer);
        if let CellValue::DataBuffer(handle) = &self.cell(buffer).value {
            let handle = handle.clone();
            handle.data.borrow_mut()[..code.len()].copy_from_slice(&code);
        }

        let zero = self.make_integer(0);
        self.push_op(zero);
        let bytecode = self.make_cons(zero, buffer);
        self.push_op(bytecode);
        let function = self.make_bytecode_function(bytecode);
        self.pop_op();
        self.pop_op();
        self.gc_unprotect();

        self.push_op(function);
        Ok(function)
    }

    /// Print a function's code on the host console: bytecode functions
    /// are decoded instruction by instruction, source functions print
    /// their expression list, native functions print nothing.
    pub fn disassemble(&mut self, function: ValueRef) {
        match self.function_view(function) {
            Some(FunctionView::Bytecode { code, .. }) => {
                let buffer = self.cdr(code);
                let start_offset = self.integer_value(self.car(code)).max(0) as usize;
                let data = match &self.cell(buffer).value {
                    CellValue::DataBuffer(handle) => handle.clone(),
                    _ => return,
                };
                let text = self.disassemble_buffer(&data, start_offset);
                self.platform.console_print_line(&text);
                self.platform.sleep(80);
            }
            Some(FunctionView::Source { code, .. }) => {
                let text = self.format(code);
                self.platform.console_print_line(&text);
                self.platform.sleep(80);
            }
            _ => {}
        }
    }

    fn disassemble_buffer(&self, data: &ScratchBufferRef, start_offset: usize) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let mut depth = 0usize;
        let mut i = start_offset;

        while i < SCRATCH_BUFFER_SIZE {
            let op = match Opcode::from_u8(buf_u8(data, i)) {
                Some(op) => op,
                None => break,
            };

            let _ = write!(out, "{:04}: ", i - start_offset);

            match op {
                Opcode::Fatal => return out,
                Opcode::PushNil => out.push_str("PUSH_NIL"),
                Opcode::Push0 => out.push_str("PUSH_0"),
                Opcode::Push1 => out.push_str("PUSH_1"),
                Opcode::Push2 => out.push_str("PUSH_2"),
                Opcode::PushSmallInteger => {
                    let _ = write!(out, "PUSH_SMALL_INTEGER({})", buf_u8(data, i + 1));
                }
                Opcode::PushInteger => {
                    let _ = write!(out, "PUSH_INTEGER({})", buf_i32(data, i + 1));
                }
                Opcode::PushSymbol => {
                    let name = self.symbol_from_offset(buf_u16(data, i + 1));
                    let _ = write!(out, "PUSH_SYMBOL({name})");
                }
                Opcode::PushSymbolRelocatable => {
                    let _ = write!(out, "PUSH_SYMBOL_RELOCATABLE({})", buf_i16(data, i + 1));
                }
                Opcode::PushString => {
                    let len = buf_u8(data, i + 1) as usize;
                    let bytes = data.data.borrow();
                    let chunk = &bytes[(i + 2).min(SCRATCH_BUFFER_SIZE)
                        ..(i + 2 + len).min(SCRATCH_BUFFER_SIZE)];
                    let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                    let _ = write!(
                        out,
                        "PUSH_STRING(\"{}\")",
                        String::from_utf8_lossy(&chunk[..end])
                    );
                }
                Opcode::PushThis => out.push_str("PUSH_THIS"),
                Opcode::PushList => {
                    let _ = write!(out, "PUSH_LIST({})", buf_u8(data, i + 1));
                }
                Opcode::PushLambda => {
                    let _ = write!(out, "PUSH_LAMBDA({})", buf_u16(data, i + 1));
                    depth += 1;
                }
                Opcode::LoadVar => {
                    let name = self.symbol_from_offset(buf_u16(data, i + 1));
                    let _ = write!(out, "LOAD_VAR({name})");
                }
                Opcode::LoadVarRelocatable => {
                    let _ = write!(out, "LOAD_VAR_RELOCATABLE({})", buf_i16(data, i + 1));
                }
                Opcode::Arg => out.push_str("ARG"),
                Opcode::Arg0 => out.push_str("ARG0"),
                Opcode::Arg1 => out.push_str("ARG1"),
                Opcode::Arg2 => out.push_str("ARG2"),
                Opcode::Dup => out.push_str("DUP"),
                Opcode::Pop => out.push_str("POP"),
                Opcode::Not => out.push_str("NOT"),
                Opcode::First => out.push_str("FIRST"),
                Opcode::Rest => out.push_str("REST"),
                Opcode::MakePair => out.push_str("MAKE_PAIR"),
                Opcode::Jump => {
                    let _ = write!(out, "JUMP({})", buf_u16(data, i + 1));
                }
                Opcode::SmallJump => {
                    let _ = write!(out, "SMALL_JUMP({})", buf_u8(data, i + 1));
                }
                Opcode::JumpIfFalse => {
                    let _ = write!(out, "JUMP_IF_FALSE({})", buf_u16(data, i + 1));
                }
                Opcode::SmallJumpIfFalse => {
                    let _ = write!(out, "SMALL_JUMP_IF_FALSE({})", buf_u8(data, i + 1));
                }
                Opcode::Funcall => {
                    let _ = write!(out, "FUNCALL({})", buf_u8(data, i + 1));
                }
                Opcode::Funcall1 => out.push_str("FUNCALL_1"),
                Opcode::Funcall2 => out.push_str("FUNCALL_2"),
                Opcode::Funcall3 => out.push_str("FUNCALL_3"),
                Opcode::TailCall => {
                    let _ = write!(out, "TAIL_CALL({})", buf_u8(data, i + 1));
                }
                Opcode::TailCall1 => out.push_str("TAIL_CALL_1"),
                Opcode::TailCall2 => out.push_str("TAIL_CALL_2"),
                Opcode::TailCall3 => out.push_str("TAIL_CALL_3"),
                Opcode::LexicalFramePush => out.push_str("LEXICAL_FRAME_PUSH"),
                Opcode::LexicalFramePop => out.push_str("LEXICAL_FRAME_POP"),
                Opcode::LexicalDef => {
                    let name = self.symbol_from_offset(buf_u16(data, i + 1));
                    let _ = write!(out, "LEXICAL_DEF({name})");
                }
                Opcode::LexicalDefRelocatable => {
                    let _ = write!(out, "LEXICAL_DEF_RELOCATABLE({})", buf_i16(data, i + 1));
                }
                Opcode::LexicalVarLoad => out.push_str("LEXICAL_VAR_LOAD"),
                Opcode::EarlyRet => out.push_str("EARLY_RET"),
                Opcode::Ret => {
                    out.push_str("RET");
                    if depth == 0 {
                        out.push_str("\r\n");
                        return out;
                    }
                    depth -= 1;
                }
            }

            out.push_str("\r\n");

            let bytes = data.data.borrow();
            i += op.instruction_len(&bytes[..], i);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;
    use crate::value::TypeTag;

    fn test_interp() -> Interp {
        Interp::new(Box::new(StdPlatform))
    }

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0..=43u8 {
            let op = Opcode::from_u8(byte).unwrap();
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Opcode::from_u8(200), None);
        assert_eq!(Opcode::from_u8(0), Some(Opcode::Fatal));
    }

    #[test]
    fn test_instruction_lengths() {
        let code = [Opcode::PushString as u8, 3, b'h', b'i', 0];
        assert_eq!(Opcode::PushString.instruction_len(&code, 0), 5);
        assert_eq!(Opcode::PushInteger.instruction_len(&code, 0), 5);
        assert_eq!(Opcode::Jump.instruction_len(&code, 0), 3);
        assert_eq!(Opcode::Funcall.instruction_len(&code, 0), 2);
        assert_eq!(Opcode::Ret.instruction_len(&code, 0), 1);
    }

    /// Assemble a module blob from symbol names and raw instructions.
    fn blob(symbols: &[&str], code: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(symbols.len() as u16).to_le_bytes());
        out.extend_from_slice(&(code.len() as u16).to_le_bytes());
        for name in symbols {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out.extend_from_slice(code);
        out
    }

    #[test]
    fn test_load_module_resolves_relocatables() {
        let mut interp = test_interp();
        // (+ 1 2) as relocatable bytecode: push 1, push 2, load "+",
        // call with 2 args, return.
        let code = [
            Opcode::Push1 as u8,
            Opcode::Push2 as u8,
            Opcode::LoadVarRelocatable as u8,
            0,
            0,
            Opcode::Funcall2 as u8,
            Opcode::Ret as u8,
        ];
        let module = blob(&["+"], &code);
        let function = interp.load_module(&module).unwrap();
        assert_eq!(interp.type_of(function), TypeTag::Function);

        interp.funcall(function, 0);
        let result = interp.pop_op();
        assert_eq!(interp.integer_value(result), 3);
        interp.pop_op(); // the loaded function
    }

    #[test]
    fn test_load_module_push_symbol_relocatable() {
        let mut interp = test_interp();
        let code = [
            Opcode::PushSymbolRelocatable as u8,
            0,
            0,
            Opcode::Ret as u8,
        ];
        let module = blob(&["banana"], &code);
        let function = interp.load_module(&module).unwrap();
        interp.funcall(function, 0);
        let result = interp.pop_op();
        assert_eq!(interp.symbol_name(result), "banana");
        interp.pop_op();
    }

    #[test]
    fn test_load_module_rejects_bad_blobs() {
        let mut interp = test_interp();
        assert_eq!(
            interp.load_module(&[1, 0]),
            Err(ModuleError::TruncatedHeader)
        );

        // Header promises a symbol that is not there.
        assert_eq!(
            interp.load_module(&[1, 0, 0, 0]),
            Err(ModuleError::TruncatedSymbolTable)
        );

        // Relocatable operand indexes past the symbol table.
        let code = [
            Opcode::LoadVarRelocatable as u8,
            9,
            0,
            Opcode::Ret as u8,
        ];
        let module = blob(&["+"], &code);
        assert_eq!(
            interp.load_module(&module),
            Err(ModuleError::BadSymbolIndex(9))
        );
    }
}
