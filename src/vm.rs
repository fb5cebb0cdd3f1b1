//! Bytecode interpreter.
//!
//! A stack machine sharing the operand stack with the evaluator. The
//! program counter is an offset into a scratch data buffer; jump
//! operands are measured from the executing function's start offset.
//!
//! Tail calls: when a `tail-call` opcode's callee is the currently
//! executing function with a matching argument count, the arguments are
//! rebound in place, any lexical frames opened inside this activation
//! are unwound, and the program counter resets to the function start.
//! The arguments are repushed in reverse of the popped order so
//! positional indexing stays stable. A self tail call with a different
//! argument count is an `invalid-argc` error. Any other callee goes
//! through the ordinary call path.

use smallvec::SmallVec;

use crate::bytecode::{buf_i16, buf_i32, buf_u16, buf_u8, Opcode};
use crate::interns::InternRef;
use crate::interp::Interp;
use crate::platform::SCRATCH_BUFFER_SIZE;
use crate::value::{CellValue, ErrorCode, TypeTag, ValueRef};

impl Interp {
    /// Run bytecode from `code_buffer` starting at `start_offset`,
    /// leaving the result on the operand stack.
    pub fn vm_execute(&mut self, code_buffer: ValueRef, start_offset: usize) {
        let data = match &self.cell(code_buffer).value {
            CellValue::DataBuffer(handle) => handle.clone(),
            _ => {
                self.push_op(self.nil);
                return;
            }
        };

        let mut pc = start_offset;
        // Frames opened since entering this function; a successful tail
        // call must unwind them before restarting.
        let mut nested_scope: u32 = 0;

        'top: loop {
            if pc >= SCRATCH_BUFFER_SIZE {
                self.platform.fatal("bytecode ran past its buffer");
            }

            let op = match Opcode::from_u8(buf_u8(&data, pc)) {
                Some(op) => op,
                None => self.platform.fatal("invalid instruction"),
            };

            match op {
                Opcode::Fatal
                | Opcode::LoadVarRelocatable
                | Opcode::PushSymbolRelocatable
                | Opcode::LexicalDefRelocatable => {
                    self.platform.fatal("invalid instruction");
                }

                Opcode::Jump => {
                    let offset = buf_u16(&data, pc + 1);
                    pc = start_offset + offset as usize;
                }

                Opcode::SmallJump => {
                    let offset = buf_u8(&data, pc + 1);
                    pc = start_offset + offset as usize;
                }

                Opcode::JumpIfFalse => {
                    let offset = buf_u16(&data, pc + 1);
                    pc += 3;
                    if !self.is_truthy(self.get_op0()) {
                        pc = start_offset + offset as usize;
                    }
                    self.pop_op();
                }

                Opcode::SmallJumpIfFalse => {
                    let offset = buf_u8(&data, pc + 1);
                    pc += 2;
                    if !self.is_truthy(self.get_op0()) {
                        pc = start_offset + offset as usize;
                    }
                    self.pop_op();
                }

                Opcode::LoadVar => {
                    let offset = buf_i16(&data, pc + 1) as u16;
                    pc += 3;
                    let symbol = self.make_symbol_interned(InternRef(offset));
                    self.gc_protect(symbol);
                    let value = self.get_var(symbol);
                    self.gc_unprotect();
                    self.push_op(value);
                }

                Opcode::LexicalVarLoad => {
                    pc += 1;
                    let symbol = self.pop_op();
                    self.gc_protect(symbol);
                    let value = self.get_var(symbol);
                    self.gc_unprotect();
                    self.push_op(value);
                }

                Opcode::Dup => {
                    pc += 1;
                    self.push_op(self.get_op0());
                }

                Opcode::Not => {
                    pc += 1;
                    let input = self.pop_op();
                    let value = i32::from(!self.is_truthy(input));
                    let result = self.make_integer(value);
                    self.push_op(result);
                }

                Opcode::PushNil => {
                    pc += 1;
                    self.push_op(self.nil);
                }

                Opcode::PushInteger => {
                    let value = buf_i32(&data, pc + 1);
                    pc += 5;
                    let result = self.make_integer(value);
                    self.push_op(result);
                }

                Opcode::Push0 => {
                    pc += 1;
                    let result = self.make_integer(0);
                    self.push_op(result);
                }

                Opcode::Push1 => {
                    pc += 1;
                    let result = self.make_integer(1);
                    self.push_op(result);
                }

                Opcode::Push2 => {
                    pc += 1;
                    let result = self.make_integer(2);
                    self.push_op(result);
                }

                Opcode::PushSmallInteger => {
                    let value = buf_u8(&data, pc + 1);
                    pc += 2;
                    let result = self.make_integer(i32::from(value));
                    self.push_op(result);
                }

                Opcode::PushSymbol => {
                    let offset = buf_i16(&data, pc + 1) as u16;
                    pc += 3;
                    let symbol = self.make_symbol_interned(InternRef(offset));
                    self.push_op(symbol);
                }

                Opcode::PushString => {
                    let len = buf_u8(&data, pc + 1) as usize;
                    pc += 2;
                    let text = {
                        let bytes = data.data.borrow();
                        let chunk =
                            &bytes[pc.min(SCRATCH_BUFFER_SIZE)..(pc + len).min(SCRATCH_BUFFER_SIZE)];
                        let end = chunk.iter().position(|&b| b == 0).unwrap_or(chunk.len());
                        String::from_utf8_lossy(&chunk[..end]).into_owned()
                    };
                    let result = self.make_string(&text);
                    self.push_op(result);
                    pc += len;
                }

                Opcode::PushThis => {
                    pc += 1;
                    self.push_op(self.get_this());
                }

                Opcode::PushList => {
                    let count = buf_u8(&data, pc + 1) as u32;
                    pc += 2;
                    let list = self.make_list(count);
                    self.gc_protect(list);
                    for i in 0..count {
                        let value = self.get_op((count - 1 - i) as usize);
                        self.set_list(list, i, value);
                    }
                    for _ in 0..count {
                        self.pop_op();
                    }
                    self.gc_unprotect();
                    self.push_op(list);
                }

                Opcode::PushLambda => {
                    let lambda_end = buf_u16(&data, pc + 1);
                    pc += 3;
                    let offset = self.make_integer(pc as i32);
                    if self.type_of(offset) == TypeTag::Integer {
                        let bytecode = self.make_cons(offset, code_buffer);
                        if self.type_of(bytecode) == TypeTag::Cons {
                            let function = self.make_bytecode_function(bytecode);
                            self.push_op(function);
                        } else {
                            self.push_op(bytecode);
                        }
                    } else {
                        self.push_op(offset);
                    }
                    pc = start_offset + lambda_end as usize;
                }

                Opcode::Arg => {
                    pc += 1;
                    let index = self.pop_op();
                    let n = self.integer_value(index).max(0) as u16;
                    let value = self.get_arg(n);
                    self.push_op(value);
                }

                Opcode::Arg0 => {
                    pc += 1;
                    let value = self.get_arg(0);
                    self.push_op(value);
                }

                Opcode::Arg1 => {
                    pc += 1;
                    let value = self.get_arg(1);
                    self.push_op(value);
                }

                Opcode::Arg2 => {
                    pc += 1;
                    let value = self.get_arg(2);
                    self.push_op(value);
                }

                Opcode::MakePair => {
                    pc += 1;
                    let car = self.get_op1();
                    let cdr = self.get_op0();
                    let pair = self.make_cons(car, cdr);
                    self.pop_op();
                    self.pop_op();
                    self.push_op(pair);
                }

                Opcode::First => {
                    pc += 1;
                    let value = self.pop_op();
                    if self.type_of(value) == TypeTag::Cons {
                        let car = self.car(value);
                        self.push_op(car);
                    } else {
                        let err = self.make_error(ErrorCode::InvalidArgumentType, self.nil);
                        self.push_op(err);
                    }
                }

                Opcode::Rest => {
                    pc += 1;
                    let value = self.pop_op();
                    if self.type_of(value) == TypeTag::Cons {
                        let cdr = self.cdr(value);
                        self.push_op(cdr);
                    } else {
                        let err = self.make_error(ErrorCode::InvalidArgumentType, self.nil);
                        self.push_op(err);
                    }
                }

                Opcode::Pop => {
                    pc += 1;
                    self.pop_op();
                }

                Opcode::EarlyRet | Opcode::Ret => return,

                Opcode::LexicalDef => {
                    let offset = buf_i16(&data, pc + 1) as u16;
                    pc += 3;
                    let symbol = self.make_symbol_interned(InternRef(offset));
                    self.gc_protect(symbol);
                    let pair = self.make_cons(symbol, self.get_op0());
                    self.gc_unprotect();
                    self.pop_op(); // bound value
                    self.push_op(pair);
                    self.lexical_frame_store(pair);
                    self.pop_op();
                }

                Opcode::LexicalFramePush => {
                    pc += 1;
                    self.lexical_frame_push();
                    nested_scope += 1;
                }

                Opcode::LexicalFramePop => {
                    pc += 1;
                    self.lexical_frame_pop();
                    nested_scope = nested_scope.saturating_sub(1);
                }

                Opcode::Funcall
                | Opcode::Funcall1
                | Opcode::Funcall2
                | Opcode::Funcall3 => {
                    let argc = match op {
                        Opcode::Funcall => {
                            let argc = buf_u8(&data, pc + 1);
                            pc += 2;
                            argc
                        }
                        Opcode::Funcall1 => {
                            pc += 1;
                            1
                        }
                        Opcode::Funcall2 => {
                            pc += 1;
                            2
                        }
                        _ => {
                            pc += 1;
                            3
                        }
                    };
                    let function = self.get_op0();
                    self.gc_protect(function);
                    self.pop_op();
                    self.funcall(function, argc);
                    self.gc_unprotect();
                }

                Opcode::TailCall
                | Opcode::TailCall1
                | Opcode::TailCall2
                | Opcode::TailCall3 => {
                    let argc = match op {
                        Opcode::TailCall => {
                            let argc = buf_u8(&data, pc + 1);
                            pc += 2;
                            argc
                        }
                        Opcode::TailCall1 => {
                            pc += 1;
                            1
                        }
                        Opcode::TailCall2 => {
                            pc += 1;
                            2
                        }
                        _ => {
                            pc += 1;
                            3
                        }
                    };

                    let function = self.get_op0();
                    if function == self.get_this() {
                        if self.get_argc() != argc {
                            // A self tail call must match the current
                            // activation's arity.
                            self.pop_op(); // function
                            for _ in 0..argc {
                                self.pop_op();
                            }
                            let err = self.make_error(ErrorCode::InvalidArgc, function);
                            self.push_op(err);
                            return;
                        }

                        self.pop_op(); // function

                        // Rebind: collect the fresh arguments, drop them
                        // and the previous ones, and repush in reverse
                        // pop order.
                        let mut args: SmallVec<[ValueRef; 6]> = SmallVec::new();
                        for i in 0..argc {
                            args.push(self.get_op(i as usize));
                        }
                        for _ in 0..(2 * argc as usize) {
                            self.pop_op();
                        }
                        for &arg in args.iter().rev() {
                            self.push_op(arg);
                        }

                        while nested_scope > 0 {
                            self.lexical_frame_pop();
                            nested_scope -= 1;
                        }
                        pc = start_offset;
                        continue 'top;
                    }

                    self.gc_protect(function);
                    self.pop_op();
                    self.funcall(function, argc);
                    self.gc_unprotect();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    fn test_interp() -> Interp {
        Interp::new(Box::new(StdPlatform))
    }

    /// Hand-assemble a buffer into a bytecode function and call it.
    fn run_code(interp: &mut Interp, code: &[u8]) -> ValueRef {
        let buffer = interp.make_databuffer();
        interp.gc_protect(buffer);
        if let CellValue::DataBuffer(handle) = &interp.cell(buffer).value {
            let handle = handle.clone();
            handle.data.borrow_mut()[..code.len()].copy_from_slice(code);
        }
        let zero = interp.make_integer(0);
        interp.push_op(zero);
        let bytecode = interp.make_cons(zero, buffer);
        interp.push_op(bytecode);
        let function = interp.make_bytecode_function(bytecode);
        interp.pop_op();
        interp.pop_op();
        interp.gc_unprotect();

        interp.gc_protect(function);
        interp.funcall(function, 0);
        interp.gc_unprotect();
        interp.pop_op()
    }

    #[test]
    fn test_push_and_return() {
        let mut interp = test_interp();
        let result = run_code(
            &mut interp,
            &[Opcode::PushSmallInteger as u8, 77, Opcode::Ret as u8],
        );
        assert_eq!(interp.integer_value(result), 77);
    }

    #[test]
    fn test_integer_push_forms() {
        let mut interp = test_interp();
        let result = run_code(&mut interp, &[Opcode::Push2 as u8, Opcode::Ret as u8]);
        assert_eq!(interp.integer_value(result), 2);

        let bytes = (-70000i32).to_le_bytes();
        let result = run_code(
            &mut interp,
            &[
                Opcode::PushInteger as u8,
                bytes[0],
                bytes[1],
                bytes[2],
                bytes[3],
                Opcode::Ret as u8,
            ],
        );
        assert_eq!(interp.integer_value(result), -70000);
    }

    #[test]
    fn test_make_pair_first_rest() {
        let mut interp = test_interp();
        let result = run_code(
            &mut interp,
            &[
                Opcode::Push1 as u8,
                Opcode::Push2 as u8,
                Opcode::MakePair as u8,
                Opcode::Ret as u8,
            ],
        );
        assert_eq!(interp.format(result), "'(1 . 2)");

        let result = run_code(
            &mut interp,
            &[
                Opcode::Push1 as u8,
                Opcode::Push2 as u8,
                Opcode::MakePair as u8,
                Opcode::Rest as u8,
                Opcode::Ret as u8,
            ],
        );
        assert_eq!(interp.integer_value(result), 2);

        // First of a non-pair is a type error.
        let result = run_code(
            &mut interp,
            &[Opcode::Push1 as u8, Opcode::First as u8, Opcode::Ret as u8],
        );
        assert!(interp.is_error(result));
    }

    #[test]
    fn test_jump_if_false_skips() {
        let mut interp = test_interp();
        // if false: jump to the PUSH_SMALL_INTEGER(9) at offset 7.
        let code = [
            Opcode::Push0 as u8,         // 0
            Opcode::JumpIfFalse as u8,   // 1
            7,
            0,
            Opcode::PushSmallInteger as u8, // 4: skipped branch
            1,
            Opcode::Ret as u8,           // 6
            Opcode::PushSmallInteger as u8, // 7
            9,
            Opcode::Ret as u8,           // 9
        ];
        let result = run_code(&mut interp, &code);
        assert_eq!(interp.integer_value(result), 9);
    }

    #[test]
    fn test_push_list_orders_elements() {
        let mut interp = test_interp();
        let code = [
            Opcode::Push0 as u8,
            Opcode::Push1 as u8,
            Opcode::Push2 as u8,
            Opcode::PushList as u8,
            3,
            Opcode::Ret as u8,
        ];
        let result = run_code(&mut interp, &code);
        assert_eq!(interp.format(result), "'(0 1 2)");
    }

    #[test]
    fn test_push_string() {
        let mut interp = test_interp();
        let code = [
            Opcode::PushString as u8,
            4,
            b'f',
            b'r',
            b'o',
            0,
            Opcode::Ret as u8,
        ];
        let result = run_code(&mut interp, &code);
        assert_eq!(interp.string_value(result), "fro");
    }

    #[test]
    fn test_lexical_frames_in_bytecode() {
        let mut interp = test_interp();
        let offset = interp.intern("vmx").0;
        let [lo, hi] = offset.to_le_bytes();
        // (let ((vmx 5)) vmx)
        let code = [
            Opcode::LexicalFramePush as u8,
            Opcode::PushSmallInteger as u8,
            5,
            Opcode::LexicalDef as u8,
            lo,
            hi,
            Opcode::LoadVar as u8,
            lo,
            hi,
            Opcode::LexicalFramePop as u8,
            Opcode::Ret as u8,
        ];
        let result = run_code(&mut interp, &code);
        assert_eq!(interp.integer_value(result), 5);
        // The binding does not leak out of the call.
        let after = interp.get_var_by_name("vmx");
        assert!(interp.is_error(after));
    }
}
