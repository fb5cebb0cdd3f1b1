//! Bytecode compiler.
//!
//! Walks a function body expression tree and emits a linear instruction
//! stream into a scratch data buffer. Jump operands are measured from
//! the owning function's start offset, so nested lambdas compile into
//! the same buffer with their own base.
//!
//! Calls in tail position emit the tail-call family, which the VM turns
//! into argument rebinding for self calls. A handful of primitives with
//! dedicated opcodes (`car`, `cdr`, `cons`, `not`, `arg`) compile to
//! those instead of full calls when the argument count matches.
//!
//! Compilation failures are ordinary error values: the caller gets an
//! `invalid-syntax` or `mismatched-parentheses` cell instead of a
//! function. Unquote-splicing inside compiled quasiquotes is rejected;
//! the tree-walking evaluator covers that form.

use crate::bytecode::Opcode;
use crate::interp::Interp;
use crate::platform::SCRATCH_BUFFER_SIZE;
use crate::value::{CellValue, ErrorCode, TypeTag, ValueRef};

fn emit(buf: &mut Vec<u8>, op: Opcode) {
    buf.push(op as u8);
}

fn emit_u8(buf: &mut Vec<u8>, op: Opcode, operand: u8) {
    buf.push(op as u8);
    buf.push(operand);
}

fn emit_u16(buf: &mut Vec<u8>, op: Opcode, operand: u16) {
    buf.push(op as u8);
    buf.extend_from_slice(&operand.to_le_bytes());
}

/// Emit an opcode with a u16 operand to be patched later; returns the
/// operand's buffer position.
fn emit_patch(buf: &mut Vec<u8>, op: Opcode) -> usize {
    buf.push(op as u8);
    let at = buf.len();
    buf.extend_from_slice(&[0, 0]);
    at
}

fn patch_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn emit_integer(buf: &mut Vec<u8>, value: i32) {
    match value {
        0 => emit(buf, Opcode::Push0),
        1 => emit(buf, Opcode::Push1),
        2 => emit(buf, Opcode::Push2),
        3..=255 => emit_u8(buf, Opcode::PushSmallInteger, value as u8),
        _ => {
            buf.push(Opcode::PushInteger as u8);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

impl Interp {
    /// Compile a function body expression list into a fresh bytecode
    /// function, leaving it (or an error value) on the operand stack.
    pub fn compile(&mut self, code: ValueRef) {
        let mut buf: Vec<u8> = Vec::new();
        if let Err(err) = self.compile_body(&mut buf, 0, code) {
            self.push_op(err);
            return;
        }
        if buf.len() > SCRATCH_BUFFER_SIZE {
            let err = self.make_error(ErrorCode::InvalidSyntax, self.nil);
            self.push_op(err);
            return;
        }

        let buffer = self.make_databuffer();
        if buffer == self.oom() {
            self.push_op(buffer);
            return;
        }
        self.gc_protect(buffer);
        if let CellValue::DataBuffer(handle) = &self.cell(buffer).value {
            let handle = handle.clone();
            handle.data.borrow_mut()[..buf.len()].copy_from_slice(&buf);
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
    }

    /// Compile an expression sequence ending in `ret`; all but the last
    /// result are popped, and the last expression is in tail position.
    fn compile_body(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        body: ValueRef,
    ) -> Result<(), ValueRef> {
        if body == self.nil {
            emit(buf, Opcode::PushNil);
            emit(buf, Opcode::Ret);
            return Ok(());
        }

        let mut current = body;
        while current != self.nil && self.type_of(current) == TypeTag::Cons {
            let expr = self.car(current);
            let next = self.cdr(current);
            let tail = next == self.nil || self.type_of(next) != TypeTag::Cons;
            self.compile_expr(buf, fn_start, expr, tail)?;
            if !tail {
                emit(buf, Opcode::Pop);
            }
            current = next;
        }

        emit(buf, Opcode::Ret);
        Ok(())
    }

    fn compile_expr(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        expr: ValueRef,
        tail: bool,
    ) -> Result<(), ValueRef> {
        match self.type_of(expr) {
            TypeTag::Nil => {
                emit(buf, Opcode::PushNil);
                Ok(())
            }
            TypeTag::Integer => {
                emit_integer(buf, self.integer_value(expr));
                Ok(())
            }
            TypeTag::Symbol => {
                match self.symbol_name(expr) {
                    "$0" => emit(buf, Opcode::Arg0),
                    "$1" => emit(buf, Opcode::Arg1),
                    "$2" => emit(buf, Opcode::Arg2),
                    _ => {
                        // Everything else, `$N`/`$V` included, resolves
                        // through variable lookup at run time.
                        if let Some(offset) = self.symbol_intern(expr) {
                            emit_u16(buf, Opcode::LoadVar, offset.0);
                        }
                    }
                }
                Ok(())
            }
            TypeTag::String => self.compile_string(buf, expr),
            TypeTag::Cons => {
                let head = self.car(expr);
                if self.symbol_is_name(head, "'") {
                    let quoted = self.cdr(expr);
                    self.compile_quoted(buf, quoted)
                } else if self.symbol_is_name(head, "`") {
                    let rest = self.cdr(expr);
                    self.compile_quasiquote(buf, fn_start, rest)
                } else if self.symbol_is_name(head, "if") {
                    let rest = self.cdr(expr);
                    self.compile_if(buf, fn_start, rest, tail)
                } else if self.symbol_is_name(head, "let") {
                    let rest = self.cdr(expr);
                    self.compile_let(buf, fn_start, rest, tail)
                } else if self.symbol_is_name(head, "lambda") {
                    let rest = self.cdr(expr);
                    self.compile_lambda(buf, fn_start, rest)
                } else if self.symbol_is_name(head, "macro") {
                    Err(self.compile_error(ErrorCode::InvalidSyntax, expr))
                } else {
                    self.compile_call(buf, fn_start, expr, tail)
                }
            }
            _ => Err(self.compile_error(ErrorCode::InvalidSyntax, expr)),
        }
    }

    fn symbol_is_name(&self, value: ValueRef, name: &str) -> bool {
        self.type_of(value) == TypeTag::Symbol && self.symbol_name(value) == name
    }

    fn compile_error(&mut self, code: ErrorCode, context: ValueRef) -> ValueRef {
        self.make_error(code, context)
    }

    fn compile_string(&mut self, buf: &mut Vec<u8>, expr: ValueRef) -> Result<(), ValueRef> {
        let text = self.string_value(expr);
        if text.len() + 1 > u8::MAX as usize {
            return Err(self.compile_error(ErrorCode::InvalidSyntax, expr));
        }
        emit_u8(buf, Opcode::PushString, (text.len() + 1) as u8);
        buf.extend_from_slice(text.as_bytes());
        buf.push(0);
        Ok(())
    }

    /// Constant data: symbols, integers, strings, and (possibly dotted)
    /// lists rebuild themselves at run time.
    fn compile_quoted(&mut self, buf: &mut Vec<u8>, value: ValueRef) -> Result<(), ValueRef> {
        match self.type_of(value) {
            TypeTag::Nil => {
                emit(buf, Opcode::PushNil);
                Ok(())
            }
            TypeTag::Integer => {
                emit_integer(buf, self.integer_value(value));
                Ok(())
            }
            TypeTag::Symbol => {
                if let Some(offset) = self.symbol_intern(value) {
                    emit_u16(buf, Opcode::PushSymbol, offset.0);
                }
                Ok(())
            }
            TypeTag::String => self.compile_string(buf, value),
            TypeTag::Cons => {
                if self.is_list(value) {
                    let len = self.list_length(value);
                    if len > u8::MAX as usize {
                        return Err(self.compile_error(ErrorCode::InvalidSyntax, value));
                    }
                    let mut current = value;
                    while current != self.nil {
                        let element = self.car(current);
                        self.compile_quoted(buf, element)?;
                        current = self.cdr(current);
                    }
                    emit_u8(buf, Opcode::PushList, len as u8);
                } else {
                    let car = self.car(value);
                    let cdr = self.cdr(value);
                    self.compile_quoted(buf, car)?;
                    self.compile_quoted(buf, cdr)?;
                    emit(buf, Opcode::MakePair);
                }
                Ok(())
            }
            _ => Err(self.compile_error(ErrorCode::InvalidSyntax, value)),
        }
    }

    fn compile_quasiquote(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        lat: ValueRef,
    ) -> Result<(), ValueRef> {
        let mut count: usize = 0;
        let mut current = lat;

        while current != self.nil && self.type_of(current) == TypeTag::Cons {
            let head = self.car(current);

            if self.symbol_is_name(head, ",") {
                current = self.cdr(current);
                if current == self.nil {
                    let msg = self.make_string("extraneous unquote");
                    return Err(self.compile_error(ErrorCode::InvalidSyntax, msg));
                }
                if self.symbol_is_name(self.car(current), "@") {
                    // Splice length is unknowable at compile time.
                    return Err(self.compile_error(ErrorCode::InvalidSyntax, lat));
                }
                let expr = self.car(current);
                self.compile_expr(buf, fn_start, expr, false)?;
            } else if self.is_list(head) && head != self.nil {
                self.compile_quasiquote(buf, fn_start, head)?;
            } else {
                self.compile_quoted(buf, head)?;
            }

            count += 1;
            if count > u8::MAX as usize {
                return Err(self.compile_error(ErrorCode::InvalidSyntax, lat));
            }
            current = self.cdr(current);
        }

        emit_u8(buf, Opcode::PushList, count as u8);
        Ok(())
    }

    fn compile_if(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        rest: ValueRef,
        tail: bool,
    ) -> Result<(), ValueRef> {
        if self.type_of(rest) != TypeTag::Cons {
            return Err(self.compile_error(ErrorCode::MismatchedParens, rest));
        }
        let cond = self.car(rest);
        let mut true_branch = self.nil;
        let mut false_branch = self.nil;
        let branches = self.cdr(rest);
        if self.type_of(branches) == TypeTag::Cons {
            true_branch = self.car(branches);
            let after = self.cdr(branches);
            if self.type_of(after) == TypeTag::Cons {
                false_branch = self.car(after);
            }
        }

        self.compile_expr(buf, fn_start, cond, false)?;
        let to_else = emit_patch(buf, Opcode::JumpIfFalse);
        self.compile_expr(buf, fn_start, true_branch, tail)?;
        let to_end = emit_patch(buf, Opcode::Jump);
        let else_offset = (buf.len() - fn_start) as u16;
        patch_u16(buf, to_else, else_offset);
        self.compile_expr(buf, fn_start, false_branch, tail)?;
        let end_offset = (buf.len() - fn_start) as u16;
        patch_u16(buf, to_end, end_offset);
        Ok(())
    }

    fn compile_let(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        rest: ValueRef,
        tail: bool,
    ) -> Result<(), ValueRef> {
        if self.type_of(rest) != TypeTag::Cons {
            return Err(self.compile_error(ErrorCode::MismatchedParens, rest));
        }

        emit(buf, Opcode::LexicalFramePush);

        let mut binding = self.car(rest);
        while binding != self.nil {
            if self.type_of(binding) != TypeTag::Cons {
                return Err(self.compile_error(ErrorCode::MismatchedParens, binding));
            }
            let pair = self.car(binding);
            let sym = self.car(pair);
            let value_list = self.cdr(pair);
            if self.type_of(pair) != TypeTag::Cons
                || self.type_of(sym) != TypeTag::Symbol
                || self.type_of(value_list) != TypeTag::Cons
            {
                return Err(self.compile_error(ErrorCode::MismatchedParens, pair));
            }
            let value_expr = self.car(value_list);
            self.compile_expr(buf, fn_start, value_expr, false)?;
            if let Some(offset) = self.symbol_intern(sym) {
                emit_u16(buf, Opcode::LexicalDef, offset.0);
            }
            binding = self.cdr(binding);
        }

        let body = self.cdr(rest);
        if body == self.nil {
            emit(buf, Opcode::PushNil);
        } else {
            let mut current = body;
            while current != self.nil && self.type_of(current) == TypeTag::Cons {
                let expr = self.car(current);
                let next = self.cdr(current);
                let last = next == self.nil || self.type_of(next) != TypeTag::Cons;
                self.compile_expr(buf, fn_start, expr, tail && last)?;
                if !last {
                    emit(buf, Opcode::Pop);
                }
                current = next;
            }
        }

        emit(buf, Opcode::LexicalFramePop);
        Ok(())
    }

    fn compile_lambda(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        body: ValueRef,
    ) -> Result<(), ValueRef> {
        let end_patch = emit_patch(buf, Opcode::PushLambda);
        // The nested function's jumps are measured from its own start.
        let inner_start = buf.len();
        self.compile_body(buf, inner_start, body)?;
        let end_offset = (buf.len() - fn_start) as u16;
        patch_u16(buf, end_patch, end_offset);
        Ok(())
    }

    fn compile_call(
        &mut self,
        buf: &mut Vec<u8>,
        fn_start: usize,
        expr: ValueRef,
        tail: bool,
    ) -> Result<(), ValueRef> {
        let callee = self.car(expr);

        let mut argc: usize = 0;
        let mut arg = self.cdr(expr);
        while arg != self.nil {
            if self.type_of(arg) != TypeTag::Cons {
                return Err(self.compile_error(ErrorCode::InvalidSyntax, expr));
            }
            let arg_expr = self.car(arg);
            self.compile_expr(buf, fn_start, arg_expr, false)?;
            argc += 1;
            if argc > u8::MAX as usize {
                return Err(self.compile_error(ErrorCode::InvalidSyntax, expr));
            }
            arg = self.cdr(arg);
        }

        // Primitives with their own opcodes.
        if self.type_of(callee) == TypeTag::Symbol {
            let specialized = match (self.symbol_name(callee), argc) {
                ("car", 1) => Some(Opcode::First),
                ("cdr", 1) => Some(Opcode::Rest),
                ("cons", 2) => Some(Opcode::MakePair),
                ("not", 1) => Some(Opcode::Not),
                ("arg", 1) => Some(Opcode::Arg),
                _ => None,
            };
            if let Some(op) = specialized {
                emit(buf, op);
                return Ok(());
            }
        }

        // `(this)` as the callee pushes the executing function
        // directly, which is what makes self tail calls recognizable.
        let callee_is_this = self.type_of(callee) == TypeTag::Cons
            && self.symbol_is_name(self.car(callee), "this")
            && self.cdr(callee) == self.nil;
        if callee_is_this {
            emit(buf, Opcode::PushThis);
        } else {
            self.compile_expr(buf, fn_start, callee, false)?;
        }

        let argc = argc as u8;
        match (tail, argc) {
            (true, 1) => emit(buf, Opcode::TailCall1),
            (true, 2) => emit(buf, Opcode::TailCall2),
            (true, 3) => emit(buf, Opcode::TailCall3),
            (true, n) => emit_u8(buf, Opcode::TailCall, n),
            (false, 1) => emit(buf, Opcode::Funcall1),
            (false, 2) => emit(buf, Opcode::Funcall2),
            (false, 3) => emit(buf, Opcode::Funcall3),
            (false, n) => emit_u8(buf, Opcode::Funcall, n),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::StdPlatform;

    fn test_interp() -> Interp {
        Interp::new(Box::new(StdPlatform))
    }

    fn run(interp: &mut Interp, code: &str) -> String {
        let v = interp.dostring(code, &mut |_, _| {});
        interp.format(v)
    }

    #[test]
    fn test_compiled_arithmetic() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'f (compile (lambda (+ $0 $1)))) (f 2 3)"
            ),
            "5"
        );
    }

    #[test]
    fn test_compiled_branches() {
        let mut interp = test_interp();
        run(
            &mut interp,
            "(set 'g (compile (lambda (if $0 'yes 'no))))",
        );
        assert_eq!(run(&mut interp, "(g 1)"), "yes");
        assert_eq!(run(&mut interp, "(g 0)"), "no");
        assert_eq!(run(&mut interp, "(g nil)"), "no");
    }

    #[test]
    fn test_compiled_let() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'h (compile (lambda (let ((a $0) (b 3)) (* a b))))) (h 7)"
            ),
            "21"
        );
    }

    #[test]
    fn test_compiled_quoted_data() {
        let mut interp = test_interp();
        assert_eq!(
            run(&mut interp, "(set 'q (compile (lambda '(1 two \"three\")))) (q)"),
            "'(1 two \"three\")"
        );
        assert_eq!(
            run(&mut interp, "(set 'p (compile (lambda '(1 . 2)))) (p)"),
            "'(1 . 2)"
        );
    }

    #[test]
    fn test_compiled_quasiquote() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'qq (compile (lambda `(1 ,(+ 1 1) 3)))) (qq)"
            ),
            "'(1 2 3)"
        );
        // Splicing is not compilable; it reports invalid syntax.
        let result = run(&mut interp, "(compile (lambda `(,@(list 1 2))))");
        assert!(result.contains("invalid-syntax"));
    }

    #[test]
    fn test_compiled_nested_lambda() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'mk (compile (lambda (lambda (+ $0 1))))) ((mk) 9)"
            ),
            "10"
        );
    }

    #[test]
    fn test_compiled_strings_and_bodies() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 's (compile (lambda 1 2 \"last\"))) (s)"
            ),
            "\"last\""
        );
    }

    #[test]
    fn test_compile_passes_through_bytecode_functions() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'f (compile (lambda 42))) (set 'f2 (compile f)) (f2)"
            ),
            "42"
        );
    }

    #[test]
    fn test_compiled_tail_recursion_runs_deep() {
        let mut interp = test_interp();
        run(
            &mut interp,
            "(set 'count-down
               (compile (lambda
                 (if (equal $0 0) 'done (count-down (- $0 1))))))",
        );
        // Large enough that non-eliminated recursion would exhaust the
        // host stack.
        assert_eq!(run(&mut interp, "(count-down 100000)"), "done");
    }

    #[test]
    fn test_compiled_tail_recursion_two_args() {
        let mut interp = test_interp();
        run(
            &mut interp,
            "(set 'sum-to
               (compile (lambda
                 (if (equal $0 0) $1 (sum-to (- $0 1) (+ $1 $0))))))",
        );
        assert_eq!(run(&mut interp, "(sum-to 1000 0)"), "500500");
    }

    #[test]
    fn test_tail_call_inside_let_unwinds_scopes() {
        let mut interp = test_interp();
        run(
            &mut interp,
            "(set 'spin
               (compile (lambda
                 (let ((n $0))
                   (if (equal n 0) 'ok (spin (- n 1)))))))",
        );
        assert_eq!(run(&mut interp, "(spin 5000)"), "ok");
    }
}
