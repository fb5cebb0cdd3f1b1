//! Tree-walking evaluator.
//!
//! Special forms are matched by symbol name at the head of a list:
//! `if`, `lambda`, `'`, `` ` ``, `let`, and `macro`. Every other list is
//! a call: the head evaluates to a function, arguments evaluate left to
//! right onto the operand stack, and `funcall` consumes them. Symbols
//! resolve through variable lookup; all other atoms evaluate to
//! themselves.
//!
//! Results travel on the operand stack: `eval` always leaves exactly
//! one value pushed. When a call returns an error with no context, the
//! source expression is attached as its context.

use crate::interp::{Interp, ListBuilder};
use crate::value::{CellValue, ErrorCode, TypeTag, ValueRef};

impl Interp {
    fn symbol_is(&self, value: ValueRef, name: &str) -> bool {
        match self.cell(value).value {
            CellValue::Symbol(r) => self.interns.name(r) == name,
            _ => false,
        }
    }

    /// Evaluate `code`, pushing the result onto the operand stack.
    pub fn eval(&mut self, code: ValueRef) {
        self.interp_entry_count += 1;

        // Keep the expression rooted while we work on it.
        self.push_op(code);

        match self.type_of(code) {
            TypeTag::Symbol => {
                self.pop_op();
                let value = self.get_var(code);
                self.push_op(value);
            }
            TypeTag::Cons => {
                let form = self.car(code);

                if self.symbol_is(form, "if") {
                    let rest = self.cdr(code);
                    self.eval_if(rest);
                    let result = self.pop_op();
                    self.pop_op(); // code
                    self.push_op(result);
                } else if self.symbol_is(form, "lambda") {
                    let rest = self.cdr(code);
                    self.eval_lambda(rest);
                    let result = self.pop_op();
                    self.pop_op(); // code
                    self.push_op(result);
                } else if self.symbol_is(form, "'") {
                    self.pop_op(); // code
                    let quoted = self.cdr(code);
                    self.push_op(quoted);
                } else if self.symbol_is(form, "`") {
                    let rest = self.cdr(code);
                    self.eval_quasiquote(rest);
                    let result = self.pop_op();
                    self.pop_op(); // code
                    self.push_op(result);
                } else if self.symbol_is(form, "let") {
                    let rest = self.cdr(code);
                    self.eval_let(rest);
                    let result = self.pop_op();
                    self.pop_op(); // code
                    self.push_op(result);
                } else if self.symbol_is(form, "macro") {
                    let rest = self.cdr(code);
                    self.eval_macro(rest);
                    let result = self.pop_op();
                    self.pop_op(); // code
                    self.push_op(result);
                } else {
                    self.eval_application(code);
                }
            }
            _ => {
                // Any other atom evaluates to itself; it is already on
                // the stack.
            }
        }

        self.interp_entry_count -= 1;
    }

    fn eval_application(&mut self, code: ValueRef) {
        let callee = self.car(code);
        self.eval(callee);
        // The function stays on the stack, rooted, while arguments
        // evaluate above it.
        let function = self.get_op0();

        let mut argc: u8 = 0;
        let mut arg_list = self.cdr(code);
        loop {
            if arg_list == self.nil {
                break;
            }
            if self.type_of(arg_list) != TypeTag::Cons {
                for _ in 0..argc {
                    self.pop_op();
                }
                self.pop_op(); // function
                self.pop_op(); // code
                let err = self.make_error(ErrorCode::ValueNotCallable, arg_list);
                self.push_op(err);
                return;
            }
            let arg = self.car(arg_list);
            self.eval(arg);
            argc = argc.saturating_add(1);
            arg_list = self.cdr(arg_list);
        }

        self.funcall(function, argc);
        let result = self.get_op0();

        // Give context-free errors the source expression as context.
        // The permanent out-of-memory cell is left untouched.
        if result != self.oom && self.is_error(result) && self.error_context(result) == self.nil {
            let nil = self.nil;
            if let CellValue::Error { context, .. } = &mut self.cell_mut(result).value {
                if *context == nil {
                    *context = code;
                }
            }
        }

        self.pop_op(); // result
        self.pop_op(); // function
        self.pop_op(); // code
        self.push_op(result);
    }

    pub(crate) fn eval_if(&mut self, code: ValueRef) {
        if self.type_of(code) != TypeTag::Cons {
            let err = self.make_error(ErrorCode::MismatchedParens, self.nil);
            self.push_op(err);
            return;
        }

        let cond = self.car(code);
        let mut true_branch = self.nil;
        let mut false_branch = self.nil;

        let rest = self.cdr(code);
        if self.type_of(rest) == TypeTag::Cons {
            true_branch = self.car(rest);
            let rest = self.cdr(rest);
            if self.type_of(rest) == TypeTag::Cons {
                false_branch = self.car(rest);
            }
        }

        self.eval(cond);
        let taken = if self.is_truthy(self.get_op0()) {
            true_branch
        } else {
            false_branch
        };
        self.eval(taken);

        let result = self.pop_op();
        self.pop_op(); // condition value
        self.push_op(result);
    }

    pub(crate) fn eval_lambda(&mut self, code: ValueRef) {
        let function = self.make_source_function(code);
        self.push_op(function);
    }

    /// `let`: evaluate each binding value, bind the symbols in a fresh
    /// frame, run the body in order, return the last value.
    pub(crate) fn eval_let(&mut self, code: ValueRef) {
        if self.type_of(code) != TypeTag::Cons {
            let err = self.make_error(ErrorCode::MismatchedParens, self.nil);
            self.push_op(err);
            return;
        }

        let bindings = self.car(code);

        let mut builder = ListBuilder::new(self);
        let mut malformed = false;
        let mut current = bindings;
        while current != self.nil {
            if self.type_of(current) != TypeTag::Cons {
                malformed = true;
                break;
            }
            let binding = self.car(current);
            let sym = self.car(binding);
            let bind = self.cdr(binding);
            if self.type_of(binding) == TypeTag::Cons
                && self.type_of(sym) == TypeTag::Symbol
                && self.type_of(bind) == TypeTag::Cons
            {
                let value_expr = self.car(bind);
                self.eval(value_expr);
                let value = self.pop_op();
                let kvp = self.make_cons(sym, value);
                builder.push_back(self, kvp);
            } else {
                malformed = true;
                break;
            }
            current = self.cdr(current);
        }

        let frame = builder.result(self);
        if malformed {
            let err = self.make_error(ErrorCode::MismatchedParens, self.nil);
            self.push_op(err);
            return;
        }

        self.push_op(frame);
        let new_binding_list = self.make_cons(frame, self.lexical_bindings);
        self.pop_op();
        if self.is_error(new_binding_list) {
            self.push_op(new_binding_list);
            return;
        }
        self.lexical_bindings = new_binding_list;

        self.gc_protect(self.nil);
        let result_slot = self.protected.len() - 1;

        let mut body = self.cdr(code);
        while body != self.nil && self.type_of(body) == TypeTag::Cons {
            let expr = self.car(body);
            self.eval(expr);
            let value = self.pop_op();
            self.protected[result_slot] = value;
            body = self.cdr(body);
        }

        let result = self.protected[result_slot];
        self.gc_unprotect();

        self.lexical_frame_pop();
        self.push_op(result);
    }

    /// Quasiquote: rebuild the list, evaluating `,`-prefixed elements
    /// and splicing `,@`-prefixed ones.
    pub(crate) fn eval_quasiquote(&mut self, code: ValueRef) {
        if code != self.nil && self.type_of(code) != TypeTag::Cons {
            self.push_op(code);
            return;
        }

        let mut builder = ListBuilder::new(self);
        let mut current = code;

        while current != self.nil && self.type_of(current) == TypeTag::Cons {
            let head = self.car(current);

            if self.symbol_is(head, ",") {
                current = self.cdr(current);
                if current == self.nil {
                    let _ = builder.result(self);
                    let msg = self.make_string("extraneous unquote");
                    let err = self.make_error(ErrorCode::InvalidSyntax, msg);
                    self.push_op(err);
                    return;
                }

                if self.symbol_is(self.car(current), "@") {
                    // Unquote-splicing: evaluate and splice the result
                    // into the surrounding list.
                    current = self.cdr(current);
                    let expr = self.car(current);
                    self.eval(expr);
                    let result = self.get_op0();
                    if self.is_list(result) {
                        let mut item = result;
                        while item != self.nil {
                            let element = self.car(item);
                            builder.push_back(self, element);
                            item = self.cdr(item);
                        }
                    } else {
                        builder.push_back(self, result);
                    }
                    self.pop_op();
                } else {
                    let expr = self.car(current);
                    self.eval(expr);
                    let result = self.pop_op();
                    builder.push_back(self, result);
                }
            } else if self.is_list(head) && head != self.nil {
                // Expand unquotes in nested lists.
                self.eval_quasiquote(head);
                let result = self.pop_op();
                builder.push_back(self, result);
            } else {
                builder.push_back(self, head);
            }

            current = self.cdr(current);
        }

        let result = builder.result(self);
        self.push_op(result);
    }

    pub(crate) fn eval_macro(&mut self, code: ValueRef) {
        if self.type_of(self.car(code)) == TypeTag::Symbol {
            self.macros = self.make_cons(code, self.macros);
            self.push_op(self.nil);
        } else {
            self.platform.fatal("invalid macro format");
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

    fn run(interp: &mut Interp, code: &str) -> String {
        let v = interp.dostring(code, &mut |_, _| {});
        interp.format(v)
    }

    #[test]
    fn test_self_evaluating_atoms() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "42"), "42");
        assert_eq!(run(&mut interp, "\"text\""), "\"text\"");
    }

    #[test]
    fn test_arithmetic() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "(+ 1 2 3)"), "6");
        assert_eq!(run(&mut interp, "(- 10 4)"), "6");
        assert_eq!(run(&mut interp, "(* 2 3 4)"), "24");
        assert_eq!(run(&mut interp, "(/ 9 3)"), "3");
    }

    #[test]
    fn test_if_branches() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "(if 1 'yes 'no)"), "yes");
        assert_eq!(run(&mut interp, "(if 0 'yes 'no)"), "no");
        assert_eq!(run(&mut interp, "(if nil 'yes 'no)"), "no");
        // Missing else branch yields nil.
        assert_eq!(run(&mut interp, "(if 0 'yes)"), "'()");
    }

    #[test]
    fn test_quote_returns_unevaluated() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "'(1 2 3)"), "'(1 2 3)");
        assert_eq!(run(&mut interp, "'frobnicate"), "frobnicate");
    }

    #[test]
    fn test_let_binds_and_unbinds() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "(let ((a 2) (b 3)) (* a b))"), "6");
        // After the let returns, the names are gone.
        let leaked = run(&mut interp, "a");
        assert!(leaked.contains("undefined-variable-access"));
    }

    #[test]
    fn test_let_body_runs_in_order() {
        let mut interp = test_interp();
        assert_eq!(
            run(&mut interp, "(let ((x 1)) (set 'seen x) (+ x 10))"),
            "11"
        );
        assert_eq!(run(&mut interp, "seen"), "1");
    }

    #[test]
    fn test_lambda_positional_args() {
        let mut interp = test_interp();
        assert_eq!(run(&mut interp, "((lambda (+ $0 $1)) 4 5)"), "9");
        assert_eq!(run(&mut interp, "((lambda $V) 1 2 3)"), "'(1 2 3)");
        assert_eq!(run(&mut interp, "((lambda (argc)) 9 9 9 9)"), "4");
    }

    #[test]
    fn test_lambda_captures_lexical_scope() {
        let mut interp = test_interp();
        assert_eq!(
            run(
                &mut interp,
                "(set 'adder (let ((n 10)) (lambda (+ n $0)))) (adder 5)"
            ),
            "15"
        );
    }

    #[test]
    fn test_quasiquote_unquote_splice() {
        let mut interp = test_interp();
        assert_eq!(
            run(&mut interp, "`(1 ,(+ 1 1) ,@(list 3 4) 5)"),
            "'(1 2 3 4 5)"
        );
        assert_eq!(run(&mut interp, "`(1 2 3)"), "'(1 2 3)");
        assert_eq!(run(&mut interp, "`(1 (2 ,(+ 1 2)))"), "'(1 (2 3))");
    }

    #[test]
    fn test_extraneous_unquote_is_an_error() {
        let mut interp = test_interp();
        let result = run(&mut interp, "`(1 ,)");
        assert!(result.contains("invalid-syntax"));
    }

    #[test]
    fn test_call_errors_gain_context() {
        let mut interp = test_interp();
        let v = interp.dostring("(car 5)", &mut |_, _| {});
        assert!(interp.is_error(v));
        // The offending value is carried as context.
        let text = interp.format(v);
        assert!(text.contains("invalid-argument-type"));
    }

    #[test]
    fn test_calling_a_non_function() {
        let mut interp = test_interp();
        let result = run(&mut interp, "(1 2 3)");
        assert!(result.contains("value-not-callable"));
    }

    #[test]
    fn test_nested_eval_entry_counting() {
        let mut interp = test_interp();
        assert!(!interp.is_executing());
        assert_eq!(run(&mut interp, "(eval '(+ 2 3))"), "5");
        assert!(!interp.is_executing());
    }
}
