//! Macro expansion.
//!
//! Macros are stored as a list of `(name params body)` entries, newest
//! first. Expansion is a pre-evaluation rewrite that runs as each list
//! is read: when a list's head names a macro, a `let` expression is
//! synthesized binding every macro parameter to the quoted corresponding
//! argument, and evaluated to produce the expansion.
//!
//! Macros are variadic in their last position: when more than one
//! argument remains at the final parameter, it binds the list of all of
//! them. A macro instantiated as `(foo (+ 1 2) 5 6)` against parameters
//! `(a b)` evaluates `(let ((a '(+ 1 2)) (b '(5 6))) body)`.

use crate::interp::{Interp, ListBuilder};
use crate::value::{ErrorCode, TypeTag};

impl Interp {
    /// Expand the list on top of the operand stack in place, if its
    /// head symbol names a macro. Applies recursively to the expansion.
    pub(crate) fn macroexpand(&mut self) {
        let lat = self.get_op0();
        if self.type_of(lat) != TypeTag::Cons {
            return;
        }
        let head = self.car(lat);
        let head_offset = match self.symbol_intern(head) {
            Some(r) => r,
            None => return,
        };

        let mut macros = self.macros;
        while macros != self.nil {
            let entry = self.car(macros); // (name params body)
            let entry_name = self.car(entry);

            if self.symbol_intern(entry_name) == Some(head_offset) {
                let supplied_args = self.cdr(lat);
                let macro_rest = self.cdr(entry); // (params body)
                let macro_params = self.car(macro_rest);

                if self.list_length(macro_params) > self.list_length(supplied_args) {
                    self.pop_op();
                    let msg = self.make_string("invalid arguments passed to macro");
                    let err = self.make_error(ErrorCode::InvalidSyntax, msg);
                    self.push_op(err);
                    return;
                }

                let quote = self.make_symbol("'");
                self.gc_protect(quote);

                // Build ((param (quote . arg)) ...); the last parameter
                // takes the whole remaining argument list when several
                // arguments remain.
                let mut bindings = ListBuilder::new(self);
                let mut params = macro_params;
                let mut args = supplied_args;
                while params != self.nil {
                    let last_param = self.cdr(params) == self.nil;
                    let bound = if last_param && self.cdr(args) != self.nil {
                        args
                    } else {
                        self.car(args)
                    };
                    let quoted = self.make_cons(quote, bound);
                    self.push_op(quoted);
                    let assoc_tail = self.make_cons(quoted, self.nil);
                    self.push_op(assoc_tail);
                    let param = self.car(params);
                    let assoc = self.make_cons(param, assoc_tail);
                    self.pop_op();
                    self.pop_op();
                    bindings.push_back(self, assoc);

                    params = self.cdr(params);
                    args = self.cdr(args);
                }

                // (bindings body): the shape eval_let consumes.
                let binding_list = bindings.result(self);
                self.push_op(binding_list);
                let body = self.car(self.cdr(macro_rest));
                let body_tail = self.make_cons(body, self.nil);
                self.push_op(body_tail);
                let synthetic_let = self.make_cons(binding_list, body_tail);
                self.pop_op();
                self.pop_op();
                self.push_op(synthetic_let);

                self.eval_let(synthetic_let);
                let result = self.pop_op(); // eval_let result
                self.pop_op(); // synthetic let
                self.pop_op(); // input list
                self.push_op(result);
                self.gc_unprotect(); // quote

                // The expansion may itself contain macro calls.
                self.macroexpand_macro();
                return;
            }

            macros = self.cdr(macros);
        }
    }

    /// Re-expand nested lists inside a fresh expansion, replacing the
    /// list on top of the operand stack.
    pub(crate) fn macroexpand_macro(&mut self) {
        let mut builder = ListBuilder::new(self);

        let mut lat = self.get_op0();
        while lat != self.nil && self.type_of(lat) == TypeTag::Cons {
            let item = self.car(lat);
            if self.is_list(item) && item != self.nil {
                self.push_op(item);
                self.macroexpand_macro();
                self.macroexpand();
                let expanded = self.pop_op();
                builder.push_back(self, expanded);
            } else {
                builder.push_back(self, item);
            }
            lat = self.cdr(lat);
        }

        self.pop_op(); // input
        let result = builder.result(self);
        self.push_op(result);
    }
}
