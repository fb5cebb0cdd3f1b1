//! Native primitive registry.
//!
//! Every primitive is a plain function taking the interpreter and an
//! argument count; arguments are read off the operand stack by
//! positional offset (offset 0 is the last argument) and the returned
//! value replaces them. Arity and type violations return `invalid-argc`
//! and `invalid-argument-type` error values.

use smallvec::SmallVec;

use crate::interp::{FunctionView, Interp, ListBuilder};
use crate::value::{CellValue, ErrorCode, NativeFn, TypeTag, ValueRef};

macro_rules! expect_argc {
    ($interp:expr, $argc:expr, $expected:expr) => {
        if $argc != $expected {
            let nil = $interp.nil();
            return $interp.make_error(ErrorCode::InvalidArgc, nil);
        }
    };
}

macro_rules! expect_op {
    ($interp:expr, $offset:expr, $tag:ident) => {
        if $interp.type_of($interp.get_op($offset)) != TypeTag::$tag {
            let context = $interp.get_op($offset);
            return $interp.make_error(ErrorCode::InvalidArgumentType, context);
        }
    };
}

impl Interp {
    /// Deep equality: structural over pairs, by content for integers,
    /// symbols and strings, by identity for everything else.
    pub fn structural_equal(&self, a: ValueRef, b: ValueRef) -> bool {
        if self.type_of(a) != self.type_of(b) {
            return false;
        }
        match self.type_of(a) {
            TypeTag::Integer => self.integer_value(a) == self.integer_value(b),
            TypeTag::Cons => {
                self.structural_equal(self.car(a), self.car(b))
                    && self.structural_equal(self.cdr(a), self.cdr(b))
            }
            TypeTag::Symbol => self.symbol_intern(a) == self.symbol_intern(b),
            TypeTag::String => self.string_value(a) == self.string_value(b),
            TypeTag::UserData => match (&self.cell(a).value, &self.cell(b).value) {
                (CellValue::UserData(x), CellValue::UserData(y)) => x == y,
                _ => false,
            },
            TypeTag::Error => false,
            _ => a == b,
        }
    }
}

fn builtin_set(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Symbol);
    let symbol = interp.get_op1();
    let value = interp.get_op0();
    interp.set_var(symbol, value);
    interp.nil()
}

fn builtin_cons(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    let car = interp.get_op1();
    let cdr = interp.get_op0();
    if interp.is_error(car) {
        return car;
    }
    if interp.is_error(cdr) {
        return cdr;
    }
    interp.make_cons(car, cdr)
}

fn builtin_car(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Cons);
    interp.car(interp.get_op0())
}

fn builtin_cdr(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Cons);
    interp.cdr(interp.get_op0())
}

fn builtin_list(interp: &mut Interp, argc: u8) -> ValueRef {
    let list = interp.make_list(u32::from(argc));
    for i in 0..u32::from(argc) {
        let value = interp.get_op((u32::from(argc) - 1 - i) as usize);
        if interp.is_error(value) {
            return value;
        }
        interp.set_list(list, i, value);
    }
    list
}

fn builtin_arg(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Integer);
    let n = interp.integer_value(interp.get_op0()).max(0) as u16;
    interp.get_arg(n)
}

fn builtin_progn(interp: &mut Interp, _argc: u8) -> ValueRef {
    // Arguments were all evaluated on the way in; the last one is the
    // result.
    interp.get_op0()
}

fn builtin_any_true(interp: &mut Interp, argc: u8) -> ValueRef {
    for i in 0..argc as usize {
        let value = interp.get_op(i);
        if interp.is_truthy(value) {
            return value;
        }
    }
    interp.nil()
}

fn builtin_all_true(interp: &mut Interp, argc: u8) -> ValueRef {
    for i in 0..argc as usize {
        if !interp.is_truthy(interp.get_op(i)) {
            return interp.nil();
        }
    }
    interp.make_integer(1)
}

fn builtin_not(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    let value = i32::from(!interp.is_truthy(interp.get_op0()));
    interp.make_integer(value)
}

fn builtin_equal(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    let result = interp.structural_equal(interp.get_op0(), interp.get_op1());
    interp.make_integer(i32::from(result))
}

fn builtin_apply(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 0, Cons);
    expect_op!(interp, 1, Function);

    let list = interp.get_op0();
    let function = interp.get_op1();

    if !interp.is_list(list) {
        return interp.make_error(ErrorCode::InvalidArgumentType, list);
    }
    let count = interp.list_length(list);
    if count > u8::MAX as usize {
        let nil = interp.nil();
        return interp.make_error(ErrorCode::InvalidArgc, nil);
    }

    let mut current = list;
    while current != interp.nil() {
        let element = interp.car(current);
        interp.push_op(element);
        current = interp.cdr(current);
    }

    interp.funcall(function, count as u8);
    interp.pop_op()
}

fn builtin_fill(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Integer);

    let count = interp.integer_value(interp.get_op1()).max(0) as u32;
    let result = interp.make_list(count);
    for i in 0..count {
        let value = interp.get_op0();
        interp.set_list(result, i, value);
    }
    result
}

fn builtin_gen(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Integer);

    let count = interp.integer_value(interp.get_op1()).max(0) as u32;
    let function = interp.get_op0();
    let result = interp.make_list(count);
    interp.push_op(result);
    for i in 0..count {
        let index = interp.make_integer(i as i32);
        interp.push_op(index);
        interp.funcall(function, 1);
        let value = interp.get_op0();
        interp.set_list(result, i, value);
        interp.pop_op();
    }
    interp.pop_op();
    result
}

fn builtin_length(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    if interp.type_of(interp.get_op0()) == TypeTag::Nil {
        return interp.make_integer(0);
    }
    expect_op!(interp, 0, Cons);
    let len = interp.list_length(interp.get_op0());
    interp.make_integer(len as i32)
}

fn builtin_less(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 0, Integer);
    expect_op!(interp, 1, Integer);
    let result = interp.integer_value(interp.get_op1()) < interp.integer_value(interp.get_op0());
    interp.make_integer(i32::from(result))
}

fn builtin_greater(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 0, Integer);
    expect_op!(interp, 1, Integer);
    let result = interp.integer_value(interp.get_op1()) > interp.integer_value(interp.get_op0());
    interp.make_integer(i32::from(result))
}

fn builtin_add(interp: &mut Interp, argc: u8) -> ValueRef {
    let mut accum: i32 = 0;
    for i in 0..argc as usize {
        expect_op!(interp, i, Integer);
        accum = accum.wrapping_add(interp.integer_value(interp.get_op(i)));
    }
    interp.make_integer(accum)
}

fn builtin_sub(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Integer);
    expect_op!(interp, 0, Integer);
    let result = interp
        .integer_value(interp.get_op1())
        .wrapping_sub(interp.integer_value(interp.get_op0()));
    interp.make_integer(result)
}

fn builtin_mul(interp: &mut Interp, argc: u8) -> ValueRef {
    let mut accum: i32 = 1;
    for i in 0..argc as usize {
        expect_op!(interp, i, Integer);
        accum = accum.wrapping_mul(interp.integer_value(interp.get_op(i)));
    }
    interp.make_integer(accum)
}

fn builtin_div(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Integer);
    expect_op!(interp, 0, Integer);
    let divisor = interp.integer_value(interp.get_op0());
    if divisor == 0 {
        let context = interp.get_op0();
        return interp.make_error(ErrorCode::InvalidArgumentType, context);
    }
    let result = interp.integer_value(interp.get_op1()).wrapping_div(divisor);
    interp.make_integer(result)
}

fn builtin_interp_stat(interp: &mut Interp, _argc: u8) -> ValueRef {
    let free = interp.pool.free_count() as i32;
    let stack = interp.operand_stack_len() as i32;
    let intern_bytes = interp.interns.bytes_used() as i32;

    let mut vars = 0;
    let root = interp.globals_tree;
    interp.globals_tree_traverse(root, &mut |_, _, _| {
        vars += 1;
    });

    let mut databuffers = 0;
    interp.live_values(|_, value| {
        if value.type_tag() == TypeTag::DataBuffer {
            databuffers += 1;
        }
    });

    let mut make_stat = |interp: &mut Interp, name: &str, value: i32| {
        let pair = interp.make_cons(interp.nil(), interp.nil());
        if pair == interp.oom() {
            return pair;
        }
        interp.push_op(pair);
        let symbol = interp.make_symbol(name);
        interp.set_car(pair, symbol);
        let number = interp.make_integer(value);
        interp.set_cdr(pair, number);
        interp.pop_op();
        pair
    };

    let mut stats = ListBuilder::new(interp);
    for (name, value) in [
        ("vars", vars),
        ("stk", stack),
        ("internb", intern_bytes),
        ("free", free),
        ("sbr", databuffers),
    ] {
        let pair = make_stat(interp, name, value);
        stats.push_front(interp, pair);
    }
    stats.result(interp)
}

fn builtin_range(interp: &mut Interp, argc: u8) -> ValueRef {
    let mut start = 0;
    let mut end = 0;
    let mut incr = 1;

    match argc {
        1 => {
            expect_op!(interp, 0, Integer);
            end = interp.integer_value(interp.get_op0());
        }
        2 => {
            expect_op!(interp, 1, Integer);
            expect_op!(interp, 0, Integer);
            start = interp.integer_value(interp.get_op1());
            end = interp.integer_value(interp.get_op0());
        }
        3 => {
            expect_op!(interp, 2, Integer);
            expect_op!(interp, 1, Integer);
            expect_op!(interp, 0, Integer);
            start = interp.integer_value(interp.get_op(2));
            end = interp.integer_value(interp.get_op1());
            incr = interp.integer_value(interp.get_op0());
        }
        _ => {
            let nil = interp.nil();
            return interp.make_error(ErrorCode::InvalidArgc, nil);
        }
    }

    if incr == 0 {
        return interp.nil();
    }

    let mut result = ListBuilder::new(interp);
    let mut i = start;
    while (incr > 0 && i < end) || (incr < 0 && i > end) {
        let number = interp.make_integer(i);
        result.push_back(interp, number);
        i = i.wrapping_add(incr);
    }
    result.result(interp)
}

fn builtin_unbind(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Symbol);
    let symbol = interp.get_op0();
    interp.globals_tree_erase(symbol);
    interp.nil()
}

fn builtin_symbol(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, String);
    let name = interp.string_value(interp.get_op0());
    interp.make_symbol(&name)
}

fn builtin_type(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    let name = match interp.type_of(interp.get_op0()) {
        TypeTag::Nil => "nil",
        TypeTag::Integer => "integer",
        TypeTag::Cons => "pair",
        TypeTag::Function => "function",
        TypeTag::Error => "error",
        TypeTag::Symbol => "symbol",
        TypeTag::UserData => "ud",
        TypeTag::DataBuffer => "databuffer",
        TypeTag::String => "string",
        TypeTag::Character => "character",
        TypeTag::HeapNode => "???",
    };
    interp.make_symbol(name)
}

fn builtin_string(interp: &mut Interp, argc: u8) -> ValueRef {
    let mut out = String::new();
    for i in (0..argc as usize).rev() {
        let value = interp.get_op(i);
        if interp.type_of(value) == TypeTag::String {
            out.push_str(&interp.string_value(value));
        } else {
            out.push_str(&interp.format(value));
        }
    }
    interp.make_string(&out)
}

fn builtin_bound(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Symbol);
    let symbol = interp.get_op0();
    let found = interp.globals_tree_find(symbol);
    let bound = found != interp.nil() && !interp.is_error(found);
    interp.make_integer(i32::from(bound))
}

fn builtin_filter(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 0, Cons);
    expect_op!(interp, 1, Function);

    let function = interp.get_op1();
    let input = interp.get_op0();

    let result = interp.make_cons(interp.nil(), interp.nil());
    if result == interp.oom() {
        return result;
    }
    let mut prev = result;
    let mut current = result;

    let mut item = input;
    while item != interp.nil() && interp.type_of(item) == TypeTag::Cons {
        let value = interp.car(item);

        interp.push_op(result);
        interp.push_op(value);
        interp.funcall(function, 1);
        let keep = interp.is_truthy(interp.get_op0());

        if keep {
            interp.set_car(current, value);
            let next = interp.make_cons(interp.nil(), interp.nil());
            if next == interp.oom() {
                interp.pop_op();
                interp.pop_op();
                break;
            }
            interp.set_cdr(current, next);
            prev = current;
            current = next;
        }

        interp.pop_op(); // call result
        interp.pop_op(); // protected result list

        item = interp.cdr(item);
    }

    if current == result {
        return interp.nil();
    }
    interp.set_cdr(prev, interp.nil());
    result
}

fn builtin_map(interp: &mut Interp, argc: u8) -> ValueRef {
    if argc < 2 {
        return interp.nil();
    }
    let function = interp.get_op(argc as usize - 1);
    if interp.type_of(function) != TypeTag::Function && interp.type_of(function) != TypeTag::Cons {
        let nil = interp.nil();
        return interp.make_error(ErrorCode::InvalidArgumentType, nil);
    }

    let list_count = argc as usize - 1;
    if list_count > 6 {
        return interp.nil();
    }

    let mut inputs: SmallVec<[ValueRef; 6]> = SmallVec::new();
    for i in 0..list_count {
        expect_op!(interp, i, Cons);
        inputs.push(interp.get_op(i));
    }

    let len = interp.list_length(inputs[0]);
    if len == 0 {
        return interp.nil();
    }
    for input in &inputs {
        if interp.list_length(*input) != len {
            return interp.nil();
        }
    }

    let result = interp.make_list(len as u32);
    interp.push_op(result);

    for index in 0..len {
        for input in inputs.iter_mut().rev() {
            let element = interp.car(*input);
            interp.push_op(element);
            *input = interp.cdr(*input);
        }
        interp.funcall(function, list_count as u8);
        let value = interp.get_op0();
        interp.set_list(result, index as u32, value);
        interp.pop_op();
    }

    interp.pop_op();
    result
}

fn builtin_reverse(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Cons);

    let mut result = interp.nil();
    let mut item = interp.get_op0();
    while item != interp.nil() && interp.type_of(item) == TypeTag::Cons {
        let element = interp.car(item);
        result = interp.make_cons(element, result);
        item = interp.cdr(item);
    }
    result
}

fn builtin_select(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 0, Cons);
    expect_op!(interp, 1, Cons);

    let input = interp.get_op1();
    let selection = interp.get_op0();

    let len = interp.list_length(selection);
    if len == 0 || len != interp.list_length(input) {
        return interp.nil();
    }

    let mut result = interp.nil();
    for i in (0..len as u32).rev() {
        let flag = interp.get_list(selection, i);
        if interp.is_truthy(flag) {
            let element = interp.get_list(input, i);
            result = interp.make_cons(element, result);
        }
    }
    result
}

fn builtin_gc(interp: &mut Interp, _argc: u8) -> ValueRef {
    let count = interp.collect_garbage() as i32;
    interp.make_integer(count)
}

fn builtin_get(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 2);
    expect_op!(interp, 1, Cons);
    expect_op!(interp, 0, Integer);
    let position = interp.integer_value(interp.get_op0()).max(0) as u32;
    interp.get_list(interp.get_op1(), position)
}

fn builtin_read(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, String);
    let text = interp.string_value(interp.get_op0());
    interp.read(&text);
    interp.pop_op()
}

fn builtin_eval(interp: &mut Interp, argc: u8) -> ValueRef {
    if argc < 1 {
        let nil = interp.nil();
        return interp.make_error(ErrorCode::InvalidArgc, nil);
    }
    let expr = interp.get_op0();
    interp.eval(expr);
    interp.pop_op()
}

fn builtin_globals(interp: &mut Interp, _argc: u8) -> ValueRef {
    interp.globals_tree
}

fn builtin_this(interp: &mut Interp, _argc: u8) -> ValueRef {
    interp.get_this()
}

fn builtin_argc(interp: &mut Interp, _argc: u8) -> ValueRef {
    // Valid because native calls do not reassign the current argument
    // count.
    let count = i32::from(interp.get_argc());
    interp.make_integer(count)
}

fn builtin_env(interp: &mut Interp, _argc: u8) -> ValueRef {
    let mut names = Vec::new();
    interp.for_each_env_name(&mut |_, name| {
        names.push(name);
    });

    let result = interp.make_cons(interp.nil(), interp.nil());
    interp.push_op(result);
    let mut current = result;
    for name in names {
        let symbol = interp.make_symbol_interned(name);
        interp.set_car(current, symbol);
        let next = interp.make_cons(interp.nil(), interp.nil());
        if next != interp.oom() {
            interp.set_cdr(current, next);
            current = next;
        }
    }
    interp.pop_op();
    result
}

fn builtin_compile(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Function);

    match interp.function_view(interp.get_op0()) {
        Some(FunctionView::Source { code, .. }) => {
            interp.compile(code);
            interp.pop_op()
        }
        _ => interp.get_op0(),
    }
}

fn builtin_disassemble(interp: &mut Interp, argc: u8) -> ValueRef {
    expect_argc!(interp, argc, 1);
    expect_op!(interp, 0, Function);
    let function = interp.get_op0();
    interp.disassemble(function);
    interp.nil()
}

/// Bind every primitive into the globals tree. Runs once at startup.
pub(crate) fn register(interp: &mut Interp) {
    let table: &[(&str, NativeFn)] = &[
        ("set", builtin_set),
        ("cons", builtin_cons),
        ("car", builtin_car),
        ("cdr", builtin_cdr),
        ("list", builtin_list),
        ("arg", builtin_arg),
        ("progn", builtin_progn),
        ("any-true", builtin_any_true),
        ("all-true", builtin_all_true),
        ("not", builtin_not),
        ("equal", builtin_equal),
        ("apply", builtin_apply),
        ("fill", builtin_fill),
        ("gen", builtin_gen),
        ("length", builtin_length),
        ("<", builtin_less),
        (">", builtin_greater),
        ("+", builtin_add),
        ("-", builtin_sub),
        ("*", builtin_mul),
        ("/", builtin_div),
        ("interp-stat", builtin_interp_stat),
        ("range", builtin_range),
        ("unbind", builtin_unbind),
        ("symbol", builtin_symbol),
        ("type", builtin_type),
        ("string", builtin_string),
        ("bound", builtin_bound),
        ("filter", builtin_filter),
        ("map", builtin_map),
        ("reverse", builtin_reverse),
        ("select", builtin_select),
        ("gc", builtin_gc),
        ("get", builtin_get),
        ("read", builtin_read),
        ("eval", builtin_eval),
        ("globals", builtin_globals),
        ("this", builtin_this),
        ("argc", builtin_argc),
        ("env", builtin_env),
        ("compile", builtin_compile),
        ("disassemble", builtin_disassemble),
    ];

    for (name, function) in table {
        let value = interp.make_native_function(*function);
        interp.gc_protect(value);
        interp.set_var_by_name(name, value);
        interp.gc_unprotect();
    }
}
