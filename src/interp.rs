//! Interpreter context.
//!
//! All interpreter state lives in one [`Interp`] value: the cell pool,
//! the intern region, the operand stack, the globals tree, the current
//! lexical bindings, the macro list, and the distinguished nil and
//! out-of-memory cells. The host constructs exactly one and threads it
//! through every call; the interpreter is single-threaded and
//! non-reentrant above the value-construction layer, though nested
//! `eval`/`dostring` entries from native primitives are supported and
//! counted.
//!
//! The operand stack is the only argument-passing channel. Functions
//! find their arguments on it by positional offset, and every public
//! operation that produces a value either returns the reference directly
//! or leaves it on the stack, rooted against collection.

use crate::interns::{InternRef, InternTable};
use crate::platform::{Platform, SCRATCH_BUFFER_SIZE};
use crate::pool::{compress, decompress, ValuePool};
use crate::value::{Cell, CellValue, ErrorCode, NativeFn, TypeTag, ValueRef};

/// Capacity of the operand stack.
pub const OPERAND_STACK_SIZE: usize = 497;

/// Copyable view of a function cell's payload, used to dispatch calls
/// without holding a borrow on the pool.
#[derive(Clone, Copy)]
pub(crate) enum FunctionView {
    Native(NativeFn),
    Source { code: ValueRef, bindings: ValueRef },
    Bytecode { code: ValueRef, bindings: ValueRef },
}

pub struct Interp {
    pub(crate) pool: ValuePool,
    pub(crate) interns: InternTable,
    pub(crate) operand_stack: Vec<ValueRef>,
    /// Registered GC roots held by host or interpreter code across
    /// allocations. Scoped: always released in reverse order.
    pub(crate) protected: Vec<ValueRef>,

    pub(crate) nil: ValueRef,
    pub(crate) oom: ValueRef,
    /// Data buffer currently being packed with short strings, or nil.
    /// Not a root: the sweep clears this slot when nothing else keeps
    /// the buffer alive.
    pub(crate) string_buffer: ValueRef,
    pub(crate) globals_tree: ValueRef,
    pub(crate) lexical_bindings: ValueRef,
    pub(crate) macros: ValueRef,
    pub(crate) this_fn: ValueRef,

    pub(crate) arguments_break_loc: usize,
    pub(crate) current_fn_argc: u8,

    constants: Vec<(String, i32)>,
    pub(crate) interp_entry_count: u32,

    pub(crate) platform: Box<dyn Platform>,
}

impl Interp {
    /// Build a fresh interpreter bound to `platform`: initialize the
    /// pool, allocate the permanent nil and out-of-memory cells, verify
    /// pointer compression round-trips, and register the native
    /// primitives.
    pub fn new(platform: Box<dyn Platform>) -> Interp {
        let mut pool = ValuePool::new();

        let nil = match pool.alloc() {
            Some(v) => v,
            None => platform.fatal("value pool init failed"),
        };
        pool.cell_mut(nil).value = CellValue::Nil;

        let oom = match pool.alloc() {
            Some(v) => v,
            None => platform.fatal("value pool init failed"),
        };
        pool.cell_mut(oom).value = CellValue::Error {
            code: ErrorCode::OutOfMemory,
            context: nil,
        };

        let mut interp = Interp {
            pool,
            interns: InternTable::new(),
            operand_stack: Vec::with_capacity(OPERAND_STACK_SIZE),
            protected: Vec::new(),
            nil,
            oom,
            string_buffer: nil,
            globals_tree: nil,
            lexical_bindings: nil,
            macros: nil,
            this_fn: nil,
            arguments_break_loc: 0,
            current_fn_argc: 0,
            constants: Vec::new(),
            interp_entry_count: 0,
            platform,
        };

        // A couple of nil sentinels let stack peeks skip size checks.
        interp.push_op(nil);
        interp.push_op(nil);

        if compress(decompress(interp.nil)) != interp.nil {
            interp.platform.fatal("pointer compression test failed");
        }

        interp.intern("'");

        crate::builtins::register(&mut interp);

        interp
    }

    // ------------------------------------------------------------------
    // Cell access

    #[inline]
    pub fn nil(&self) -> ValueRef {
        self.nil
    }

    #[inline]
    pub fn oom(&self) -> ValueRef {
        self.oom
    }

    #[inline]
    pub(crate) fn cell(&self, value: ValueRef) -> &Cell {
        self.pool.cell(value)
    }

    #[inline]
    pub(crate) fn cell_mut(&mut self, value: ValueRef) -> &mut Cell {
        self.pool.cell_mut(value)
    }

    #[inline]
    pub fn type_of(&self, value: ValueRef) -> TypeTag {
        self.cell(value).value.type_tag()
    }

    pub fn is_error(&self, value: ValueRef) -> bool {
        self.type_of(value) == TypeTag::Error
    }

    pub fn error_code(&self, value: ValueRef) -> Option<ErrorCode> {
        match self.cell(value).value {
            CellValue::Error { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn error_context(&self, value: ValueRef) -> ValueRef {
        match self.cell(value).value {
            CellValue::Error { context, .. } => context,
            _ => self.nil,
        }
    }

    /// Car of a pair; nil for anything else.
    #[inline]
    pub fn car(&self, value: ValueRef) -> ValueRef {
        match self.cell(value).value {
            CellValue::Cons { car, .. } => car,
            _ => self.nil,
        }
    }

    /// Cdr of a pair; nil for anything else.
    #[inline]
    pub fn cdr(&self, value: ValueRef) -> ValueRef {
        match self.cell(value).value {
            CellValue::Cons { cdr, .. } => cdr,
            _ => self.nil,
        }
    }

    pub(crate) fn set_car(&mut self, pair: ValueRef, value: ValueRef) {
        if let CellValue::Cons { car, .. } = &mut self.cell_mut(pair).value {
            *car = value;
        }
    }

    pub(crate) fn set_cdr(&mut self, pair: ValueRef, value: ValueRef) {
        if let CellValue::Cons { cdr, .. } = &mut self.cell_mut(pair).value {
            *cdr = value;
        }
    }

    /// Payload of an integer cell; 0 for anything else.
    pub fn integer_value(&self, value: ValueRef) -> i32 {
        match self.cell(value).value {
            CellValue::Integer(n) => n,
            _ => 0,
        }
    }

    pub(crate) fn symbol_intern(&self, value: ValueRef) -> Option<InternRef> {
        match self.cell(value).value {
            CellValue::Symbol(r) => Some(r),
            _ => None,
        }
    }

    /// Name of a symbol cell; empty for anything else.
    pub fn symbol_name(&self, value: ValueRef) -> &str {
        match self.cell(value).value {
            CellValue::Symbol(r) => self.interns.name(r),
            _ => "",
        }
    }

    /// Copy the bytes of a string cell out of its data buffer.
    pub fn string_value(&self, value: ValueRef) -> String {
        let (buffer, offset) = match self.cell(value).value {
            CellValue::String { buffer, offset } => (buffer, offset as usize),
            _ => return String::new(),
        };
        let data = match &self.cell(buffer).value {
            CellValue::DataBuffer(handle) => handle.clone(),
            _ => return String::new(),
        };
        let bytes = data.data.borrow();
        let mut end = offset;
        while end < SCRATCH_BUFFER_SIZE && bytes[end] != 0 {
            end += 1;
        }
        String::from_utf8_lossy(&bytes[offset..end]).into_owned()
    }

    pub(crate) fn function_view(&self, value: ValueRef) -> Option<FunctionView> {
        match self.cell(value).value {
            CellValue::NativeFunction(f) => Some(FunctionView::Native(f)),
            CellValue::SourceFunction { code, bindings } => {
                Some(FunctionView::Source { code, bindings })
            }
            CellValue::BytecodeFunction { code, bindings } => {
                Some(FunctionView::Bytecode { code, bindings })
            }
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Operand stack

    pub fn push_op(&mut self, operand: ValueRef) {
        self.operand_stack.push(operand);
    }

    pub fn pop_op(&mut self) -> ValueRef {
        self.operand_stack.pop().unwrap_or(self.nil)
    }

    pub fn get_op0(&self) -> ValueRef {
        self.get_op(0)
    }

    pub fn get_op1(&self) -> ValueRef {
        self.get_op(1)
    }

    /// Peek `offset` entries below the stack top; nil when out of range.
    pub fn get_op(&self, offset: usize) -> ValueRef {
        let len = self.operand_stack.len();
        if offset >= len {
            return self.nil;
        }
        self.operand_stack[len - 1 - offset]
    }

    pub fn operand_stack_len(&self) -> usize {
        self.operand_stack.len()
    }

    // ------------------------------------------------------------------
    // Protected roots

    /// Register `value` as a collection root. Pair every call with
    /// [`Interp::gc_unprotect`] on all exit paths; this is the only safe
    /// way to hold a reference across an allocation.
    pub fn gc_protect(&mut self, value: ValueRef) {
        self.protected.push(value);
    }

    /// Release the most recently registered root.
    pub fn gc_unprotect(&mut self) {
        self.protected.pop();
    }

    // ------------------------------------------------------------------
    // Interning

    /// Intern `name`, aborting via the platform when the region is full.
    pub fn intern(&mut self, name: &str) -> InternRef {
        match self.interns.intern(name) {
            Some(r) => r,
            None => self.platform.fatal("string intern table full"),
        }
    }

    /// Name stored at an intern offset, as used by bytecode operands.
    pub fn symbol_from_offset(&self, offset: u16) -> &str {
        self.interns.name(InternRef(offset))
    }

    // ------------------------------------------------------------------
    // Constructors

    fn alloc_cell(&mut self) -> Option<ValueRef> {
        if let Some(v) = self.pool.alloc() {
            return Some(v);
        }
        self.collect_garbage();
        self.pool.alloc()
    }

    fn alloc_value(&mut self, value: CellValue) -> ValueRef {
        match self.alloc_cell() {
            Some(v) => {
                self.cell_mut(v).value = value;
                v
            }
            None => self.oom,
        }
    }

    /// Allocate a pair. The halves are rooted for the duration of the
    /// allocation, so callers may pass otherwise-unreachable values.
    pub fn make_cons(&mut self, car: ValueRef, cdr: ValueRef) -> ValueRef {
        self.push_op(car);
        self.push_op(cdr);
        let v = self.alloc_value(CellValue::Cons { car, cdr });
        self.pop_op();
        self.pop_op();
        v
    }

    pub fn make_integer(&mut self, value: i32) -> ValueRef {
        self.alloc_value(CellValue::Integer(value))
    }

    /// Allocate a symbol, interning its name.
    pub fn make_symbol(&mut self, name: &str) -> ValueRef {
        let r = self.intern(name);
        self.alloc_value(CellValue::Symbol(r))
    }

    /// Allocate a symbol for an already-interned name.
    pub(crate) fn make_symbol_interned(&mut self, r: InternRef) -> ValueRef {
        self.alloc_value(CellValue::Symbol(r))
    }

    pub fn make_native_function(&mut self, f: NativeFn) -> ValueRef {
        self.alloc_value(CellValue::NativeFunction(f))
    }

    /// Allocate an interpreted function over `code`, capturing the
    /// current lexical bindings.
    pub fn make_source_function(&mut self, code: ValueRef) -> ValueRef {
        self.push_op(code);
        let bindings = self.lexical_bindings;
        let v = self.alloc_value(CellValue::SourceFunction { code, bindings });
        self.pop_op();
        v
    }

    /// Allocate a compiled function over an `(offset . databuffer)`
    /// pair, capturing the current lexical bindings.
    pub fn make_bytecode_function(&mut self, bytecode: ValueRef) -> ValueRef {
        self.push_op(bytecode);
        let bindings = self.lexical_bindings;
        let v = self.alloc_value(CellValue::BytecodeFunction {
            code: bytecode,
            bindings,
        });
        self.pop_op();
        v
    }

    pub fn make_error(&mut self, code: ErrorCode, context: ValueRef) -> ValueRef {
        self.push_op(context);
        let v = self.alloc_value(CellValue::Error { code, context });
        self.pop_op();
        v
    }

    pub fn make_userdata(&mut self, handle: usize) -> ValueRef {
        self.alloc_value(CellValue::UserData(handle))
    }

    /// Allocate a data-buffer cell owning a fresh host scratch buffer.
    /// Runs a collection first when the host is out of buffers, since
    /// unreachable data buffers may be holding some.
    pub fn make_databuffer(&mut self) -> ValueRef {
        if self.platform.scratch_buffers_remaining() == 0 {
            self.collect_garbage();
        }
        let handle = self.platform.make_scratch_buffer();
        self.alloc_value(CellValue::DataBuffer(handle))
    }

    /// Allocate a string. Short strings pack into a shared data buffer;
    /// a new buffer is opened when the current one has no room.
    pub fn make_string(&mut self, text: &str) -> ValueRef {
        let len = text.len();
        if len + 1 >= SCRATCH_BUFFER_SIZE {
            return self.make_error(ErrorCode::InvalidArgumentType, self.nil);
        }

        let mut existing: Option<(ValueRef, usize)> = None;
        if self.string_buffer != self.nil {
            let buffer = self.string_buffer;
            let free = match &self.cell(buffer).value {
                CellValue::DataBuffer(handle) => {
                    let bytes = handle.data.borrow();
                    let mut free = 0;
                    for i in (1..SCRATCH_BUFFER_SIZE).rev() {
                        if bytes[i] == 0 {
                            free += 1;
                        } else {
                            break;
                        }
                    }
                    free
                }
                _ => 0,
            };
            if free > len + 1 {
                // Leave one NUL to separate this string from the last.
                let offset = (SCRATCH_BUFFER_SIZE - free) + 1;
                existing = Some((buffer, offset));
            } else {
                self.string_buffer = self.nil;
            }
        }

        let (buffer, offset) = match existing {
            Some(pair) => pair,
            None => {
                let buffer = self.make_databuffer();
                if buffer == self.oom {
                    return self.oom;
                }
                self.string_buffer = buffer;
                (buffer, 0)
            }
        };

        self.gc_protect(buffer);
        if let CellValue::DataBuffer(handle) = &self.cell(buffer).value {
            let handle = handle.clone();
            let mut bytes = handle.data.borrow_mut();
            bytes[offset..offset + len].copy_from_slice(text.as_bytes());
            bytes[offset + len] = 0;
        }
        let v = self.alloc_value(CellValue::String {
            buffer,
            offset: offset as u16,
        });
        self.gc_unprotect();
        v
    }

    /// Allocate a proper list of `length` nil elements.
    pub fn make_list(&mut self, length: u32) -> ValueRef {
        if length == 0 {
            return self.nil;
        }
        let mut head = self.make_cons(self.nil, self.nil);
        for _ in 1..length {
            // make_cons roots the partial head across the allocation.
            head = self.make_cons(self.nil, head);
        }
        head
    }

    // ------------------------------------------------------------------
    // List helpers

    /// True for every value except nil and integer zero.
    pub fn is_truthy(&self, value: ValueRef) -> bool {
        match self.cell(value).value {
            CellValue::Integer(n) => n != 0,
            _ => value != self.nil,
        }
    }

    /// True for nil and for chains of pairs ending in nil.
    pub fn is_list(&self, value: ValueRef) -> bool {
        let mut current = value;
        while current != self.nil {
            if self.type_of(current) != TypeTag::Cons {
                return false;
            }
            current = self.cdr(current);
        }
        true
    }

    /// Element count of a proper list; 0 for nil and malformed lists.
    pub fn list_length(&self, value: ValueRef) -> usize {
        if self.type_of(value) != TypeTag::Cons {
            return 0;
        }
        let mut len = 0;
        let mut current = value;
        loop {
            len += 1;
            current = self.cdr(current);
            if self.type_of(current) != TypeTag::Cons {
                if current != self.nil {
                    return 0; // not a well-formed list
                }
                break;
            }
        }
        len
    }

    /// N-th element of a list; nil when out of range.
    pub fn get_list(&self, list: ValueRef, position: u32) -> ValueRef {
        let mut current = list;
        for _ in 0..position {
            if self.type_of(current) != TypeTag::Cons {
                return self.nil;
            }
            current = self.cdr(current);
        }
        if self.type_of(current) != TypeTag::Cons {
            return self.nil;
        }
        self.car(current)
    }

    /// Overwrite the N-th element of a list; no-op when out of range.
    pub fn set_list(&mut self, list: ValueRef, position: u32, value: ValueRef) {
        let mut current = list;
        for _ in 0..position {
            if self.type_of(current) != TypeTag::Cons {
                return;
            }
            current = self.cdr(current);
        }
        if self.type_of(current) != TypeTag::Cons {
            return;
        }
        self.set_car(current, value);
    }

    // ------------------------------------------------------------------
    // Globals tree
    //
    // Node shape: ((key . value) . (left . right)), three pairs per
    // binding, ordered by the key symbol's intern offset.

    fn key_offset(&self, symbol: ValueRef) -> Option<InternRef> {
        self.symbol_intern(symbol)
    }

    pub(crate) fn globals_tree_insert(&mut self, key: ValueRef, value: ValueRef) {
        let key_offset = match self.key_offset(key) {
            Some(k) => k,
            None => return,
        };

        let kvp = self.make_cons(key, value);
        self.gc_protect(kvp);

        if self.globals_tree == self.nil {
            let children = self.make_cons(self.nil, self.nil);
            self.push_op(children);
            let new_tree = self.make_cons(kvp, children);
            self.pop_op();
            self.globals_tree = new_tree;
        } else {
            let mut current = self.globals_tree;
            let mut prev = current;
            let mut insert_left = true;

            while current != self.nil {
                let current_key = self.car(self.car(current));
                let current_offset = match self.key_offset(current_key) {
                    Some(k) => k,
                    None => break,
                };

                if current_offset == key_offset {
                    // Key exists: overwrite the value in place.
                    let existing_kvp = self.car(current);
                    self.set_cdr(existing_kvp, value);
                    self.gc_unprotect();
                    return;
                }

                prev = current;
                if current_offset < key_offset {
                    insert_left = true;
                    current = self.car(self.cdr(current));
                } else {
                    insert_left = false;
                    current = self.cdr(self.cdr(current));
                }
            }

            let children = self.make_cons(self.nil, self.nil);
            self.push_op(children);
            let new_tree = self.make_cons(kvp, children);
            self.pop_op();

            let links = self.cdr(prev);
            if insert_left {
                self.set_car(links, new_tree);
            } else {
                self.set_cdr(links, new_tree);
            }
        }

        self.gc_unprotect();
    }

    /// Look up `key`; returns the bound value, or an
    /// undefined-variable error with a `[var: name]` hint string.
    pub(crate) fn globals_tree_find(&mut self, key: ValueRef) -> ValueRef {
        let key_offset = self.key_offset(key);

        let mut current = self.globals_tree;
        while current != self.nil {
            let current_key = self.car(self.car(current));
            let current_offset = self.key_offset(current_key);

            if current_offset == key_offset && current_offset.is_some() {
                return self.cdr(self.car(current));
            }

            if current_offset < key_offset {
                current = self.car(self.cdr(current));
            } else {
                current = self.cdr(self.cdr(current));
            }
        }

        let hint = format!("[var: {}]", self.symbol_name(key));
        let context = self.make_string(&hint);
        self.make_error(ErrorCode::UndefinedVariableAccess, context)
    }

    pub(crate) fn globals_tree_erase(&mut self, key: ValueRef) {
        if self.globals_tree == self.nil {
            return;
        }
        let key_offset = match self.key_offset(key) {
            Some(k) => k,
            None => return,
        };

        let mut current = self.globals_tree;
        let mut prev = current;
        let mut erase_left = true;

        while current != self.nil {
            let current_key = self.car(self.car(current));
            let current_offset = match self.key_offset(current_key) {
                Some(k) => k,
                None => return,
            };

            if current_offset == key_offset {
                self.gc_protect(current);

                if current == prev {
                    self.globals_tree = self.nil;
                } else {
                    let links = self.cdr(prev);
                    if erase_left {
                        self.set_car(links, self.nil);
                    } else {
                        self.set_cdr(links, self.nil);
                    }
                }

                // Splice the erased node out and reattach both subtrees
                // by traversal.
                let left = self.car(self.cdr(current));
                if left != self.nil {
                    self.reattach_subtree(left);
                }
                let right = self.cdr(self.cdr(current));
                if right != self.nil {
                    self.reattach_subtree(right);
                }

                self.gc_unprotect();
                return;
            }

            prev = current;
            if current_offset < key_offset {
                erase_left = true;
                current = self.car(self.cdr(current));
            } else {
                erase_left = false;
                current = self.cdr(self.cdr(current));
            }
        }
    }

    fn reattach_subtree(&mut self, root: ValueRef) {
        self.globals_tree_traverse(root, &mut |interp, kvp, _node| {
            let k = interp.car(kvp);
            let v = interp.cdr(kvp);
            interp.globals_tree_insert(k, v);
        });
    }

    /// In-order traversal of a globals (sub)tree. The visitor receives
    /// the `(key . value)` pair and the tree node carrying it.
    pub(crate) fn globals_tree_traverse(
        &mut self,
        root: ValueRef,
        visit: &mut dyn FnMut(&mut Interp, ValueRef, ValueRef),
    ) {
        let mut stack: Vec<ValueRef> = Vec::new();
        let mut current = root;

        loop {
            while current != self.nil {
                stack.push(current);
                current = self.car(self.cdr(current));
            }
            let node = match stack.pop() {
                Some(n) => n,
                None => return,
            };
            let kvp = self.car(node);
            visit(self, kvp, node);
            current = self.cdr(self.cdr(node));
        }
    }

    /// Invoke `visit` with each global name, then each constant-table
    /// name. Feeds the `env` primitive.
    pub(crate) fn for_each_env_name(&mut self, visit: &mut dyn FnMut(&mut Interp, InternRef)) {
        let root = self.globals_tree;
        self.globals_tree_traverse(root, &mut |interp, kvp, _| {
            let key = interp.car(kvp);
            if let Some(r) = interp.symbol_intern(key) {
                visit(interp, r);
            }
        });
        for i in 0..self.constants.len() {
            let name = self.constants[i].0.clone();
            let r = self.intern(&name);
            visit(self, r);
        }
    }

    // ------------------------------------------------------------------
    // Variables

    /// Install the host constants table: read-only integer fallbacks
    /// consulted when a variable is found in neither the lexical frames
    /// nor the globals tree.
    pub fn set_constants(&mut self, table: &[(&str, i32)]) {
        self.constants = table
            .iter()
            .map(|(name, value)| ((*name).to_string(), *value))
            .collect();
    }

    /// Positional argument of the current activation; nil out of range.
    pub fn get_arg(&self, n: u16) -> ValueRef {
        let argc = self.current_fn_argc as usize;
        let n = n as usize;
        if n >= argc {
            return self.nil;
        }
        let depth = (argc - 1) - n;
        let br = self.arguments_break_loc;
        if br >= depth && br - depth < self.operand_stack.len() {
            self.operand_stack[br - depth]
        } else {
            self.nil
        }
    }

    pub fn get_argc(&self) -> u8 {
        self.current_fn_argc
    }

    /// The function object currently executing, or nil.
    pub fn get_this(&self) -> ValueRef {
        self.this_fn
    }

    /// Resolve a symbol: `$`-prefixed names are positional argument
    /// references, everything else walks lexical frames innermost-out,
    /// then the globals tree, then the host constants table.
    pub fn get_var(&mut self, symbol: ValueRef) -> ValueRef {
        let name = self.symbol_name(symbol).to_owned();

        if let Some(rest) = name.strip_prefix('$') {
            if rest == "V" {
                // The whole argument list.
                let mut result = self.nil;
                for i in (0..self.current_fn_argc as u16).rev() {
                    let arg = self.get_arg(i);
                    result = self.make_cons(arg, result);
                }
                return result;
            }
            let argn: u16 = rest.parse().unwrap_or(0);
            return self.get_arg(argn);
        }

        let symbol_offset = self.symbol_intern(symbol);
        let mut stack = self.lexical_bindings;
        while stack != self.nil {
            let mut bindings = self.car(stack);
            while bindings != self.nil {
                let kvp = self.car(bindings);
                if self.symbol_intern(self.car(kvp)) == symbol_offset {
                    return self.cdr(kvp);
                }
                bindings = self.cdr(bindings);
            }
            stack = self.cdr(stack);
        }

        let found = self.globals_tree_find(symbol);
        if !self.is_error(found) {
            return found;
        }

        for i in 0..self.constants.len() {
            if self.constants[i].0 == name {
                let value = self.constants[i].1;
                return self.make_integer(value);
            }
        }
        found
    }

    /// Convenience lookup by name.
    pub fn get_var_by_name(&mut self, name: &str) -> ValueRef {
        let symbol = self.make_symbol(name);
        self.gc_protect(symbol);
        let result = self.get_var(symbol);
        self.gc_unprotect();
        result
    }

    /// Bind `symbol`. An existing lexical binding is overwritten in its
    /// frame; otherwise the globals tree is updated.
    pub fn set_var(&mut self, symbol: ValueRef, value: ValueRef) -> ValueRef {
        if self.type_of(symbol) != TypeTag::Symbol {
            return self.nil;
        }

        let symbol_offset = self.symbol_intern(symbol);
        let mut stack = self.lexical_bindings;
        while stack != self.nil {
            let mut bindings = self.car(stack);
            while bindings != self.nil {
                let kvp = self.car(bindings);
                if self.symbol_intern(self.car(kvp)) == symbol_offset {
                    self.set_cdr(kvp, value);
                    return self.nil;
                }
                bindings = self.cdr(bindings);
            }
            stack = self.cdr(stack);
        }

        self.globals_tree_insert(symbol, value);
        self.nil
    }

    /// Bind a global by name.
    pub fn set_var_by_name(&mut self, name: &str, value: ValueRef) {
        self.push_op(value);
        let symbol = self.make_symbol(name);
        self.push_op(symbol);
        self.set_var(symbol, value);
        self.pop_op();
        self.pop_op();
    }

    // ------------------------------------------------------------------
    // Lexical frames

    /// Open a fresh innermost binding frame.
    pub fn lexical_frame_push(&mut self) {
        self.lexical_bindings = self.make_cons(self.nil, self.lexical_bindings);
    }

    /// Drop the innermost binding frame.
    pub fn lexical_frame_pop(&mut self) {
        self.lexical_bindings = self.cdr(self.lexical_bindings);
    }

    /// Prepend a `(symbol . value)` pair to the innermost frame.
    pub fn lexical_frame_store(&mut self, kvp: ValueRef) {
        let frame = self.car(self.lexical_bindings);
        let new_frame = self.make_cons(kvp, frame);
        let head = self.lexical_bindings;
        self.set_car(head, new_frame);
    }

    // ------------------------------------------------------------------
    // Calls

    /// Call `obj` with `argc` arguments sitting on top of the operand
    /// stack. The arguments are consumed and replaced with the result.
    /// `this`, the lexical bindings, the argument break location and the
    /// argument count are saved and restored around the call.
    pub fn funcall(&mut self, obj: ValueRef, argc: u8) {
        let prev_this = self.this_fn;
        let prev_bindings = self.lexical_bindings;
        let prev_break_loc = self.arguments_break_loc;
        let prev_argc = self.current_fn_argc;

        // The caller's chain must survive collections inside the callee
        // even while a different chain is installed.
        self.gc_protect(prev_this);
        self.gc_protect(prev_bindings);

        match self.function_view(obj) {
            None => {
                self.pop_args(argc);
                let err = self.make_error(ErrorCode::ValueNotCallable, self.nil);
                self.push_op(err);
            }
            Some(view) => {
                if self.operand_stack.len() < argc as usize {
                    self.pop_args(argc);
                    let err = self.make_error(ErrorCode::InvalidArgc, obj);
                    self.push_op(err);
                } else {
                    match view {
                        FunctionView::Native(f) => {
                            let result = f(self, argc);
                            self.pop_args(argc);
                            self.push_op(result);
                        }
                        FunctionView::Source { code, bindings } => {
                            self.lexical_bindings = bindings;
                            let break_loc = self.operand_stack.len().saturating_sub(1);
                            let mut expression_list = code;
                            self.push_op(self.nil); // result placeholder
                            while expression_list != self.nil {
                                if self.type_of(expression_list) != TypeTag::Cons {
                                    break;
                                }
                                self.pop_op(); // previous result
                                self.arguments_break_loc = break_loc;
                                self.current_fn_argc = argc;
                                self.this_fn = obj;
                                let expr = self.car(expression_list);
                                self.eval(expr); // new result
                                expression_list = self.cdr(expression_list);
                            }
                            let result = self.pop_op();
                            self.pop_args(argc);
                            self.push_op(result);
                        }
                        FunctionView::Bytecode { code, bindings } => {
                            let break_loc = self.operand_stack.len().saturating_sub(1);
                            self.arguments_break_loc = break_loc;
                            self.current_fn_argc = argc;
                            self.this_fn = obj;
                            self.lexical_bindings = bindings;

                            let buffer = self.cdr(code);
                            let offset = self.integer_value(self.car(code));
                            self.vm_execute(buffer, offset.max(0) as usize);

                            let result = self.pop_op();
                            self.pop_args(argc);
                            self.push_op(result);
                        }
                    }
                }
            }
        }

        self.gc_unprotect();
        self.gc_unprotect();

        self.this_fn = prev_this;
        self.lexical_bindings = prev_bindings;
        self.arguments_break_loc = prev_break_loc;
        self.current_fn_argc = prev_argc;
    }

    fn pop_args(&mut self, argc: u8) {
        for _ in 0..argc {
            self.pop_op();
        }
    }

    // ------------------------------------------------------------------
    // Top-level driver

    /// True while an `eval` or `dostring` entry is live. Host code can
    /// use this to skip expensive bookkeeping during nested entries.
    pub fn is_executing(&self) -> bool {
        self.interp_entry_count > 0
    }

    /// Read and evaluate every expression in `code`. Returns the value
    /// of the last expression. The first error value halts iteration and
    /// is handed to `on_error` before returning.
    pub fn dostring(
        &mut self,
        code: &str,
        on_error: &mut dyn FnMut(&mut Interp, ValueRef),
    ) -> ValueRef {
        self.interp_entry_count += 1;

        self.gc_protect(self.nil);
        let result_slot = self.protected.len() - 1;

        let mut i = 0;
        let mut result = self.nil;

        loop {
            i += self.read(&code[i..]);
            let reader_result = self.get_op0();
            if reader_result == self.nil {
                self.pop_op();
                break;
            }
            self.eval(reader_result);
            let expr_result = self.get_op0();
            result = expr_result;
            self.protected[result_slot] = expr_result;
            self.pop_op(); // expression result
            self.pop_op(); // reader result

            if self.is_error(expr_result) {
                self.push_op(expr_result);
                on_error(self, expr_result);
                self.pop_op();
                break;
            }
        }

        self.gc_unprotect();
        self.interp_entry_count -= 1;
        result
    }

    // ------------------------------------------------------------------
    // Printing

    /// Render `value` as source-like text.
    pub fn format(&self, value: ValueRef) -> String {
        let mut out = String::new();
        self.format_impl(value, &mut out, 0);
        out
    }

    fn format_impl(&self, value: ValueRef, out: &mut String, depth: u32) {
        match &self.cell(value).value {
            CellValue::HeapNode { .. } => {
                self.platform.fatal("direct access to heap node");
            }
            CellValue::Nil => {
                if depth == 0 {
                    out.push_str("'()");
                } else {
                    out.push_str("()");
                }
            }
            CellValue::Character(_) => {}
            CellValue::String { .. } => {
                out.push('"');
                out.push_str(&self.string_value(value));
                out.push('"');
            }
            CellValue::Symbol(r) => {
                out.push_str(self.interns.name(*r));
            }
            CellValue::Integer(n) => {
                out.push_str(&n.to_string());
            }
            CellValue::Cons { .. } => {
                if depth == 0 {
                    out.push('\'');
                }
                out.push('(');
                self.format_impl(self.car(value), out, depth + 1);
                let rest = self.cdr(value);
                if rest == self.nil {
                    // ...
                } else if self.type_of(rest) != TypeTag::Cons {
                    out.push_str(" . ");
                    self.format_impl(rest, out, depth + 1);
                } else {
                    let mut current = value;
                    loop {
                        let next = self.cdr(current);
                        if self.type_of(next) == TypeTag::Cons {
                            out.push(' ');
                            self.format_impl(self.car(next), out, depth + 1);
                            current = next;
                        } else if next != self.nil {
                            out.push_str(" . ");
                            self.format_impl(next, out, depth + 1);
                            break;
                        } else {
                            break;
                        }
                    }
                }
                out.push(')');
            }
            CellValue::NativeFunction(_)
            | CellValue::SourceFunction { .. }
            | CellValue::BytecodeFunction { .. } => {
                out.push_str("<lambda>");
            }
            CellValue::UserData(_) => {
                out.push_str("<ud>");
            }
            CellValue::Error { code, context } => {
                out.push_str("[ERR: ");
                out.push_str(code.as_str());
                out.push_str(" : ");
                self.format_impl(*context, out, 0);
                out.push(']');
            }
            CellValue::DataBuffer(_) => {
                out.push_str("<sbr>");
            }
        }
    }
}

/// Incremental list construction that keeps the partial list registered
/// as a collection root. Results must be re-rooted by the caller before
/// the next allocation.
pub(crate) struct ListBuilder {
    slot: usize,
    tail: Option<ValueRef>,
}

impl ListBuilder {
    pub fn new(interp: &mut Interp) -> ListBuilder {
        let slot = interp.protected.len();
        interp.gc_protect(interp.nil);
        ListBuilder { slot, tail: None }
    }

    pub fn push_front(&mut self, interp: &mut Interp, value: ValueRef) {
        let head = interp.protected[self.slot];
        let cell = interp.make_cons(value, head);
        if interp.type_of(cell) != TypeTag::Cons {
            return; // out of memory: drop the element
        }
        interp.protected[self.slot] = cell;
        if self.tail.is_none() {
            self.tail = Some(cell);
        }
    }

    pub fn push_back(&mut self, interp: &mut Interp, value: ValueRef) {
        let cell = interp.make_cons(value, interp.nil);
        if interp.type_of(cell) != TypeTag::Cons {
            return;
        }
        match self.tail {
            None => {
                interp.protected[self.slot] = cell;
            }
            Some(t) => {
                interp.set_cdr(t, cell);
            }
        }
        self.tail = Some(cell);
    }

    pub fn result(self, interp: &mut Interp) -> ValueRef {
        let head = interp.protected[self.slot];
        interp.protected.truncate(self.slot);
        head
    }
}
