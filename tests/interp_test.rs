use std::cell::RefCell;
use std::rc::Rc;

use emberlisp::{
    compress, decompress, Interp, ModuleError, Opcode, Platform, ScratchBuffer, ScratchBufferRef,
    StdPlatform, TypeTag, POOL_SIZE,
};

fn new_interp() -> Interp {
    Interp::new(Box::new(StdPlatform))
}

fn run(interp: &mut Interp, code: &str) -> String {
    let v = interp.dostring(code, &mut |_, _| {});
    interp.format(v)
}

#[test]
fn test_addition_scenario() {
    let mut interp = new_interp();
    assert_eq!(run(&mut interp, "(+ 1 2 3)"), "6");
}

#[test]
fn test_let_scenario() {
    let mut interp = new_interp();
    assert_eq!(run(&mut interp, "(let ((a 2) (b 3)) (* a b))"), "6");
    assert!(run(&mut interp, "a").contains("undefined-variable-access"));
    assert!(run(&mut interp, "b").contains("undefined-variable-access"));
}

#[test]
fn test_map_scenario() {
    let mut interp = new_interp();
    assert_eq!(
        run(&mut interp, "(map (lambda (* $0 $0)) '(1 2 3 4))"),
        "'(1 4 9 16)"
    );
}

#[test]
fn test_macro_scenario() {
    let mut interp = new_interp();
    assert_eq!(run(&mut interp, "(macro inc (x) (+ x 1)) (inc 5)"), "6");
}

#[test]
fn test_filter_scenario() {
    let mut interp = new_interp();
    assert_eq!(
        run(&mut interp, "(filter (lambda (> $0 2)) '(1 2 3 4 5))"),
        "'(3 4 5)"
    );
}

#[test]
fn test_quasiquote_scenario() {
    let mut interp = new_interp();
    assert_eq!(
        run(&mut interp, "`(1 ,(+ 1 1) ,@(list 3 4) 5)"),
        "'(1 2 3 4 5)"
    );
}

#[test]
fn test_compression_round_trip_invariant() {
    for slot in 0..POOL_SIZE {
        assert_eq!(decompress(compress(slot)), slot);
    }
}

#[test]
fn test_collection_after_dostring_is_idempotent() {
    let mut interp = new_interp();
    run(
        &mut interp,
        "(set 'data (map (lambda (* $0 3)) (range 50))) (length data)",
    );
    // Everything live is reachable from the roots, so a second pass
    // right after a first frees nothing.
    interp.collect_garbage();
    assert_eq!(interp.collect_garbage(), 0);
    assert_eq!(run(&mut interp, "(length data)"), "50");
}

#[test]
fn test_symbols_intern_once() {
    let mut interp = new_interp();
    assert_eq!(run(&mut interp, "(equal 'reactor 'reactor)"), "1");
    let a = interp.make_symbol("reactor-core");
    let b = interp.make_symbol("reactor-core");
    assert_eq!(interp.symbol_name(a), interp.symbol_name(b));
    assert_ne!(a, b);
}

#[test]
fn test_unrooted_churn_allocates_past_pool_size() {
    let mut interp = new_interp();
    let keep = interp.make_integer(-1);
    interp.gc_protect(keep);
    for i in 0..(POOL_SIZE + 1) {
        let v = interp.make_integer(i as i32);
        assert!(!interp.is_error(v), "allocation {i} failed");
    }
    // The protected root survived the churn.
    assert_eq!(interp.integer_value(keep), -1);
    interp.gc_unprotect();
}

#[test]
fn test_errors_halt_dostring_iteration() {
    let mut interp = new_interp();
    let mut reported = Vec::new();
    let result = interp.dostring(
        "(set 'first 1) no-such-binding (set 'second 2)",
        &mut |interp, err| {
            reported.push(interp.format(err));
        },
    );
    assert!(interp.is_error(result));
    assert_eq!(reported.len(), 1);
    assert!(reported[0].contains("undefined-variable-access"));
    // Evaluation stopped at the error.
    assert_eq!(run(&mut interp, "first"), "1");
    assert!(run(&mut interp, "second").contains("undefined-variable-access"));
}

#[test]
fn test_constants_table_is_a_lookup_fallback() {
    let mut interp = new_interp();
    interp.set_constants(&[("screen-width", 240), ("screen-height", 160)]);
    assert_eq!(run(&mut interp, "(+ screen-width screen-height)"), "400");
    assert_eq!(run(&mut interp, "(set 'screen-width 9) screen-width"), "9");
}

#[test]
fn test_compiled_tail_calls_bound_only_by_time() {
    let mut interp = new_interp();
    run(
        &mut interp,
        "(set 'f (compile (lambda (if (equal $0 0) 'done (f (- $0 1))))))",
    );
    assert_eq!(run(&mut interp, "(f 200000)"), "done");
    // The operand stack returns to its resting depth.
    assert_eq!(run(&mut interp, "(f 10)"), "done");
}

#[test]
fn test_compile_and_eval_agree() {
    let mut interp = new_interp();
    let programs = [
        "(+ 1 2 3)",
        "(let ((a 5)) (* a a))",
        "(if (> 3 2) 'bigger 'smaller)",
        "(cons 1 (cons 2 nil))",
        "'(a b (c))",
    ];
    for program in programs {
        let direct = run(&mut interp, program);
        let compiled = run(
            &mut interp,
            &format!("((compile (lambda {program})))"),
        );
        assert_eq!(direct, compiled, "eval/VM divergence for {program}");
    }
}

#[test]
fn test_module_blob_loads_and_runs() {
    let mut interp = new_interp();

    // Module: (set 'answer 42) expressed as relocatable bytecode.
    let code = [
        Opcode::PushSymbolRelocatable as u8,
        0,
        0,
        Opcode::PushSmallInteger as u8,
        42,
        Opcode::LoadVarRelocatable as u8,
        1,
        0,
        Opcode::Funcall2 as u8,
        Opcode::Ret as u8,
    ];
    let mut blob = Vec::new();
    blob.extend_from_slice(&2u16.to_le_bytes());
    blob.extend_from_slice(&(code.len() as u16).to_le_bytes());
    blob.extend_from_slice(b"answer\0set\0");
    blob.extend_from_slice(&code);

    let function = interp.load_module(&blob).expect("module loads");
    assert_eq!(interp.type_of(function), TypeTag::Function);
    interp.funcall(function, 0);
    interp.pop_op(); // call result
    interp.pop_op(); // loaded function

    assert_eq!(run(&mut interp, "answer"), "42");
}

#[test]
fn test_module_blob_errors_are_host_results() {
    let mut interp = new_interp();
    assert_eq!(
        interp.load_module(&[7]),
        Err(ModuleError::TruncatedHeader)
    );
}

struct CapturePlatform {
    lines: Rc<RefCell<Vec<String>>>,
}

impl Platform for CapturePlatform {
    fn fatal(&self, msg: &str) -> ! {
        panic!("fatal: {msg}");
    }
    fn sleep(&self, _ticks: u32) {}
    fn make_scratch_buffer(&self) -> ScratchBufferRef {
        Rc::new(ScratchBuffer::new())
    }
    fn scratch_buffers_remaining(&self) -> usize {
        usize::MAX
    }
    fn console_print_line(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }
}

#[test]
fn test_disassemble_prints_instructions() {
    let lines = Rc::new(RefCell::new(Vec::new()));
    let mut interp = Interp::new(Box::new(CapturePlatform {
        lines: lines.clone(),
    }));

    run(
        &mut interp,
        "(set 'f (compile (lambda (if $0 1 2)))) (disassemble f)",
    );

    let captured = lines.borrow().join("\n");
    assert!(captured.contains("ARG0"), "missing ARG0 in {captured}");
    assert!(
        captured.contains("JUMP_IF_FALSE"),
        "missing JUMP_IF_FALSE in {captured}"
    );
    assert!(captured.contains("RET"), "missing RET in {captured}");

    // Source functions print their expression list instead.
    lines.borrow_mut().clear();
    run(&mut interp, "(set 'g (lambda (+ 1 1))) (disassemble g)");
    let captured = lines.borrow().join("\n");
    assert!(captured.contains("(+ 1 1)"), "got {captured}");
}

#[test]
fn test_operand_stack_returns_to_resting_depth() {
    let mut interp = new_interp();
    let depth = interp.operand_stack_len();
    run(&mut interp, "(map (lambda (+ $0 1)) (range 20))");
    run(&mut interp, "(let ((a 1) (b 2)) (list a b))");
    run(&mut interp, "(filter (lambda (> $0 5)) (range 10))");
    assert_eq!(interp.operand_stack_len(), depth);
}

#[test]
fn test_value_construction_api() {
    let mut interp = new_interp();

    let n = interp.make_integer(7);
    assert_eq!(interp.type_of(n), TypeTag::Integer);
    assert_eq!(interp.integer_value(n), 7);

    let s = interp.make_string("scrap");
    interp.gc_protect(s);
    assert_eq!(interp.type_of(s), TypeTag::String);
    assert_eq!(interp.string_value(s), "scrap");

    let sym = interp.make_symbol("torch");
    interp.gc_protect(sym);
    let pair = interp.make_cons(sym, s);
    assert_eq!(interp.format(pair), "'(torch . \"scrap\")");

    let ud = interp.make_userdata(0xdead_beef);
    assert_eq!(interp.type_of(ud), TypeTag::UserData);

    let list = interp.make_list(4);
    assert_eq!(interp.list_length(list), 4);

    interp.gc_unprotect();
    interp.gc_unprotect();
}

#[test]
fn test_nested_host_reentry() {
    let mut interp = new_interp();
    // eval of a read of a string, all within one dostring entry.
    assert_eq!(
        run(&mut interp, "(eval (read \"(apply * '(2 3 7))\"))"),
        "42"
    );
    assert!(!interp.is_executing());
}

#[test]
fn test_userdata_is_opaque_to_collection() {
    let mut interp = new_interp();
    let ud = interp.make_userdata(12345);
    interp.gc_protect(ud);
    interp.collect_garbage();
    match interp.type_of(ud) {
        TypeTag::UserData => {}
        other => panic!("userdata collected into {other:?}"),
    }
    interp.gc_unprotect();
}
