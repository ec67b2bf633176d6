//! Edge case tests for the compiler: error reporting, emission forms, and
//! the scope/closure bookkeeping.

use crate::{compile, CompileError};
use lox_runtime::{disasm, Heap, ObjRef, Table, Value};

/// Compiles a source string against a fresh heap, returning the result, the
/// collected diagnostics, and the heap for inspection.
fn try_compile(source: &str) -> (Result<ObjRef, CompileError>, String, Heap) {
    let mut heap = Heap::new();
    let globals = Table::new();
    let init_string = heap.intern("init");
    let mut err: Vec<u8> = Vec::new();
    let result = compile(source, &mut heap, &globals, init_string, &mut err);
    let diagnostics = String::from_utf8(err).expect("utf8 diagnostics");
    (result, diagnostics, heap)
}

fn disassemble(source: &str) -> String {
    let (result, diagnostics, heap) = try_compile(source);
    let function = match result {
        Ok(function) => function,
        Err(_) => panic!("expected successful compile, got:\n{diagnostics}"),
    };
    let mut out = Vec::new();
    disasm::disassemble_function(&heap, function, &mut out).expect("write to vec");
    String::from_utf8(out).expect("utf8 disassembly")
}

fn expect_error(source: &str, message: &str) {
    let (result, diagnostics, _) = try_compile(source);
    assert!(result.is_err(), "expected compile error for: {source}");
    assert!(
        diagnostics.contains(message),
        "expected {message:?} in:\n{diagnostics}"
    );
}

// ==================== SUCCESSFUL EMISSION ====================

#[test]
fn arithmetic_uses_byte_num_compression() {
    let text = disassemble("print 1 + 2 * 3;");
    assert!(text.contains("ByteNum 1"));
    assert!(text.contains("ByteNum 2"));
    assert!(text.contains("ByteNum 3"));
    assert!(text.contains("Multiply"));
    assert!(text.contains("Add"));
    assert!(text.contains("Print"));
    assert!(text.contains("ReturnNil"));
}

#[test]
fn byte_num_boundaries() {
    // 255 fits the compressed form, 256 and fractions do not.
    let text = disassemble("print 255; print 256; print 2.5; print -3;");
    assert!(text.contains("ByteNum 255"));
    assert!(text.contains("Constant 0 '256'"));
    assert!(text.contains("'2.5'"));
    // Negative literals are unary negation over a positive literal.
    assert!(text.contains("ByteNum 3"));
    assert!(text.contains("Negate"));
}

#[test]
fn string_constants_are_deduped_per_chunk() {
    let (result, _, heap) = try_compile("var a = \"x\"; var b = \"x\"; var c = \"y\";");
    let function = result.expect("compiles");
    let constants = &heap.function(function).chunk.constants;
    let xs = constants
        .iter()
        .filter(|&&c| matches!(c, Value::Obj(_)) && heap.stringify(c) == "x")
        .count();
    assert_eq!(xs, 1, "the string \"x\" should occupy one pool slot");
}

#[test]
fn long_constant_form_past_256_entries() {
    // Force more than 256 distinct pool entries in one chunk; index 255 is
    // the last one the short form can encode.
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("print \"s{i}\";\n"));
    }
    let text = disassemble(&source);
    assert!(text.contains("Constant 0 's0'"));
    assert!(text.contains("Constant 255 's255'"));
    assert!(text.contains("ConstantLong 256 's256'"));
    assert!(text.contains("ConstantLong 299 's299'"));
    assert!(!text.contains("Constant 256 "));
}

#[test]
fn constant_pool_overflows_at_65537_entries() {
    // Indices 0..=65535 are addressable; one more is a compile error.
    let mut source = String::with_capacity(1 << 20);
    for i in 0..65_537 {
        source.push_str(&format!("print \"k{i}\";\n"));
    }
    expect_error(&source, "Too many constants in one chunk. (max is 65536)");
}

#[test]
fn globals_compile_to_late_bound_names() {
    let text = disassemble("var answer = 42; print answer;");
    assert!(text.contains("DefineGlobal"));
    assert!(text.contains("GetGlobal"));
}

#[test]
fn locals_compile_to_slots() {
    let text = disassemble("{ var a = 1; print a; a = 2; }");
    assert!(text.contains("GetLocal 1"));
    assert!(text.contains("SetLocal 1"));
    assert!(text.contains("Pop"));
    assert!(!text.contains("GetGlobal"));
}

#[test]
fn closures_record_captured_locals() {
    let text = disassemble(
        "fun outer() {\n  var x = 1;\n  fun inner() { return x; }\n  return inner;\n}\n",
    );
    assert!(text.contains("Closure"));
    assert!(text.contains("local 1"));
    assert!(text.contains("GetUpvalue 0"));
}

#[test]
fn captured_block_locals_close_at_scope_exit() {
    // Leaving the inner block must close the captured slot, not pop it.
    let text = disassemble(
        "var f;\n{ var x = 1; fun g() { x = x + 1; } f = g; }\n",
    );
    assert!(text.contains("CloseUpvalue"));
    assert!(text.contains("SetUpvalue 0"));
}

#[test]
fn transitive_capture_goes_through_enclosing_upvalues() {
    let text = disassemble(
        "fun a() {\n  var x = 1;\n  fun b() {\n    fun c() { return x; }\n  }\n}\n",
    );
    // c reaches x through b's upvalue, not b's locals.
    assert!(text.contains("upvalue 0"));
}

#[test]
fn lambda_is_named_after_enclosing_function() {
    let text = disassemble("var f = fun () { return 1; };");
    assert!(text.contains("fun <script>.<anonymous>"));
}

#[test]
fn control_flow_emits_jumps() {
    let text = disassemble("if (true) print 1; else print 2;");
    assert!(text.contains("JumpIfFalse"));
    assert!(text.contains("Jump"));

    let text = disassemble("while (true) print 1;");
    assert!(text.contains("JumpBackwards"));

    let text = disassemble("var a = true and false or true;");
    assert!(text.contains("JumpIfFalse"));
    assert!(text.contains("JumpIfTrue"));
}

#[test]
fn class_emission() {
    let text = disassemble(
        "class A { init(v) { this.v = v; } get() { return this.v; } }\nclass B < A {}\n",
    );
    assert!(text.contains("Class 0 'A'"));
    assert!(text.contains("Method"));
    assert!(text.contains("Inherit"));
    assert!(text.contains("SetProperty"));
    assert!(text.contains("GetProperty"));
    // Initialisers return `this` (slot 0) implicitly.
    assert!(text.contains("GetLocal 0"));
}

#[test]
fn super_emission() {
    let text = disassemble(
        "class A { m() {} }\nclass B < A { m() { super.m(); return super.m; } }\n",
    );
    assert!(text.contains("SuperInvoke"));
    assert!(text.contains("GetSuper"));
}

#[test]
fn array_emission() {
    let text = disassemble("var a = [1, 2, 3]; a[0] = a[1];");
    assert!(text.contains("NewArray 3"));
    assert!(text.contains("Subscript 1"));
    assert!(text.contains("SubscriptAssign 1"));
}

#[test]
fn bitwise_and_shift_emission() {
    let text = disassemble("print 1 & 2 | 3 ^ 4 << 5 >> 6; print ~7;");
    for op in ["BitAnd", "BitOr", "BitXor", "ShiftLeft", "ShiftRight", "Invert"] {
        assert!(text.contains(op), "missing {op} in:\n{text}");
    }
}

#[test]
fn bare_return_is_allowed_at_top_level() {
    let (result, _, _) = try_compile("print 1; return;");
    assert!(result.is_ok());
}

// ==================== COMPILE ERRORS ====================

#[test]
fn read_in_own_initializer() {
    expect_error(
        "{ var a = a; }",
        "Can't read local variable in its own initializer.",
    );
}

#[test]
fn self_inheritance() {
    expect_error("class A < A {}", "A class can't inherit from itself.");
}

#[test]
fn invalid_assignment_target() {
    expect_error("1 + 2 = 3;", "Invalid assignment target.");
    expect_error("a * b = 3;", "Invalid assignment target.");
}

#[test]
fn duplicate_local() {
    expect_error(
        "{ var a = 1; var a = 2; }",
        "Already a variable with this name in this scope.",
    );
}

#[test]
fn this_and_super_outside_class() {
    expect_error("print this;", "Can't use 'this' outside of a class.");
    expect_error("print super.x;", "Can't use 'super' outside of a class.");
    expect_error(
        "class A { m() { return super.m; } }",
        "Can't use 'super' in a class with no superclass.",
    );
}

#[test]
fn value_returns_rejected_where_forbidden() {
    expect_error("return 1;", "Can't return a value from top-level code.");
    expect_error(
        "class A { init() { return 1; } }",
        "Can't return a value from an initializer.",
    );
}

#[test]
fn break_and_continue_need_a_loop() {
    expect_error("break;", "No loop to break out of.");
    expect_error("continue;", "No loop to continue to top of.");
}

#[test]
fn one_break_per_loop() {
    expect_error(
        "while (true) { if (1) break; break; }",
        "Too many break statements in loop.",
    );
}

#[test]
fn statement_level_lambda_is_rejected() {
    expect_error(
        "fun () { return 1; };",
        "Can't have an anonymous function expression statement.",
    );
}

#[test]
fn unterminated_string_reports_scanner_message() {
    expect_error("print \"oops;", "Unterminated string.");
}

#[test]
fn unexpected_character_reports_scanner_message() {
    expect_error("print 1 @ 2;", "Unexpected character.");
}

#[test]
fn missing_semicolon() {
    expect_error("print 1", "Expect ';' after value.");
}

#[test]
fn panic_mode_suppresses_cascades_until_sync() {
    // Both statements are broken; each should report exactly once.
    let (_, diagnostics, _) = try_compile("var 1 = 2;\nvar 3 = 4;\n");
    let count = diagnostics.matches("Error").count();
    assert_eq!(count, 2, "one diagnostic per statement:\n{diagnostics}");
}

#[test]
fn compile_error_carries_count() {
    let (result, _, _) = try_compile("var 1;");
    match result {
        Err(error) => assert!(error.errors >= 1),
        Ok(_) => panic!("expected error"),
    }
}

#[test]
fn too_many_parameters_is_reported() {
    let params: Vec<String> = (0..260).map(|i| format!("p{i}")).collect();
    let source = format!("fun f({}) {{ }}", params.join(", "));
    expect_error(&source, "Can't have more than 255 parameters.");
}

#[test]
fn script_function_is_nameless() {
    let (result, _, heap) = try_compile("print 1;");
    let function = result.expect("compiles");
    assert!(heap.function(function).name.is_none());
    assert_eq!(heap.function(function).arity, 0);
}
