//! End-to-end interpreter tests: source in, output and diagnostics out.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use lox_vm::{InterpretError, Vm};

/// A cloneable sink capturing everything the VM writes.
#[derive(Clone, Default)]
struct Sink(Rc<RefCell<Vec<u8>>>);

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Sink {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("utf8 output")
    }
}

fn capture() -> (Vm, Sink, Sink) {
    let out = Sink::default();
    let err = Sink::default();
    let vm = Vm::with_sinks(Box::new(out.clone()), Box::new(err.clone()));
    (vm, out, err)
}

fn run(source: &str) -> (Result<(), InterpretError>, String, String) {
    let (mut vm, out, err) = capture();
    let result = vm.interpret(source);
    (result, out.contents(), err.contents())
}

/// Runs a program expected to succeed and returns its stdout.
fn run_ok(source: &str) -> String {
    let (result, out, err) = run(source);
    assert_eq!(result, Ok(()), "unexpected failure:\n{err}");
    out
}

/// Runs a program expected to die at runtime; returns its stderr.
fn run_runtime_error(source: &str) -> String {
    let (result, _, err) = run(source);
    assert_eq!(result, Err(InterpretError::Runtime), "expected runtime error");
    err
}

// ==================== EXPRESSIONS AND PRINTING ====================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print 2 + 3 * 4 - 6 / 2;"), "11\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print -4 + 2;"), "-2\n");
}

#[test]
fn number_formatting_matches_printf_g() {
    assert_eq!(run_ok("print 10 / 4;"), "2.5\n");
    assert_eq!(run_ok("print 1 / 3;"), "0.333333\n");
    assert_eq!(run_ok("print 0.1 + 0.2;"), "0.3\n");
    assert_eq!(run_ok("print 1000000;"), "1e+06\n");
    assert_eq!(run_ok("print 100000;"), "100000\n");
    assert_eq!(run_ok("print 1 / 0;"), "inf\n");
}

#[test]
fn comparisons_and_equality() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 1;"), "false\n");
    assert_eq!(run_ok("print 3 > 2;"), "true\n");
    assert_eq!(run_ok("print 3 >= 4;"), "false\n");
    assert_eq!(run_ok("print 1 == 1;"), "true\n");
    assert_eq!(run_ok("print 1 != 1;"), "false\n");
    assert_eq!(run_ok("print nil == nil;"), "true\n");
    // Different kinds never compare equal.
    assert_eq!(run_ok("print 0 == false;"), "false\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
}

#[test]
fn string_equality_through_interning() {
    assert_eq!(run_ok("print \"ab\" == \"ab\";"), "true\n");
    assert_eq!(run_ok("print \"a\" + \"b\" == \"ab\";"), "true\n");
    assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
}

#[test]
fn concatenation_stringifies_either_side() {
    assert_eq!(run_ok("print \"a\" + \"b\";"), "ab\n");
    assert_eq!(run_ok("print \"n=\" + 5;"), "n=5\n");
    assert_eq!(run_ok("print 5 + \"!\";"), "5!\n");
    assert_eq!(run_ok("print \"v:\" + nil;"), "v:nil\n");
    assert_eq!(run_ok("print \"b:\" + true;"), "b:true\n");
}

#[test]
fn add_rejects_other_mixes() {
    let err = run_runtime_error("print nil + 1;");
    assert!(err.contains("Operands must be numbers or strings."));
}

#[test]
fn bitwise_and_shift_operators() {
    assert_eq!(run_ok("print 5 & 3;"), "1\n");
    assert_eq!(run_ok("print 5 | 3;"), "7\n");
    assert_eq!(run_ok("print 5 ^ 3;"), "6\n");
    assert_eq!(run_ok("print 1 << 10;"), "1024\n");
    assert_eq!(run_ok("print 1024 >> 3;"), "128\n");
    assert_eq!(run_ok("print 6 & 3 | 8;"), "10\n");
}

#[test]
fn invert_is_minus_x_minus_one() {
    assert_eq!(run_ok("print ~5;"), "-6\n");
    assert_eq!(run_ok("print ~0;"), "-1\n");
    // Not a true bitwise op on fractions, by definition.
    assert_eq!(run_ok("print ~2.5;"), "-3.5\n");
}

#[test]
fn truthiness_in_conditions() {
    let source = "\
if (0) print \"t\"; else print \"f\";
if (\"\") print \"t\"; else print \"f\";
if (nil) print \"t\"; else print \"f\";
if (false) print \"t\"; else print \"f\";
if (\"x\") print \"t\"; else print \"f\";
if (0.5) print \"t\"; else print \"f\";
";
    assert_eq!(run_ok(source), "f\nf\nf\nf\nt\nt\n");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(run_ok("print false and 1;"), "false\n");
    assert_eq!(run_ok("print true and 1;"), "1\n");
    assert_eq!(run_ok("print false or 2;"), "2\n");
    assert_eq!(run_ok("print \"x\" or 2;"), "x\n");
    // The right side must not run when short-circuited.
    let source = "\
var ran = false;
fun effect() { ran = true; return true; }
var v = false and effect();
print ran;
";
    assert_eq!(run_ok(source), "false\n");
}

#[test]
fn not_operator() {
    assert_eq!(run_ok("print !true;"), "false\n");
    assert_eq!(run_ok("print !0;"), "true\n");
    assert_eq!(run_ok("print !\"\";"), "true\n");
    assert_eq!(run_ok("print !!nil;"), "false\n");
}

// ==================== VARIABLES AND SCOPE ====================

#[test]
fn globals_define_get_set() {
    assert_eq!(run_ok("var a = 1; print a; a = 2; print a;"), "1\n2\n");
    // Redefinition is allowed for globals.
    assert_eq!(run_ok("var a = 1; var a = 2; print a;"), "2\n");
    // Declaration without initialiser yields nil.
    assert_eq!(run_ok("var a; print a;"), "nil\n");
}

#[test]
fn locals_shadow_and_unwind() {
    let source = "\
var a = \"global\";
{
  var a = \"outer\";
  {
    var a = \"inner\";
    print a;
  }
  print a;
}
print a;
";
    assert_eq!(run_ok(source), "inner\nouter\nglobal\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run_ok("var a; var b; a = b = 3; print a; print b;"), "3\n3\n");
}

#[test]
fn undefined_variable_read_is_runtime_error() {
    let err = run_runtime_error("print x;");
    assert!(err.contains("Undefined variable 'x'."));
    assert!(err.contains("[line 1] in script"));
}

#[test]
fn undefined_variable_write_is_runtime_error() {
    let err = run_runtime_error("x = 1;");
    assert!(err.contains("Undefined variable 'x'."));
    // The failed assignment must not have created the global.
    let (mut vm, _, err_sink) = capture();
    let _ = vm.interpret("x = 1;");
    let result = vm.interpret("print x;");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert!(err_sink.contents().matches("Undefined variable 'x'.").count() == 2);
}

// ==================== CONTROL FLOW ====================

#[test]
fn while_loop() {
    let source = "\
var sum = 0;
var i = 1;
while (i <= 10) {
  sum = sum + i;
  i = i + 1;
}
print sum;
";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn for_loop() {
    assert_eq!(
        run_ok("for (var i = 0; i < 3; i = i + 1) print i;"),
        "0\n1\n2\n"
    );
    // All three clauses optional; break required to leave.
    assert_eq!(
        run_ok("var i = 0; for (;;) { i = i + 1; if (i == 3) break; } print i;"),
        "3\n"
    );
}

#[test]
fn break_exits_the_loop() {
    let source = "\
var i = 0;
while (i < 10) {
  var x = i;
  i = i + 1;
  if (x == 3) break;
}
print i;
";
    assert_eq!(run_ok(source), "4\n");
}

#[test]
fn continue_targets_the_increment() {
    let source = "\
for (var i = 0; i < 5; i = i + 1) {
  if (i == 2) continue;
  print i;
}
";
    assert_eq!(run_ok(source), "0\n1\n3\n4\n");
}

#[test]
fn continue_in_while_returns_to_condition() {
    let source = "\
var i = 0;
var printed = 0;
while (i < 5) {
  i = i + 1;
  if (i == 2) continue;
  printed = printed + 1;
}
print printed;
";
    assert_eq!(run_ok(source), "4\n");
}

#[test]
fn nested_loops_break_inner_only() {
    let source = "\
var total = 0;
for (var i = 0; i < 3; i = i + 1) {
  for (var j = 0; j < 10; j = j + 1) {
    if (j == 2) break;
    total = total + 1;
  }
}
print total;
";
    assert_eq!(run_ok(source), "6\n");
}

// ==================== FUNCTIONS AND CLOSURES ====================

#[test]
fn recursive_fibonacci() {
    let source = "\
fun f(n) { if (n < 2) return n; return f(n-1) + f(n-2); }
print f(10);
";
    assert_eq!(run_ok(source), "55\n");
}

#[test]
fn functions_print_their_names() {
    let source = "\
fun greet() {}
print greet;
print clock;
var anon = fun () { return 1; };
print anon;
";
    assert_eq!(
        run_ok(source),
        "<fun greet>\n<native fun>\n<fun <script>.<anonymous>>\n"
    );
}

#[test]
fn lambda_expressions_are_values() {
    assert_eq!(
        run_ok("var double = fun (x) { return x * 2; }; print double(21);"),
        "42\n"
    );
}

#[test]
fn implicit_return_is_nil() {
    assert_eq!(run_ok("fun f() {} print f();"), "nil\n");
    assert_eq!(run_ok("fun f() { return; } print f();"), "nil\n");
}

#[test]
fn closures_capture_and_mutate_shared_state() {
    let source = "\
var c;
{
  var x = 1;
  fun g() { x = x + 1; return x; }
  c = g;
}
print c();
print c();
";
    assert_eq!(run_ok(source), "2\n3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "\
var get;
var set;
{
  var value = 10;
  fun getter() { return value; }
  fun setter(v) { value = v; }
  get = getter;
  set = setter;
}
set(99);
print get();
";
    assert_eq!(run_ok(source), "99\n");
}

#[test]
fn transitive_capture_through_nested_functions() {
    let source = "\
fun outer() {
  var x = \"captured\";
  fun middle() {
    fun inner() { return x; }
    return inner;
  }
  return middle();
}
print outer()();
";
    assert_eq!(run_ok(source), "captured\n");
}

#[test]
fn arity_mismatch_is_runtime_error() {
    let err = run_runtime_error("fun f(a) { return a; } f();");
    assert!(err.contains("Expected 1 arguments but got 0"));
}

#[test]
fn unbounded_recursion_overflows() {
    let err = run_runtime_error("fun f() { f(); } f();");
    assert!(err.contains("Stack overflow."));
}

#[test]
fn calling_a_non_callable_fails() {
    let err = run_runtime_error("var x = 1; x();");
    assert!(err.contains("Can only call functions and classes."));
}

#[test]
fn stack_trace_lists_frames_innermost_first() {
    let source = "\
fun inner() { return missing; }
fun outer() { return inner(); }
outer();
";
    let err = run_runtime_error(source);
    let inner_at = err.find("in inner()").expect("inner frame");
    let outer_at = err.find("in outer()").expect("outer frame");
    let script_at = err.find("in script").expect("script frame");
    assert!(inner_at < outer_at && outer_at < script_at, "trace order:\n{err}");
    assert!(err.contains("[line 1] in inner()"));
    assert!(err.contains("[line 2] in outer()"));
    assert!(err.contains("[line 3] in script"));
}

// ==================== CLASSES ====================

#[test]
fn methods_inherit_across_classes() {
    let source = "\
class A { greet() { print \"hi\"; } }
class B < A {}
B().greet();
";
    assert_eq!(run_ok(source), "hi\n");
}

#[test]
fn init_sets_fields_and_properties_mutate() {
    let source = "\
class C { init(v) { this.v = v; } }
var o = C(7);
print o.v;
o.v = 42;
print o.v;
";
    assert_eq!(run_ok(source), "7\n42\n");
}

#[test]
fn methods_see_this() {
    let source = "\
class Counter {
  init() { this.n = 0; }
  bump() { this.n = this.n + 1; return this.n; }
}
var c = Counter();
c.bump();
print c.bump();
";
    assert_eq!(run_ok(source), "2\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "\
class Greeter {
  init(name) { this.name = name; }
  greet() { print \"hello \" + this.name; }
}
var m = Greeter(\"world\").greet;
m();
";
    assert_eq!(run_ok(source), "hello world\n");
}

#[test]
fn fields_shadow_methods_on_invoke() {
    let source = "\
class C { act() { print \"method\"; } }
var o = C();
o.field = fun () { print \"field\"; };
o.field();
o.act();
";
    assert_eq!(run_ok(source), "field\nmethod\n");
}

#[test]
fn subclass_overrides_and_super_calls() {
    let source = "\
class A {
  describe() { return \"A\"; }
  both() { return this.describe(); }
}
class B < A {
  describe() { return \"B(\" + super.describe() + \")\"; }
}
print B().describe();
print B().both();
";
    assert_eq!(run_ok(source), "B(A)\nB(A)\n");
}

#[test]
fn super_invoke_dispatches_on_the_superclass() {
    let source = "\
class A { m() { print \"from A\"; } }
class B < A { m() { super.m(); print \"from B\"; } }
B().m();
";
    assert_eq!(run_ok(source), "from A\nfrom B\n");
}

#[test]
fn init_returns_the_instance() {
    let source = "\
class C { init() { this.ready = true; } }
var o = C();
print o.ready;
print getTypeName(o);
";
    assert_eq!(run_ok(source), "true\nC\n");
}

#[test]
fn nullary_class_call_requires_no_args() {
    let err = run_runtime_error("class C {} C(1);");
    assert!(err.contains("Expected 0 arguments but got 1"));
}

#[test]
fn missing_property_cites_receiver_and_name() {
    let err = run_runtime_error("class C {} var o = C(); print o.ghost;");
    assert!(err.contains("Undefined property 'ghost'"));
    assert!(err.contains("C instance"));
}

#[test]
fn property_access_on_non_instances_fails() {
    let err = run_runtime_error("var x = 1; print x.field;");
    assert!(err.contains("Only instances have properties."));
    let err = run_runtime_error("var x = 1; x.field = 2;");
    assert!(err.contains("Only instances have fields."));
    let err = run_runtime_error("var x = 1; x.method();");
    assert!(err.contains("Only instances have methods."));
}

#[test]
fn inheriting_from_a_non_class_fails() {
    let err = run_runtime_error("var NotAClass = 1; class B < NotAClass {}");
    assert!(err.contains("Superclass must be a class."));
}

#[test]
fn class_values_stringify() {
    let source = "\
class Point {}
print Point;
var p = Point();
print getTypeName(Point);
";
    assert_eq!(run_ok(source), "<class Point>\nclass\n");
}

// ==================== ARRAYS ====================

#[test]
fn array_literals_index_and_assign() {
    let source = "\
var a = [10, 20, 30];
a[1] = 99;
print a[0] + a[1] + a[2];
";
    assert_eq!(run_ok(source), "129\n");
}

#[test]
fn arrays_stringify_by_length() {
    assert_eq!(run_ok("print [1, 2, 3];"), "<array of length 3>\n");
    assert_eq!(run_ok("print [];"), "<array of length 0>\n");
}

#[test]
fn array_index_errors() {
    let err = run_runtime_error("var a = [1]; print a[1];");
    assert!(err.contains("Array index out of range."));
    let err = run_runtime_error("var a = [1]; print a[-1];");
    assert!(err.contains("Array index out of range."));
    let err = run_runtime_error("var a = [1]; print a[\"x\"];");
    assert!(err.contains("Array index must be a number."));
    let err = run_runtime_error("var n = 1; print n[0];");
    assert!(err.contains("Can only subscript arrays."));
}

#[test]
fn fractional_indices_truncate() {
    assert_eq!(run_ok("var a = [7, 8]; print a[1.9];"), "8\n");
}

#[test]
fn arrays_hold_mixed_values() {
    let source = "\
var a = [1, \"two\", nil, true];
print a[1];
print a[2];
print a[3];
";
    assert_eq!(run_ok(source), "two\nnil\ntrue\n");
}

// ==================== NATIVES ====================

#[test]
fn native_to_string_and_type_names() {
    let source = "\
print toString(2.5);
print toString(nil) + \"!\";
print getTypeName(1);
print getTypeName(\"s\");
print getTypeName(nil);
print getTypeName(true);
print getTypeName([1]);
print getTypeName(toString);
fun f() {}
print getTypeName(f);
";
    assert_eq!(
        run_ok(source),
        "2.5\nnil!\nnumber\nstring\nnil\nboolean\narray\nnative\nclosure\n"
    );
}

#[test]
fn native_has_get_set() {
    let source = "\
class C { init() { this.x = 1; } m() { return 9; } }
var o = C();
print has(o, \"x\");
print has(o, \"y\");
print has(1, \"x\");
print get(o, \"x\");
set(o, \"y\", 5);
print o.y;
var m = get(o, \"m\");
print m();
";
    assert_eq!(run_ok(source), "true\nfalse\nfalse\n1\n5\n9\n");
}

#[test]
fn native_size() {
    assert_eq!(run_ok("print size(\"hello\");"), "5\n");
    assert_eq!(run_ok("print size([1, 2, 3]);"), "3\n");
    let err = run_runtime_error("print size(1);");
    assert!(err.contains("Only strings, arrays, and tables have size/length"));
}

#[test]
fn native_errors_carry_stack_traces() {
    let err = run_runtime_error("fun f() { return get(1, \"x\"); } f();");
    assert!(err.contains("Undefined property 'x'"));
    assert!(err.contains("in f()"));
}

#[test]
fn native_get_rejects_non_string_names() {
    let err = run_runtime_error("get(1, 2);");
    assert!(err.contains("Cannot have non-string property of object"));
}

#[test]
fn clock_advances_monotonically() {
    assert_eq!(run_ok("print clock() >= 0;"), "true\n");
    assert_eq!(run_ok("var a = clock(); var b = clock(); print b >= a;"), "true\n");
}

#[test]
fn native_arg_counts_are_checked() {
    let err = run_runtime_error("toString();");
    assert!(err.contains("Expected 1 arguments but got 0"));
}

// ==================== VM LIFECYCLE ====================

#[test]
fn globals_persist_across_interpret_calls() {
    let (mut vm, out, _) = capture();
    assert_eq!(vm.interpret("var a = 1;"), Ok(()));
    assert_eq!(vm.interpret("fun bump() { a = a + 1; }"), Ok(()));
    assert_eq!(vm.interpret("bump(); bump(); print a;"), Ok(()));
    assert_eq!(out.contents(), "3\n");
}

#[test]
fn vm_recovers_after_runtime_error() {
    let (mut vm, out, _) = capture();
    assert_eq!(vm.interpret("print missing;"), Err(InterpretError::Runtime));
    assert_eq!(vm.stack_depth(), 0, "stacks reset after a runtime error");
    assert_eq!(vm.interpret("print 2 + 2;"), Ok(()));
    assert_eq!(out.contents(), "4\n");
}

#[test]
fn compile_errors_do_not_touch_execution_state() {
    let (mut vm, out, err) = capture();
    assert_eq!(vm.interpret("var a = 1;"), Ok(()));
    assert_eq!(vm.interpret("var = ;"), Err(InterpretError::Compile));
    assert!(err.contents().contains("Error"));
    assert_eq!(vm.interpret("print a;"), Ok(()));
    assert_eq!(out.contents(), "1\n");
}

#[test]
fn stack_is_empty_after_clean_runs() {
    let (mut vm, _, _) = capture();
    assert_eq!(vm.interpret("var a = [1, 2]; fun f() { return a; } f();"), Ok(()));
    assert_eq!(vm.stack_depth(), 0);
}

// ==================== GARBAGE COLLECTION ====================

#[test]
fn stress_collection_preserves_program_behavior() {
    let source = "\
class Node {
  init(value) { this.value = value; this.next = nil; }
}
fun build(n) {
  var head = nil;
  for (var i = 0; i < n; i = i + 1) {
    var node = Node(i);
    node.next = head;
    head = node;
  }
  return head;
}
var list = build(50);
var sum = 0;
while (list != nil) {
  sum = sum + list.value;
  list = list.next;
}
print sum + \" done\";
";
    let (mut vm, out, err) = capture();
    vm.heap_mut().set_stress(true);
    assert_eq!(vm.interpret(source), Ok(()), "errors:\n{}", err.contents());
    assert_eq!(out.contents(), "1225 done\n");
}

#[test]
fn stress_collection_keeps_closures_alive() {
    let source = "\
fun adder(n) {
  return fun (x) { return x + n; };
}
var add5 = adder(5);
var garbage = 0;
for (var i = 0; i < 100; i = i + 1) {
  garbage = garbage + size(toString(i));
}
print add5(37);
";
    let (mut vm, out, _) = capture();
    vm.heap_mut().set_stress(true);
    assert_eq!(vm.interpret(source), Ok(()));
    assert_eq!(out.contents(), "42\n");
}

#[test]
fn collection_reclaims_garbage_objects() {
    let source = "\
for (var i = 0; i < 200; i = i + 1) {
  var droplet = [toString(i), toString(i + 1)];
}
print \"ok\";
";
    let (mut vm, out, _) = capture();
    vm.heap_mut().set_stress(true);
    assert_eq!(vm.interpret(source), Ok(()));
    assert_eq!(out.contents(), "ok\n");
    let stats = vm.heap().stats();
    assert!(stats.collections > 0, "stress mode must have collected");
    // The loop's droplets are all dead; only globals-reachable objects and
    // interned leftovers survive, far fewer than were allocated.
    assert!(stats.live_objects < 500, "live: {}", stats.live_objects);
}
