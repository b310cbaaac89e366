//! End-to-end interpreter tests.
//!
//! Each test feeds source through the full pipeline (scan, compile,
//! execute) and checks the value `interpret` hands back.

use lox_core::chunk::{Chunk, OpCode};
use lox_core::value::{ErrorKind, Value};
use lox_runtime::Vm;

fn number(vm: &mut Vm, source: &str) -> f64 {
    match vm.interpret(source) {
        Value::Number(n) => n,
        other => panic!("expected a number from {source:?}, got {other:?}"),
    }
}

fn string<'h>(vm: &'h mut Vm, source: &str) -> &'h str {
    match vm.interpret(source) {
        Value::Obj(handle) => vm.heap().string_text(handle),
        other => panic!("expected a string from {source:?}, got {other:?}"),
    }
}

#[test]
fn test_grouped_arithmetic() {
    let mut vm = Vm::new();
    assert_eq!(number(&mut vm, "return -((1.2 + 3.4) / 2);"), -2.3);
}

#[test]
fn test_precedence_mix() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("return !(5 - 4 > 3 * 2 == !nil);"),
        Value::Bool(true)
    );
}

#[test]
fn test_concat_interns_operands_and_result() {
    let mut vm = Vm::new();
    let before = vm.heap().strings.len();
    assert_eq!(string(&mut vm, "return \"hi\" + \"hi\";"), "hihi");
    // exactly "hi" and "hihi" were created
    assert_eq!(vm.heap().strings.len() - before, 2);
}

#[test]
fn test_string_equality_is_identity() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("return \"a\" + \"b\" == \"ab\";"),
        Value::Bool(true)
    );
    assert_eq!(
        vm.interpret("return \"ab\" == \"ac\";"),
        Value::Bool(false)
    );
}

#[test]
fn test_assignment_is_an_expression() {
    let mut vm = Vm::new();
    assert_eq!(number(&mut vm, "var x = 1; return x = 3 + 4;"), 7.0);
}

#[test]
fn test_assignment_precedence_rejected() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("var x = 1; return 2 * x = 3 + 4;"),
        Value::Error(ErrorKind::Compile)
    );
}

#[test]
fn test_function_call_and_return() {
    let mut vm = Vm::new();
    assert_eq!(
        number(&mut vm, "fun add1(x){return x+1;} return add1(2);"),
        3.0
    );
}

#[test]
fn test_function_without_return_yields_nil() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("fun noop() {} return noop();"), Value::Nil);
}

#[test]
fn test_arity_mismatch_unwinds_with_trace() {
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("fun a(){b();} fun b(){c();} fun c(){c(\"too\",\"many\");} a();"),
        Value::Error(ErrorKind::Runtime)
    );
}

#[test]
fn test_program_without_return_yields_nil() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("var x = 1; x + 1;"), Value::Nil);
}

#[test]
fn test_globals_read_write() {
    let mut vm = Vm::new();
    assert_eq!(
        number(&mut vm, "var a = 1; var b = 2; a = a + b; return a;"),
        3.0
    );
}

#[test]
fn test_locals_and_shadowing() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "var x = 1; { var x = 2; { var x = 3; } } return x;"
        ),
        1.0
    );
}

#[test]
fn test_if_else_branches() {
    let mut vm = Vm::new();
    assert_eq!(
        number(&mut vm, "var r = 0; if (true) r = 1; else r = 2; return r;"),
        1.0
    );
    assert_eq!(
        number(&mut vm, "var r = 0; if (false) r = 1; else r = 2; return r;"),
        2.0
    );
    assert_eq!(
        number(&mut vm, "var r = 0; if (false) r = 1; return r;"),
        0.0
    );
}

#[test]
fn test_logical_operators_keep_operand_values() {
    let mut vm = Vm::new();
    assert_eq!(number(&mut vm, "return 1 and 2;"), 2.0);
    assert_eq!(vm.interpret("return nil and 2;"), Value::Nil);
    assert_eq!(number(&mut vm, "return 1 or 2;"), 1.0);
    assert_eq!(number(&mut vm, "return false or 2;"), 2.0);
    assert_eq!(
        vm.interpret("return false or nil;"),
        Value::Nil
    );
}

#[test]
fn test_while_loop() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "var i = 0; var sum = 0; while (i < 5) { sum = sum + i; i = i + 1; } return sum;"
        ),
        10.0
    );
}

#[test]
fn test_for_loop_with_all_clauses() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "var sum = 0; for (var i = 1; i <= 4; i = i + 1) sum = sum + i; return sum;"
        ),
        10.0
    );
}

#[test]
fn test_for_loop_with_empty_clauses() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "var i = 0; for (;;) { i = i + 1; if (i == 3) return i; }"
        ),
        3.0
    );
}

#[test]
fn test_recursion() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } return fib(10);"
        ),
        55.0
    );
}

#[test]
fn test_closure_counter_shares_upvalue() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "fun makeCounter() {\n\
             var i = 0;\n\
             fun count() { i = i + 1; return i; }\n\
             return count;\n\
             }\n\
             var c = makeCounter();\n\
             c(); c();\n\
             return c();"
        ),
        3.0
    );
}

#[test]
fn test_two_closures_share_one_variable() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "fun pair() {\n\
             var n = 0;\n\
             fun bump() { n = n + 1; return n; }\n\
             fun read() { return n; }\n\
             bump(); bump();\n\
             return read();\n\
             }\n\
             return pair();"
        ),
        2.0
    );
}

#[test]
fn test_upvalue_closes_on_block_exit() {
    let mut vm = Vm::new();
    assert_eq!(
        string(
            &mut vm,
            "var keep;\n\
             {\n\
             var text = \"first\";\n\
             fun get() { return text; }\n\
             keep = get;\n\
             }\n\
             return keep();"
        ),
        "first"
    );
}

#[test]
fn test_division_by_zero_is_not_an_error() {
    let mut vm = Vm::new();
    assert_eq!(
        number(&mut vm, "return 1 / 0;"),
        f64::INFINITY
    );
    // 0/0 is NaN, which is not even equal to itself
    assert_eq!(
        vm.interpret("return 0 / 0 == 0 / 0;"),
        Value::Bool(false)
    );
}

#[test]
fn test_number_equality_across_expressions() {
    let mut vm = Vm::new();
    assert_eq!(vm.interpret("return 1 + 2 == 3;"), Value::Bool(true));
    assert_eq!(vm.interpret("return nil == false;"), Value::Bool(false));
    assert_eq!(vm.interpret("return true == 1;"), Value::Bool(false));
}

#[test]
fn test_interpret_chunk_hand_built() {
    // -((1.2 + 3.4) / 2), written out opcode by opcode
    let mut chunk = Chunk::new();
    let c0 = chunk.add_constant(Value::Number(1.2)) as u8;
    chunk.write_op(OpCode::Constant, 123);
    chunk.write(c0, 123);
    let c1 = chunk.add_constant(Value::Number(3.4)) as u8;
    chunk.write_op(OpCode::Constant, 123);
    chunk.write(c1, 123);
    chunk.write_op(OpCode::Add, 123);
    let c2 = chunk.add_constant(Value::Number(2.0)) as u8;
    chunk.write_op(OpCode::Constant, 123);
    chunk.write(c2, 123);
    chunk.write_op(OpCode::Divide, 123);
    chunk.write_op(OpCode::Negate, 123);
    chunk.write_op(OpCode::Return, 123);

    let mut vm = Vm::new();
    assert_eq!(vm.interpret_chunk(chunk), Value::Number(-2.3));
}

#[test]
fn test_interpret_chunk_interns_constants() {
    let mut vm = Vm::new();
    let mut chunk = Chunk::new();
    let hi1 = vm.heap_mut().intern("hi");
    let hi2 = vm.heap_mut().intern("hi");
    assert_eq!(hi1, hi2);
    let c0 = chunk.add_constant(Value::Obj(hi1)) as u8;
    let c1 = chunk.add_constant(Value::Obj(hi2)) as u8;
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(c0, 1);
    chunk.write_op(OpCode::Constant, 1);
    chunk.write(c1, 1);
    chunk.write_op(OpCode::Add, 1);
    chunk.write_op(OpCode::Return, 1);

    match vm.interpret_chunk(chunk) {
        Value::Obj(handle) => assert_eq!(vm.heap().string_text(handle), "hihi"),
        other => panic!("expected a string, got {other:?}"),
    }
}

#[test]
fn test_clock_native_is_preinstalled() {
    let mut vm = Vm::new();
    assert!(matches!(vm.interpret("return clock();"), Value::Number(_)));
}

#[test]
fn test_print_does_not_disturb_results() {
    let mut vm = Vm::new();
    assert_eq!(
        number(&mut vm, "print 1; print \"two\"; print nil; return 3;"),
        3.0
    );
}

#[test]
fn test_error_reporting_carries_source_line() {
    // errors should not poison later runs of the same VM
    let mut vm = Vm::new();
    assert_eq!(
        vm.interpret("var ok = 1;\nreturn ok + nil;"),
        Value::Error(ErrorKind::Runtime)
    );
    assert_eq!(number(&mut vm, "return ok;"), 1.0);
}

#[test]
fn test_deeply_nested_closures() {
    let mut vm = Vm::new();
    assert_eq!(
        number(
            &mut vm,
            "fun a() {\n\
             var x = 1;\n\
             fun b() {\n\
             fun c() { return x; }\n\
             return c;\n\
             }\n\
             return b;\n\
             }\n\
             return a()()();"
        ),
        1.0
    );
}
