//! Built-in interpreter self-tests.
//!
//! A handful of end-to-end scenarios runnable from a shipped binary
//! (`lox test`), each in a fresh VM. Useful as a smoke test where the
//! Rust test harness is not available.

use lox_core::chunk::{Chunk, OpCode};
use lox_core::debug::disassemble_chunk;
use lox_core::value::{ErrorKind, Value, format_value};
use lox_runtime::Vm;

struct Scenario {
    name: &'static str,
    run: fn() -> Result<(), String>,
}

const SCENARIOS: &[Scenario] = &[
    Scenario {
        name: "chunk arithmetic -((1.2 + 3.4) / 2)",
        run: chunk_arithmetic,
    },
    Scenario {
        name: "string interning and concatenation",
        run: intern_and_concat,
    },
    Scenario {
        name: "comparison precedence !(5 - 4 > 3 * 2 == !nil)",
        run: comparison_precedence,
    },
    Scenario {
        name: "assignment precedence var x = 1; return x = 3 + 4;",
        run: assignment_precedence,
    },
    Scenario {
        name: "invalid assignment target is a compile error",
        run: invalid_assignment_target,
    },
    Scenario {
        name: "function call with return value",
        run: function_call,
    },
    Scenario {
        name: "arity mismatch unwinds with a stack trace",
        run: arity_mismatch,
    },
];

pub fn run() -> i32 {
    println!("Running {} interpreter self-tests", SCENARIOS.len());
    let mut failed = 0;
    for scenario in SCENARIOS {
        match (scenario.run)() {
            Ok(()) => println!("  ok   {}", scenario.name),
            Err(message) => {
                failed += 1;
                println!("  FAIL {}: {message}", scenario.name);
            }
        }
    }
    if failed == 0 {
        println!("All {} self-tests passed", SCENARIOS.len());
        0
    } else {
        println!("{failed} self-test(s) failed");
        1
    }
}

fn expect(vm: &mut Vm, source: &str, expected: Value) -> Result<(), String> {
    let value = vm.interpret(source);
    if value == expected {
        Ok(())
    } else {
        Err(format!(
            "expected {}, got {}",
            format_value(vm.heap(), expected),
            format_value(vm.heap(), value)
        ))
    }
}

/// Build the arithmetic chunk by hand and run it through the VM,
/// printing its disassembly on the way.
fn chunk_arithmetic() -> Result<(), String> {
    let mut vm = Vm::new();
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

    print!("{}", disassemble_chunk(vm.heap(), &chunk, "arithmetic"));

    let value = vm.interpret_chunk(chunk);
    if value == Value::Number(-2.3) {
        Ok(())
    } else {
        Err(format!("expected -2.3, got {}", format_value(vm.heap(), value)))
    }
}

/// Two identical concatenations and one literal should create exactly
/// two strings: the concatenation result and the literal.
fn intern_and_concat() -> Result<(), String> {
    let mut vm = Vm::new();
    let before = vm.heap().strings.len();
    vm.heap_mut().concat_parts("hello", " world");
    vm.heap_mut().concat_parts("hello", " world");
    vm.heap_mut().intern("hi");
    let created = vm.heap().strings.len() - before;
    if created == 2 {
        Ok(())
    } else {
        Err(format!("expected 2 new strings, got {created}"))
    }
}

fn comparison_precedence() -> Result<(), String> {
    let mut vm = Vm::new();
    expect(
        &mut vm,
        "return !(5 - 4 > 3 * 2 == !nil);",
        Value::Bool(true),
    )
}

fn assignment_precedence() -> Result<(), String> {
    let mut vm = Vm::new();
    expect(&mut vm, "var x = 1; return x = 3 + 4;", Value::Number(7.0))
}

fn invalid_assignment_target() -> Result<(), String> {
    let mut vm = Vm::new();
    expect(
        &mut vm,
        "var x = 1; return 2 * x = 3 + 4;",
        Value::Error(ErrorKind::Compile),
    )
}

fn function_call() -> Result<(), String> {
    let mut vm = Vm::new();
    expect(
        &mut vm,
        "fun add1(x){return x+1;} return add1(2);",
        Value::Number(3.0),
    )
}

fn arity_mismatch() -> Result<(), String> {
    let mut vm = Vm::new();
    expect(
        &mut vm,
        "fun a(){b();} fun b(){c();} fun c(){c(\"too\",\"many\");} a();",
        Value::Error(ErrorKind::Runtime),
    )
}
