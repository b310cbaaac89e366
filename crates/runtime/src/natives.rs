//! Native functions.
//!
//! Hosts extend the language through [`Vm::register_native`]; the
//! functions here are the built-in set installed at construction.
//!
//! [`Vm::register_native`]: crate::vm::Vm::register_native

use lox_core::object::NativeContext;
use lox_core::value::Value;

/// `clock()`: seconds since the VM started, as a number.
pub fn clock(context: &mut NativeContext<'_>, _args: &[Value]) -> Value {
    Value::Number(context.started.elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Vm;

    #[test]
    fn test_clock_returns_nonnegative_seconds() {
        let mut vm = Vm::new();
        match vm.interpret("return clock();") {
            Value::Number(seconds) => assert!(seconds >= 0.0),
            other => panic!("expected a number, got {other:?}"),
        }
    }

    #[test]
    fn test_clock_is_monotonic_within_a_run() {
        let mut vm = Vm::new();
        let result = vm.interpret(
            "var a = clock();\n\
             var b = clock();\n\
             return b >= a;",
        );
        assert_eq!(result, Value::Bool(true));
    }
}
