//! End-to-end tests against `lox-runtime`'s public surface: compile and run
//! whole programs through `Vm`, the way `lox-cli` does, and assert on exact
//! captured stdout.

use lox_runtime::{InterpretError, Vm, VmConfig};

fn run(source: &str) -> String {
    let mut output = Vec::new();
    let mut vm = Vm::with_writer(VmConfig::new(), Box::new(&mut output));
    vm.interpret(source).expect("program should run to completion");
    drop(vm);
    String::from_utf8(output).unwrap()
}

#[test]
fn fibonacci_and_closures_compose_across_calls() {
    let source = r#"
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }

        fun counter() {
            var n = 0;
            fun next() { n = n + 1; return n; }
            return next;
        }

        var c = counter();
        print fib(6);
        print c();
        print c();
    "#;
    assert_eq!(run(source), "8\n1\n2\n");
}

#[test]
fn undefined_global_access_is_a_runtime_error_not_a_panic() {
    let mut output = Vec::new();
    let mut vm = Vm::with_writer(VmConfig::new(), Box::new(&mut output));
    let err = vm.interpret("print undefined_name;").unwrap_err();
    match err {
        InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable")),
        InterpretError::Compile(_) => panic!("expected a runtime error"),
    }
}

#[test]
fn a_compile_error_never_reaches_the_vm() {
    let mut output = Vec::new();
    let mut vm = Vm::with_writer(VmConfig::new(), Box::new(&mut output));
    let err = vm.interpret("var = 1;").unwrap_err();
    assert!(matches!(err, InterpretError::Compile(_)));
}
