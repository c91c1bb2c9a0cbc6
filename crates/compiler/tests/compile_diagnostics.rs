//! Integration tests against `lox-compiler`'s public surface.

use lox_compiler::compile;
use lox_core::StringInterner;

#[test]
fn well_formed_source_compiles_to_a_function_with_a_nonempty_chunk() {
    let mut interner = StringInterner::new();
    let function = compile("fun add(a, b) { return a + b; } print add(1, 2);", &mut interner)
        .expect("well-formed source should compile");
    assert!(!function.chunk.is_empty());
    assert_eq!(function.arity, 0);
}

#[test]
fn unterminated_block_is_reported_as_a_compile_error() {
    let mut interner = StringInterner::new();
    let errors = compile("fun f() { print 1;", &mut interner).unwrap_err();
    assert!(!errors.is_empty());
}

#[test]
fn multiple_errors_in_one_source_are_all_reported() {
    let mut interner = StringInterner::new();
    let errors = compile("var; var;", &mut interner).unwrap_err();
    assert!(errors.len() >= 2, "expected both bad declarations to be reported, got {errors:?}");
}
