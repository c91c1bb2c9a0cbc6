//! The stack virtual machine (section 4.7): frame stack, value stack,
//! globals, open-upvalue list, and the dispatch loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::rc::Rc;

use lox_core::object::InternedKey;
use lox_core::{Closure, NativeFunction, Object, OpCode, StringInterner, Upvalue, Value};

use crate::config::VmConfig;
use crate::error::{InterpretError, RuntimeError, TraceFrame};

struct CallFrame {
    closure: Rc<Object>,
    ip: usize,
    base: usize,
}

/// Executes compiled chunks. Owns the value stack, the frame stack, the
/// global table, the open-upvalue list, and the string interner the
/// compiler interns its constants through.
///
/// # Examples
///
/// ```
/// use lox_runtime::{Vm, VmConfig};
///
/// let mut output = Vec::new();
/// let mut vm = Vm::with_writer(VmConfig::new(), Box::new(&mut output));
/// vm.interpret("print 1 + 2;").unwrap();
/// drop(vm);
/// assert_eq!(output, b"3\n");
/// ```
pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: HashMap<InternedKey, Value>,
    open_upvalues: Vec<Rc<Object>>,
    interner: StringInterner,
    frames_max: usize,
    stack_max: usize,
    out: Box<dyn Write>,
}

impl Vm {
    /// Build a VM whose `print` output goes to stdout (section 6).
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self::with_writer(config, Box::new(io::stdout()))
    }

    /// Build a VM whose `print` output is captured by `out` instead of
    /// stdout — the injection point the test suite uses for section 8's
    /// exact-stdout scenarios.
    #[must_use]
    pub fn with_writer(config: VmConfig, out: Box<dyn Write>) -> Self {
        let mut interner = StringInterner::new();
        let mut globals = HashMap::new();
        for (name, native_obj) in config.build_natives(&mut interner) {
            globals.insert(InternedKey(name), Value::Object(native_obj));
        }
        Self {
            frames: Vec::new(),
            stack: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            interner,
            frames_max: config.frames_max,
            stack_max: config.stack_max,
            out,
        }
    }

    /// Compile `source` and run it to completion (section 4.7's `interpret`).
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function =
            lox_compiler::compile(source, &mut self.interner).map_err(InterpretError::Compile)?;
        let function = Rc::try_unwrap(function)
            .unwrap_or_else(|_| unreachable!("a freshly compiled function has one owner"));
        let function_obj = Rc::new(Object::Function(function));
        let closure = Closure { function: function_obj, upvalues: Vec::new() };
        let closure_obj = Rc::new(Object::Closure(closure));
        self.stack.push(Value::Object(Rc::clone(&closure_obj)));
        self.frames.push(CallFrame { closure: closure_obj, ip: 0, base: 0 });
        self.run().map_err(InterpretError::Runtime)
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.stack_max {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("compiler-emitted bytecode keeps the stack balanced")
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn frame_idx(&self) -> usize {
        self.frames.len() - 1
    }

    fn read_byte(&mut self, frame_idx: usize) -> u8 {
        let ip = self.frames[frame_idx].ip;
        let byte = {
            let closure = self.frames[frame_idx]
                .closure
                .as_closure()
                .expect("call frames always hold a closure");
            closure.function().chunk.read_byte(ip)
        };
        self.frames[frame_idx].ip += 1;
        byte
    }

    fn read_u16(&mut self, frame_idx: usize) -> u16 {
        let ip = self.frames[frame_idx].ip;
        let value = {
            let closure = self.frames[frame_idx]
                .closure
                .as_closure()
                .expect("call frames always hold a closure");
            closure.function().chunk.read_u16(ip)
        };
        self.frames[frame_idx].ip += 2;
        value
    }

    fn read_u24(&mut self, frame_idx: usize) -> u32 {
        let ip = self.frames[frame_idx].ip;
        let value = {
            let closure = self.frames[frame_idx]
                .closure
                .as_closure()
                .expect("call frames always hold a closure");
            closure.function().chunk.read_u24(ip)
        };
        self.frames[frame_idx].ip += 3;
        value
    }

    fn read_constant(&self, frame_idx: usize, index: usize) -> Value {
        let closure = self.frames[frame_idx]
            .closure
            .as_closure()
            .expect("call frames always hold a closure");
        closure.function().chunk.constant(index).clone()
    }

    /// `capture_upvalue` (section 4.7): find-or-insert an open upvalue for
    /// `location`, keeping `open_upvalues` sorted by decreasing address.
    fn capture_upvalue(&mut self, location: usize) -> Rc<Object> {
        let mut insert_at = self.open_upvalues.len();
        for (i, existing) in self.open_upvalues.iter().enumerate() {
            let upvalue = existing.as_upvalue().expect("open_upvalues only ever holds upvalues");
            match &*upvalue.borrow() {
                Upvalue::Open(loc) if *loc == location => return Rc::clone(existing),
                Upvalue::Open(loc) if *loc < location => {
                    insert_at = i;
                    break;
                }
                _ => {}
            }
        }
        let new_upvalue = Rc::new(Object::Upvalue(RefCell::new(Upvalue::Open(location))));
        self.open_upvalues.insert(insert_at, Rc::clone(&new_upvalue));
        new_upvalue
    }

    /// `close_upvalues` (section 4.7): move every open upvalue at or above
    /// `last` into its own `Closed` cell.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(front) = self.open_upvalues.first() {
            let location = match &*front.as_upvalue().expect("open_upvalues only ever holds upvalues").borrow() {
                Upvalue::Open(loc) => *loc,
                Upvalue::Closed(_) => unreachable!("closed upvalues are removed from open_upvalues immediately"),
            };
            if location < last {
                break;
            }
            let upvalue_rc = self.open_upvalues.remove(0);
            let value = self.stack[location].clone();
            *upvalue_rc.as_upvalue().unwrap().borrow_mut() = Upvalue::Closed(value);
        }
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        tracing::warn!(%message, "runtime error unwinding stack");
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let closure = frame.closure.as_closure().expect("call frames always hold a closure");
            let function = closure.function();
            let line = function.chunk.line_of(frame.ip.saturating_sub(1));
            let name = function.name.as_ref().map(|n| {
                n.as_string().expect("function names are interned strings").as_str().to_string()
            });
            trace.push(TraceFrame { line, name });
        }
        self.stack.clear();
        self.frames.clear();
        RuntimeError::new(message, trace)
    }

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> Value) -> Result<(), RuntimeError> {
        let b = self.peek(0).as_number();
        let a = self.peek(1).as_number();
        match (a, b) {
            (Some(a), Some(b)) => {
                self.pop();
                self.pop();
                self.push(op(a, b))?;
                Ok(())
            }
            _ => Err(self.runtime_error("Operand must be a number.")),
        }
    }

    fn call_value(&mut self, argc: u8) -> Result<(), RuntimeError> {
        let argc = argc as usize;
        let callee_idx = self.stack.len() - argc - 1;
        let callee = self.stack[callee_idx].clone();
        let Some(object) = callee.as_object() else {
            return Err(self.runtime_error("Can only call functions and classes."));
        };
        match object.as_ref() {
            Object::Closure(c) => {
                let arity = c.function().arity as usize;
                if arity != argc {
                    return Err(self.runtime_error(format!(
                        "Expected {arity} arguments but got {argc}."
                    )));
                }
                if self.frames.len() + 1 > self.frames_max {
                    return Err(self.runtime_error("Stack overflow."));
                }
                let closure_rc = Rc::clone(object);
                self.frames.push(CallFrame { closure: closure_rc, ip: 0, base: callee_idx });
                Ok(())
            }
            Object::NativeFunction(NativeFunction { func, .. }) => {
                let args = self.stack[callee_idx + 1..].to_vec();
                let result = func(&args).map_err(|msg| self.runtime_error(msg))?;
                self.stack.truncate(callee_idx);
                self.stack.push(result);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    /// Render the instruction about to execute via `lox_core::disassemble`
    /// and emit it at trace level. Only compiled in when the `trace` feature
    /// is enabled — formatting every dispatched instruction is too expensive
    /// to pay unconditionally.
    #[cfg(feature = "trace")]
    fn trace_instruction(&self, frame_idx: usize) {
        let closure = self.frames[frame_idx]
            .closure
            .as_closure()
            .expect("call frames always hold a closure");
        let offset = self.frames[frame_idx].ip - 1;
        let mut buf = Vec::new();
        if lox_core::disassemble_instruction(&closure.function().chunk, offset, &mut buf).is_ok() {
            let text = String::from_utf8_lossy(&buf);
            tracing::trace!(target: "lox_runtime::trace", "{}", text.trim_end());
        }
    }

    /// The dispatch loop (section 4.7): read one opcode at a time from the
    /// current frame and execute it until the script closure returns.
    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let frame_idx = self.frame_idx();
            let op_byte = self.read_byte(frame_idx);
            let Some(op) = OpCode::from_byte(op_byte) else {
                return Err(self.runtime_error("internal error: invalid opcode in compiled chunk"));
            };
            tracing::trace!(?op, frame = frame_idx, "dispatch");
            #[cfg(feature = "trace")]
            self.trace_instruction(frame_idx);

            match op {
                OpCode::Constant => {
                    let idx = self.read_byte(frame_idx);
                    let value = self.read_constant(frame_idx, idx as usize);
                    self.push(value)?;
                }
                OpCode::ConstantLong => {
                    let idx = self.read_u24(frame_idx);
                    let value = self.read_constant(frame_idx, idx as usize);
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte(frame_idx);
                    let base = self.frames[frame_idx].base;
                    let value = self.stack[base + slot as usize].clone();
                    self.push(value)?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte(frame_idx);
                    let base = self.frames[frame_idx].base;
                    let value = self.peek(0).clone();
                    self.stack[base + slot as usize] = value;
                }
                OpCode::GetGlobal => {
                    let idx = self.read_byte(frame_idx);
                    let name = self.read_constant(frame_idx, idx as usize);
                    let name_obj = Rc::clone(name.as_object().expect("global name constants are strings"));
                    match self.globals.get(&InternedKey(Rc::clone(&name_obj))) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value)?;
                        }
                        None => {
                            let text = name_obj.as_string().unwrap().as_str().to_string();
                            return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                        }
                    }
                }
                OpCode::SetGlobal => {
                    let idx = self.read_byte(frame_idx);
                    let name = self.read_constant(frame_idx, idx as usize);
                    let name_obj = Rc::clone(name.as_object().expect("global name constants are strings"));
                    let key = InternedKey(Rc::clone(&name_obj));
                    if !self.globals.contains_key(&key) {
                        let text = name_obj.as_string().unwrap().as_str().to_string();
                        return Err(self.runtime_error(format!("Undefined variable '{text}'.")));
                    }
                    let value = self.peek(0).clone();
                    self.globals.insert(key, value);
                }
                OpCode::DefineGlobal => {
                    let idx = self.read_byte(frame_idx);
                    let name = self.read_constant(frame_idx, idx as usize);
                    let name_obj = Rc::clone(name.as_object().expect("global name constants are strings"));
                    let value = self.pop();
                    self.globals.insert(InternedKey(name_obj), value);
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte(frame_idx);
                    let value = {
                        let closure = self.frames[frame_idx].closure.as_closure().unwrap();
                        let upvalue = closure.upvalues[index as usize].as_upvalue().unwrap();
                        match &*upvalue.borrow() {
                            Upvalue::Open(loc) => self.stack[*loc].clone(),
                            Upvalue::Closed(v) => v.clone(),
                        }
                    };
                    self.push(value)?;
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte(frame_idx);
                    let value = self.peek(0).clone();
                    let upvalue_obj = {
                        let closure = self.frames[frame_idx].closure.as_closure().unwrap();
                        Rc::clone(&closure.upvalues[index as usize])
                    };
                    let upvalue = upvalue_obj.as_upvalue().unwrap();
                    let open_location = match &*upvalue.borrow() {
                        Upvalue::Open(loc) => Some(*loc),
                        Upvalue::Closed(_) => None,
                    };
                    match open_location {
                        Some(loc) => self.stack[loc] = value,
                        None => *upvalue.borrow_mut() = Upvalue::Closed(value),
                    }
                }
                OpCode::CloseUpvalue => {
                    let last = self.stack.len() - 1;
                    self.close_upvalues(last);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a.values_equal(&b)))?;
                }
                OpCode::Greater => self.binary_numeric(|a, b| Value::Bool(a > b))?,
                OpCode::Less => self.binary_numeric(|a, b| Value::Bool(a < b))?,
                OpCode::Add => {
                    let b = self.peek(0).clone();
                    let a = self.peek(1).clone();
                    match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => {
                            let sum = x + y;
                            self.pop();
                            self.pop();
                            self.push(Value::Number(sum))?;
                        }
                        _ if a.is_string() && b.is_string() => {
                            let sa = a.as_object().unwrap().as_string().unwrap();
                            let sb = b.as_object().unwrap().as_string().unwrap();
                            let mut combined =
                                Vec::with_capacity(sa.as_bytes().len() + sb.as_bytes().len());
                            combined.extend_from_slice(sa.as_bytes());
                            combined.extend_from_slice(sb.as_bytes());
                            let interned = self.interner.intern(&combined);
                            self.pop();
                            self.pop();
                            self.push(Value::Object(interned))?;
                        }
                        _ => {
                            return Err(
                                self.runtime_error("Operands must be two numbers or two strings.")
                            );
                        }
                    }
                }
                OpCode::Subtract => self.binary_numeric(|a, b| Value::Number(a - b))?,
                OpCode::Multiply => self.binary_numeric(|a, b| Value::Number(a * b))?,
                OpCode::Divide => self.binary_numeric(|a, b| Value::Number(a / b))?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()))?;
                }
                OpCode::Negate => match self.peek(0).as_number() {
                    Some(n) => {
                        self.pop();
                        self.push(Value::Number(-n))?;
                    }
                    None => return Err(self.runtime_error("Operand must be a number.")),
                },
                OpCode::Print => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16(frame_idx);
                    self.frames[frame_idx].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16(frame_idx);
                    if self.peek(0).is_falsey() {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16(frame_idx);
                    self.frames[frame_idx].ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte(frame_idx);
                    self.call_value(argc)?;
                }
                OpCode::Closure => {
                    let const_idx = self.read_byte(frame_idx);
                    let function_value = self.read_constant(frame_idx, const_idx as usize);
                    let function_rc =
                        Rc::clone(function_value.as_object().expect("CLOSURE constant is a Function"));
                    let upvalue_count = function_rc
                        .as_function()
                        .expect("CLOSURE constant is a Function")
                        .upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte(frame_idx) != 0;
                        let index = self.read_byte(frame_idx);
                        if is_local {
                            let base = self.frames[frame_idx].base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            let enclosing = self.frames[frame_idx].closure.as_closure().unwrap();
                            upvalues.push(Rc::clone(&enclosing.upvalues[index as usize]));
                        }
                    }
                    let closure = Closure { function: function_rc, upvalues };
                    self.push(Value::Object(Rc::new(Object::Closure(closure))))?;
                }
                OpCode::Compare => {
                    let case_value = self.pop();
                    let subject = self.peek(0).clone();
                    let ordering = match (&subject, &case_value) {
                        (Value::Number(a), Value::Number(b)) => {
                            if a > b {
                                1.0
                            } else if a < b {
                                -1.0
                            } else {
                                0.0
                            }
                        }
                        _ if subject.values_equal(&case_value) => 0.0,
                        _ => 1.0,
                    };
                    self.push(Value::Number(ordering))?;
                }
                OpCode::JumpIfNoEqual => {
                    let offset = self.read_u16(frame_idx);
                    let is_equal = matches!(self.peek(0), Value::Number(n) if *n == 0.0);
                    if !is_equal {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::JumpIfEqual => {
                    let offset = self.read_u16(frame_idx);
                    let is_equal = matches!(self.peek(0), Value::Number(n) if *n == 0.0);
                    if is_equal {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames[frame_idx].base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.stack.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result)?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests share a `Rc<RefCell<Vec<u8>>>` sink so they can read back what
    // the VM printed after `Vm::with_writer` takes ownership of a boxed copy.
    #[derive(Clone)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> String {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(VmConfig::new(), Box::new(buf.clone()));
        vm.interpret(source).expect("program should run to completion");
        let bytes = buf.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run(r#"var a = "foo"; var b = "bar"; print a + b;"#), "foobar\n");
    }

    #[test]
    fn recursive_fibonacci() {
        assert_eq!(
            run("fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2);} print fib(10);"),
            "55\n"
        );
    }

    #[test]
    fn closure_capture_shares_mutable_state() {
        let source = r#"
            fun make(){ var i=0; fun inc(){ i=i+1; return i; } return inc; }
            var c = make(); print c(); print c(); print c();
        "#;
        assert_eq!(run(source), "1\n2\n3\n");
    }

    #[test]
    fn global_redeclaration_is_allowed_assignment_to_undefined_is_not() {
        assert_eq!(run("var a=1; var a=2; print a;"), "2\n");

        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(VmConfig::new(), Box::new(buf));
        let err = vm.interpret("b=3;").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Undefined variable 'b'")),
            InterpretError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn for_loop_prints_each_iteration() {
        assert_eq!(run("for (var i=0;i<3;i=i+1) print i;"), "0\n1\n2\n");
    }

    #[test]
    fn switch_runs_only_the_matching_case() {
        let source = r#"
            var x = 2;
            switch (x) {
                case 1: print "one";
                case 2: print "two";
                case 3: print "three";
            }
        "#;
        assert_eq!(run(source), "two\n");
    }

    #[test]
    fn two_closures_over_the_same_local_observe_each_others_writes() {
        let source = r#"
            fun make() {
                var i = 0;
                fun get() { return i; }
                fun set(v) { i = v; }
                set(5);
                return get();
            }
            print make();
        "#;
        assert_eq!(run(source), "5\n");
    }

    #[test]
    fn stack_overflow_on_unbounded_recursion_is_a_runtime_error() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let mut vm = Vm::with_writer(VmConfig::new(), Box::new(buf));
        let err = vm.interpret("fun f() { return f(); } print f();").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Stack overflow")),
            InterpretError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn clock_and_unix_natives_are_registered_by_default() {
        assert!(run("print clock() >= 0;").starts_with("true"));
    }

    #[test]
    fn with_stack_max_bounds_the_value_stack() {
        let buf = SharedBuf(Rc::new(RefCell::new(Vec::new())));
        let config = VmConfig::new().with_stack_max(3);
        let mut vm = Vm::with_writer(config, Box::new(buf));
        let err = vm.interpret("{ var a=1; var b=2; var c=3; print a; }").unwrap_err();
        match err {
            InterpretError::Runtime(e) => assert!(e.message.contains("Stack overflow")),
            InterpretError::Compile(_) => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn switch_compares_strings_by_equality_not_just_numbers() {
        let source = r#"
            var x = "b";
            switch (x) {
                case "a": print "first";
                case "b": print "second";
            }
        "#;
        assert_eq!(run(source), "second\n");
    }

    #[test]
    fn break_exits_a_while_loop_early() {
        let source = r#"
            var i = 0;
            while (i < 10) {
                if (i == 3) break;
                print i;
                i = i + 1;
            }
        "#;
        assert_eq!(run(source), "0\n1\n2\n");
    }

    #[test]
    fn continue_skips_to_the_for_loops_increment() {
        let source = r#"
            for (var i = 0; i < 5; i = i + 1) {
                if (i == 2) continue;
                print i;
            }
        "#;
        assert_eq!(run(source), "0\n1\n3\n4\n");
    }

    #[test]
    fn break_exits_the_innermost_loop_only() {
        let source = r#"
            for (var i = 0; i < 2; i = i + 1) {
                var j = 0;
                while (j < 10) {
                    if (j == 1) break;
                    print j;
                    j = j + 1;
                }
            }
        "#;
        assert_eq!(run(source), "0\n0\n");
    }
}
