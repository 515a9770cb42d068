use std::fmt::Debug;

use cpu_time::ProcessTime;
use lazy_static::lazy_static;

use crate::chunk::{Instruction, Table, Value};
use crate::compiler::Parser;
use crate::error::LoxError;
use crate::gc::{Gc, GcRef, GcTrace};
use crate::objects::{BoundMethod, Closure, Instance, LoxClass, NativeFn, Upvalue};

const MAX_FRAMES: usize = 64;
const STACK_SIZE: usize = MAX_FRAMES * (u8::MAX as usize + 1);

#[derive(Clone, Copy)]
struct CallFrame {
    closure: GcRef<Closure>,
    ip: usize,
    slot: usize,
}

impl CallFrame {
    fn new(closure: GcRef<Closure>, slot: usize) -> Self {
        CallFrame {
            closure,
            ip: 0,
            slot,
        }
    }
}

lazy_static! {
    static ref BEGIN_OF_PROGRAM: ProcessTime = ProcessTime::now();
}

fn clock_native(_args: &[Value]) -> Value {
    Value::Number(BEGIN_OF_PROGRAM.elapsed().as_secs_f64())
}

fn print_native(args: &[Value]) -> Value {
    let forms: Vec<String> = args.iter().map(|value| format!("{}", value)).collect();
    println!("{}", forms.join(", "));
    Value::Nil
}

pub struct Vm {
    gc: Gc,
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: Table,
    open_upvalues: Vec<GcRef<Upvalue>>,
    init_string: GcRef<String>,
}

impl Vm {
    pub fn new() -> Self {
        let mut gc = Gc::new();
        let init_string = gc.intern("init".to_owned());
        let mut vm = Vm {
            gc,
            frames: Vec::with_capacity(MAX_FRAMES),
            stack: Vec::with_capacity(STACK_SIZE),
            globals: Table::new(),
            open_upvalues: Vec::with_capacity(MAX_FRAMES),
            init_string,
        };
        vm.define_native("clock", NativeFn(clock_native));
        vm.define_native("print", NativeFn(print_native));
        vm
    }

    pub fn interpret(&mut self, code: &str) -> Result<(), LoxError> {
        let parser = Parser::new(code, &mut self.gc);
        let function = parser.compile()?;
        self.push(Value::Function(function));
        let closure = self.alloc(Closure::new(function));
        self.pop();
        self.push(Value::Closure(closure));

        if let Err(error) = self.call(closure, 0).and_then(|()| self.run()) {
            // Leave a clean slate so a REPL can keep going.
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
            return Err(error);
        }
        Ok(())
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("Empty stack")
    }

    fn peek(&self, n: usize) -> Value {
        let size = self.stack.len();
        self.stack[size - 1 - n]
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("No current frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("No current frame")
    }

    fn current_closure(&self) -> GcRef<Closure> {
        self.current_frame().closure
    }

    fn read_constant(&self, index: u8) -> Value {
        let closure = self.current_closure();
        let function = closure.function;
        function.chunk.read_constant(index)
    }

    fn read_string(&self, index: u8) -> GcRef<String> {
        let closure = self.current_closure();
        let function = closure.function;
        function.chunk.read_string(index)
    }

    fn define_native(&mut self, name: &str, native: NativeFn) {
        let name = self.gc.intern(name.to_owned());
        self.globals.insert(name, Value::NativeFunction(native));
    }

    // Runtime allocations funnel through here so collection pressure is
    // checked while the VM roots are visible.
    fn alloc<T: GcTrace + Debug>(&mut self, object: T) -> GcRef<T> {
        self.mark_and_sweep();
        self.gc.alloc(object)
    }

    fn intern(&mut self, name: String) -> GcRef<String> {
        self.mark_and_sweep();
        self.gc.intern(name)
    }

    fn mark_and_sweep(&mut self) {
        if self.gc.should_gc() {
            self.mark_roots();
            self.gc.collect_garbage();
        }
    }

    fn mark_roots(&mut self) {
        for &value in &self.stack {
            self.gc.mark_value(value);
        }
        for frame in &self.frames {
            self.gc.mark_object(frame.closure);
        }
        for &upvalue in &self.open_upvalues {
            self.gc.mark_object(upvalue);
        }
        self.gc.mark_table(&self.globals);
        self.gc.mark_object(self.init_string);
    }

    fn binary_op<T>(&mut self, f: fn(f64, f64) -> T, r: fn(T) -> Value) -> Result<(), LoxError> {
        let operands = (self.pop(), self.pop());
        match operands {
            (Value::Number(value_b), Value::Number(value_a)) => {
                self.push(r(f(value_a, value_b)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn run(&mut self) -> Result<(), LoxError> {
        loop {
            let instruction = {
                let frame = self.current_frame();
                let closure = frame.closure;
                let function = closure.function;
                function.chunk.code[frame.ip]
            };

            #[cfg(feature = "debug_trace_execution")]
            {
                let frame = self.current_frame();
                let closure = frame.closure;
                let function = closure.function;
                crate::chunk::Disassembler::new(&function.chunk, Some(&self.stack))
                    .instruction(&instruction, frame.ip);
            }

            self.current_frame_mut().ip += 1;

            match instruction {
                Instruction::Add => {
                    let (b, a) = (self.peek(0), self.peek(1));
                    match (a, b) {
                        (Value::Number(value_a), Value::Number(value_b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(value_a + value_b));
                        }
                        (Value::String(value_a), Value::String(value_b)) => {
                            // Interning may collect, so the operands stay
                            // on the stack until the result exists.
                            let result = format!("{}{}", value_a, value_b);
                            let result = self.intern(result);
                            self.pop();
                            self.pop();
                            self.push(Value::String(result));
                        }
                        _ => {
                            return Err(self
                                .runtime_error("Operands must be two numbers or two strings."));
                        }
                    }
                }
                Instruction::Call(arg_count) => {
                    self.call_value(arg_count)?;
                }
                Instruction::Class(index) => {
                    let name = self.read_string(index);
                    let class = self.alloc(LoxClass::new(name));
                    self.push(Value::Class(class));
                }
                Instruction::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                Instruction::Closure(index) => {
                    let function = match self.read_constant(index) {
                        Value::Function(function) => function,
                        _ => panic!("Closure constant is not a function"),
                    };
                    let frame_slot = self.current_frame().slot;
                    let mut closure = Closure::new(function);
                    for i in 0..function.upvalues.len() {
                        let upvalue = function.upvalues[i];
                        let obj_upvalue = if upvalue.is_local {
                            self.capture_upvalue(frame_slot + upvalue.index as usize)
                        } else {
                            let current_closure = self.current_closure();
                            current_closure.upvalues[upvalue.index as usize]
                        };
                        closure.upvalues.push(obj_upvalue);
                    }
                    let closure = self.alloc(closure);
                    self.push(Value::Closure(closure));
                }
                Instruction::Constant(index) => {
                    let value = self.read_constant(index);
                    self.push(value);
                }
                Instruction::DefineGlobal(index) => {
                    let name = self.read_string(index);
                    let value = self.pop();
                    self.globals.insert(name, value);
                }
                Instruction::Divide => {
                    self.binary_op(|a, b| a / b, Value::Number)?;
                }
                Instruction::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Instruction::False => self.push(Value::Bool(false)),
                Instruction::GetGlobal(index) => {
                    let name = self.read_string(index);
                    match self.globals.get(&name) {
                        Some(&value) => self.push(value),
                        None => {
                            let msg = format!("Undefined variable '{}'.", name);
                            return Err(self.runtime_error(&msg));
                        }
                    }
                }
                Instruction::GetLocal(slot) => {
                    let index = slot as usize + self.current_frame().slot;
                    let value = self.stack[index];
                    self.push(value);
                }
                Instruction::GetProperty(index) => {
                    let instance = match self.peek(0) {
                        Value::Instance(instance) => instance,
                        _ => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let name = self.read_string(index);
                    match instance.fields.get(&name) {
                        Some(&value) => {
                            self.pop();
                            self.push(value);
                        }
                        None => self.bind_method(instance.class, name)?,
                    }
                }
                Instruction::GetSuper(index) => {
                    let superclass = match self.pop() {
                        Value::Class(superclass) => superclass,
                        _ => panic!("Super is not a class"),
                    };
                    let name = self.read_string(index);
                    self.bind_method(superclass, name)?;
                }
                Instruction::GetUpvalue(slot) => {
                    let value = {
                        let current_closure = self.current_closure();
                        let upvalue = current_closure.upvalues[slot as usize];
                        if let Some(value) = upvalue.closed {
                            value
                        } else {
                            self.stack[upvalue.location]
                        }
                    };
                    self.push(value);
                }
                Instruction::Greater => {
                    self.binary_op(|a, b| a > b, Value::Bool)?;
                }
                Instruction::Inherit => {
                    let superclass = match self.peek(1) {
                        Value::Class(superclass) => superclass,
                        _ => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let mut subclass = match self.peek(0) {
                        Value::Class(subclass) => subclass,
                        _ => panic!("Inherit without a subclass"),
                    };
                    let methods: Vec<_> = superclass
                        .methods
                        .iter()
                        .map(|(&name, &method)| (name, method))
                        .collect();
                    for (name, method) in methods {
                        subclass.methods.insert(name, method);
                    }
                    self.pop();
                }
                Instruction::Invoke((index, arg_count)) => {
                    let name = self.read_string(index);
                    self.invoke(name, arg_count)?;
                }
                Instruction::Jump(offset) => {
                    self.current_frame_mut().ip += offset as usize;
                }
                Instruction::JumpIfFalse(offset) => {
                    if self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                Instruction::JumpIfTrue(offset) => {
                    if !self.peek(0).is_falsey() {
                        self.current_frame_mut().ip += offset as usize;
                    }
                }
                Instruction::Less => {
                    self.binary_op(|a, b| a < b, Value::Bool)?;
                }
                Instruction::Loop(offset) => {
                    self.current_frame_mut().ip -= offset as usize + 1;
                }
                Instruction::Method(index) => {
                    let name = self.read_string(index);
                    self.define_method(name);
                }
                Instruction::Multiply => {
                    self.binary_op(|a, b| a * b, Value::Number)?;
                }
                Instruction::Negate => {
                    if let Value::Number(value) = self.peek(0) {
                        self.pop();
                        self.push(Value::Number(-value));
                    } else {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                }
                Instruction::Nil => self.push(Value::Nil),
                Instruction::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                Instruction::Pop => {
                    self.pop();
                }
                Instruction::Return => {
                    let frame = self.frames.pop().expect("No frame to return from");
                    let value = self.pop();
                    self.close_upvalues(frame.slot);
                    if self.frames.is_empty() {
                        // Pop the script closure.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(frame.slot);
                    self.push(value);
                }
                Instruction::SetGlobal(index) => {
                    let name = self.read_string(index);
                    let value = self.peek(0);
                    if self.globals.insert(name, value).is_none() {
                        self.globals.remove(&name);
                        let msg = format!("Undefined variable '{}'.", name);
                        return Err(self.runtime_error(&msg));
                    }
                }
                Instruction::SetLocal(slot) => {
                    let index = slot as usize + self.current_frame().slot;
                    self.stack[index] = self.peek(0);
                }
                Instruction::SetProperty(index) => {
                    let mut instance = match self.peek(1) {
                        Value::Instance(instance) => instance,
                        _ => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let name = self.read_string(index);
                    let value = self.pop();
                    instance.fields.insert(name, value);
                    self.pop();
                    self.push(value);
                }
                Instruction::SetUpvalue(slot) => {
                    let current_closure = self.current_closure();
                    let mut upvalue = current_closure.upvalues[slot as usize];
                    let value = self.peek(0);
                    if upvalue.closed.is_none() {
                        self.stack[upvalue.location] = value;
                    } else {
                        upvalue.closed = Some(value);
                    }
                }
                Instruction::Subtract => {
                    self.binary_op(|a, b| a - b, Value::Number)?;
                }
                Instruction::SuperInvoke((index, arg_count)) => {
                    let superclass = match self.pop() {
                        Value::Class(superclass) => superclass,
                        _ => panic!("Super is not a class"),
                    };
                    let name = self.read_string(index);
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                Instruction::True => self.push(Value::Bool(true)),
            };
        }
    }

    fn call_value(&mut self, arg_count: u8) -> Result<(), LoxError> {
        let callee = self.peek(arg_count as usize);
        match callee {
            Value::BoundMethod(bound) => {
                let slot = self.stack.len() - 1 - arg_count as usize;
                self.stack[slot] = bound.receiver;
                self.call(bound.method, arg_count)
            }
            Value::Class(class) => {
                let instance = self.alloc(Instance::new(class));
                let slot = self.stack.len() - 1 - arg_count as usize;
                self.stack[slot] = Value::Instance(instance);
                if let Some(&initializer) = class.methods.get(&self.init_string) {
                    match initializer {
                        Value::Closure(initializer) => self.call(initializer, arg_count),
                        _ => panic!("Initializer is not a closure"),
                    }
                } else if arg_count != 0 {
                    let msg = format!("Expected 0 arguments but got {}.", arg_count);
                    Err(self.runtime_error(&msg))
                } else {
                    Ok(())
                }
            }
            Value::Closure(closure) => self.call(closure, arg_count),
            Value::NativeFunction(native) => {
                let left = self.stack.len() - arg_count as usize;
                let result = native.0(&self.stack[left..]);
                self.stack.truncate(left - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(self.runtime_error("Can only call functions and classes.")),
        }
    }

    fn call(&mut self, closure: GcRef<Closure>, arg_count: u8) -> Result<(), LoxError> {
        let function = closure.function;
        if (arg_count as usize) != function.arity {
            let msg = format!(
                "Expected {} arguments but got {}.",
                function.arity, arg_count
            );
            Err(self.runtime_error(&msg))
        } else if self.frames.len() == MAX_FRAMES {
            Err(self.runtime_error("Stack overflow."))
        } else {
            let slot = self.stack.len() - 1 - arg_count as usize;
            self.frames.push(CallFrame::new(closure, slot));
            Ok(())
        }
    }

    fn invoke(&mut self, name: GcRef<String>, arg_count: u8) -> Result<(), LoxError> {
        let receiver = self.peek(arg_count as usize);
        let instance = match receiver {
            Value::Instance(instance) => instance,
            _ => return Err(self.runtime_error("Only instances have methods.")),
        };
        match instance.class.methods.get(&name) {
            Some(&Value::Closure(method)) => self.call(method, arg_count),
            Some(_) => panic!("Method is not a closure"),
            // A field is only called when no method has this name.
            None => match instance.fields.get(&name) {
                Some(&field) => {
                    let slot = self.stack.len() - 1 - arg_count as usize;
                    self.stack[slot] = field;
                    self.call_value(arg_count)
                }
                None => {
                    let msg = format!("Undefined property '{}'.", name);
                    Err(self.runtime_error(&msg))
                }
            },
        }
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef<LoxClass>,
        name: GcRef<String>,
        arg_count: u8,
    ) -> Result<(), LoxError> {
        match class.methods.get(&name) {
            Some(&Value::Closure(method)) => self.call(method, arg_count),
            Some(_) => panic!("Method is not a closure"),
            None => {
                let msg = format!("Undefined property '{}'.", name);
                Err(self.runtime_error(&msg))
            }
        }
    }

    fn bind_method(&mut self, class: GcRef<LoxClass>, name: GcRef<String>) -> Result<(), LoxError> {
        match class.methods.get(&name) {
            Some(&method) => {
                let receiver = self.peek(0);
                let method = match method {
                    Value::Closure(closure) => closure,
                    _ => panic!("Method is not a closure"),
                };
                let bound = self.alloc(BoundMethod::new(receiver, method));
                self.pop();
                self.push(Value::BoundMethod(bound));
                Ok(())
            }
            None => {
                let msg = format!("Undefined property '{}'.", name);
                Err(self.runtime_error(&msg))
            }
        }
    }

    fn define_method(&mut self, name: GcRef<String>) {
        let method = self.peek(0);
        let mut class = match self.peek(1) {
            Value::Class(class) => class,
            _ => panic!("Method on a non-class"),
        };
        class.methods.insert(name, method);
        self.pop();
    }

    fn capture_upvalue(&mut self, location: usize) -> GcRef<Upvalue> {
        for &upvalue in &self.open_upvalues {
            if upvalue.location == location {
                return upvalue;
            }
        }
        let upvalue = self.alloc(Upvalue::new(location));
        self.open_upvalues.push(upvalue);
        upvalue
    }

    fn close_upvalues(&mut self, last: usize) {
        let mut i = 0;
        while i != self.open_upvalues.len() {
            let mut upvalue = self.open_upvalues[i];
            if upvalue.location >= last {
                self.open_upvalues.remove(i);
                upvalue.closed = Some(self.stack[upvalue.location]);
            } else {
                i += 1;
            }
        }
    }

    fn runtime_error(&self, msg: &str) -> LoxError {
        eprintln!("{}", msg);
        for frame in self.frames.iter().rev() {
            let closure = frame.closure;
            let function = closure.function;
            let line = function.chunk.lines[frame.ip - 1];
            if function.name.is_empty() {
                eprintln!("[line {}] in script", line);
            } else {
                eprintln!("[line {}] in {}()", line, function.name);
            }
        }
        LoxError::RuntimeError
    }
}

#[cfg(test)]
mod tests {
    use super::Vm;
    use crate::chunk::Value;
    use crate::error::LoxError;

    fn global_number(vm: &mut Vm, name: &str) -> f64 {
        let name = vm.gc.intern(name.to_owned());
        match vm.globals.get(&name) {
            Some(Value::Number(n)) => *n,
            other => panic!("Expected a number, found {:?}", other),
        }
    }

    fn global_bool(vm: &mut Vm, name: &str) -> bool {
        let name = vm.gc.intern(name.to_owned());
        match vm.globals.get(&name) {
            Some(Value::Bool(b)) => *b,
            other => panic!("Expected a bool, found {:?}", other),
        }
    }

    #[test]
    fn arithmetic_precedence() {
        let mut vm = Vm::new();
        vm.interpret("var a = 1 + 2 * 3;").expect("Interpret failed");
        assert_eq!(global_number(&mut vm, "a"), 7.0);
    }

    #[test]
    fn stack_is_neutral_across_statements() {
        let mut vm = Vm::new();
        vm.interpret("1 + 2; true; nil; \"text\";")
            .expect("Interpret failed");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut vm = Vm::new();
        vm.interpret("var a = 1;").expect("Interpret failed");
        vm.interpret("var b = a + 1;").expect("Interpret failed");
        assert_eq!(global_number(&mut vm, "b"), 2.0);
    }

    #[test]
    fn closures_capture_by_reference() {
        let mut vm = Vm::new();
        let code = "
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var c = makeCounter();
            var first = c();
            var second = c();
            var third = c();";
        vm.interpret(code).expect("Interpret failed");
        assert_eq!(global_number(&mut vm, "first"), 1.0);
        assert_eq!(global_number(&mut vm, "second"), 2.0);
        assert_eq!(global_number(&mut vm, "third"), 3.0);
    }

    #[test]
    fn concatenation_is_interned() {
        let mut vm = Vm::new();
        vm.interpret("var eq = \"ab\" == \"a\" + \"b\";")
            .expect("Interpret failed");
        assert!(global_bool(&mut vm, "eq"));
    }

    #[test]
    fn initializer_returns_the_instance() {
        let mut vm = Vm::new();
        let code = "
            class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
            }
            var p = Point(3, 4);
            var x = p.x;
            var y = p.y;";
        vm.interpret(code).expect("Interpret failed");
        assert_eq!(global_number(&mut vm, "x"), 3.0);
        assert_eq!(global_number(&mut vm, "y"), 4.0);
    }

    #[test]
    fn super_calls_reach_the_superclass() {
        let mut vm = Vm::new();
        let code = "
            class A {
                value() { return 1; }
            }
            class B < A {
                value() { return super.value() + 10; }
            }
            var v = B().value();";
        vm.interpret(code).expect("Interpret failed");
        assert_eq!(global_number(&mut vm, "v"), 11.0);
    }

    #[test]
    fn calling_a_non_callable_fails() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("var x; x();"),
            Err(LoxError::RuntimeError)
        );
        // The stacks are reset for the next REPL line.
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn undefined_variable_fails() {
        let mut vm = Vm::new();
        assert_eq!(vm.interpret("missing;"), Err(LoxError::RuntimeError));
        assert_eq!(
            vm.interpret("existing = 1;"),
            Err(LoxError::RuntimeError)
        );
    }

    #[test]
    fn wrong_arity_fails() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("fun f(a, b) {} f(1);"),
            Err(LoxError::RuntimeError)
        );
    }

    #[test]
    fn deep_recursion_overflows_the_frame_stack() {
        let mut vm = Vm::new();
        assert_eq!(
            vm.interpret("fun f() { f(); } f();"),
            Err(LoxError::RuntimeError)
        );
    }
}
