use std::fmt::{self, Display};
use std::mem;

use crate::chunk::{Chunk, Table, Value};
use crate::gc::{Gc, GcRef, GcTrace};

#[derive(Clone, Copy)]
pub struct NativeFn(pub fn(&[Value]) -> Value);

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<native fn>")
    }
}

impl PartialEq for NativeFn {
    fn eq(&self, other: &Self) -> bool {
        self.0 as usize == other.0 as usize
    }
}

/// Compile-time description of a captured variable: where the closure
/// finds it when it is built (enclosing locals or enclosing upvalues).
#[derive(Copy, Clone, Debug)]
pub struct FunctionUpvalue {
    pub index: u8,
    pub is_local: bool,
}

#[derive(Debug)]
pub struct LoxFunction {
    pub arity: usize,
    pub chunk: Chunk,
    pub name: GcRef<String>,
    pub upvalues: Vec<FunctionUpvalue>,
}

impl LoxFunction {
    pub fn new(name: GcRef<String>) -> Self {
        LoxFunction {
            arity: 0,
            chunk: Chunk::default(),
            name,
            upvalues: Vec::new(),
        }
    }
}

impl Display for LoxFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "<script>")
        } else {
            write!(f, "<fn {}>", self.name)
        }
    }
}

impl GcTrace for LoxFunction {
    fn size(&self) -> usize {
        mem::size_of::<LoxFunction>()
            + self.upvalues.capacity() * mem::size_of::<FunctionUpvalue>()
            + self.chunk.code.capacity() * mem::size_of::<crate::chunk::Instruction>()
            + self.chunk.constants.capacity() * mem::size_of::<Value>()
            + self.chunk.lines.capacity() * mem::size_of::<usize>()
    }
    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.name);
        for &constant in &self.chunk.constants {
            gc.mark_value(constant);
        }
    }
}

#[derive(Debug)]
pub struct Upvalue {
    pub location: usize,
    pub closed: Option<Value>,
}

impl Upvalue {
    pub fn new(location: usize) -> Self {
        Upvalue {
            location,
            closed: None,
        }
    }
}

impl GcTrace for Upvalue {
    fn size(&self) -> usize {
        mem::size_of::<Upvalue>()
    }
    fn trace(&self, gc: &mut Gc) {
        if let Some(value) = self.closed {
            gc.mark_value(value)
        }
    }
}

#[derive(Debug)]
pub struct Closure {
    pub function: GcRef<LoxFunction>,
    pub upvalues: Vec<GcRef<Upvalue>>,
}

impl Closure {
    pub fn new(function: GcRef<LoxFunction>) -> Self {
        Closure {
            function,
            upvalues: Vec::new(),
        }
    }
}

impl GcTrace for Closure {
    fn size(&self) -> usize {
        mem::size_of::<Closure>() + self.upvalues.capacity() * mem::size_of::<GcRef<Upvalue>>()
    }
    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.function);
        for &upvalue in &self.upvalues {
            gc.mark_object(upvalue);
        }
    }
}

#[derive(Debug)]
pub struct LoxClass {
    pub name: GcRef<String>,
    pub methods: Table,
}

impl LoxClass {
    pub fn new(name: GcRef<String>) -> Self {
        LoxClass {
            name,
            methods: Table::new(),
        }
    }
}

impl GcTrace for LoxClass {
    fn size(&self) -> usize {
        mem::size_of::<LoxClass>()
            + self.methods.capacity() * (mem::size_of::<GcRef<String>>() + mem::size_of::<Value>())
    }
    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.name);
        gc.mark_table(&self.methods);
    }
}

#[derive(Debug)]
pub struct Instance {
    pub class: GcRef<LoxClass>,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: GcRef<LoxClass>) -> Self {
        Instance {
            class,
            fields: Table::new(),
        }
    }
}

impl GcTrace for Instance {
    fn size(&self) -> usize {
        mem::size_of::<Instance>()
            + self.fields.capacity() * (mem::size_of::<GcRef<String>>() + mem::size_of::<Value>())
    }
    fn trace(&self, gc: &mut Gc) {
        gc.mark_object(self.class);
        gc.mark_table(&self.fields);
    }
}

#[derive(Debug)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: GcRef<Closure>,
}

impl BoundMethod {
    pub fn new(receiver: Value, method: GcRef<Closure>) -> Self {
        BoundMethod { receiver, method }
    }
}

impl GcTrace for BoundMethod {
    fn size(&self) -> usize {
        mem::size_of::<BoundMethod>()
    }
    fn trace(&self, gc: &mut Gc) {
        gc.mark_value(self.receiver);
        gc.mark_object(self.method);
    }
}
