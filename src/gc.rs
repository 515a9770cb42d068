use std::fmt::{self, Debug, Display};
use std::hash;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use ahash::AHashMap;

use crate::chunk::{Table, Value};

/// Implemented by every heap-allocated object. `trace` marks the
/// objects directly reachable from `self`; `size` is the heap
/// footprint charged against the collection threshold.
pub trait GcTrace {
    fn size(&self) -> usize;
    fn trace(&self, gc: &mut Gc);
}

impl GcTrace for String {
    fn size(&self) -> usize {
        std::mem::size_of::<String>() + self.capacity()
    }
    fn trace(&self, _gc: &mut Gc) {}
}

struct GcBox<T: GcTrace + ?Sized + 'static> {
    is_marked: bool,
    next: Option<NonNull<GcBox<dyn GcTrace>>>,
    size: usize,
    value: T,
}

pub struct GcRef<T: GcTrace + ?Sized + 'static> {
    pointer: NonNull<GcBox<T>>,
}

impl<T: GcTrace> Copy for GcRef<T> {}

impl<T: GcTrace> Clone for GcRef<T> {
    fn clone(&self) -> GcRef<T> {
        *self
    }
}

impl<T: GcTrace> Deref for GcRef<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &self.pointer.as_ref().value }
    }
}

impl<T: GcTrace> DerefMut for GcRef<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut self.pointer.as_mut().value }
    }
}

impl<T: GcTrace> Eq for GcRef<T> {}

impl<T: GcTrace> PartialEq for GcRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.pointer == other.pointer
    }
}

// Strings are interned, so pointer identity doubles as value identity
// and the pointer is a valid hash.
impl hash::Hash for GcRef<String> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.pointer.hash(state)
    }
}

impl<T: GcTrace + Debug> Debug for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { self.pointer.as_ref().value.fmt(f) }
    }
}

impl<T: GcTrace + Display> Display for GcRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { write!(f, "{}", self.pointer.as_ref().value) }
    }
}

#[cfg(feature = "debug_log_gc")]
fn short_type_name<T: std::any::Any>() -> &'static str {
    let full_name = std::any::type_name::<T>();
    full_name.split("::").last().unwrap()
}

pub struct Gc {
    bytes_allocated: usize,
    next_gc: usize,
    first: Option<NonNull<GcBox<dyn GcTrace>>>,
    strings: AHashMap<&'static str, GcRef<String>>,
    grey_stack: Vec<NonNull<GcBox<dyn GcTrace>>>,
}

impl Gc {
    const HEAP_GROW_FACTOR: usize = 2;

    pub fn new() -> Self {
        Gc {
            bytes_allocated: 0,
            next_gc: 1024 * 1024,
            first: None,
            strings: AHashMap::new(),
            grey_stack: Vec::new(),
        }
    }

    pub fn alloc<T: GcTrace + Debug>(&mut self, obj: T) -> GcRef<T> {
        #[cfg(feature = "debug_log_gc")]
        let repr = format!("{:?}", obj).chars().take(32).collect::<String>();
        let size = obj.size() + std::mem::size_of::<GcBox<T>>();
        unsafe {
            let boxed = Box::new(GcBox {
                is_marked: false,
                next: self.first.take(),
                size,
                value: obj,
            });
            self.bytes_allocated += size;
            let pointer = NonNull::new_unchecked(Box::into_raw(boxed));
            self.first = Some(pointer);

            #[cfg(feature = "debug_log_gc")]
            println!(
                "alloc(adr:{:?} type:{} repr:{} size:{} total:{} next:{})",
                pointer,
                short_type_name::<T>(),
                repr,
                size,
                self.bytes_allocated,
                self.next_gc,
            );

            GcRef { pointer }
        }
    }

    pub fn intern(&mut self, s: String) -> GcRef<String> {
        if let Some(&value) = self.strings.get(&s as &str) {
            value
        } else {
            let reference = self.alloc(s);
            // The key borrows the heap-owned bytes; the entry is erased
            // before the string can be swept.
            let key = unsafe { &*(reference.deref() as *const String) };
            self.strings.insert(key, reference);
            reference
        }
    }

    pub fn collect_garbage(&mut self) {
        #[cfg(feature = "debug_log_gc")]
        let before = self.bytes_allocated;

        self.trace_references();
        self.remove_white_strings();
        self.sweep();
        self.next_gc = self.bytes_allocated * Gc::HEAP_GROW_FACTOR;

        #[cfg(feature = "debug_log_gc")]
        println!(
            "collected(bytes:{} before:{} after:{} next:{})",
            before - self.bytes_allocated,
            before,
            self.bytes_allocated,
            self.next_gc
        );
    }

    #[cfg(feature = "debug_stress_gc")]
    pub fn should_gc(&self) -> bool {
        true
    }

    #[cfg(not(feature = "debug_stress_gc"))]
    pub fn should_gc(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn mark_value(&mut self, value: Value) {
        value.trace(self);
    }

    pub fn mark_object<T: GcTrace + Debug>(&mut self, mut reference: GcRef<T>) {
        unsafe {
            if reference.pointer.as_ref().is_marked {
                return;
            }
            reference.pointer.as_mut().is_marked = true;
            self.grey_stack.push(reference.pointer);

            #[cfg(feature = "debug_log_gc")]
            println!(
                "mark(adr:{:?} type:{} val:{:?})",
                reference.pointer,
                short_type_name::<T>(),
                reference
            );
        }
    }

    pub fn mark_table(&mut self, table: &Table) {
        for (&k, &v) in table.iter() {
            self.mark_object(k);
            self.mark_value(v);
        }
    }

    fn trace_references(&mut self) {
        while let Some(pointer) = self.grey_stack.pop() {
            self.blacken_object(pointer);
        }
    }

    fn blacken_object(&mut self, pointer: NonNull<GcBox<dyn GcTrace>>) {
        #[cfg(feature = "debug_log_gc")]
        println!("blacken(adr:{:?})", pointer);
        let object = unsafe { &pointer.as_ref().value };
        object.trace(self);
    }

    fn remove_white_strings(&mut self) {
        self.strings
            .retain(|_k, v| unsafe { v.pointer.as_ref().is_marked });
    }

    fn sweep(&mut self) {
        let mut previous: Option<NonNull<GcBox<dyn GcTrace>>> = None;
        let mut current = self.first;
        while let Some(mut object) = current {
            unsafe {
                let object_ptr = object.as_mut();
                current = object_ptr.next;
                if object_ptr.is_marked {
                    object_ptr.is_marked = false;
                    previous = Some(object);
                } else {
                    if let Some(mut previous) = previous {
                        previous.as_mut().next = object_ptr.next
                    } else {
                        self.first = object_ptr.next
                    }
                    let boxed = Box::from_raw(object_ptr);
                    self.bytes_allocated -= boxed.size;
                }
            }
        }
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        let mut current = self.first.take();
        while let Some(object) = current {
            unsafe {
                let boxed = Box::from_raw(object.as_ptr());
                current = boxed.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Gc;
    use crate::chunk::Value;
    use crate::objects::{Closure, LoxFunction, Upvalue};

    #[test]
    fn interning_dedupes() {
        let mut gc = Gc::new();
        let a = gc.intern("counter".to_owned());
        let b = gc.intern("counter".to_owned());
        let c = gc.intern("other".to_owned());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(&*a, "counter");
    }

    #[test]
    fn collect_frees_unmarked() {
        let mut gc = Gc::new();
        gc.alloc("garbage".to_owned());
        assert!(gc.bytes_allocated > 0);
        gc.collect_garbage();
        assert_eq!(gc.bytes_allocated, 0);
        assert!(gc.first.is_none());
    }

    #[test]
    fn marked_objects_survive_and_marks_clear() {
        let mut gc = Gc::new();
        let keep = gc.intern("keep".to_owned());
        gc.alloc("drop".to_owned());
        let before = gc.bytes_allocated;

        gc.mark_object(keep);
        gc.collect_garbage();

        assert!(gc.bytes_allocated < before);
        assert_eq!(&*keep, "keep");

        // Mark bits are cleared, so an unmarked follow-up collection
        // frees the survivor.
        gc.collect_garbage();
        assert_eq!(gc.bytes_allocated, 0);
    }

    #[test]
    fn white_strings_leave_the_intern_map() {
        let mut gc = Gc::new();
        gc.intern("transient".to_owned());
        gc.collect_garbage();
        assert!(gc.strings.is_empty());
        // Re-interning after the sweep allocates a fresh object.
        gc.intern("transient".to_owned());
        assert_eq!(gc.strings.len(), 1);
    }

    #[test]
    fn threshold_grows_with_live_set() {
        let mut gc = Gc::new();
        let s = gc.intern("live".to_owned());
        gc.mark_object(s);
        gc.collect_garbage();
        assert_eq!(gc.next_gc, gc.bytes_allocated * Gc::HEAP_GROW_FACTOR);
    }

    #[test]
    fn cyclic_references_terminate() {
        let mut gc = Gc::new();
        let name = gc.intern("cycle".to_owned());
        let function = gc.alloc(LoxFunction::new(name));
        let mut closure = gc.alloc(Closure::new(function));
        let mut upvalue = gc.alloc(Upvalue::new(0));
        upvalue.closed = Some(Value::Closure(closure));
        closure.upvalues.push(upvalue);

        let before = gc.bytes_allocated;
        gc.mark_object(closure);
        gc.collect_garbage();

        // Everything in the cycle survived.
        assert_eq!(gc.bytes_allocated, before);
        assert_eq!(&*name, "cycle");
        assert_eq!(closure.upvalues[0], upvalue);
    }
}
