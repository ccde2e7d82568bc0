use std::sync::Arc;

use crate::{Arity, Class, CoreClasses, Invocation, Outcome, Runtime, RuntimeError, Value};

mod fixnum;
mod float;
mod object;
mod proc;
mod string;

pub use string::RString;

pub type PrimitiveFunction = fn(&Invocation<'_>) -> Outcome;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoreClass {
    Object,
    Integer,
    Float,
    String,
    Proc,
}

impl CoreClass {
    pub fn of(self, core: &CoreClasses) -> &Arc<Class> {
        match self {
            CoreClass::Object => &core.object,
            CoreClass::Integer => &core.integer,
            CoreClass::Float => &core.float,
            CoreClass::String => &core.string,
            CoreClass::Proc => &core.proc,
        }
    }
}

// self does not count as an argument
#[derive(Debug, Copy, Clone)]
pub struct PrimitiveMethod<'a> {
    pub class: CoreClass,
    pub name: &'a str,
    pub arity: Arity,
    pub ptr: PrimitiveFunction,
}

impl<'a> PrimitiveMethod<'a> {
    pub const fn new(class: CoreClass, name: &'a str, arity: Arity, ptr: PrimitiveFunction) -> Self {
        Self {
            class,
            name,
            arity,
            ptr,
        }
    }
}

use CoreClass::{Float, Integer, Object, Proc, String};

pub const PRIMITIVES: &[PrimitiveMethod] = &[
    PrimitiveMethod::new(Object, "hash", Arity::Exact(0), object::hash),
    PrimitiveMethod::new(Object, "eql?", Arity::Exact(1), object::identical),
    PrimitiveMethod::new(Object, "==", Arity::Exact(1), object::identical),
    PrimitiveMethod::new(Object, "equal?", Arity::Exact(1), object::identical),
    PrimitiveMethod::new(Object, "object_id", Arity::Exact(0), object::object_id),
    PrimitiveMethod::new(Object, "respond_to?", Arity::Exact(1), object::respond_to),
    PrimitiveMethod::new(Object, "freeze", Arity::Exact(0), object::freeze),
    PrimitiveMethod::new(Object, "frozen?", Arity::Exact(0), object::is_frozen),
    PrimitiveMethod::new(Object, "class", Arity::Exact(0), object::class),
    PrimitiveMethod::new(Integer, "hash", Arity::Exact(0), fixnum::fixnum_hash),
    PrimitiveMethod::new(Integer, "eql?", Arity::Exact(1), fixnum::fixnum_eql),
    PrimitiveMethod::new(Integer, "==", Arity::Exact(1), fixnum::fixnum_eq),
    PrimitiveMethod::new(Integer, "+", Arity::Exact(1), fixnum::fixnum_add),
    PrimitiveMethod::new(Integer, "-", Arity::Exact(1), fixnum::fixnum_sub),
    PrimitiveMethod::new(Integer, "to_int", Arity::Exact(0), identity),
    PrimitiveMethod::new(Integer, "to_i", Arity::Exact(0), identity),
    PrimitiveMethod::new(Integer, "to_f", Arity::Exact(0), fixnum::fixnum_to_f),
    PrimitiveMethod::new(Integer, "times", Arity::Exact(0), fixnum::fixnum_times),
    PrimitiveMethod::new(Float, "hash", Arity::Exact(0), float::float_hash),
    PrimitiveMethod::new(Float, "eql?", Arity::Exact(1), float::float_eql),
    PrimitiveMethod::new(Float, "to_f", Arity::Exact(0), identity),
    PrimitiveMethod::new(Float, "to_i", Arity::Exact(0), float::float_to_i),
    PrimitiveMethod::new(Float, "to_int", Arity::Exact(0), float::float_to_i),
    PrimitiveMethod::new(String, "hash", Arity::Exact(0), string::hash),
    PrimitiveMethod::new(String, "eql?", Arity::Exact(1), string::eql),
    PrimitiveMethod::new(String, "==", Arity::Exact(1), string::eql),
    PrimitiveMethod::new(String, "to_str", Arity::Exact(0), identity),
    PrimitiveMethod::new(String, "to_s", Arity::Exact(0), identity),
    PrimitiveMethod::new(Proc, "call", Arity::AtLeast(0), proc::call),
];

/// Defines every primitive as a library method on its core class.
pub(crate) fn install(runtime: &Runtime) {
    for primitive in PRIMITIVES {
        let class = primitive.class.of(runtime.core());
        runtime.install_primitive(class, primitive.name, primitive.arity, primitive.ptr);
    }
    log::debug!("installed {} primitives", PRIMITIVES.len());
}

pub(crate) fn identity(inv: &Invocation<'_>) -> Outcome {
    Ok(inv.receiver.clone())
}

pub(crate) fn bool_value(value: bool) -> Value {
    Value::Bool(value)
}

pub(crate) fn receiver_fixnum(inv: &Invocation<'_>) -> Result<i64, RuntimeError> {
    inv.receiver.as_fixnum().ok_or_else(|| {
        RuntimeError::type_error(format!(
            "expected Integer receiver, got {}",
            inv.runtime.class_of(inv.receiver).display_name()
        ))
    })
}
