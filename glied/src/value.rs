//! Value: an immediate (nil, booleans, fixnums, floats, symbols) or a
//! reference to a heap object.
//!
//! ObjectRef: shared, identity-compared reference to anything implementing
//! [`Object`]. Objects either carry their state intrinsically (they return
//! it from [`Object::instance_data`]) or get it from the runtime's weak
//! lookaside table.
use std::{
    any::Any,
    fmt,
    sync::{Arc, Weak},
};

use crate::{Class, CoreClasses, InstanceData, Symbol};

/// Smallest and largest fixnums whose tagged object id still fits an `i64`.
pub const FIXNUM_MIN: i64 = i64::MIN >> 1;
pub const FIXNUM_MAX: i64 = i64::MAX >> 1;

pub trait Object: Any + Send + Sync + fmt::Debug {
    /// Class used for dispatch when no singleton class is attached.
    fn nominal_class(&self, core: &CoreClasses) -> Arc<Class>;

    /// Intrinsic state, if this object type carries it natively.
    fn instance_data(&self) -> Option<&Arc<InstanceData>> {
        None
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Clone)]
pub struct ObjectRef(Arc<dyn Object>);

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Fixnum(i64),
    Float(f64),
    Symbol(Symbol),
    Object(ObjectRef),
}

impl ObjectRef {
    pub fn new<T: Object>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn Object>) -> Self {
        Self(object)
    }

    pub fn as_arc(&self) -> &Arc<dyn Object> {
        &self.0
    }

    pub fn downgrade(&self) -> Weak<dyn Object> {
        Arc::downgrade(&self.0)
    }

    /// Identity address. Stable while any strong or weak reference exists.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        self.address() == other.address()
    }

    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    pub fn downcast<T: Object>(&self) -> Option<Arc<T>> {
        self.0.clone().into_any().downcast::<T>().ok()
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = dyn Object;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#<{:?} @{:#x}>", self.0, self.address())
    }
}

impl Value {
    pub fn object<T: Object>(object: T) -> Self {
        Value::Object(ObjectRef::new(object))
    }

    pub fn from_arc<T: Object>(object: Arc<T>) -> Self {
        Value::Object(ObjectRef::from_arc(object))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Everything except `nil` and `false` is true.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_fixnum(&self) -> Option<i64> {
        match self {
            Value::Fixnum(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        self.as_object()?.downcast_ref::<T>()
    }

    pub fn as_class(&self) -> Option<Arc<Class>> {
        self.as_object()?.downcast::<Class>()
    }

    /// Reference identity for objects, value identity for immediates.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Fixnum(a), Value::Fixnum(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Fixnum(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Value::Symbol(value)
    }
}

/// A plain language-level object. Carries its state natively.
#[derive(Debug)]
pub struct RObject {
    class: Arc<Class>,
    data: Arc<InstanceData>,
}

impl RObject {
    pub fn new(class: Arc<Class>) -> Self {
        Self {
            class,
            data: Arc::new(InstanceData::new()),
        }
    }
}

impl Object for RObject {
    fn nominal_class(&self, _core: &CoreClasses) -> Arc<Class> {
        self.class.clone()
    }

    fn instance_data(&self) -> Option<&Arc<InstanceData>> {
        Some(&self.data)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A host value exposed to the language. It has no room for language state,
/// so frozen/tainted flags and instance variables live in the lookaside table.
#[derive(Debug)]
pub struct HostObject<T> {
    class: Arc<Class>,
    pub value: T,
}

impl<T> HostObject<T> {
    pub fn new(class: Arc<Class>, value: T) -> Self {
        Self { class, value }
    }
}

impl<T: fmt::Debug + Send + Sync + 'static> Object for HostObject<T> {
    fn nominal_class(&self, _core: &CoreClasses) -> Arc<Class> {
        self.class.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
