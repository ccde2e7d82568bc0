use crate::{CallSignature, Invocation, Outcome, RuntimeError, Value, primitives::bool_value};

pub fn hash(inv: &Invocation<'_>) -> Outcome {
    let id = inv.runtime.object_id(inv.receiver);
    Ok(Value::Fixnum(inv.runtime.hash_of(&id)))
}

/// `eql?`, `==` and `equal?` all default to identity.
pub fn identical(inv: &Invocation<'_>) -> Outcome {
    Ok(bool_value(inv.receiver.identical(inv.arg(0))))
}

pub fn object_id(inv: &Invocation<'_>) -> Outcome {
    Ok(Value::Fixnum(inv.runtime.object_id(inv.receiver)))
}

pub fn respond_to(inv: &Invocation<'_>) -> Outcome {
    let Value::Symbol(name) = inv.arg(0) else {
        return Err(RuntimeError::type_error("respond_to? expects a Symbol").into());
    };
    let class = inv.runtime.class_of(inv.receiver);
    let found = inv
        .runtime
        .resolver()
        .resolve(&class, *name, CallSignature::new(0, false));
    Ok(bool_value(found.is_some()))
}

pub fn freeze(inv: &Invocation<'_>) -> Outcome {
    inv.runtime.freeze(inv.receiver);
    Ok(inv.receiver.clone())
}

pub fn is_frozen(inv: &Invocation<'_>) -> Outcome {
    Ok(bool_value(inv.runtime.is_frozen(inv.receiver)))
}

/// The nominal class: singleton classes are skipped.
pub fn class(inv: &Invocation<'_>) -> Outcome {
    let mut class = inv.runtime.class_of(inv.receiver);
    while class.is_singleton() {
        match class.superclass() {
            Some(superclass) => class = superclass.clone(),
            None => break,
        }
    }
    Ok(Value::from_arc(class))
}
