use crate::{HostObject, Invocation, Outcome, RuntimeError, primitives::bool_value};

/// Language strings are host strings; their state lives in the lookaside
/// table.
pub type RString = HostObject<String>;

fn receiver_str<'a>(inv: &Invocation<'a>) -> Result<&'a str, RuntimeError> {
    inv.receiver
        .downcast_ref::<RString>()
        .map(|s| s.value.as_str())
        .ok_or_else(|| RuntimeError::type_error("expected String receiver"))
}

pub fn hash(inv: &Invocation<'_>) -> Outcome {
    let s = receiver_str(inv)?;
    Ok(crate::Value::Fixnum(inv.runtime.hash_of(s)))
}

pub fn eql(inv: &Invocation<'_>) -> Outcome {
    let s = receiver_str(inv)?;
    let other = inv.arg(0).downcast_ref::<RString>();
    Ok(bool_value(other.is_some_and(|o| o.value == s)))
}
