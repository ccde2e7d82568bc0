use crate::{FIXNUM_MAX, FIXNUM_MIN, Invocation, Outcome, RuntimeError, Value, primitives::bool_value};

fn receiver_float(inv: &Invocation<'_>) -> Result<f64, RuntimeError> {
    match inv.receiver {
        Value::Float(f) => Ok(*f),
        other => Err(RuntimeError::type_error(format!(
            "expected Float receiver, got {}",
            inv.runtime.class_of(other).display_name()
        ))),
    }
}

pub fn float_hash(inv: &Invocation<'_>) -> Outcome {
    let f = receiver_float(inv)?;
    // 0.0 and -0.0 are eql?, so they must hash alike.
    let bits = if f == 0.0 { 0 } else { f.to_bits() };
    Ok(Value::Fixnum(inv.runtime.hash_of(&bits)))
}

pub fn float_eql(inv: &Invocation<'_>) -> Outcome {
    let f = receiver_float(inv)?;
    Ok(bool_value(matches!(inv.arg(0), Value::Float(g) if *g == f)))
}

/// Truncates toward zero.
pub fn float_to_i(inv: &Invocation<'_>) -> Outcome {
    let f = receiver_float(inv)?;
    if !f.is_finite() {
        return Err(RuntimeError::type_error(format!("{} can't be converted to Integer", f)).into());
    }
    let truncated = f.trunc();
    if truncated < FIXNUM_MIN as f64 || truncated > FIXNUM_MAX as f64 {
        return Err(RuntimeError::type_error("float out of fixnum range").into());
    }
    Ok(Value::Fixnum(truncated as i64))
}
