use crate::{
    FIXNUM_MAX, FIXNUM_MIN, Invocation, Outcome, RuntimeError, Value,
    primitives::{bool_value, receiver_fixnum},
};

type Fixnum2Op = fn(a: i64, b: i64) -> Option<i64>;
type Float2Op = fn(a: f64, b: f64) -> f64;

fn fixnum_binop(inv: &Invocation<'_>, op: Fixnum2Op, float_op: Float2Op) -> Outcome {
    let a = receiver_fixnum(inv)?;
    match inv.arg(0) {
        Value::Fixnum(b) => match op(a, *b) {
            Some(res) if (FIXNUM_MIN..=FIXNUM_MAX).contains(&res) => Ok(Value::Fixnum(res)),
            _ => Err(RuntimeError::type_error("fixnum overflow").into()),
        },
        Value::Float(b) => Ok(Value::Float(float_op(a as f64, *b))),
        other => Err(RuntimeError::type_error(format!(
            "{} can't be coerced into Integer",
            inv.runtime.class_of(other).display_name()
        ))
        .into()),
    }
}

pub fn fixnum_add(inv: &Invocation<'_>) -> Outcome {
    fixnum_binop(inv, i64::checked_add, |a, b| a + b)
}

pub fn fixnum_sub(inv: &Invocation<'_>) -> Outcome {
    fixnum_binop(inv, i64::checked_sub, |a, b| a - b)
}

pub fn fixnum_hash(inv: &Invocation<'_>) -> Outcome {
    let n = receiver_fixnum(inv)?;
    Ok(Value::Fixnum(inv.runtime.hash_of(&n)))
}

/// Strict: `1.eql?(1.0)` is false.
pub fn fixnum_eql(inv: &Invocation<'_>) -> Outcome {
    let a = receiver_fixnum(inv)?;
    Ok(bool_value(inv.arg(0).as_fixnum() == Some(a)))
}

/// Numeric: `1 == 1.0` is true.
pub fn fixnum_eq(inv: &Invocation<'_>) -> Outcome {
    let a = receiver_fixnum(inv)?;
    let equal = match inv.arg(0) {
        Value::Fixnum(b) => a == *b,
        Value::Float(b) => a as f64 == *b,
        _ => false,
    };
    Ok(bool_value(equal))
}

pub fn fixnum_to_f(inv: &Invocation<'_>) -> Outcome {
    let a = receiver_fixnum(inv)?;
    Ok(Value::Float(a as f64))
}

/// `n.times { |i| ... }`. Returns the receiver, or the break value.
pub fn fixnum_times(inv: &Invocation<'_>) -> Outcome {
    let n = receiver_fixnum(inv)?;
    for i in 0..n {
        let yielded = inv.yield_block(&[Value::Fixnum(i)])?;
        if yielded.jumped {
            return Ok(yielded.value);
        }
    }
    Ok(inv.receiver.clone())
}

#[cfg(test)]
mod tests {
    use crate::{BinaryOpSite, Runtime, RuntimeCreateInfo, Thrown, Value, VariadicSite};

    #[test]
    fn arithmetic_promotes_to_float_and_checks_overflow() {
        let rt = Runtime::new(RuntimeCreateInfo::default());
        let add = BinaryOpSite::new(rt.intern("+"));
        let sub = BinaryOpSite::new(rt.intern("-"));

        let sum = add.call(&rt, &Value::Fixnum(40), [Value::Fixnum(2)]).unwrap();
        assert_eq!(sum.as_fixnum(), Some(42));
        let diff = sub.call(&rt, &Value::Fixnum(1), [Value::Float(0.5)]).unwrap();
        assert!(matches!(diff, Value::Float(f) if f == 0.5));

        let overflow = add.call(&rt, &Value::Fixnum(crate::FIXNUM_MAX), [Value::Fixnum(1)]);
        assert!(matches!(overflow, Err(Thrown::Error(_))));
    }

    #[test]
    fn eql_is_strict_and_equality_is_numeric() {
        let rt = Runtime::new(RuntimeCreateInfo::default());
        let eql = BinaryOpSite::new(rt.intern("eql?"));
        let eq = BinaryOpSite::new(rt.intern("=="));
        let one = Value::Fixnum(1);

        assert!(!eql.call(&rt, &one, [Value::Float(1.0)]).unwrap().is_truthy());
        assert!(eq.call(&rt, &one, [Value::Float(1.0)]).unwrap().is_truthy());
        assert!(eql.call(&rt, &one, [Value::Fixnum(1)]).unwrap().is_truthy());
    }

    #[test]
    fn times_yields_every_index_and_stops_on_break() {
        let rt = Runtime::new(RuntimeCreateInfo::default());
        let times = VariadicSite::new(rt.intern("times"));
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = seen.clone();
        let block = crate::Proc::new(Value::Nil, None, move |bp, args| {
            let i = args[0].as_fixnum().unwrap_or(-1);
            log.lock().push(i);
            if i == 3 {
                return bp.break_with(Value::Fixnum(-3));
            }
            Ok(Value::Nil)
        });
        let result = times
            .call_with_block(&rt, &Value::Fixnum(10), &[], &block)
            .unwrap();
        assert_eq!(result.as_fixnum(), Some(-3));
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3]);

        let plain = crate::Proc::new(Value::Nil, None, |_, _| Ok(Value::Nil));
        let result = times
            .call_with_block(&rt, &Value::Fixnum(2), &[], &plain)
            .unwrap();
        assert_eq!(result.as_fixnum(), Some(2));
    }
}
