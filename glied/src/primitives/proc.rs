use crate::{Invocation, Outcome, Proc, RuntimeError};

pub fn call(inv: &Invocation<'_>) -> Outcome {
    let proc = inv
        .receiver
        .as_object()
        .and_then(|o| o.downcast::<Proc>())
        .ok_or_else(|| RuntimeError::type_error("expected Proc receiver"))?;
    proc.call(inv.runtime, inv.args)
}
