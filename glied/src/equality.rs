//! Host-side equality and hashing for language values.
//!
//! Host containers need `Hash`/`Eq`; language values answer `hash` and
//! `eql?` through dynamic dispatch, so user classes (and singleton methods
//! added later) can override both. Identical values and fixnum pairs skip
//! dispatch.
use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{BinaryOpSite, Outcome, Runtime, RuntimeError, UnaryOpSite, Value};

pub struct EqualityComparer {
    runtime: Runtime,
    hash_site: UnaryOpSite,
    eql_site: BinaryOpSite,
}

impl EqualityComparer {
    pub fn new(runtime: &Runtime) -> Arc<Self> {
        Arc::new(Self {
            runtime: runtime.clone(),
            hash_site: UnaryOpSite::new(runtime.intern("hash")),
            eql_site: BinaryOpSite::new(runtime.intern("eql?")),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn equals(&self, x: &Value, y: &Value) -> Outcome<bool> {
        if x.identical(y) {
            return Ok(true);
        }
        if let (Value::Fixnum(a), Value::Fixnum(b)) = (x, y) {
            return Ok(a == b);
        }
        self.eql_site
            .call(&self.runtime, x, [y.clone()])
            .map(|v| v.is_truthy())
    }

    pub fn hash_code(&self, x: &Value) -> Outcome<i64> {
        if let Value::Fixnum(n) = x {
            return Ok(self.runtime.hash_of(n));
        }
        match self.hash_site.call(&self.runtime, x, [])? {
            Value::Fixnum(h) => Ok(h),
            other => Err(RuntimeError::type_error(format!(
                "hash must return an Integer, got {}",
                self.runtime.class_of(&other).display_name()
            ))
            .into()),
        }
    }

    /// Dispatch counters of the `hash` and `eql?` sites.
    pub fn dispatches(&self) -> u64 {
        let h = self.hash_site.cache();
        let e = self.eql_site.cache();
        h.hits() + h.misses() + e.hits() + e.misses()
    }
}

impl fmt::Debug for EqualityComparer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EqualityComparer")
            .field("dispatches", &self.dispatches())
            .finish()
    }
}

/// A language value usable as a host map key. The hash is computed once,
/// up front, so `Hash` cannot fail; `eql?` failures inside `PartialEq` are
/// logged and count as "not equal".
#[derive(Clone)]
pub struct HashKey {
    value: Value,
    hash: i64,
    comparer: Arc<EqualityComparer>,
}

impl HashKey {
    pub fn new(comparer: &Arc<EqualityComparer>, value: Value) -> Outcome<Self> {
        let hash = comparer.hash_code(&value)?;
        Ok(Self {
            value,
            hash,
            comparer: comparer.clone(),
        })
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn hash_code(&self) -> i64 {
        self.hash
    }
}

impl Hash for HashKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i64(self.hash);
    }
}

impl PartialEq for HashKey {
    fn eq(&self, other: &Self) -> bool {
        if self.hash != other.hash {
            return false;
        }
        match self.comparer.equals(&self.value, &other.value) {
            Ok(equal) => equal,
            Err(e) => {
                log::warn!("eql? failed inside a hash lookup: {}", e);
                false
            }
        }
    }
}

impl Eq for HashKey {}

impl fmt::Debug for HashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashKey")
            .field("value", &self.value)
            .field("hash", &self.hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Arity, RuntimeCreateInfo, Thrown};
    use std::collections::{HashMap, HashSet};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo::default())
    }

    #[test]
    fn fixnums_never_dispatch() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let mut map = HashMap::new();
        for i in 0..100 {
            map.insert(HashKey::new(&cmp, Value::Fixnum(i)).unwrap(), i);
        }
        for i in 0..100 {
            let key = HashKey::new(&cmp, Value::Fixnum(i)).unwrap();
            assert_eq!(map.get(&key), Some(&i));
        }
        assert_eq!(cmp.dispatches(), 0);
    }

    #[test]
    fn fixnum_fast_path_agrees_with_integer_hash() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let site = UnaryOpSite::new(rt.intern("hash"));
        let dispatched = site.call(&rt, &Value::Fixnum(77), []).unwrap();
        assert_eq!(
            dispatched.as_fixnum(),
            Some(cmp.hash_code(&Value::Fixnum(77)).unwrap())
        );
    }

    #[test]
    fn strings_compare_by_content() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let a = rt.new_string("key");
        let b = rt.new_string("key");
        let c = rt.new_string("other");

        let mut set = HashSet::new();
        set.insert(HashKey::new(&cmp, a).unwrap());
        assert!(set.contains(&HashKey::new(&cmp, b).unwrap()));
        assert!(!set.contains(&HashKey::new(&cmp, c).unwrap()));
    }

    #[test]
    fn user_classes_can_override_equality() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let point = rt.define_class("Point", None);
        let x = rt.intern("@x");

        rt.define_method(&point, "hash", Arity::Exact(0), move |inv| {
            let x = inv.runtime.instance_variable_get(inv.receiver, x);
            Ok(Value::Fixnum(x.as_fixnum().unwrap_or(0) * 31))
        })
        .unwrap();
        rt.define_method(&point, "eql?", Arity::Exact(1), move |inv| {
            let rt = inv.runtime;
            let mine = rt.instance_variable_get(inv.receiver, x);
            let theirs = rt.instance_variable_get(inv.arg(0), x);
            Ok(Value::Bool(mine.identical(&theirs)))
        })
        .unwrap();

        let p1 = rt.allocate(&point);
        let p2 = rt.allocate(&point);
        rt.instance_variable_set(&p1, x, Value::Fixnum(4)).unwrap();
        rt.instance_variable_set(&p2, x, Value::Fixnum(4)).unwrap();

        assert!(cmp.equals(&p1, &p2).unwrap());
        assert_eq!(cmp.hash_code(&p1).unwrap(), 124);
        let k1 = HashKey::new(&cmp, p1.clone()).unwrap();
        let k2 = HashKey::new(&cmp, p2).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn singleton_equality_added_later_is_honoured() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let a = rt.allocate(&rt.core().object);
        let b = rt.allocate(&rt.core().object);
        assert!(!cmp.equals(&a, &b).unwrap());

        let singleton = rt.singleton_class_of(&a).unwrap();
        rt.define_method(&singleton, "eql?", Arity::Exact(1), |_| Ok(Value::Bool(true)))
            .unwrap();
        assert!(cmp.equals(&a, &b).unwrap());
        assert!(!cmp.equals(&b, &a).unwrap());
    }

    #[test]
    fn failing_eql_is_not_equal() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let broken = rt.define_class("Broken", None);
        rt.define_method(&broken, "hash", Arity::Exact(0), |_| Ok(Value::Fixnum(1)))
            .unwrap();
        rt.define_method(&broken, "eql?", Arity::Exact(1), |_| {
            Err(RuntimeError::type_error("no comparison").into())
        })
        .unwrap();

        let k1 = HashKey::new(&cmp, rt.allocate(&broken)).unwrap();
        let k2 = HashKey::new(&cmp, rt.allocate(&broken)).unwrap();
        assert_ne!(k1, k2);
        assert_eq!(k1, k1.clone());
    }

    #[test]
    fn hash_must_be_an_integer() {
        let rt = runtime();
        let cmp = EqualityComparer::new(&rt);
        let odd = rt.define_class("Odd", None);
        rt.define_method(&odd, "hash", Arity::Exact(0), |_| Ok(Value::Nil))
            .unwrap();
        let err = cmp.hash_code(&rt.allocate(&odd));
        assert!(matches!(err, Err(Thrown::Error(RuntimeError::Type { .. }))));
    }
}
