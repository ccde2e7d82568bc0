//! Per-site caches of constant lookups.
//!
//! Unqualified sites (`FOO`) are valid while the global constant version is
//! unchanged. Qualified sites (`owner::FOO`) additionally remember which
//! module they resolved against, since one site can see several owners.
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{Class, ModuleId, Runtime, RuntimeError, Symbol, Value, VersionedCell};

/// A lookup result. `Missing` is distinct from a constant bound to `nil`.
#[derive(Debug, Clone)]
pub enum ConstantValue {
    Defined(Value),
    Missing,
}

impl ConstantValue {
    pub fn is_defined(&self) -> bool {
        matches!(self, ConstantValue::Defined(_))
    }

    pub fn into_option(self) -> Option<Value> {
        match self {
            ConstantValue::Defined(v) => Some(v),
            ConstantValue::Missing => None,
        }
    }
}

impl From<Option<Value>> for ConstantValue {
    fn from(value: Option<Value>) -> Self {
        match value {
            Some(v) => ConstantValue::Defined(v),
            None => ConstantValue::Missing,
        }
    }
}

#[derive(Debug)]
struct ConstantEntry {
    version: u64,
    owner: Option<ModuleId>,
    value: ConstantValue,
}

#[derive(Debug)]
struct ConstantCache {
    name: Symbol,
    entry: VersionedCell<ConstantEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ConstantCache {
    fn new(name: Symbol) -> Self {
        Self {
            name,
            entry: VersionedCell::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn resolve(
        &self,
        runtime: &Runtime,
        owner: Option<ModuleId>,
        lookup: impl FnOnce() -> ConstantValue,
    ) -> ConstantValue {
        let version = runtime.constant_version();
        if let Some(entry) = self.entry.load().as_ref() {
            if entry.version == version && entry.owner == owner {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return entry.value.clone();
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "constant site miss: {} at version {}",
            runtime.symbol_name(self.name),
            version
        );
        let value = lookup();
        self.entry.update(|current| match current {
            Some(entry) if entry.version > version => None,
            _ => Some(ConstantEntry {
                version,
                owner,
                value: value.clone(),
            }),
        });
        value
    }
}

/// `NAME` written inside some class body.
#[derive(Debug)]
pub struct ConstantSite {
    cache: ConstantCache,
}

impl ConstantSite {
    pub fn new(name: Symbol) -> Self {
        Self {
            cache: ConstantCache::new(name),
        }
    }

    pub fn name(&self) -> Symbol {
        self.cache.name
    }

    pub fn hits(&self) -> u64 {
        self.cache.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.cache.misses.load(Ordering::Relaxed)
    }

    /// `lexical` is the innermost class the site is written in. The lookup
    /// walks its ancestors, then falls back to `Object`.
    pub fn resolve(&self, runtime: &Runtime, lexical: &Arc<Class>) -> ConstantValue {
        self.cache.resolve(runtime, None, || {
            runtime
                .lookup_constant_uncached(lexical, self.cache.name)
                .into()
        })
    }

    pub fn get(&self, runtime: &Runtime, lexical: &Arc<Class>) -> Result<Value, RuntimeError> {
        self.resolve(runtime, lexical)
            .into_option()
            .ok_or_else(|| RuntimeError::Name {
                name: runtime.symbol_name(self.cache.name),
            })
    }

    pub fn is_defined(&self, runtime: &Runtime, lexical: &Arc<Class>) -> bool {
        self.resolve(runtime, lexical).is_defined()
    }
}

/// `owner::NAME`, where `owner` is only known at run time.
#[derive(Debug)]
pub struct QualifiedConstantSite {
    cache: ConstantCache,
}

impl QualifiedConstantSite {
    pub fn new(name: Symbol) -> Self {
        Self {
            cache: ConstantCache::new(name),
        }
    }

    pub fn name(&self) -> Symbol {
        self.cache.name
    }

    pub fn hits(&self) -> u64 {
        self.cache.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.cache.misses.load(Ordering::Relaxed)
    }

    pub fn resolve(&self, runtime: &Runtime, owner: &Value) -> Result<ConstantValue, RuntimeError> {
        let Some(owner) = owner.as_class() else {
            return Err(RuntimeError::type_error(format!(
                "{} is not a class/module",
                runtime.class_of(owner).display_name()
            )));
        };
        let name = self.cache.name;
        Ok(self
            .cache
            .resolve(runtime, Some(owner.id()), || owner.lookup_constant(name).into()))
    }

    pub fn get(&self, runtime: &Runtime, owner: &Value) -> Result<Value, RuntimeError> {
        match self.resolve(runtime, owner)? {
            ConstantValue::Defined(value) => Ok(value),
            ConstantValue::Missing => {
                let owner_name = owner
                    .as_class()
                    .map(|c| c.display_name())
                    .unwrap_or_else(|| Arc::from("?"));
                Err(RuntimeError::Name {
                    name: Arc::from(format!(
                        "{}::{}",
                        owner_name,
                        runtime.symbol_name(self.cache.name)
                    )),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeCreateInfo;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo::default())
    }

    #[test]
    fn cached_until_the_constant_version_moves() {
        let rt = runtime();
        let object = rt.core().object.clone();
        rt.set_constant(&object, "LIMIT", Value::Fixnum(10)).unwrap();
        let site = ConstantSite::new(rt.intern("LIMIT"));

        for _ in 0..5 {
            assert_eq!(site.get(&rt, &object).unwrap().as_fixnum(), Some(10));
        }
        assert_eq!(site.misses(), 1);
        assert_eq!(site.hits(), 4);

        rt.set_constant(&object, "LIMIT", Value::Fixnum(20)).unwrap();
        assert_eq!(site.get(&rt, &object).unwrap().as_fixnum(), Some(20));
        assert_eq!(site.misses(), 2);
    }

    #[test]
    fn a_stale_entry_is_dropped_on_rebind() {
        let rt = runtime();
        let object = rt.core().object.clone();
        rt.set_constant(&object, "LIMIT", Value::Fixnum(10)).unwrap();
        let site = ConstantSite::new(rt.intern("LIMIT"));

        site.get(&rt, &object).unwrap();
        let first = site.cache.entry.current().unwrap();
        for i in 0..100 {
            rt.set_constant(&object, "OTHER", Value::Fixnum(i)).unwrap();
            site.get(&rt, &object).unwrap();
        }
        assert_eq!(Arc::strong_count(&first), 1);
        assert_eq!(site.misses(), 101);
    }

    #[test]
    fn nil_constants_are_not_missing() {
        let rt = runtime();
        let object = rt.core().object.clone();
        let nothing = ConstantSite::new(rt.intern("NOTHING"));
        let missing = ConstantSite::new(rt.intern("UNDEFINED_THING"));
        rt.set_constant(&object, "NOTHING", Value::Nil).unwrap();

        assert!(matches!(
            nothing.resolve(&rt, &object),
            ConstantValue::Defined(Value::Nil)
        ));
        assert!(matches!(missing.resolve(&rt, &object), ConstantValue::Missing));
        assert_eq!(
            missing.get(&rt, &object).unwrap_err().to_string(),
            "uninitialized constant UNDEFINED_THING"
        );
        // Missing results are cached too.
        assert!(!missing.is_defined(&rt, &object));
        assert_eq!(missing.misses(), 1);
    }

    #[test]
    fn lexical_scope_wins_over_object() {
        let rt = runtime();
        let object = rt.core().object.clone();
        let outer = rt.define_class("Outer", None);
        rt.set_constant(&object, "X", Value::Fixnum(1)).unwrap();
        rt.set_constant(&outer, "X", Value::Fixnum(2)).unwrap();

        let site = ConstantSite::new(rt.intern("X"));
        assert_eq!(site.get(&rt, &outer).unwrap().as_fixnum(), Some(2));

        rt.remove_constant(&outer, "X").unwrap();
        assert_eq!(site.get(&rt, &outer).unwrap().as_fixnum(), Some(1));
    }

    #[test]
    fn qualified_sites_key_on_the_owner() {
        let rt = runtime();
        let a = rt.define_class("A", None);
        let b = rt.define_class("B", None);
        rt.set_constant(&a, "V", Value::Fixnum(1)).unwrap();
        rt.set_constant(&b, "V", Value::Fixnum(2)).unwrap();
        let (a_value, b_value) = (Value::from_arc(a), Value::from_arc(b));

        let site = QualifiedConstantSite::new(rt.intern("V"));
        assert_eq!(site.get(&rt, &a_value).unwrap().as_fixnum(), Some(1));
        assert_eq!(site.get(&rt, &a_value).unwrap().as_fixnum(), Some(1));
        assert_eq!(site.get(&rt, &b_value).unwrap().as_fixnum(), Some(2));
        assert_eq!(site.hits(), 1);
        assert_eq!(site.misses(), 2);

        let err = site.get(&rt, &Value::Fixnum(3)).unwrap_err();
        assert_eq!(err.to_string(), "Integer is not a class/module");

        let missing = QualifiedConstantSite::new(rt.intern("W"));
        assert_eq!(
            missing.get(&rt, &a_value).unwrap_err().to_string(),
            "uninitialized constant A::W"
        );
    }

    #[test]
    fn frozen_classes_reject_constants() {
        let rt = runtime();
        let class = rt.define_class("Sealed", None);
        rt.freeze(&Value::from_arc(class.clone()));
        assert!(matches!(
            rt.set_constant(&class, "Y", Value::Nil),
            Err(RuntimeError::Frozen { .. })
        ));
    }
}
