//! Inline caches for dynamic calls.
//!
//! A site binds receiver shapes (class ids) to resolved methods under the
//! method-table version that was current when resolution started. An entry
//! is published as a whole through a [`VersionedCell`], so no reader can pair
//! a version with a method resolved after it. A rebind replaces the entry and
//! the old one is freed with its last reader. Misses are never cached.
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    CallSignature, Carrier, Class, Method, ModuleId, Outcome, Proc, Runtime, RuntimeError, Symbol,
    Thrown, Value, VersionedCell,
};

#[derive(Debug)]
struct CacheEntry {
    version: u64,
    rules: Vec<(ModuleId, Method)>,
}

impl CacheEntry {
    fn find(&self, shape: ModuleId) -> Option<&Method> {
        self.rules
            .iter()
            .find_map(|(id, method)| (*id == shape).then_some(method))
    }
}

/// The shared cache protocol behind every site flavour.
#[derive(Debug)]
pub struct SiteCache {
    name: Symbol,
    entry: VersionedCell<CacheEntry>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SiteCache {
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            entry: VersionedCell::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> Symbol {
        self.name
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Version of the bound entry, if any.
    pub fn bound_version(&self) -> Option<u64> {
        self.entry.load().as_ref().map(|e| e.version)
    }

    /// Number of shapes bound under the current entry.
    pub fn polymorphism(&self) -> usize {
        self.entry.load().as_ref().map_or(0, |e| e.rules.len())
    }

    pub fn target(
        &self,
        runtime: &Runtime,
        receiver: &Value,
        signature: CallSignature,
    ) -> Result<Method, RuntimeError> {
        // Version before shape and resolution: an entry may only claim a
        // version that was current before its method was looked up.
        let version = runtime.method_version();
        let shape = runtime.class_of(receiver);

        if let Some(entry) = self.entry.load().as_ref() {
            if entry.version == version {
                if let Some(method) = entry.find(shape.id()) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(method.clone());
                }
            }
        }
        self.miss(runtime, &shape, version, signature)
    }

    fn miss(
        &self,
        runtime: &Runtime,
        shape: &Arc<Class>,
        version: u64,
        signature: CallSignature,
    ) -> Result<Method, RuntimeError> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "call site miss: {} on {} at version {}",
            runtime.symbol_name(self.name),
            shape.display_name(),
            version
        );

        let Some(method) = runtime.resolver().resolve(shape, self.name, signature) else {
            return Err(RuntimeError::NoMethod {
                name: runtime.symbol_name(self.name),
                class: shape.display_name(),
            });
        };

        let limit = runtime.settings().polymorphism_limit;
        let shape_id = shape.id();
        self.entry.update(|current| match current {
            Some(entry) if entry.version > version => None,
            Some(entry) if entry.version == version => {
                if entry.find(shape_id).is_some() {
                    return None;
                }
                if entry.rules.len() >= limit {
                    log::trace!("call site at polymorphism limit, not binding");
                    return None;
                }
                let mut rules = entry.rules.clone();
                rules.push((shape_id, method.clone()));
                Some(CacheEntry { version, rules })
            }
            _ => Some(CacheEntry {
                version,
                rules: vec![(shape_id, method.clone())],
            }),
        });
        Ok(method)
    }
}

/// Fixed-arity site without a block. `ARGC` counts arguments besides the
/// receiver.
#[derive(Debug)]
pub struct CallSite<const ARGC: usize> {
    cache: SiteCache,
}

pub type UnaryOpSite = CallSite<0>;
pub type BinaryOpSite = CallSite<1>;

impl<const ARGC: usize> CallSite<ARGC> {
    pub fn new(name: Symbol) -> Self {
        Self {
            cache: SiteCache::new(name),
        }
    }

    pub fn cache(&self) -> &SiteCache {
        &self.cache
    }

    pub fn call(&self, runtime: &Runtime, receiver: &Value, args: [Value; ARGC]) -> Outcome {
        let method = self
            .cache
            .target(runtime, receiver, CallSignature::new(ARGC, false))?;
        method.invoke(runtime, receiver, &args, None)
    }
}

/// Site with a runtime argument count and an optional block.
#[derive(Debug)]
pub struct VariadicSite {
    cache: SiteCache,
}

impl VariadicSite {
    pub fn new(name: Symbol) -> Self {
        Self {
            cache: SiteCache::new(name),
        }
    }

    pub fn cache(&self) -> &SiteCache {
        &self.cache
    }

    pub fn call(&self, runtime: &Runtime, receiver: &Value, args: &[Value]) -> Outcome {
        let method = self
            .cache
            .target(runtime, receiver, CallSignature::new(args.len(), false))?;
        method.invoke(runtime, receiver, args, None)
    }

    /// A call with a block literal. A `retry` from the block restarts the
    /// whole call, re-dispatching it.
    pub fn call_with_block(
        &self,
        runtime: &Runtime,
        receiver: &Value,
        args: &[Value],
        block: &Arc<Proc>,
    ) -> Outcome {
        loop {
            let method = self
                .cache
                .target(runtime, receiver, CallSignature::new(args.len(), true))?;
            match method.invoke(runtime, receiver, args, Some(block)) {
                Err(Thrown::Jump(Carrier::Retry)) => {
                    log::trace!("retrying call with block");
                    continue;
                }
                other => return other,
            }
        }
    }
}

/// `respond_to?` dispatched like any other call, so user overrides count.
#[derive(Debug)]
pub struct RespondToSite {
    site: BinaryOpSite,
}

impl RespondToSite {
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            site: BinaryOpSite::new(runtime.intern("respond_to?")),
        }
    }

    pub fn cache(&self) -> &SiteCache {
        self.site.cache()
    }

    pub fn call(&self, runtime: &Runtime, receiver: &Value, name: Symbol) -> Outcome<bool> {
        self.site
            .call(runtime, receiver, [Value::Symbol(name)])
            .map(|v| v.is_truthy())
    }
}

/// Implicit conversion through a protocol method such as `to_str` or
/// `to_int`.
#[derive(Debug)]
pub struct ConversionSite {
    site: UnaryOpSite,
    target: Arc<Class>,
}

impl ConversionSite {
    pub fn new(runtime: &Runtime, method: &str, target: Arc<Class>) -> Self {
        Self {
            site: UnaryOpSite::new(runtime.intern(method)),
            target,
        }
    }

    pub fn cache(&self) -> &SiteCache {
        self.site.cache()
    }

    /// Converts or fails with a `TypeError`.
    pub fn convert(&self, runtime: &Runtime, value: &Value) -> Outcome {
        match self.try_convert(runtime, value)? {
            Some(converted) => Ok(converted),
            None => Err(RuntimeError::type_error(format!(
                "can't convert {} into {}",
                runtime.class_of(value).display_name(),
                self.target.display_name()
            ))
            .into()),
        }
    }

    /// `None` when the value has no conversion method.
    pub fn try_convert(&self, runtime: &Runtime, value: &Value) -> Outcome<Option<Value>> {
        let class = runtime.class_of(value);
        if class.is_subclass_of(&self.target) {
            return Ok(Some(value.clone()));
        }

        let converted = match self.site.call(runtime, value, []) {
            Ok(converted) => converted,
            Err(Thrown::Error(RuntimeError::NoMethod { name, .. }))
                if *name == *runtime.symbol_name(self.site.cache().name()) =>
            {
                return Ok(None);
            }
            Err(other) => return Err(other),
        };

        if runtime.class_of(&converted).is_subclass_of(&self.target) {
            Ok(Some(converted))
        } else {
            Err(RuntimeError::type_error(format!(
                "can't convert {} to {} ({}#{} gives {})",
                class.display_name(),
                self.target.display_name(),
                class.display_name(),
                runtime.symbol_name(self.site.cache().name()),
                runtime.class_of(&converted).display_name()
            ))
            .into())
        }
    }
}
