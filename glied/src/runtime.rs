use std::{
    fmt,
    hash::{BuildHasher, Hash},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    AncestorResolver, Arity, Class, HostObject, Invocation, Method, MethodKind, MethodResolver,
    ObjectStateStore, Outcome, PrimitiveFunction, RObject, RecursiveLock, RecursiveLockGuard,
    RuntimeError, Symbol, SymbolTable, Thrown, Value, WeakList, WeakTableSettings,
    notify_collection, primitives,
};

/// Classes the core itself needs to name.
#[derive(Debug, Clone)]
pub struct CoreClasses {
    pub object: Arc<Class>,
    pub class: Arc<Class>,
    pub nil: Arc<Class>,
    pub true_class: Arc<Class>,
    pub false_class: Arc<Class>,
    pub integer: Arc<Class>,
    pub float: Arc<Class>,
    pub symbol: Arc<Class>,
    pub string: Arc<Class>,
    pub proc: Arc<Class>,
}

impl CoreClasses {
    pub fn new() -> Self {
        let object = Class::new(Some("Object"), None);
        let subclass = |name| Class::new(Some(name), Some(object.clone()));
        Self {
            class: subclass("Class"),
            nil: subclass("NilClass"),
            true_class: subclass("TrueClass"),
            false_class: subclass("FalseClass"),
            integer: subclass("Integer"),
            float: subclass("Float"),
            symbol: subclass("Symbol"),
            string: subclass("String"),
            proc: subclass("Proc"),
            object,
        }
    }

    /// The class a value has before any singleton class is attached.
    pub fn nominal_class_of(&self, value: &Value) -> Arc<Class> {
        match value {
            Value::Nil => self.nil.clone(),
            Value::Bool(true) => self.true_class.clone(),
            Value::Bool(false) => self.false_class.clone(),
            Value::Fixnum(_) => self.integer.clone(),
            Value::Float(_) => self.float.clone(),
            Value::Symbol(_) => self.symbol.clone(),
            Value::Object(object) => object.nominal_class(self),
        }
    }

    fn all(&self) -> [&Arc<Class>; 10] {
        [
            &self.object,
            &self.class,
            &self.nil,
            &self.true_class,
            &self.false_class,
            &self.integer,
            &self.float,
            &self.symbol,
            &self.string,
            &self.proc,
        ]
    }
}

impl Default for CoreClasses {
    fn default() -> Self {
        Self::new()
    }
}

/// Told about every method definition, after the fact and outside the
/// hierarchy lock. Held weakly: dropping the last `Arc` unsubscribes.
pub trait MethodObserver: Send + Sync {
    fn method_added(&self, class: &Arc<Class>, name: Symbol);
}

#[derive(Default)]
pub struct RuntimeCreateInfo {
    // max shapes per call site entry, default 8
    pub polymorphism_limit: Option<usize>,
    // inserts into the extrinsic state table between sweep checks
    pub weak_cleanup_cooldown: Option<usize>,
    pub weak_dead_ratio: Option<usize>,
    pub resolver: Option<Arc<dyn MethodResolver>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RuntimeSettings {
    pub polymorphism_limit: usize,
    pub weak_cleanup_cooldown: usize,
    pub weak_dead_ratio: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        let weak = WeakTableSettings::default();
        Self {
            polymorphism_limit: 8,
            weak_cleanup_cooldown: weak.cooldown,
            weak_dead_ratio: weak.dead_ratio,
        }
    }
}

pub struct RuntimeShared {
    core: CoreClasses,
    symbols: SymbolTable,
    method_version: AtomicU64,
    constant_version: AtomicU64,
    states: ObjectStateStore,
    resolver: Arc<dyn MethodResolver>,
    // serializes writers of method and constant tables
    hierarchy_lock: RecursiveLock,
    settings: RuntimeSettings,
    observers: Mutex<WeakList<dyn MethodObserver>>,
    hasher: ahash::RandomState,
}

/// Handle to one runtime. Cheap to clone and shared between threads.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        let mut settings = RuntimeSettings::default();
        info.polymorphism_limit
            .inspect(|&val| settings.polymorphism_limit = val);
        info.weak_cleanup_cooldown
            .inspect(|&val| settings.weak_cleanup_cooldown = val);
        info.weak_dead_ratio
            .inspect(|&val| settings.weak_dead_ratio = val);

        let core = CoreClasses::new();
        let states = ObjectStateStore::new(
            core.clone(),
            WeakTableSettings {
                cooldown: settings.weak_cleanup_cooldown,
                dead_ratio: settings.weak_dead_ratio,
            },
        );
        let resolver = info
            .resolver
            .unwrap_or_else(|| Arc::new(AncestorResolver));

        let inner = RuntimeShared {
            core,
            symbols: SymbolTable::new(),
            method_version: AtomicU64::new(1),
            constant_version: AtomicU64::new(1),
            states,
            resolver,
            hierarchy_lock: RecursiveLock::new(),
            settings,
            observers: Mutex::new(WeakList::new()),
            hasher: ahash::RandomState::new(),
        };

        let new = Self {
            inner: Arc::new(inner),
        };
        new.init_core();
        new
    }

    fn init_core(&self) {
        let core = &self.inner.core;
        for class in core.all() {
            if let Some(name) = class.name() {
                let name = self.intern(name);
                core.object.insert_constant(name, Value::from_arc(class.clone()));
            }
        }
        primitives::install(self);
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.inner.symbols.intern(name)
    }

    pub fn symbol_name(&self, symbol: Symbol) -> Arc<str> {
        self.inner
            .symbols
            .name(symbol)
            .unwrap_or_else(|| Arc::from("<unknown symbol>"))
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.inner.symbols
    }

    pub fn core(&self) -> &CoreClasses {
        &self.inner.core
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    pub fn resolver(&self) -> &dyn MethodResolver {
        &*self.inner.resolver
    }

    pub fn states(&self) -> &ObjectStateStore {
        &self.inner.states
    }

    /// Bumped after every method table change and singleton creation.
    pub fn method_version(&self) -> u64 {
        self.inner.method_version.load(Ordering::Acquire)
    }

    /// Bumped after every constant table change.
    pub fn constant_version(&self) -> u64 {
        self.inner.constant_version.load(Ordering::Acquire)
    }

    fn bump_method_version(&self) {
        let version = self.inner.method_version.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("method version bumped to {}", version);
    }

    fn bump_constant_version(&self) {
        let version = self.inner.constant_version.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!("constant version bumped to {}", version);
    }

    /// The dispatch class: singleton class if attached, nominal otherwise.
    pub fn class_of(&self, value: &Value) -> Arc<Class> {
        self.inner.states.class_of(value)
    }

    /// Creates the singleton class on first use. `nil`, `true` and `false`
    /// answer their own class; other immediates have none.
    pub fn singleton_class_of(&self, value: &Value) -> Result<Arc<Class>, RuntimeError> {
        let object = match value {
            Value::Nil | Value::Bool(_) => return Ok(self.core().nominal_class_of(value)),
            Value::Fixnum(_) | Value::Float(_) | Value::Symbol(_) => {
                return Err(RuntimeError::type_error(format!(
                    "can't define singleton for {}",
                    self.class_of(value).display_name()
                )));
            }
            Value::Object(object) => object,
        };

        let _guard = self.inner.hierarchy_lock.lock();
        let current = self.class_of(value);
        if current.is_singleton() {
            return Ok(current);
        }
        let singleton = Class::new_singleton(&object.nominal_class(self.core()));
        self.inner.states.attach_singleton(value, singleton.clone());
        log::debug!("created singleton class of {}", current.display_name());
        self.bump_method_version();
        Ok(singleton)
    }

    /// A named subclass of `superclass` (`Object` if none), registered as
    /// a constant of `Object`.
    pub fn define_class(&self, name: &str, superclass: Option<Arc<Class>>) -> Arc<Class> {
        let superclass = superclass.unwrap_or_else(|| self.core().object.clone());
        let class = Class::new(Some(name), Some(superclass));
        let symbol = self.intern(name);
        {
            let _guard = self.inner.hierarchy_lock.lock();
            self.core()
                .object
                .insert_constant(symbol, Value::from_arc(class.clone()));
            self.bump_constant_version();
        }
        class
    }

    fn frozen_class_error(&self, class: &Arc<Class>) -> RuntimeError {
        RuntimeError::Frozen {
            class: class.display_name(),
        }
    }

    fn add_method(&self, class: &Arc<Class>, method: Method) -> Result<Method, RuntimeError> {
        let name = method.name();
        let mut guard = self.inner.hierarchy_lock.lock();
        if class.is_frozen() {
            return Err(self.frozen_class_error(class));
        }
        class.insert_method(name, method.clone());
        self.bump_method_version();
        RecursiveLockGuard::unlocked(&mut guard, || self.notify_method_added(class, name));
        Ok(method)
    }

    fn notify_method_added(&self, class: &Arc<Class>, name: Symbol) {
        let observers: Vec<_> = self.inner.observers.lock().iter().collect();
        for observer in observers {
            observer.method_added(class, name);
        }
    }

    /// Defines a method with its own frame.
    pub fn define_method(
        &self,
        class: &Arc<Class>,
        name: &str,
        arity: Arity,
        body: impl Fn(&Invocation<'_>) -> Outcome + Send + Sync + 'static,
    ) -> Result<Method, RuntimeError> {
        let method = Method::new(self.intern(name), class.id(), arity, MethodKind::User, body);
        self.add_method(class, method)
    }

    /// Defines a host-implemented method.
    pub fn define_library_method(
        &self,
        class: &Arc<Class>,
        name: &str,
        arity: Arity,
        body: impl Fn(&Invocation<'_>) -> Outcome + Send + Sync + 'static,
    ) -> Result<Method, RuntimeError> {
        let method = Method::new(
            self.intern(name),
            class.id(),
            arity,
            MethodKind::Library,
            body,
        );
        self.add_method(class, method)
    }

    pub(crate) fn install_primitive(
        &self,
        class: &Arc<Class>,
        name: &str,
        arity: Arity,
        ptr: PrimitiveFunction,
    ) {
        let name = self.intern(name);
        class.insert_method(
            name,
            Method::new(name, class.id(), arity, MethodKind::Library, ptr),
        );
    }

    pub fn remove_method(
        &self,
        class: &Arc<Class>,
        name: &str,
    ) -> Result<Option<Method>, RuntimeError> {
        let name = self.intern(name);
        let _guard = self.inner.hierarchy_lock.lock();
        if class.is_frozen() {
            return Err(self.frozen_class_error(class));
        }
        let removed = class.remove_method(name);
        if removed.is_some() {
            self.bump_method_version();
        }
        Ok(removed)
    }

    /// `alias_method new_name, old_name`: the alias keeps the old body even
    /// if `old_name` is redefined later.
    pub fn alias_method(
        &self,
        class: &Arc<Class>,
        new_name: &str,
        old_name: &str,
    ) -> Result<Method, RuntimeError> {
        let old = self.intern(old_name);
        let Some(original) = class.lookup_method(old) else {
            return Err(RuntimeError::NoMethod {
                name: Arc::from(old_name),
                class: class.display_name(),
            });
        };
        let alias = original.renamed(self.intern(new_name), class.id());
        self.add_method(class, alias)
    }

    pub fn subscribe(&self, observer: &Arc<dyn MethodObserver>) {
        self.inner.observers.lock().add(observer);
    }

    pub fn allocate(&self, class: &Arc<Class>) -> Value {
        Value::object(RObject::new(class.clone()))
    }

    pub fn new_string(&self, value: &str) -> Value {
        Value::object(HostObject::new(self.core().string.clone(), value.to_owned()))
    }

    pub fn object_id(&self, value: &Value) -> i64 {
        self.inner.states.object_id(value)
    }

    pub fn freeze(&self, value: &Value) {
        self.inner.states.freeze(value);
    }

    pub fn is_frozen(&self, value: &Value) -> bool {
        self.inner.states.is_frozen(value)
    }

    /// `nil` when unset.
    pub fn instance_variable_get(&self, value: &Value, name: Symbol) -> Value {
        self.inner
            .states
            .try_get_instance_variable(value, name)
            .unwrap_or(Value::Nil)
    }

    pub fn instance_variable_set(
        &self,
        value: &Value,
        name: Symbol,
        new_value: Value,
    ) -> Result<(), RuntimeError> {
        self.inner.states.set_instance_variable(value, name, new_value)
    }

    pub fn set_constant(
        &self,
        class: &Arc<Class>,
        name: &str,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let name = self.intern(name);
        let _guard = self.inner.hierarchy_lock.lock();
        if class.is_frozen() {
            return Err(self.frozen_class_error(class));
        }
        class.insert_constant(name, value);
        self.bump_constant_version();
        Ok(())
    }

    pub fn remove_constant(
        &self,
        class: &Arc<Class>,
        name: &str,
    ) -> Result<Option<Value>, RuntimeError> {
        let name = self.intern(name);
        let _guard = self.inner.hierarchy_lock.lock();
        if class.is_frozen() {
            return Err(self.frozen_class_error(class));
        }
        let removed = class.remove_constant(name);
        if removed.is_some() {
            self.bump_constant_version();
        }
        Ok(removed)
    }

    /// Lexical class and its ancestors, then `Object`.
    pub fn lookup_constant_uncached(&self, lexical: &Arc<Class>, name: Symbol) -> Option<Value> {
        lexical
            .lookup_constant(name)
            .or_else(|| self.core().object.own_constant(name))
    }

    /// Host hash of a value, folded to a fixnum.
    pub fn hash_of<T: Hash + ?Sized>(&self, value: &T) -> i64 {
        (BuildHasher::hash_one(&self.inner.hasher, value) >> 2) as i64
    }

    /// Outermost entry point. Language errors come back as `Err`; a control
    /// flow carrier reaching this point has lost its target frame, which is a
    /// bug in the caller.
    pub fn execute<T>(&self, f: impl FnOnce(&Runtime) -> Outcome<T>) -> Result<T, RuntimeError> {
        match f(self) {
            Ok(value) => Ok(value),
            Err(Thrown::Error(error)) => Err(error),
            Err(Thrown::Jump(carrier)) => {
                log::error!("control flow escaped to the top level: {:?}", carrier);
                panic!("unconsumed control flow carrier: {:?}", carrier)
            }
        }
    }

    /// Advances the collection epoch and sweeps dead extrinsic state and
    /// observers. Returns the number of state slots freed.
    pub fn collect(&self) -> usize {
        notify_collection();
        let swept = self.inner.states.sweep();
        self.inner.observers.lock().compact();
        swept
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("method_version", &self.method_version())
            .field("constant_version", &self.constant_version())
            .field("settings", &self.inner.settings)
            .field("states", &self.inner.states)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Proc, VariadicSite, retry};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeCreateInfo::default())
    }

    #[test]
    fn host_object_state_survives_freeze() {
        let rt = runtime();
        let x = rt.intern("@x");
        let o = rt.new_string("host");

        rt.freeze(&o);
        assert_eq!(
            rt.instance_variable_set(&o, x, Value::Fixnum(1)),
            Err(RuntimeError::Frozen {
                class: Arc::from("String")
            })
        );
        assert!(rt.states().try_get_instance_variable(&o, x).is_none());
        assert!(rt.is_frozen(&o));
    }

    #[test]
    fn innermost_break_lands_at_its_own_call() {
        let rt = runtime();
        let object = rt.core().object.clone();
        // Returns -1 on normal completion, the break value otherwise.
        rt.define_library_method(&object, "each_once", Arity::Exact(0), |inv| {
            let yielded = inv.yield_block(&[])?;
            if yielded.jumped {
                return Ok(yielded.value);
            }
            Ok(Value::Fixnum(-1))
        })
        .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let site = Arc::new(VariadicSite::new(rt.intern("each_once")));

        let (log2, site2) = (seen.clone(), site.clone());
        let level1 = Proc::new(Value::Nil, None, move |bp, _| {
            let (log3, site3) = (log2.clone(), site2.clone());
            let level2 = Proc::new(Value::Nil, None, move |bp, _| {
                let level3 = Proc::new(Value::Nil, None, |bp, _| bp.break_with(Value::Fixnum(42)));
                let r3 = site3.call_with_block(bp.runtime(), &Value::Nil, &[], &level3)?;
                log3.lock().push(("level3", r3.as_fixnum()));
                Ok(Value::Nil)
            });
            let r2 = site2.call_with_block(bp.runtime(), &Value::Nil, &[], &level2)?;
            log2.lock().push(("level2", r2.as_fixnum()));
            Ok(Value::Nil)
        });

        let r1 = rt
            .execute(|rt| site.call_with_block(rt, &Value::Nil, &[], &level1))
            .unwrap();
        assert_eq!(r1.as_fixnum(), Some(-1));
        assert_eq!(
            *seen.lock(),
            vec![("level3", Some(42)), ("level2", Some(-1))]
        );
    }

    #[test]
    fn released_host_objects_leave_the_state_table() {
        let rt = runtime();
        let tag = rt.intern("@tag");
        let kept: Vec<_> = (0..10).map(|i| rt.new_string(&i.to_string())).collect();
        for (i, s) in kept.iter().enumerate() {
            rt.instance_variable_set(s, tag, Value::Fixnum(i as i64)).unwrap();
        }
        for i in 0..90 {
            let temporary = rt.new_string("temporary");
            rt.instance_variable_set(&temporary, tag, Value::Fixnum(i)).unwrap();
        }

        rt.collect();
        assert_eq!(rt.states().extrinsic_len(), 10);
        for (i, s) in kept.iter().enumerate() {
            assert_eq!(rt.instance_variable_get(s, tag).as_fixnum(), Some(i as i64));
        }
    }

    struct Recorder {
        runtime: Runtime,
        added: Mutex<Vec<Arc<str>>>,
    }

    impl MethodObserver for Recorder {
        fn method_added(&self, class: &Arc<Class>, name: Symbol) {
            let name = self.runtime.symbol_name(name);
            self.added.lock().push(name.clone());
            // Observers may define methods themselves.
            if &*name == "trigger" {
                self.runtime
                    .define_method(class, "triggered", Arity::Exact(0), |_| Ok(Value::Nil))
                    .unwrap();
            }
        }
    }

    #[test]
    fn observers_see_definitions_and_can_define_more() {
        let rt = runtime();
        let class = rt.define_class("Watched", None);
        let recorder = Arc::new(Recorder {
            runtime: rt.clone(),
            added: Mutex::new(Vec::new()),
        });
        let observer: Arc<dyn MethodObserver> = recorder.clone();
        rt.subscribe(&observer);

        rt.define_method(&class, "trigger", Arity::Exact(0), |_| Ok(Value::Nil))
            .unwrap();
        rt.alias_method(&class, "fire", "trigger").unwrap();
        assert_eq!(
            recorder.added.lock().iter().map(|n| &**n).collect::<Vec<_>>(),
            ["trigger", "triggered", "fire"]
        );

        drop(observer);
        drop(recorder);
        rt.define_method(&class, "unobserved", Arity::Exact(0), |_| Ok(Value::Nil))
            .unwrap();
        rt.collect();
    }

    #[test]
    fn method_table_changes_bump_the_version() {
        let rt = runtime();
        let class = rt.define_class("Versioned", None);
        let v0 = rt.method_version();
        rt.define_method(&class, "m", Arity::Exact(0), |_| Ok(Value::Fixnum(1)))
            .unwrap();
        let v1 = rt.method_version();
        assert!(v1 > v0);

        assert!(rt.remove_method(&class, "missing").unwrap().is_none());
        assert_eq!(rt.method_version(), v1);
        assert!(rt.remove_method(&class, "m").unwrap().is_some());
        assert!(rt.method_version() > v1);

        rt.freeze(&Value::from_arc(class.clone()));
        assert!(matches!(
            rt.define_method(&class, "late", Arity::Exact(0), |_| Ok(Value::Nil)),
            Err(RuntimeError::Frozen { .. })
        ));
    }

    #[test]
    fn aliases_keep_the_old_body() {
        let rt = runtime();
        let class = rt.define_class("Aliased", None);
        rt.define_method(&class, "name", Arity::Exact(0), |_| Ok(Value::Fixnum(1)))
            .unwrap();
        rt.alias_method(&class, "old_name", "name").unwrap();
        rt.define_method(&class, "name", Arity::Exact(0), |_| Ok(Value::Fixnum(2)))
            .unwrap();

        let o = rt.allocate(&class);
        let site = VariadicSite::new(rt.intern("old_name"));
        assert_eq!(site.call(&rt, &o, &[]).unwrap().as_fixnum(), Some(1));
        assert!(rt.alias_method(&class, "x", "nope").is_err());
    }

    #[test]
    fn singletons_only_for_real_objects() {
        let rt = runtime();
        assert!(Arc::ptr_eq(
            &rt.singleton_class_of(&Value::Nil).unwrap(),
            &rt.core().nil
        ));
        assert!(matches!(
            rt.singleton_class_of(&Value::Fixnum(1)),
            Err(RuntimeError::Type { .. })
        ));

        let o = rt.allocate(&rt.core().object);
        let before = rt.method_version();
        let first = rt.singleton_class_of(&o).unwrap();
        assert!(rt.method_version() > before);
        let second = rt.singleton_class_of(&o).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&rt.class_of(&o), &first));
    }

    #[test]
    fn core_classes_are_constants_of_object() {
        let rt = runtime();
        let name = rt.intern("String");
        let found = rt.lookup_constant_uncached(&rt.core().integer, name);
        assert!(found
            .and_then(|v| v.as_class())
            .is_some_and(|c| Arc::ptr_eq(&c, &rt.core().string)));
    }

    #[test]
    fn orphaned_return_is_a_local_jump_error() {
        let rt = runtime();
        let class = rt.define_class("Maker", None);
        rt.define_method(&class, "make", Arity::Exact(0), |inv| {
            let block = inv.new_block(|bp, _| bp.return_with(Value::Fixnum(1)));
            Ok(Value::from_arc(block))
        })
        .unwrap();

        let maker = rt.allocate(&class);
        let make = VariadicSite::new(rt.intern("make"));
        let call = VariadicSite::new(rt.intern("call"));
        let result = rt.execute(|rt| {
            let block = make.call(rt, &maker, &[])?;
            call.call(rt, &block, &[])
        });
        assert_eq!(
            result.unwrap_err(),
            RuntimeError::local_jump("unexpected return")
        );
    }

    #[test]
    #[should_panic(expected = "unconsumed control flow carrier")]
    fn escaped_carriers_are_fatal() {
        let rt = runtime();
        let _ = rt.execute(|_| retry());
    }

    #[test]
    fn concurrent_definitions_share_the_hierarchy_lock() {
        let rt = runtime();
        let class = rt.define_class("Shared", None);
        let before = rt.method_version();
        let definers: Vec<_> = (0..4)
            .map(|t| {
                let (rt, class) = (rt.clone(), class.clone());
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        let name = format!("m{}_{}", t, i % 16);
                        rt.define_method(&class, &name, Arity::Exact(0), |_| Ok(Value::Nil))
                            .unwrap();
                    }
                })
            })
            .collect();
        for definer in definers {
            definer.join().unwrap();
        }

        assert_eq!(rt.method_version(), before + 8_000);
        assert!(!rt.inner.hierarchy_lock.is_locked());
        assert!(class.lookup_method(rt.intern("m3_15")).is_some());
    }
}
