use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::RwLock;

use crate::{CoreClasses, InstanceData, Method, Object, Symbol, Value};

/// Process-unique identity of a class or module. Used as the dispatch shape
/// key and as the owner key of qualified constant caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(1);

impl ModuleId {
    fn next() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

type Table<V> = RwLock<HashMap<Symbol, V, ahash::RandomState>>;

/// A runtime class. Method and constant tables are only mutated through the
/// [`Runtime`](crate::Runtime), which bumps the matching version counter.
pub struct Class {
    id: ModuleId,
    name: Option<Arc<str>>,
    superclass: Option<Arc<Class>>,
    singleton: bool,
    methods: Table<Method>,
    constants: Table<Value>,
    data: Arc<InstanceData>,
}

impl Class {
    pub fn new(name: Option<&str>, superclass: Option<Arc<Class>>) -> Arc<Self> {
        Arc::new(Self {
            id: ModuleId::next(),
            name: name.map(Arc::from),
            superclass,
            singleton: false,
            methods: RwLock::new(HashMap::default()),
            constants: RwLock::new(HashMap::default()),
            data: Arc::new(InstanceData::new()),
        })
    }

    /// A singleton class inherits from the class the object had before.
    pub(crate) fn new_singleton(attached_to: &Arc<Class>) -> Arc<Self> {
        Arc::new(Self {
            id: ModuleId::next(),
            name: None,
            superclass: Some(attached_to.clone()),
            singleton: true,
            methods: RwLock::new(HashMap::default()),
            constants: RwLock::new(HashMap::default()),
            data: Arc::new(InstanceData::new()),
        })
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn name(&self) -> Option<&Arc<str>> {
        self.name.as_ref()
    }

    /// Name for messages; singleton and anonymous classes borrow the name
    /// of the first named ancestor.
    pub fn display_name(&self) -> Arc<str> {
        self.ancestors()
            .find_map(|c| c.name.clone())
            .unwrap_or_else(|| Arc::from("#<Class>"))
    }

    pub fn superclass(&self) -> Option<&Arc<Class>> {
        self.superclass.as_ref()
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn data(&self) -> &Arc<InstanceData> {
        &self.data
    }

    pub fn is_frozen(&self) -> bool {
        self.data.is_frozen()
    }

    /// `self` followed by its superclass chain.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    pub fn is_subclass_of(&self, other: &Class) -> bool {
        self.ancestors().any(|c| c.id == other.id)
    }

    pub fn own_method(&self, name: Symbol) -> Option<Method> {
        self.methods.read().get(&name).cloned()
    }

    /// Walks the superclass chain. Module inclusion is not modelled.
    pub fn lookup_method(&self, name: Symbol) -> Option<Method> {
        self.ancestors().find_map(|c| c.own_method(name))
    }

    pub fn method_names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.methods.read().keys().copied().collect();
        names.sort();
        names
    }

    pub(crate) fn insert_method(&self, name: Symbol, method: Method) -> Option<Method> {
        self.methods.write().insert(name, method)
    }

    pub(crate) fn remove_method(&self, name: Symbol) -> Option<Method> {
        self.methods.write().remove(&name)
    }

    pub fn own_constant(&self, name: Symbol) -> Option<Value> {
        self.constants.read().get(&name).cloned()
    }

    /// Constant lookup through the superclass chain.
    pub fn lookup_constant(&self, name: Symbol) -> Option<Value> {
        self.ancestors().find_map(|c| c.own_constant(name))
    }

    pub(crate) fn insert_constant(&self, name: Symbol, value: Value) -> Option<Value> {
        self.constants.write().insert(name, value)
    }

    pub(crate) fn remove_constant(&self, name: Symbol) -> Option<Value> {
        self.constants.write().remove(&name)
    }
}

pub struct Ancestors<'a> {
    next: Option<&'a Class>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Class;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.superclass.as_deref();
        Some(current)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.display_name())
            .field("singleton", &self.singleton)
            .finish()
    }
}

impl Object for Class {
    fn nominal_class(&self, core: &CoreClasses) -> Arc<Class> {
        core.class.clone()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SymbolTable;

    #[test]
    fn module_ids_are_unique() {
        let a = Class::new(Some("A"), None);
        let b = Class::new(Some("B"), None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn ancestors_walk_the_superclass_chain() {
        let object = Class::new(Some("Object"), None);
        let animal = Class::new(Some("Animal"), Some(object.clone()));
        let dog = Class::new(Some("Dog"), Some(animal.clone()));

        let names: Vec<_> = dog.ancestors().map(|c| c.display_name()).collect();
        assert_eq!(
            names.iter().map(|n| &**n).collect::<Vec<_>>(),
            ["Dog", "Animal", "Object"]
        );
        assert!(dog.is_subclass_of(&object));
        assert!(!object.is_subclass_of(&dog));
    }

    #[test]
    fn singleton_classes_borrow_the_attached_name() {
        let object = Class::new(Some("Object"), None);
        let singleton = Class::new_singleton(&object);
        assert!(singleton.is_singleton());
        assert_eq!(&*singleton.display_name(), "Object");
        assert!(singleton.is_subclass_of(&object));
    }

    #[test]
    fn constants_are_inherited() {
        let symbols = SymbolTable::new();
        let name = symbols.intern("LIMIT");
        let base = Class::new(Some("Base"), None);
        let derived = Class::new(Some("Derived"), Some(base.clone()));

        base.insert_constant(name, Value::Fixnum(10));
        assert!(derived.own_constant(name).is_none());
        assert_eq!(
            derived.lookup_constant(name).and_then(|v| v.as_fixnum()),
            Some(10)
        );
        base.remove_constant(name);
        assert!(derived.lookup_constant(name).is_none());
    }
}
