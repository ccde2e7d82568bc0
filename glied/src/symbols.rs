use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

/// An interned name: method names, instance variable names, constant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    pub fn index(self) -> u32 {
        self.0
    }
}

struct SymbolTableImpl {
    names: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, Symbol, ahash::RandomState>,
}

/// Process-lifetime symbol table. Lookups of already interned names only
/// take the read lock.
pub struct SymbolTable(RwLock<SymbolTableImpl>);

impl SymbolTableImpl {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            ids: HashMap::default(),
        }
    }

    fn get_or_add(&mut self, name: &str) -> Symbol {
        if let Some(&id) = self.ids.get(name) {
            return id;
        }
        let id = Symbol(self.names.len() as u32);
        let interned = Arc::<str>::from(name);
        self.names.push(interned.clone());
        self.ids.insert(interned, id);
        id
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self(RwLock::new(SymbolTableImpl::new()))
    }

    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(&id) = self.0.read().ids.get(name) {
            return id;
        }
        self.0.write().get_or_add(name)
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.0.read().ids.get(name).copied()
    }

    pub fn name(&self, symbol: Symbol) -> Option<Arc<str>> {
        self.0.read().names.get(symbol.0 as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolTable")
            .field("len", &self.len())
            .finish()
    }
}
