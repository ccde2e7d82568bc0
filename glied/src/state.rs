//! Per-object language state: frozen/tainted/untrusted flags, the lazily
//! assigned object id, an optional singleton class and instance variables.
//!
//! Objects that carry an [`InstanceData`] themselves answer every query
//! directly. Everything else (host objects, procs) gets one allocated on
//! demand in a weak lookaside table that dies together with the object.
//! Immediates live in a strong table keyed by value.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering},
    },
};

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::{
    Class, CoreClasses, FIXNUM_MAX, FIXNUM_MIN, Object, ObjectRef, RuntimeError, Symbol, Value,
    WeakKeyedTable, WeakTableSettings,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectState: u8 {
        const FROZEN = 1 << 0;
        const TAINTED = 1 << 1;
        const UNTRUSTED = 1 << 2;
    }
}

pub const FALSE_OBJECT_ID: i64 = 0;
pub const TRUE_OBJECT_ID: i64 = 2;
pub const NIL_OBJECT_ID: i64 = 4;
const FIRST_OBJECT_ID: i64 = 8;

// Even ids only; odd ids encode fixnums.
static NEXT_OBJECT_ID: AtomicI64 = AtomicI64::new(FIRST_OBJECT_ID);

type IvarMap = HashMap<Symbol, Value, ahash::RandomState>;

pub struct InstanceData {
    object_id: AtomicI64,
    flags: AtomicU8,
    immediate_class: RwLock<Option<Arc<Class>>>,
    ivars: Mutex<Option<IvarMap>>,
}

impl InstanceData {
    pub fn new() -> Self {
        Self {
            object_id: AtomicI64::new(0),
            flags: AtomicU8::new(0),
            immediate_class: RwLock::new(None),
            ivars: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ObjectState {
        ObjectState::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_frozen(&self) -> bool {
        self.state().contains(ObjectState::FROZEN)
    }

    pub fn is_tainted(&self) -> bool {
        self.state().contains(ObjectState::TAINTED)
    }

    pub fn is_untrusted(&self) -> bool {
        self.state().contains(ObjectState::UNTRUSTED)
    }

    /// Irreversible. Taken under the ivar lock so no write that already
    /// passed its frozen check can land afterwards.
    pub fn freeze(&self) {
        let _ivars = self.ivars.lock();
        self.flags
            .fetch_or(ObjectState::FROZEN.bits(), Ordering::AcqRel);
    }

    /// Sets or clears a trust flag. Returns false, leaving the flags
    /// untouched, when the object is frozen.
    fn set_flag(&self, flag: ObjectState, on: bool) -> bool {
        debug_assert!(!flag.contains(ObjectState::FROZEN));
        let result = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let mut state = ObjectState::from_bits_truncate(bits);
                if state.contains(ObjectState::FROZEN) {
                    return None;
                }
                state.set(flag, on);
                Some(state.bits())
            });
        result.is_ok()
    }

    pub fn set_tainted(&self, tainted: bool) -> bool {
        self.set_flag(ObjectState::TAINTED, tainted)
    }

    pub fn set_untrusted(&self, untrusted: bool) -> bool {
        self.set_flag(ObjectState::UNTRUSTED, untrusted)
    }

    /// Assigned on first call; later calls return the same id.
    pub fn object_id(&self) -> i64 {
        let id = self.object_id.load(Ordering::Acquire);
        if id != 0 {
            return id;
        }
        let fresh = NEXT_OBJECT_ID.fetch_add(2, Ordering::Relaxed);
        match self
            .object_id
            .compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => winner,
        }
    }

    pub fn immediate_class(&self) -> Option<Arc<Class>> {
        self.immediate_class.read().clone()
    }

    pub(crate) fn set_immediate_class(&self, class: Arc<Class>) {
        *self.immediate_class.write() = Some(class);
    }

    /// Returns false when frozen.
    pub fn set_ivar(&self, name: Symbol, value: Value) -> bool {
        let mut ivars = self.ivars.lock();
        // `freeze` takes the same lock, so it is ordered with this write.
        if self.is_frozen() {
            return false;
        }
        ivars.get_or_insert_with(IvarMap::default).insert(name, value);
        true
    }

    pub fn get_ivar(&self, name: Symbol) -> Option<Value> {
        self.ivars.lock().as_ref()?.get(&name).cloned()
    }

    /// Does not check the frozen flag; callers must.
    pub fn remove_ivar(&self, name: Symbol) -> Option<Value> {
        self.ivars.lock().as_mut()?.remove(&name)
    }

    pub fn has_ivars(&self) -> bool {
        self.ivars.lock().as_ref().is_some_and(|m| !m.is_empty())
    }

    pub fn ivar_names(&self) -> Vec<Symbol> {
        let ivars = self.ivars.lock();
        let mut names: Vec<Symbol> = ivars
            .as_ref()
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Copies instance variables into `target`, which must not be shared yet.
    pub fn copy_ivars_to(&self, target: &InstanceData) {
        let snapshot = self.ivars.lock().clone();
        if let Some(ivars) = snapshot.filter(|m| !m.is_empty()) {
            *target.ivars.lock() = Some(ivars);
        }
    }
}

impl Default for InstanceData {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InstanceData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceData")
            .field("object_id", &self.object_id.load(Ordering::Relaxed))
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ImmediateKey {
    Nil,
    Bool(bool),
    Fixnum(i64),
    Float(u64),
    Symbol(Symbol),
}

/// Where a value's state lives.
enum StateKey<'a> {
    Object(&'a ObjectRef),
    Immediate(ImmediateKey),
}

impl<'a> StateKey<'a> {
    fn of(value: &'a Value) -> Self {
        StateKey::Immediate(match value {
            Value::Object(object) => return StateKey::Object(object),
            Value::Nil => ImmediateKey::Nil,
            Value::Bool(b) => ImmediateKey::Bool(*b),
            Value::Fixnum(n) => ImmediateKey::Fixnum(*n),
            Value::Float(f) => ImmediateKey::Float(f.to_bits()),
            Value::Symbol(s) => ImmediateKey::Symbol(*s),
        })
    }
}

/// Lookup of language state for any value.
///
/// The weak table is guarded by one mutex held only for the lookup itself;
/// the returned [`InstanceData`] is locked per object.
pub struct ObjectStateStore {
    core: CoreClasses,
    extrinsic: Mutex<WeakKeyedTable<dyn Object, Arc<InstanceData>>>,
    immediates: Mutex<HashMap<ImmediateKey, Arc<InstanceData>, ahash::RandomState>>,
    extrinsic_singletons: AtomicBool,
}

impl ObjectStateStore {
    pub fn new(core: CoreClasses, settings: WeakTableSettings) -> Self {
        Self {
            core,
            extrinsic: Mutex::new(WeakKeyedTable::with_settings(settings)),
            immediates: Mutex::new(HashMap::default()),
            extrinsic_singletons: AtomicBool::new(false),
        }
    }

    pub fn get_or_create_state(&self, value: &Value) -> Arc<InstanceData> {
        match StateKey::of(value) {
            StateKey::Object(object) => match object.instance_data() {
                Some(data) => data.clone(),
                None => self
                    .extrinsic
                    .lock()
                    .get_or_insert_with(object.as_arc(), || Arc::new(InstanceData::new()))
                    .clone(),
            },
            StateKey::Immediate(key) => self
                .immediates
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(InstanceData::new()))
                .clone(),
        }
    }

    /// Never allocates.
    pub fn try_get_state(&self, value: &Value) -> Option<Arc<InstanceData>> {
        match StateKey::of(value) {
            StateKey::Object(object) => match object.instance_data() {
                Some(data) => Some(data.clone()),
                None => self
                    .extrinsic
                    .lock()
                    .try_get_value(object.as_arc())
                    .cloned(),
            },
            StateKey::Immediate(key) => self.immediates.lock().get(&key).cloned(),
        }
    }

    /// Class used for dispatch: the singleton class if one was attached,
    /// the nominal class otherwise.
    pub fn class_of(&self, value: &Value) -> Arc<Class> {
        if let Value::Object(object) = value {
            let attached = match object.instance_data() {
                Some(data) => data.immediate_class(),
                None if self.extrinsic_singletons.load(Ordering::Acquire) => self
                    .extrinsic
                    .lock()
                    .try_get_value(object.as_arc())
                    .and_then(|data| data.immediate_class()),
                None => None,
            };
            if let Some(class) = attached {
                return class;
            }
            return object.nominal_class(&self.core);
        }
        self.core.nominal_class_of(value)
    }

    pub(crate) fn attach_singleton(&self, value: &Value, singleton: Arc<Class>) {
        if let Value::Object(object) = value {
            if object.instance_data().is_none() {
                self.extrinsic_singletons.store(true, Ordering::Release);
            }
        }
        self.get_or_create_state(value).set_immediate_class(singleton);
    }

    fn frozen_error(&self, value: &Value) -> RuntimeError {
        RuntimeError::Frozen {
            class: self.class_of(value).display_name(),
        }
    }

    pub fn is_frozen(&self, value: &Value) -> bool {
        self.try_get_state(value).is_some_and(|s| s.is_frozen())
    }

    pub fn freeze(&self, value: &Value) {
        self.get_or_create_state(value).freeze();
    }

    pub fn is_tainted(&self, value: &Value) -> bool {
        self.try_get_state(value).is_some_and(|s| s.is_tainted())
    }

    pub fn is_untrusted(&self, value: &Value) -> bool {
        self.try_get_state(value).is_some_and(|s| s.is_untrusted())
    }

    pub fn set_tainted(&self, value: &Value, tainted: bool) -> Result<(), RuntimeError> {
        if self.get_or_create_state(value).set_tainted(tainted) {
            Ok(())
        } else {
            Err(self.frozen_error(value))
        }
    }

    pub fn set_untrusted(&self, value: &Value, untrusted: bool) -> Result<(), RuntimeError> {
        if self.get_or_create_state(value).set_untrusted(untrusted) {
            Ok(())
        } else {
            Err(self.frozen_error(value))
        }
    }

    /// Propagates taint and untrust from `source` to `target`. Never clears.
    pub fn taint_by(&self, target: &Value, source: &Value) -> Result<(), RuntimeError> {
        let Some(source) = self.try_get_state(source) else {
            return Ok(());
        };
        if source.is_tainted() {
            self.set_tainted(target, true)?;
        }
        if source.is_untrusted() {
            self.set_untrusted(target, true)?;
        }
        Ok(())
    }

    /// Freezes `target` if `source` is frozen.
    pub fn freeze_by(&self, target: &Value, source: &Value) {
        if self.is_frozen(source) {
            self.freeze(target);
        }
    }

    pub fn set_instance_variable(
        &self,
        value: &Value,
        name: Symbol,
        ivar: Value,
    ) -> Result<(), RuntimeError> {
        if self.get_or_create_state(value).set_ivar(name, ivar) {
            Ok(())
        } else {
            Err(self.frozen_error(value))
        }
    }

    pub fn try_get_instance_variable(&self, value: &Value, name: Symbol) -> Option<Value> {
        self.try_get_state(value)?.get_ivar(name)
    }

    pub fn try_remove_instance_variable(
        &self,
        value: &Value,
        name: Symbol,
    ) -> Result<Option<Value>, RuntimeError> {
        let Some(state) = self.try_get_state(value) else {
            return Ok(None);
        };
        if state.is_frozen() {
            return Err(self.frozen_error(value));
        }
        Ok(state.remove_ivar(name))
    }

    pub fn has_instance_variables(&self, value: &Value) -> bool {
        self.try_get_state(value).is_some_and(|s| s.has_ivars())
    }

    pub fn instance_variable_names(&self, value: &Value) -> Vec<Symbol> {
        self.try_get_state(value)
            .map(|s| s.ivar_names())
            .unwrap_or_default()
    }

    /// dup/clone support: copies instance variables plus taint and untrust
    /// to a fresh `target`. Freezing is left to [`Self::freeze_by`].
    pub fn copy_instance_data(&self, source: &Value, target: &Value) -> Result<(), RuntimeError> {
        let Some(source_state) = self.try_get_state(source) else {
            return Ok(());
        };
        if source_state.has_ivars() {
            source_state.copy_ivars_to(&self.get_or_create_state(target));
        }
        self.taint_by(target, source)
    }

    pub fn object_id(&self, value: &Value) -> i64 {
        match value {
            Value::Bool(false) => FALSE_OBJECT_ID,
            Value::Bool(true) => TRUE_OBJECT_ID,
            Value::Nil => NIL_OBJECT_ID,
            // Outside the tagged range the id comes from the state table.
            Value::Fixnum(n) if (FIXNUM_MIN..=FIXNUM_MAX).contains(n) => 2 * n + 1,
            other => self.get_or_create_state(other).object_id(),
        }
    }

    /// Number of extrinsic state slots, live or not yet swept.
    pub fn extrinsic_len(&self) -> usize {
        self.extrinsic.lock().len()
    }

    pub fn sweep(&self) -> usize {
        self.extrinsic.lock().sweep()
    }
}

impl std::fmt::Debug for ObjectStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStateStore")
            .field("extrinsic", &*self.extrinsic.lock())
            .field("immediates", &self.immediates.lock().len())
            .finish()
    }
}
