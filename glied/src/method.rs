use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use crate::{
    ActiveFrame, BlockParam, Class, FrameKind, FrameRef, ModuleId, Outcome, Proc, Runtime,
    RuntimeError, Symbol, Value, Yielded, consume_at,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(self, given: usize) -> bool {
        match self {
            Arity::Exact(n) => given == n,
            Arity::AtLeast(n) => given >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "{}+", n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Compiled language code: gets its own frame, which is the `return`
    /// target of blocks written in it and the converter of its block.
    User,
    /// Host code: no frame, a converter only when its block breaks.
    Library,
}

/// Shape of a call as seen by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub argc: usize,
    pub has_block: bool,
}

impl CallSignature {
    pub fn new(argc: usize, has_block: bool) -> Self {
        Self { argc, has_block }
    }
}

static NIL: Value = Value::Nil;

pub type MethodBody = dyn Fn(&Invocation<'_>) -> Outcome + Send + Sync;

pub struct MethodInfo {
    pub name: Symbol,
    pub owner: ModuleId,
    pub arity: Arity,
    pub kind: MethodKind,
    body: Arc<MethodBody>,
}

/// Invocable method handle. Cheap to clone; identity is the allocation.
#[derive(Clone)]
pub struct Method(Arc<MethodInfo>);

impl Method {
    pub fn new(
        name: Symbol,
        owner: ModuleId,
        arity: Arity,
        kind: MethodKind,
        body: impl Fn(&Invocation<'_>) -> Outcome + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(MethodInfo {
            name,
            owner,
            arity,
            kind,
            body: Arc::new(body),
        }))
    }

    /// Same body under another name, as `alias_method` does.
    pub(crate) fn renamed(&self, name: Symbol, owner: ModuleId) -> Self {
        Self(Arc::new(MethodInfo {
            name,
            owner,
            arity: self.0.arity,
            kind: self.0.kind,
            body: self.0.body.clone(),
        }))
    }

    pub fn name(&self) -> Symbol {
        self.0.name
    }

    pub fn owner(&self) -> ModuleId {
        self.0.owner
    }

    pub fn arity(&self) -> Arity {
        self.0.arity
    }

    pub fn kind(&self) -> MethodKind {
        self.0.kind
    }

    pub fn ptr_eq(&self, other: &Method) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn invoke(
        &self,
        runtime: &Runtime,
        receiver: &Value,
        args: &[Value],
        block: Option<&Arc<Proc>>,
    ) -> Outcome {
        if !self.0.arity.accepts(args.len()) {
            return Err(RuntimeError::Argument {
                expected: self.0.arity,
                given: args.len(),
            }
            .into());
        }

        let converter = OnceLock::new();
        match self.0.kind {
            MethodKind::User => {
                let active = ActiveFrame::new(FrameKind::Method);
                if let Some(block) = block {
                    block.promote(active.frame());
                }
                let invocation = Invocation {
                    runtime,
                    receiver,
                    args,
                    block,
                    frame: Some(active.frame()),
                    converter: &converter,
                    method: self,
                };
                consume_at((self.0.body)(&invocation), active.frame())
            }
            MethodKind::Library => {
                let invocation = Invocation {
                    runtime,
                    receiver,
                    args,
                    block,
                    frame: None,
                    converter: &converter,
                    method: self,
                };
                let result = (self.0.body)(&invocation);
                match converter.get() {
                    Some(frame) => {
                        let result = consume_at(result, frame);
                        frame.deactivate();
                        result
                    }
                    None => result,
                }
            }
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.0.name)
            .field("owner", &self.0.owner)
            .field("arity", &self.0.arity)
            .field("kind", &self.0.kind)
            .finish()
    }
}

/// Everything a method body sees of its activation.
pub struct Invocation<'a> {
    pub runtime: &'a Runtime,
    pub receiver: &'a Value,
    pub args: &'a [Value],
    pub block: Option<&'a Arc<Proc>>,
    frame: Option<&'a FrameRef>,
    converter: &'a OnceLock<FrameRef>,
    method: &'a Method,
}

impl<'a> Invocation<'a> {
    pub fn arg(&self, index: usize) -> &'a Value {
        self.args.get(index).unwrap_or(&NIL)
    }

    pub fn method(&self) -> &'a Method {
        self.method
    }

    pub fn block_given(&self) -> bool {
        self.block.is_some()
    }

    /// The method frame; `None` for library methods.
    pub fn frame(&self) -> Option<&'a FrameRef> {
        self.frame
    }

    /// `yield *args`. When `jumped` comes back the body must return
    /// `value` right away: the block broke out of this very call.
    pub fn yield_block(&self, args: &[Value]) -> Outcome<Yielded> {
        let Some(block) = self.block else {
            return Err(RuntimeError::local_jump("no block given (yield)").into());
        };
        match self.frame {
            Some(frame) => {
                let param = BlockParam::for_yield(self.runtime, block);
                let yielded = param.yield_values(args)?;
                param.finish_method_yield(yielded, Some(frame))
            }
            None => {
                let param = BlockParam::for_library_method(self.runtime, block, self.converter);
                let yielded = param.yield_values(args)?;
                param.finish_method_yield(yielded, self.converter.get().map(|c| &**c))
            }
        }
    }

    /// A block literal written in this method's body.
    pub fn new_block(
        &self,
        body: impl Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Proc> {
        Proc::new(self.receiver.clone(), self.frame.cloned(), body)
    }

    pub fn new_lambda(
        &self,
        body: impl Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Proc> {
        Proc::lambda(self.receiver.clone(), self.frame.cloned(), body)
    }
}

/// Full method resolution, consulted by call sites on a miss.
pub trait MethodResolver: Send + Sync {
    fn resolve(&self, shape: &Arc<Class>, name: Symbol, signature: CallSignature)
    -> Option<Method>;
}

/// Superclass-chain lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct AncestorResolver;

impl MethodResolver for AncestorResolver {
    fn resolve(&self, shape: &Arc<Class>, name: Symbol, _: CallSignature) -> Option<Method> {
        shape.lookup_method(name)
    }
}
