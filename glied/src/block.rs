//! Blocks, procs and the per-invocation [`BlockParam`] that classifies how
//! a block body finished.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;

use crate::{
    Carrier, Class, CoreClasses, FlowFrame, FrameKind, FrameRef, Object, Outcome, Runtime,
    RuntimeError, Thrown, Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcKind {
    /// A literal block that was never converted to a proc.
    Block,
    /// A block promoted to a proc; `break` unwinds to its converter.
    Proc,
    /// `break` and `return` leave only the lambda itself.
    Lambda,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockCallerKind {
    Yield,
    Call,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReturnReason {
    Undefined,
    Retry,
    Return,
    Break,
}

/// Result of running a block once. `jumped` means the block issued
/// `break`, `return` or `retry` and the caller must stop what it is doing.
#[derive(Debug, Clone)]
pub struct Yielded {
    pub jumped: bool,
    pub value: Value,
}

impl Yielded {
    pub fn normal(value: Value) -> Self {
        Self {
            jumped: false,
            value,
        }
    }
}

pub type BlockBody = dyn Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync;

pub struct Proc {
    lambda: bool,
    self_value: Value,
    /// Method activation the block was written in; target of `return`.
    owner: Option<FrameRef>,
    /// Target of `break`. Set when the block is first handed to a method.
    converter: Mutex<Option<FrameRef>>,
    body: Arc<BlockBody>,
}

impl Proc {
    pub fn new(
        self_value: Value,
        owner: Option<FrameRef>,
        body: impl Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            lambda: false,
            self_value,
            owner,
            converter: Mutex::new(None),
            body: Arc::new(body),
        })
    }

    pub fn lambda(
        self_value: Value,
        owner: Option<FrameRef>,
        body: impl Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            lambda: true,
            self_value,
            owner,
            converter: Mutex::new(None),
            body: Arc::new(body),
        })
    }

    pub fn kind(&self) -> ProcKind {
        if self.lambda {
            ProcKind::Lambda
        } else if self.converter.lock().is_some() {
            ProcKind::Proc
        } else {
            ProcKind::Block
        }
    }

    pub fn is_lambda(&self) -> bool {
        self.lambda
    }

    pub fn self_value(&self) -> &Value {
        &self.self_value
    }

    pub fn owner(&self) -> Option<&FrameRef> {
        self.owner.as_ref()
    }

    pub fn converter(&self) -> Option<FrameRef> {
        self.converter.lock().clone()
    }

    /// Makes `frame` the break target. Only plain blocks are promoted; a
    /// proc keeps its first converter even after that frame returned.
    pub(crate) fn promote(&self, frame: &FrameRef) -> bool {
        if self.lambda {
            return false;
        }
        let mut converter = self.converter.lock();
        if converter.is_some() {
            return false;
        }
        *converter = Some(frame.clone());
        true
    }

    /// Runs the body, handling `redo` and `next`.
    fn run_body(&self, param: &BlockParam<'_>, args: &[Value]) -> Outcome {
        loop {
            match (self.body)(param, args) {
                Err(Thrown::Jump(Carrier::BlockRedo { is_redo: true, .. })) => continue,
                Err(Thrown::Jump(Carrier::BlockRedo {
                    is_redo: false,
                    value,
                })) => return Ok(value),
                other => return other,
            }
        }
    }

    /// `proc.call(*args)`.
    pub fn call(self: &Arc<Self>, runtime: &Runtime, args: &[Value]) -> Outcome {
        let param = BlockParam::for_proc_call(runtime, self);
        let yielded = param.yield_values(args)?;
        if !yielded.jumped {
            return Ok(yielded.value);
        }
        match param.return_reason() {
            BlockReturnReason::Break if param.source_kind() == ProcKind::Lambda => {
                Ok(yielded.value)
            }
            BlockReturnReason::Break => param.break_to_target(yielded.value),
            BlockReturnReason::Undefined => Ok(yielded.value),
            BlockReturnReason::Return | BlockReturnReason::Retry => {
                Err(param.jump_for(yielded.value))
            }
        }
    }
}

impl fmt::Debug for Proc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proc")
            .field("kind", &self.kind())
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Object for Proc {
    fn nominal_class(&self, core: &CoreClasses) -> Arc<Class> {
        core.proc.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// One invocation of a block. Flow statements inside the body go through
/// it and the body returns what they return.
pub struct BlockParam<'a> {
    runtime: &'a Runtime,
    proc: &'a Arc<Proc>,
    caller_kind: BlockCallerKind,
    library_converter: Option<&'a OnceLock<FrameRef>>,
    reason: Cell<BlockReturnReason>,
    target_frame: RefCell<Option<FrameRef>>,
    return_target: RefCell<Option<FrameRef>>,
    source_kind: Cell<ProcKind>,
}

impl<'a> BlockParam<'a> {
    fn with(
        runtime: &'a Runtime,
        proc: &'a Arc<Proc>,
        caller_kind: BlockCallerKind,
        library_converter: Option<&'a OnceLock<FrameRef>>,
    ) -> Self {
        Self {
            runtime,
            proc,
            caller_kind,
            library_converter,
            reason: Cell::new(BlockReturnReason::Undefined),
            target_frame: RefCell::new(None),
            return_target: RefCell::new(None),
            source_kind: Cell::new(proc.kind()),
        }
    }

    pub fn for_yield(runtime: &'a Runtime, proc: &'a Arc<Proc>) -> Self {
        Self::with(runtime, proc, BlockCallerKind::Yield, None)
    }

    pub fn for_proc_call(runtime: &'a Runtime, proc: &'a Arc<Proc>) -> Self {
        Self::with(runtime, proc, BlockCallerKind::Call, None)
    }

    /// Yield from a library method. The method's converter frame is only
    /// created if the block actually breaks.
    pub fn for_library_method(
        runtime: &'a Runtime,
        proc: &'a Arc<Proc>,
        converter: &'a OnceLock<FrameRef>,
    ) -> Self {
        Self::with(runtime, proc, BlockCallerKind::Yield, Some(converter))
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn proc(&self) -> &'a Arc<Proc> {
        self.proc
    }

    pub fn self_value(&self) -> &Value {
        &self.proc.self_value
    }

    pub fn caller_kind(&self) -> BlockCallerKind {
        self.caller_kind
    }

    pub fn return_reason(&self) -> BlockReturnReason {
        self.reason.get()
    }

    /// Set exactly when the reason is `Break`.
    pub fn target_frame(&self) -> Option<FrameRef> {
        self.target_frame.borrow().clone()
    }

    pub fn source_kind(&self) -> ProcKind {
        self.source_kind.get()
    }

    fn set_flow_control(
        &self,
        reason: BlockReturnReason,
        target: Option<FrameRef>,
        source_kind: ProcKind,
    ) {
        debug_assert_eq!(reason == BlockReturnReason::Break, target.is_some());
        self.reason.set(reason);
        *self.target_frame.borrow_mut() = target;
        self.source_kind.set(source_kind);
    }

    /// Runs the block body once.
    pub fn yield_values(&self, args: &[Value]) -> Outcome<Yielded> {
        match self.proc.run_body(self, args) {
            Ok(value) => Ok(Yielded {
                jumped: self.reason.get() != BlockReturnReason::Undefined,
                value,
            }),
            Err(Thrown::Jump(carrier)) if self.classifies(&carrier) => Ok(Yielded {
                jumped: true,
                value: carrier.value(),
            }),
            Err(other) => Err(other),
        }
    }

    /// Whether `carrier` was raised by a flow statement of this invocation.
    fn classifies(&self, carrier: &Carrier) -> bool {
        let same = |slot: &RefCell<Option<FrameRef>>, target: &FrameRef| {
            slot.borrow().as_ref().is_some_and(|t| t.is(target))
        };
        match (self.reason.get(), carrier) {
            (BlockReturnReason::Break, Carrier::BlockBreak { target, .. }) => {
                same(&self.target_frame, target)
            }
            (BlockReturnReason::Return, Carrier::MethodReturn { target, .. }) => {
                same(&self.return_target, target)
            }
            (BlockReturnReason::Retry, Carrier::Retry) => true,
            _ => false,
        }
    }

    /// The unwrapped value if the block issued `return`.
    pub fn returning(&self, yielded: &Yielded) -> Option<Value> {
        (self.reason.get() == BlockReturnReason::Return).then(|| yielded.value.clone())
    }

    /// The carrier that continues the classified jump.
    pub fn into_carrier(&self, value: Value) -> Option<Carrier> {
        match self.reason.get() {
            BlockReturnReason::Undefined => None,
            BlockReturnReason::Retry => Some(Carrier::Retry),
            BlockReturnReason::Break => self
                .target_frame()
                .map(|target| Carrier::BlockBreak { target, value }),
            BlockReturnReason::Return => self
                .return_target
                .borrow()
                .clone()
                .map(|target| Carrier::MethodReturn { target, value }),
        }
    }

    fn jump_for(&self, value: Value) -> Thrown {
        match self.into_carrier(value) {
            Some(carrier) => Thrown::Jump(carrier),
            None => Thrown::Error(RuntimeError::local_jump("unexpected jump")),
        }
    }

    fn converter_for_break(&self) -> Option<FrameRef> {
        if let Some(converter) = self.proc.converter() {
            return Some(converter);
        }
        let cell = self.library_converter?;
        let frame = cell.get_or_init(|| FlowFrame::new(FrameKind::Converter));
        self.proc.promote(frame);
        self.proc.converter()
    }

    /// `break value`.
    pub fn break_with(&self, value: Value) -> Outcome {
        if self.proc.lambda {
            return Err(Carrier::BlockRedo {
                is_redo: false,
                value,
            }
            .into());
        }
        match self.converter_for_break() {
            Some(target) => {
                self.set_flow_control(
                    BlockReturnReason::Break,
                    Some(target.clone()),
                    self.proc.kind(),
                );
                Err(Carrier::BlockBreak { target, value }.into())
            }
            None => Err(RuntimeError::local_jump("break from proc-closure").into()),
        }
    }

    /// `return value` inside the block.
    pub fn return_with(&self, value: Value) -> Outcome {
        if self.proc.lambda {
            return Err(Carrier::BlockRedo {
                is_redo: false,
                value,
            }
            .into());
        }
        match &self.proc.owner {
            Some(owner) if owner.is_active() => {
                self.set_flow_control(BlockReturnReason::Return, None, self.proc.kind());
                *self.return_target.borrow_mut() = Some(owner.clone());
                Err(Carrier::MethodReturn {
                    target: owner.clone(),
                    value,
                }
                .into())
            }
            _ => Err(RuntimeError::local_jump("unexpected return").into()),
        }
    }

    pub fn retry(&self) -> Outcome {
        if self.caller_kind == BlockCallerKind::Yield {
            self.set_flow_control(BlockReturnReason::Retry, None, self.proc.kind());
            Err(Carrier::Retry.into())
        } else {
            Err(RuntimeError::local_jump("retry from proc-closure").into())
        }
    }

    pub fn next_with(&self, value: Value) -> Outcome {
        Err(Carrier::BlockRedo {
            is_redo: false,
            value,
        }
        .into())
    }

    pub fn redo(&self) -> Outcome {
        Err(Carrier::BlockRedo {
            is_redo: true,
            value: Value::Nil,
        }
        .into())
    }

    /// Unwinds a classified break to its converter, if that frame is still
    /// running.
    pub(crate) fn break_to_target(&self, value: Value) -> Outcome {
        match self.target_frame() {
            Some(target) if target.is_active() => {
                Err(Carrier::BlockBreak { target, value }.into())
            }
            _ => Err(RuntimeError::local_jump("break from proc-closure").into()),
        }
    }

    /// Post-yield handling in a method whose own frame is `frame` (the
    /// method frame for user methods, the converter for library methods).
    /// A break aimed at `frame` comes back as `jumped` so the method can
    /// return the value without unwinding.
    pub(crate) fn finish_method_yield(
        &self,
        yielded: Yielded,
        frame: Option<&FlowFrame>,
    ) -> Outcome<Yielded> {
        if !yielded.jumped {
            return Ok(yielded);
        }
        match self.reason.get() {
            BlockReturnReason::Break => {
                let own = match (self.target_frame(), frame) {
                    (Some(target), Some(frame)) => target.is_active() && target.is(frame),
                    _ => false,
                };
                if own {
                    Ok(yielded)
                } else {
                    self.break_to_target(yielded.value).map(Yielded::normal)
                }
            }
            BlockReturnReason::Return | BlockReturnReason::Retry => {
                Err(self.jump_for(yielded.value))
            }
            BlockReturnReason::Undefined => Ok(yielded),
        }
    }

    /// `yield` written inside this block's body, to the enclosing method's
    /// block.
    pub fn yield_from_block(&self, block: &Arc<Proc>, args: &[Value]) -> Outcome<Yielded> {
        let inner = BlockParam::for_yield(self.runtime, block);
        let yielded = inner.yield_values(args)?;
        if !yielded.jumped {
            return Ok(yielded);
        }
        match inner.return_reason() {
            BlockReturnReason::Retry => self.retry().map(Yielded::normal),
            BlockReturnReason::Return => {
                if self.caller_kind == BlockCallerKind::Yield {
                    self.set_flow_control(BlockReturnReason::Return, None, inner.source_kind());
                    *self.return_target.borrow_mut() = inner.return_target.borrow().clone();
                }
                Err(inner.jump_for(yielded.value))
            }
            BlockReturnReason::Break => inner.break_to_target(yielded.value).map(Yielded::normal),
            BlockReturnReason::Undefined => Ok(yielded),
        }
    }

    /// Re-exposes how a nested block finished to this block's caller: a
    /// nested `break` breaks out of this block, a nested `return` or
    /// `retry` is classified as this block's own.
    pub fn propagate_flow(&self, inner: &BlockParam<'_>, value: Value) -> Outcome {
        match inner.return_reason() {
            BlockReturnReason::Break => self.break_with(value),
            BlockReturnReason::Undefined => Ok(value),
            BlockReturnReason::Retry => {
                self.set_flow_control(BlockReturnReason::Retry, None, inner.source_kind());
                Err(Carrier::Retry.into())
            }
            BlockReturnReason::Return => {
                self.set_flow_control(BlockReturnReason::Return, None, inner.source_kind());
                *self.return_target.borrow_mut() = inner.return_target.borrow().clone();
                Err(inner.jump_for(value))
            }
        }
    }

    /// A block written inside this block. Shares its `self` and its
    /// `return` target.
    pub fn new_block(
        &self,
        body: impl Fn(&BlockParam<'_>, &[Value]) -> Outcome + Send + Sync + 'static,
    ) -> Arc<Proc> {
        Proc::new(
            self.proc.self_value.clone(),
            self.proc.owner.clone(),
            body,
        )
    }
}

impl fmt::Debug for BlockParam<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockParam")
            .field("caller_kind", &self.caller_kind)
            .field("reason", &self.reason.get())
            .field("target_frame", &self.target_frame.borrow())
            .field("source_kind", &self.source_kind.get())
            .finish()
    }
}
