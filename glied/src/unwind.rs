//! Non-local control flow.
//!
//! A `return`, `break`, `retry`, `next` or `redo` that has to leave more than
//! the current native frame travels as a [`Carrier`] inside
//! [`Thrown::Jump`]. Every native frame forwards it with `?`; only the frame
//! the carrier targets consumes it. Carriers never leave the thread that
//! created them.
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::{RuntimeError, Value};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A user method activation; also the converter of blocks passed to it.
    Method,
    /// Break target created on demand for blocks yielded to by library
    /// methods.
    Converter,
}

/// Identity of an unwind target. Compared by reference only.
pub struct FlowFrame {
    id: u64,
    kind: FrameKind,
    active: AtomicBool,
}

pub type FrameRef = Arc<FlowFrame>;

impl FlowFrame {
    pub fn new(kind: FrameKind) -> FrameRef {
        Arc::new(Self {
            id: NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// False once the activation this frame stands for has returned.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub fn is(&self, other: &FlowFrame) -> bool {
        std::ptr::eq(self, other)
    }
}

impl fmt::Debug for FlowFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FlowFrame({}, {:?}{})",
            self.id,
            self.kind,
            if self.is_active() { "" } else { ", inactive" }
        )
    }
}

/// Keeps a frame active for the lifetime of the guard, including unwinding.
pub struct ActiveFrame(FrameRef);

impl ActiveFrame {
    pub fn new(kind: FrameKind) -> Self {
        Self(FlowFrame::new(kind))
    }

    pub fn frame(&self) -> &FrameRef {
        &self.0
    }
}

impl Drop for ActiveFrame {
    fn drop(&mut self) {
        self.0.deactivate();
    }
}

#[derive(Debug, Clone)]
pub enum Carrier {
    /// `return` from a block, unwinding to the block's defining method.
    MethodReturn { target: FrameRef, value: Value },
    /// Restarts the nearest retriable construct. Carries nothing.
    Retry,
    /// `break` from a block, unwinding to the block's converter frame.
    BlockBreak { target: FrameRef, value: Value },
    /// `redo` restarts the current block iteration; `next` finishes it with
    /// `value`.
    BlockRedo { is_redo: bool, value: Value },
}

impl Carrier {
    pub fn target(&self) -> Option<&FrameRef> {
        match self {
            Carrier::MethodReturn { target, .. } | Carrier::BlockBreak { target, .. } => {
                Some(target)
            }
            Carrier::Retry | Carrier::BlockRedo { .. } => None,
        }
    }

    pub fn targets(&self, frame: &FlowFrame) -> bool {
        self.target().is_some_and(|t| t.is(frame))
    }

    pub fn value(&self) -> Value {
        match self {
            Carrier::MethodReturn { value, .. }
            | Carrier::BlockBreak { value, .. }
            | Carrier::BlockRedo { value, .. } => value.clone(),
            Carrier::Retry => Value::Nil,
        }
    }

    /// Unwraps the value if this carrier targets `frame`, hands the carrier
    /// back otherwise so it keeps propagating.
    pub fn consume(self, frame: &FlowFrame) -> Result<Value, Carrier> {
        match self {
            Carrier::MethodReturn { target, value } | Carrier::BlockBreak { target, value }
                if target.is(frame) =>
            {
                Ok(value)
            }
            other => Err(other),
        }
    }
}

/// What a native frame can propagate: a language error or a jump.
#[derive(Debug, Clone)]
pub enum Thrown {
    Error(RuntimeError),
    Jump(Carrier),
}

pub type Outcome<T = Value> = Result<T, Thrown>;

impl Thrown {
    pub fn as_error(&self) -> Option<&RuntimeError> {
        match self {
            Thrown::Error(e) => Some(e),
            Thrown::Jump(_) => None,
        }
    }

    pub fn is_retry(&self) -> bool {
        matches!(self, Thrown::Jump(Carrier::Retry))
    }
}

impl From<RuntimeError> for Thrown {
    fn from(value: RuntimeError) -> Self {
        Thrown::Error(value)
    }
}

impl From<Carrier> for Thrown {
    fn from(value: Carrier) -> Self {
        Thrown::Jump(value)
    }
}

impl fmt::Display for Thrown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Thrown::Error(e) => write!(f, "{}", e),
            Thrown::Jump(c) => write!(f, "unconsumed control flow: {:?}", c),
        }
    }
}

/// Turns a carrier aimed at `frame` into a normal return.
pub fn consume_at(result: Outcome, frame: &FlowFrame) -> Outcome {
    match result {
        Err(Thrown::Jump(carrier)) => carrier.consume(frame).map_err(Thrown::Jump),
        other => other,
    }
}

/// `begin body rescue => e; rescue(e) end`, where a `retry` raised by the
/// rescue clause runs `body` again. Jumps out of `body` are not rescued.
pub fn rescue_retry(
    mut body: impl FnMut() -> Outcome,
    mut rescue: impl FnMut(RuntimeError) -> Outcome,
) -> Outcome {
    loop {
        match body() {
            Err(Thrown::Error(error)) => match rescue(error) {
                Err(Thrown::Jump(Carrier::Retry)) => {
                    log::trace!("retry from rescue clause");
                    continue;
                }
                other => return other,
            },
            other => return other,
        }
    }
}

/// `retry` as written inside a rescue clause.
pub fn retry() -> Outcome {
    Err(Thrown::Jump(Carrier::Retry))
}
