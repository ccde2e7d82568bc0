mod barrier;
mod block;
mod call_site;
mod class;
mod constants;
mod equality;
mod error;
mod lock;
mod method;
mod primitives;
mod runtime;
mod state;
mod symbols;
mod unwind;
mod value;
mod versioned;
mod weak;

pub use barrier::*;
pub use block::*;
pub use call_site::*;
pub use class::*;
pub use constants::*;
pub use equality::*;
pub use error::*;
pub use lock::*;
pub use method::*;
pub use primitives::{CoreClass, PRIMITIVES, PrimitiveFunction, PrimitiveMethod, RString};
pub use runtime::*;
pub use state::*;
pub use symbols::*;
pub use unwind::*;
pub use value::*;
pub use versioned::*;
pub use weak::*;
