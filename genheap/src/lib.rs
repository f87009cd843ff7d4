extern crate blockalloc;

mod bitmap;
mod cardtable;
mod cell;
mod config;
pub mod constants;
mod error;
mod evacuate;
mod heap;
mod mark;
mod oldgen;
mod phase;
mod rawptr;
mod roots;
mod segment;
mod stats;
mod value;
mod weakref;
mod worklist;
mod young;


pub use cell::{CellKind, CellView};

pub use config::GcConfig;

pub use error::{ErrorKind, HeapError};

pub use heap::{Field, FinalizerHook, HasFinalizer, Heap};

pub use phase::Phase;

pub use rawptr::CellPtr;

pub use roots::{RootSet, RootStack, RootVisitor};

pub use stats::{GcStats, HeapInfo};

pub use value::{SymbolId, Value};

pub use weakref::{WeakSlotId, WeakSlotState};
