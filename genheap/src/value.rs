//! Tagged word encoding for everything a heap slot or a root can hold.
//!
//! Cell addresses are word aligned, which leaves the low three bits free to
//! tag immediate values:
//!
//!  - `...000` with a non-zero address: a cell pointer
//!  - all zero: the empty value
//!  - `...001`: a 61 bit signed integer
//!  - `...010`: a symbol number

use crate::rawptr::CellPtr;

const TAG_MASK: usize = 0x7;
const TAG_CELL: usize = 0x0;
const TAG_INT: usize = 0x1;
const TAG_SYMBOL: usize = 0x2;
const TAG_BITS: u32 = 3;

/// A runtime symbol number. Symbols are not heap cells but the collector
/// reports which symbols are still referenced after each old generation cycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum Value {
    #[default]
    Empty,
    Int(i64),
    Symbol(SymbolId),
    Cell(CellPtr),
}

impl Value {
    /// Largest integer a slot can hold
    pub const INT_MAX: i64 = (1 << 60) - 1;
    /// Smallest integer a slot can hold
    pub const INT_MIN: i64 = -(1 << 60);

    /// Whether `i` survives the tagged encoding
    pub fn fits_int(i: i64) -> bool {
        (Value::INT_MIN..=Value::INT_MAX).contains(&i)
    }

    /// Encode as a single machine word. Panics on an integer outside
    /// `INT_MIN..=INT_MAX`.
    pub fn to_word(self) -> usize {
        match self {
            Value::Empty => 0,
            Value::Int(i) => {
                assert!(Value::fits_int(i), "integer {} does not fit in 61 bits", i);
                ((i << TAG_BITS) as usize) | TAG_INT
            }
            Value::Symbol(SymbolId(s)) => ((s as usize) << TAG_BITS) | TAG_SYMBOL,
            Value::Cell(ptr) => ptr.as_word(),
        }
    }

    /// Decode a machine word written by `to_word`
    pub fn from_word(word: usize) -> Value {
        match word & TAG_MASK {
            TAG_CELL if word == 0 => Value::Empty,
            TAG_CELL => Value::Cell(CellPtr::from_addr(word)),
            TAG_INT => Value::Int((word as i64) >> TAG_BITS),
            TAG_SYMBOL => Value::Symbol(SymbolId((word >> TAG_BITS) as u32)),
            _ => panic!("invalid tagged word {:#x}", word),
        }
    }

    pub fn as_cell(&self) -> Option<CellPtr> {
        match self {
            Value::Cell(ptr) => Some(*ptr),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Value::Empty
    }
}

impl From<CellPtr> for Value {
    fn from(ptr: CellPtr) -> Value {
        Value::Cell(ptr)
    }
}
