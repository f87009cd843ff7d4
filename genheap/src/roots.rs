use crate::value::Value;
use crate::weakref::WeakSlotId;

/// Receives the runtime's roots during root enumeration
pub trait RootVisitor {
    /// A strong root. The collector may rewrite it when the cell it points at
    /// is evacuated.
    fn visit(&mut self, root: &mut Value);

    /// A weak slot the runtime is holding on to
    fn visit_weak(&mut self, _slot: WeakSlotId) {}
}

/// The runtime's side of root discovery. The collector calls `visit_roots`
/// at the start of each young collection and at the start of old generation
/// marking.
pub trait RootSet {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor);

    /// Number of symbols the runtime has handed out
    fn symbol_count(&self) -> usize {
        0
    }

    /// Called at a mutator entry point after an old generation cycle with one
    /// flag per symbol, `false` for symbols nothing referenced
    fn free_symbols(&mut self, _live: &[bool]) {}
}

/// A stack of root values, the simplest possible runtime
#[derive(Debug, Default)]
pub struct RootStack {
    values: Vec<Value>,
    weak: Vec<WeakSlotId>,
    symbols: usize,
    dead_symbols: Vec<u32>,
}

impl RootStack {
    pub fn new() -> RootStack {
        RootStack::default()
    }

    /// Push a root, returning its index
    pub fn push(&mut self, value: Value) -> usize {
        self.values.push(value);
        self.values.len() - 1
    }

    pub fn pop(&mut self) -> Option<Value> {
        self.values.pop()
    }

    pub fn get(&self, index: usize) -> Value {
        self.values[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }

    pub fn push_weak(&mut self, slot: WeakSlotId) {
        self.weak.push(slot);
    }

    pub fn remove_weak(&mut self, slot: WeakSlotId) {
        self.weak.retain(|s| *s != slot);
    }

    /// Declare how many symbols exist
    pub fn set_symbol_count(&mut self, count: usize) {
        self.symbols = count;
    }

    /// Symbols reported unreferenced by the most recent old generation cycle
    pub fn dead_symbols(&self) -> &[u32] {
        &self.dead_symbols
    }
}

impl RootSet for RootStack {
    fn visit_roots(&mut self, visitor: &mut dyn RootVisitor) {
        for value in self.values.iter_mut() {
            visitor.visit(value);
        }
        for slot in self.weak.iter() {
            visitor.visit_weak(*slot);
        }
    }

    fn symbol_count(&self) -> usize {
        self.symbols
    }

    fn free_symbols(&mut self, live: &[bool]) {
        self.dead_symbols = live
            .iter()
            .enumerate()
            .filter(|(_, live)| !**live)
            .map(|(index, _)| index as u32)
            .collect();
    }
}
