use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::constants;
use crate::rawptr::CellPtr;
use crate::value::Value;
use crate::weakref::WeakSlotId;

/// The closed set of cell kinds. `Freelist` is reserved for reclaimed space.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CellKind {
    Freelist = 0,
    /// A sequence of strong `Value` slots
    Object = 1,
    /// Raw words, never traced
    Bytes = 2,
    /// Names a weak slot; keeps the slot but not its target alive
    WeakRef = 3,
    /// Key/value pairs; keys are weak, a value lives while its key does
    WeakMap = 4,
}

impl CellKind {
    fn from_u8(kind: u8) -> CellKind {
        match kind {
            0 => CellKind::Freelist,
            1 => CellKind::Object,
            2 => CellKind::Bytes,
            3 => CellKind::WeakRef,
            4 => CellKind::WeakMap,
            _ => panic!("invalid cell kind {} in header", kind),
        }
    }

    pub(crate) fn vtable(self) -> &'static CellVTable {
        &VTABLES[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.vtable().name
    }
}

/// Per-kind behavior, indexed by `CellKind`
pub(crate) struct CellVTable {
    pub name: &'static str,
    pub trace: fn(CellRef, &mut dyn SlotAcceptor),
}

static VTABLES: [CellVTable; 5] = [
    CellVTable {
        name: "freelist",
        trace: trace_nothing,
    },
    CellVTable {
        name: "object",
        trace: trace_object,
    },
    CellVTable {
        name: "bytes",
        trace: trace_nothing,
    },
    CellVTable {
        name: "weakref",
        trace: trace_weak_ref,
    },
    CellVTable {
        name: "weakmap",
        trace: trace_weak_map,
    },
];

fn trace_nothing(_cell: CellRef, _acceptor: &mut dyn SlotAcceptor) {}

fn trace_object(cell: CellRef, acceptor: &mut dyn SlotAcceptor) {
    for index in 0..cell.payload_words() {
        acceptor.accept(cell.slot(index));
    }
}

fn trace_weak_ref(cell: CellRef, acceptor: &mut dyn SlotAcceptor) {
    if let Some(slot) = cell.weak_slot() {
        acceptor.accept_weak_slot(slot);
    }
}

fn trace_weak_map(cell: CellRef, acceptor: &mut dyn SlotAcceptor) {
    for entry in 0..cell.payload_words() / 2 {
        acceptor.accept_weak_map_entry(cell.slot(entry * 2), cell.slot(entry * 2 + 1));
    }
}

/// The visitor side of cell tracing. Each collector traversal implements this.
pub(crate) trait SlotAcceptor {
    fn accept(&mut self, slot: HeapSlot);

    /// Weak map entries are strong unless the traversal says otherwise
    fn accept_weak_map_entry(&mut self, key: HeapSlot, value: HeapSlot) {
        self.accept(key);
        self.accept(value);
    }

    fn accept_weak_slot(&mut self, _slot: WeakSlotId) {}
}

/// Access a heap word as an atomic.
///
/// Unsafe because the address must be word aligned and inside segment memory
/// that outlives the returned reference.
pub(crate) unsafe fn word_at<'a>(addr: usize) -> &'a AtomicUsize {
    debug_assert!(addr != 0 && addr & (constants::HEAP_ALIGN - 1) == 0);
    &*(addr as *const AtomicUsize)
}

const KIND_MASK: usize = 0xff;
const FINALIZER_BIT: usize = 1 << 8;
const SIZE_SHIFT: u32 = 32;

/// A cell header word: kind in the low byte, finalizer flag, byte size in the
/// upper half.
#[derive(Copy, Clone, PartialEq, Eq)]
pub(crate) struct Header(usize);

impl Header {
    pub fn new(kind: CellKind, size: usize, has_finalizer: bool) -> Header {
        debug_assert!(size >= constants::MIN_CELL_SIZE && size <= constants::MAX_CELL_SIZE);
        let flag = if has_finalizer { FINALIZER_BIT } else { 0 };
        Header((size << SIZE_SHIFT) | flag | kind as usize)
    }

    pub fn kind(&self) -> CellKind {
        CellKind::from_u8((self.0 & KIND_MASK) as u8)
    }

    pub fn size(&self) -> usize {
        self.0 >> SIZE_SHIFT
    }

    pub fn has_finalizer(&self) -> bool {
        self.0 & FINALIZER_BIT != 0
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Header({}, {} bytes{})",
            self.kind().name(),
            self.size(),
            if self.has_finalizer() { ", finalizable" } else { "" }
        )
    }
}

/// The location of one `Value` word inside a cell
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct HeapSlot {
    addr: usize,
}

impl HeapSlot {
    pub fn at(addr: usize) -> HeapSlot {
        HeapSlot { addr }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn load(&self) -> Value {
        Value::from_word(unsafe { word_at(self.addr) }.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: Value) {
        unsafe { word_at(self.addr) }.store(value.to_word(), Ordering::Relaxed)
    }
}

/// An untyped handle on a cell in segment memory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct CellRef {
    ptr: CellPtr,
}

impl CellRef {
    pub fn new(ptr: CellPtr) -> CellRef {
        CellRef { ptr }
    }

    /// Write a fresh header and zero the payload
    pub fn initialize(ptr: CellPtr, kind: CellKind, size: usize, has_finalizer: bool) -> CellRef {
        let cell = CellRef { ptr };
        cell.set_header(Header::new(kind, size, has_finalizer));
        for index in 0..cell.payload_words() {
            cell.set_raw(index, 0);
        }
        cell
    }

    pub fn ptr(&self) -> CellPtr {
        self.ptr
    }

    pub fn header(&self) -> Header {
        Header(unsafe { word_at(self.ptr.as_word()) }.load(Ordering::Acquire))
    }

    pub fn set_header(&self, header: Header) {
        unsafe { word_at(self.ptr.as_word()) }.store(header.0, Ordering::Release)
    }

    pub fn kind(&self) -> CellKind {
        self.header().kind()
    }

    pub fn size(&self) -> usize {
        self.header().size()
    }

    pub fn payload_words(&self) -> usize {
        (self.size() - constants::HEADER_SIZE) / constants::HEAP_ALIGN
    }

    pub fn slot(&self, index: usize) -> HeapSlot {
        debug_assert!(index < self.payload_words());
        HeapSlot::at(self.ptr.offset(constants::HEADER_SIZE + index * constants::HEAP_ALIGN))
    }

    pub fn raw(&self, index: usize) -> usize {
        unsafe { word_at(self.slot(index).addr()) }.load(Ordering::Relaxed)
    }

    pub fn set_raw(&self, index: usize, word: usize) {
        unsafe { word_at(self.slot(index).addr()) }.store(word, Ordering::Relaxed)
    }

    /// The weak slot a `WeakRef` cell names, stored off by one so a zeroed
    /// cell names nothing
    pub fn weak_slot(&self) -> Option<WeakSlotId> {
        match self.raw(0) {
            0 => None,
            n => Some(WeakSlotId::from_index(n - 1)),
        }
    }

    pub fn set_weak_slot(&self, slot: WeakSlotId) {
        self.set_raw(0, slot.index() + 1)
    }

    /// Copy header and payload to `dest`, which must have room for this cell
    pub fn copy_to(&self, dest: CellPtr) {
        let words = self.size() / constants::HEAP_ALIGN;
        for index in 0..words {
            let offset = index * constants::HEAP_ALIGN;
            let word = unsafe { word_at(self.ptr.offset(offset)) }.load(Ordering::Relaxed);
            unsafe { word_at(dest.offset(offset)) }.store(word, Ordering::Relaxed);
        }
    }

    /// Claim the trailing words of an allocation that was rounded up,
    /// zeroing them so they read as empty slots
    pub fn grow_to(&self, size: usize) {
        let header = self.header();
        let old_words = self.payload_words();
        self.set_header(Header::new(header.kind(), size, header.has_finalizer()));
        for index in old_words..self.payload_words() {
            self.set_raw(index, 0);
        }
    }

    pub fn trace(&self, acceptor: &mut dyn SlotAcceptor) {
        (self.kind().vtable().trace)(*self, acceptor)
    }
}

/// A read-only view of a cell, handed to finalizers and heap walks
pub struct CellView<'h> {
    cell: CellRef,
    _heap: PhantomData<&'h ()>,
}

impl<'h> CellView<'h> {
    pub(crate) fn new(cell: CellRef) -> CellView<'h> {
        CellView {
            cell,
            _heap: PhantomData,
        }
    }

    pub fn ptr(&self) -> CellPtr {
        self.cell.ptr()
    }

    pub fn kind(&self) -> CellKind {
        self.cell.kind()
    }

    /// Cell size in bytes, header included
    pub fn size(&self) -> usize {
        self.cell.size()
    }

    pub fn has_finalizer(&self) -> bool {
        self.cell.header().has_finalizer()
    }

    /// Number of payload words
    pub fn len(&self) -> usize {
        self.cell.payload_words()
    }

    pub fn slot(&self, index: usize) -> Value {
        self.cell.slot(index).load()
    }

    pub fn raw(&self, index: usize) -> usize {
        self.cell.raw(index)
    }
}

impl<'h> fmt::Debug for CellView<'h> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} {:?}", self.cell.ptr(), self.cell.header())
    }
}
