use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;

use colored::Colorize;

use super::ptr::Ptr;
use super::root::{Root, RootList};
use super::trace::{Trace, Tracer};
use crate::debug::{LOG_GC, STRESS_GC};

/// Collection runs when the live cell count reaches the threshold; the
/// threshold then doubles, but never drops below this floor.
const THRESHOLD_FLOOR: usize = 128;

/// Header shared by every cell. The payload lives directly behind it in
/// the same allocation, accessed through the type-erased entry points.
pub(super) struct Header {
    /// True until the payload destructor has run.
    pub(super) valid: Cell<bool>,
    /// Set during the mark phase, cleared again by the sweep.
    pub(super) marked: Cell<bool>,
    /// Number of live weak handles. The header outlives the payload for
    /// as long as this is nonzero.
    pub(super) ptrs: Cell<u64>,
    /// Intrusive list of all cells.
    next: Cell<*mut Header>,
    trace: unsafe fn(*const Header, &mut Tracer),
    destroy: unsafe fn(*const Header),
    release: unsafe fn(*mut Header),
}

#[repr(C)]
struct CellBox<T> {
    header: Header,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub(super) fn payload<T>(header: *mut Header) -> *mut T {
    unsafe { (*(header as *mut CellBox<T>)).value.get() as *mut T }
}

unsafe fn trace_cell<T: Trace>(header: *const Header, tracer: &mut Tracer) {
    if (*header).valid.get() {
        (*payload::<T>(header as *mut Header)).trace(tracer);
    }
}

unsafe fn destroy_cell<T>(header: *const Header) {
    std::ptr::drop_in_place(payload::<T>(header as *mut Header));
}

unsafe fn release_cell<T>(header: *mut Header) {
    drop(Box::from_raw(header as *mut CellBox<T>));
}

/// Precise mark-and-sweep heap.
///
/// Cells are reachable when a registered [`Root`] traces to them,
/// directly or through other cells. Everything else is destroyed on the
/// next cycle. Weak handles ([`Ptr`]) never extend a payload's lifetime,
/// only the lifetime of the header they observe validity through.
pub struct Heap {
    cells: Cell<*mut Header>,
    roots: Box<RootList>,
    /// Live cell count, headers excluded once their payload is gone.
    allocations: Cell<usize>,
    threshold: Cell<usize>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            cells: Cell::new(std::ptr::null_mut()),
            roots: RootList::new(),
            allocations: Cell::new(0),
            threshold: Cell::new(THRESHOLD_FLOOR),
        }
    }

    /// Moves `value` into a fresh cell and returns a rooted handle to it.
    ///
    /// May run a collection first; handles that are not reachable from a
    /// root when that happens come back invalid.
    pub fn alloc<T: Trace>(&self, value: T) -> Root<Ptr<T>> {
        if STRESS_GC || self.allocations.get() >= self.threshold.get() {
            self.collect();
            self.threshold
                .set(std::cmp::max(self.allocations.get() * 2, THRESHOLD_FLOOR));
        }
        let cell = Box::into_raw(Box::new(CellBox {
            header: Header {
                valid: Cell::new(true),
                marked: Cell::new(false),
                ptrs: Cell::new(0),
                next: Cell::new(self.cells.get()),
                trace: trace_cell::<T>,
                destroy: destroy_cell::<T>,
                release: release_cell::<T>,
            },
            value: UnsafeCell::new(MaybeUninit::new(value)),
        })) as *mut Header;
        self.cells.set(cell);
        self.allocations.set(self.allocations.get() + 1);
        self.root(Ptr::from_header(cell))
    }

    /// Registers `value` with the collector for the root's lifetime.
    pub fn root<T: Trace>(&self, value: T) -> Root<T> {
        Root::new(&self.roots, value)
    }

    /// Runs a full stop-the-world collection cycle.
    pub fn collect(&self) {
        let before = self.allocations.get();

        // Mark: seed from the root list, then trace until the queue runs dry.
        let mut tracer = Tracer::new();
        self.roots.trace_all(&mut tracer);
        while let Some(header) = tracer.pop() {
            unsafe {
                ((*header).trace)(header, &mut tracer);
            }
        }

        // Sweep: destroy unmarked payloads. Headers stay behind while
        // weak handles are still watching them.
        unsafe {
            let mut head: *mut Header = std::ptr::null_mut();
            let mut cell = self.cells.get();
            while !cell.is_null() {
                let next = (*cell).next.get();
                if (*cell).marked.get() {
                    (*cell).marked.set(false);
                    (*cell).next.set(head);
                    head = cell;
                } else {
                    if (*cell).valid.get() {
                        ((*cell).destroy)(cell);
                        (*cell).valid.set(false);
                        self.allocations.set(self.allocations.get() - 1);
                    }
                    if (*cell).ptrs.get() == 0 {
                        ((*cell).release)(cell);
                    } else {
                        (*cell).next.set(head);
                        head = cell;
                    }
                }
                cell = next;
            }
            self.cells.set(head);
        }

        if LOG_GC {
            println!(
                "{} collected {} cells ({} live, next cycle at {})",
                "[gc]".cyan(),
                before - self.allocations.get(),
                self.allocations.get(),
                self.threshold.get(),
            );
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe {
            // Destroy payloads first: their handle fields still decrement
            // weak counts on headers that must not be freed yet.
            let mut cell = self.cells.get();
            while !cell.is_null() {
                if (*cell).valid.get() {
                    ((*cell).destroy)(cell);
                    (*cell).valid.set(false);
                }
                cell = (*cell).next.get();
            }
            let mut cell = self.cells.get();
            while !cell.is_null() {
                let next = (*cell).next.get();
                ((*cell).release)(cell);
                cell = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    /// Counts how many copies of itself are alive, so tests can observe
    /// destructor runs.
    #[derive(Default)]
    struct Count {
        value: Rc<Cell<i64>>,
    }

    impl Count {
        fn get(&self) -> i64 {
            self.value.get()
        }
    }

    impl Clone for Count {
        fn clone(&self) -> Self {
            self.value.set(self.value.get() + 1);
            Self {
                value: self.value.clone(),
            }
        }
    }

    impl Drop for Count {
        fn drop(&mut self) {
            self.value.set(self.value.get() - 1);
        }
    }

    #[derive(Default)]
    struct Node {
        count: Count,
        edges: Vec<Ptr<Node>>,
    }

    impl Node {
        fn new(count: &Count) -> Self {
            Self {
                count: count.clone(),
                edges: Vec::new(),
            }
        }
    }

    impl Trace for Node {
        fn trace(&self, tracer: &mut Tracer) {
            for edge in &self.edges {
                tracer.visit(edge);
            }
        }
    }

    #[test]
    fn linked_list() {
        let count = Count::default();
        let heap = Heap::new();
        {
            let mut head = heap.alloc(Node::new(&count));
            for _ in 0..5 {
                let new_head = heap.alloc(Node::new(&count));
                new_head.get_mut().edges.push(head.clone());
                head = new_head;
            }
            heap.collect();
            assert_eq!(count.get(), 6, "list should be alive");
        }
        heap.collect();
        assert_eq!(count.get(), 0, "list should be dead");
    }

    #[test]
    fn cycle() {
        let count = Count::default();
        let heap = Heap::new();
        {
            let n1 = heap.alloc(Node::new(&count));
            {
                let n2 = heap.alloc(Node::new(&count));
                let n3 = heap.alloc(Node::new(&count));
                n1.get_mut().edges.push(n2.clone());
                n2.get_mut().edges.push(n3.clone());
                n3.get_mut().edges.push(n1.clone());
                let n4 = heap.alloc(Node::new(&count));
                n3.get_mut().edges.push(n4.clone());
            }
            heap.collect();
            assert_eq!(count.get(), 4, "cycle should be alive");
        }
        heap.collect();
        assert_eq!(count.get(), 0, "cycle should be dead");
    }

    #[test]
    fn tree() {
        let count = Count::default();
        let heap = Heap::new();
        {
            let mut root = heap.alloc(Node::new(&count));
            {
                let n11 = heap.alloc(Node::new(&count));
                let n12 = heap.alloc(Node::new(&count));
                root.get_mut().edges.push(n11.clone());
                root.get_mut().edges.push(n12.clone());
                let n121 = heap.alloc(Node::new(&count));
                let n122 = heap.alloc(Node::new(&count));
                let n123 = heap.alloc(Node::new(&count));
                n12.get_mut().edges.push(n121.clone());
                n12.get_mut().edges.push(n122.clone());
                n12.get_mut().edges.push(n123.clone());
            }
            heap.collect();
            assert_eq!(count.get(), 6, "entire tree should be alive");
            let n12 = root.get().edges[1].clone();
            *root = n12;
            heap.collect();
            assert_eq!(count.get(), 4, "subtree should be alive");
            let n123 = root.get().edges[2].clone();
            *root = n123;
            heap.collect();
            assert_eq!(count.get(), 1, "leaf should be alive");
        }
        heap.collect();
        assert_eq!(count.get(), 0, "tree should be dead");
    }

    #[test]
    fn ptr_validity() {
        let heap = Heap::new();
        let ptr = Ptr::<Node>::null();
        assert!(!ptr.valid(), "null ptr should be invalid");
        let ptr: Ptr<Node> = heap.alloc(Node::default()).clone();
        assert!(ptr.valid(), "freshly allocated ptr should be valid");
        {
            let _root = heap.root(ptr.clone());
            heap.collect();
            assert!(ptr.valid(), "rooted ptr should survive a collection");
        }
        heap.collect();
        assert!(!ptr.valid(), "unrooted ptr should be invalidated");
    }

    #[test]
    fn threshold_collects_garbage() {
        let count = Count::default();
        let heap = Heap::new();
        let keep = heap.alloc(Node::new(&count));
        for _ in 0..10 * THRESHOLD_FLOOR {
            heap.alloc(Node::new(&count));
        }
        // Automatic cycles must have reclaimed most of the loop garbage.
        assert!(count.get() < 2 * THRESHOLD_FLOOR as i64);
        assert!(keep.valid());
    }

    #[test]
    fn root_into_inner_unregisters() {
        let count = Count::default();
        let heap = Heap::new();
        let root = heap.alloc(Node::new(&count));
        let ptr = root.into_inner();
        assert!(ptr.valid());
        heap.collect();
        assert!(!ptr.valid());
        assert_eq!(count.get(), 0);
    }
}
