//! Bounded list over a pre-allocated node pool.
//!
//! Every node index lives in exactly one of two chains: the active chain
//! holding elements, or the free chain holding spare capacity. Pushing moves
//! a node from the free chain to the active chain; popping moves it back.
//! The structure never allocates after construction, which makes it suitable
//! for per-connection write queues with a hard bound.

use thiserror::Error;

const NIL: usize = usize::MAX;

/// Errors reported by [`StaticList`] operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// No free node is available.
    #[error("list is full")]
    Full,
    /// The active chain holds no element.
    #[error("list is empty")]
    Empty,
}

#[derive(Debug)]
struct Slot<T> {
    element: Option<T>,
    next: usize,
}

/// Fixed-capacity list with O(1) pushes and pops at either end of insertion.
#[derive(Debug)]
pub struct StaticList<T> {
    slots: Vec<Slot<T>>,
    head: usize,
    tail: usize,
    space: usize,
    len: usize,
}

impl<T> StaticList<T> {
    /// Create a list with room for `capacity` elements (minimum one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 < capacity { i + 1 } else { NIL };
            slots.push(Slot { element: None, next });
        }
        Self {
            slots,
            head: NIL,
            tail: NIL,
            space: 0,
            len: 0,
        }
    }

    fn take_free_slot(&mut self) -> Result<usize, ListError> {
        let idx = self.space;
        if idx == NIL {
            return Err(ListError::Full);
        }
        self.space = self.slots[idx].next;
        Ok(idx)
    }

    /// Push an element at the left end.
    ///
    /// # Errors
    /// Returns [`ListError::Full`] when every node is in use.
    pub fn insert_left(&mut self, element: T) -> Result<(), ListError> {
        let idx = self.take_free_slot()?;
        self.slots[idx].element = Some(element);
        self.slots[idx].next = self.head;
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
        self.len += 1;
        Ok(())
    }

    /// Push an element at the right end.
    ///
    /// # Errors
    /// Returns [`ListError::Full`] when every node is in use.
    pub fn push_back(&mut self, element: T) -> Result<(), ListError> {
        let idx = self.take_free_slot()?;
        self.slots[idx].element = Some(element);
        self.slots[idx].next = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            let tail = self.tail;
            self.slots[tail].next = idx;
        }
        self.tail = idx;
        self.len += 1;
        Ok(())
    }

    /// Pop the element at the left end.
    ///
    /// # Errors
    /// Returns [`ListError::Empty`] when no element is present.
    pub fn pop_left(&mut self) -> Result<T, ListError> {
        let idx = self.head;
        if idx == NIL {
            return Err(ListError::Empty);
        }
        self.head = self.slots[idx].next;
        if self.head == NIL {
            self.tail = NIL;
        }
        self.slots[idx].next = self.space;
        self.space = idx;
        self.len -= 1;
        self.slots[idx].element.take().ok_or(ListError::Empty)
    }

    /// Borrow the element at the left end.
    ///
    /// # Errors
    /// Returns [`ListError::Empty`] when no element is present.
    pub fn peek_left(&self) -> Result<&T, ListError> {
        if self.head == NIL {
            return Err(ListError::Empty);
        }
        self.slots[self.head].element.as_ref().ok_or(ListError::Empty)
    }

    /// Whether the free chain is exhausted.
    #[must_use]
    pub const fn is_full(&self) -> bool { self.space == NIL }

    /// Number of elements in the active chain.
    #[must_use]
    pub const fn len(&self) -> usize { self.len }

    /// Whether the active chain is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool { self.len == 0 }

    /// Total node count.
    #[must_use]
    pub fn capacity(&self) -> usize { self.slots.len() }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn fills_drains_and_reports_bounds() {
        let mut list = StaticList::new(3);
        list.insert_left(1).expect("room for 1");
        list.insert_left(2).expect("room for 2");
        list.insert_left(3).expect("room for 3");
        assert!(list.is_full());
        assert_eq!(list.insert_left(4), Err(ListError::Full));
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop_left(), Ok(3));
        assert_eq!(list.len(), 2);
        list.pop_left().expect("second pop");
        list.pop_left().expect("third pop");
        assert_eq!(list.pop_left(), Err(ListError::Empty));

        list.insert_left(4).expect("reuse after drain");
        assert_eq!(list.peek_left(), Ok(&4));
    }

    #[test]
    fn push_back_gives_fifo_order() {
        let mut list = StaticList::new(4);
        for i in 0..4 {
            list.push_back(i).expect("capacity 4");
        }
        assert_eq!(list.push_back(4), Err(ListError::Full));
        for i in 0..4 {
            assert_eq!(list.pop_left(), Ok(i));
        }
        assert_eq!(list.pop_left(), Err(ListError::Empty));
    }

    #[test]
    fn mixed_ends_interleave() {
        let mut list = StaticList::new(3);
        list.push_back(1).expect("push 1");
        list.insert_left(0).expect("insert 0");
        list.push_back(2).expect("push 2");
        assert_eq!(list.pop_left(), Ok(0));
        assert_eq!(list.pop_left(), Ok(1));
        assert_eq!(list.pop_left(), Ok(2));
    }

    #[derive(Debug, Clone)]
    enum Op {
        InsertLeft(u8),
        PushBack(u8),
        PopLeft,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::InsertLeft),
            any::<u8>().prop_map(Op::PushBack),
            Just(Op::PopLeft),
        ]
    }

    proptest! {
        /// The list behaves like a bounded deque and every node stays in
        /// exactly one chain: `len` mirrors the model and capacity is never
        /// exceeded or leaked.
        #[test]
        fn matches_deque_model(ops in proptest::collection::vec(op_strategy(), 0..64)) {
            let capacity = 8;
            let mut list = StaticList::new(capacity);
            let mut model: VecDeque<u8> = VecDeque::new();
            for op in ops {
                match op {
                    Op::InsertLeft(v) => {
                        let outcome = list.insert_left(v);
                        if model.len() < capacity {
                            prop_assert!(outcome.is_ok());
                            model.push_front(v);
                        } else {
                            prop_assert_eq!(outcome, Err(ListError::Full));
                        }
                    }
                    Op::PushBack(v) => {
                        let outcome = list.push_back(v);
                        if model.len() < capacity {
                            prop_assert!(outcome.is_ok());
                            model.push_back(v);
                        } else {
                            prop_assert_eq!(outcome, Err(ListError::Full));
                        }
                    }
                    Op::PopLeft => {
                        prop_assert_eq!(list.pop_left().ok(), model.pop_front());
                    }
                }
                prop_assert_eq!(list.len(), model.len());
                prop_assert_eq!(list.is_full(), model.len() == capacity);
            }
            while let Some(expected) = model.pop_front() {
                prop_assert_eq!(list.pop_left(), Ok(expected));
            }
            prop_assert!(list.is_empty());
        }
    }
}
