// License and Copyright Notice:
//
// Some of the code and doc comments in this module were copied from
// `std::collections::LinkedList` in the Rust standard library.
// https://github.com/rust-lang/rust/blob/master/src/liballoc/collections/linked_list.rs
//
// The original code/comments from LinkedList are dual-licensed under
// the Apache License, Version 2.0 <https://github.com/rust-lang/rust/blob/master/LICENSE-APACHE>
// or the MIT license <https://github.com/rust-lang/rust/blob/master/LICENSE-MIT>
//
// Copyrights of the original code/comments are retained by their contributors.
// For full authorship information, see the version control history of
// https://github.com/rust-lang/rust/ or https://thanks.rust-lang.org

use std::{marker::PhantomData, ptr::NonNull};

/// A node of the eviction order deque. The deque owns its nodes (boxed), and
/// entries keep a raw back-pointer to their node so that `move_to_back` and
/// `unlink` are O(1).
pub(crate) struct DeqNode<T> {
    next: Option<NonNull<DeqNode<T>>>,
    prev: Option<NonNull<DeqNode<T>>>,
    pub(crate) element: T,
}

impl<T> std::fmt::Debug for DeqNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeqNode")
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish()
    }
}

impl<T> DeqNode<T> {
    pub(crate) fn new(element: T) -> Self {
        Self {
            next: None,
            prev: None,
            element,
        }
    }
}

/// The eviction order deque. The node at the front is the least recently
/// used entry (the next eviction victim); the node at the back is the most
/// recently used or inserted one.
///
/// This is not a concurrent data structure; it is mutated only while the
/// eviction lock is held.
pub(crate) struct Deque<T> {
    len: usize,
    head: Option<NonNull<DeqNode<T>>>,
    tail: Option<NonNull<DeqNode<T>>>,
    marker: PhantomData<Box<DeqNode<T>>>,
}

impl<T> Drop for Deque<T> {
    fn drop(&mut self) {
        struct DropGuard<'a, T>(&'a mut Deque<T>);

        impl<'a, T> Drop for DropGuard<'a, T> {
            fn drop(&mut self) {
                // Continue the same loop we do below. This only runs when a destructor has
                // panicked. If another one panics this will abort.
                while self.0.pop_front().is_some() {}
            }
        }

        while let Some(node) = self.pop_front() {
            let guard = DropGuard(self);
            drop(node);
            std::mem::forget(guard);
        }
    }
}

impl<T> Default for Deque<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Deque<T> {
    pub(crate) fn new() -> Self {
        Self {
            len: 0,
            head: None,
            tail: None,
            marker: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the given node is linked into this deque. A linked
    /// node either has a predecessor or is the head.
    pub(crate) fn contains(&self, node: &DeqNode<T>) -> bool {
        node.prev.is_some() || self.is_head(node)
    }

    pub(crate) fn peek_front(&self) -> Option<&DeqNode<T>> {
        self.head.as_ref().map(|node| unsafe { node.as_ref() })
    }

    /// Removes and returns the node at the front of the deque.
    pub(crate) fn pop_front(&mut self) -> Option<Box<DeqNode<T>>> {
        // This method takes care not to create mutable references to whole nodes,
        // to maintain validity of aliasing pointers into `element`.
        self.head.map(|node| unsafe {
            let mut node = Box::from_raw(node.as_ptr());
            self.head = node.next;

            match self.head {
                None => self.tail = None,
                // Not creating new mutable (unique!) references overlapping `element`.
                Some(head) => (*head.as_ptr()).prev = None,
            }

            self.len -= 1;

            node.prev = None;
            node.next = None;
            node
        })
    }

    /// Adds the given node to the back of the deque.
    pub(crate) fn push_back(&mut self, mut node: Box<DeqNode<T>>) -> NonNull<DeqNode<T>> {
        // This method takes care not to create mutable references to whole nodes,
        // to maintain validity of aliasing pointers into `element`.
        unsafe {
            node.next = None;
            node.prev = self.tail;
            let node = NonNull::new(Box::into_raw(node)).expect("Got a null ptr");

            match self.tail {
                None => self.head = Some(node),
                // Not creating new mutable (unique!) references overlapping `element`.
                Some(tail) => (*tail.as_ptr()).next = Some(node),
            }

            self.tail = Some(node);
            self.len += 1;
            node
        }
    }

    /// Moves the given node to the back of the deque (the most recently used
    /// position). No-op when the node is already at the tail.
    ///
    /// # Safety
    ///
    /// The node must be linked into this deque.
    pub(crate) unsafe fn move_to_back(&mut self, mut node: NonNull<DeqNode<T>>) {
        if self.is_tail(node.as_ref()) {
            // Already at the tail. Nothing to do.
            return;
        }

        let node = node.as_mut(); // this one is ours now, we can create an &mut.

        // Not creating new mutable (unique!) references overlapping `element`.
        match node.prev {
            Some(prev) if node.next.is_some() => (*prev.as_ptr()).next = node.next,
            Some(..) => (),
            // This node is the head node.
            None => self.head = node.next,
        };

        // This node is not the tail node.
        if let Some(next) = node.next.take() {
            (*next.as_ptr()).prev = node.prev;

            let mut node = NonNull::from(node);
            match self.tail {
                // Not creating new mutable (unique!) references overlapping `element`.
                Some(tail) => {
                    node.as_mut().prev = Some(tail);
                    (*tail.as_ptr()).next = Some(node);
                }
                None => unreachable!(),
            }
            self.tail = Some(node);
        }
    }

    /// Unlinks the specified node from the deque.
    ///
    /// This method takes care not to create mutable references to `element`, to
    /// maintain validity of aliasing pointers.
    ///
    /// IMPORTANT: This method does not drop the node. If the node is no longer
    /// needed, use `unlink_and_drop` instead, or drop it at the caller side.
    /// Otherwise, the node will leak.
    ///
    /// # Safety
    ///
    /// The node must be linked into this deque.
    pub(crate) unsafe fn unlink(&mut self, mut node: NonNull<DeqNode<T>>) {
        let node = node.as_mut(); // this one is ours now, we can create an &mut.

        // Not creating new mutable (unique!) references overlapping `element`.
        match node.prev {
            Some(prev) => (*prev.as_ptr()).next = node.next,
            // this node is the head node
            None => self.head = node.next,
        };

        match node.next {
            Some(next) => (*next.as_ptr()).prev = node.prev,
            // this node is the tail node
            None => self.tail = node.prev,
        };

        node.prev = None;
        node.next = None;

        self.len -= 1;
    }

    /// Unlinks the specified node from the deque, and then drops it.
    ///
    /// # Safety
    ///
    /// The node must be linked into this deque.
    pub(crate) unsafe fn unlink_and_drop(&mut self, node: NonNull<DeqNode<T>>) {
        self.unlink(node);
        std::mem::drop(Box::from_raw(node.as_ptr()));
    }

    /// An iterator over the elements, front (LRU) to back (MRU). Reversible
    /// for the descending snapshot views.
    pub(crate) fn iter(&self) -> Iter<'_, T> {
        Iter {
            head: self.head,
            tail: self.tail,
            len: self.len,
            marker: PhantomData,
        }
    }

    fn is_head(&self, node: &DeqNode<T>) -> bool {
        if let Some(head) = self.head {
            std::ptr::eq(unsafe { head.as_ref() }, node)
        } else {
            false
        }
    }

    fn is_tail(&self, node: &DeqNode<T>) -> bool {
        if let Some(tail) = self.tail {
            std::ptr::eq(unsafe { tail.as_ref() }, node)
        } else {
            false
        }
    }
}

pub(crate) struct Iter<'a, T> {
    head: Option<NonNull<DeqNode<T>>>,
    tail: Option<NonNull<DeqNode<T>>>,
    len: usize,
    marker: PhantomData<&'a DeqNode<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.head.map(|node| {
            let node = unsafe { &*node.as_ptr() };
            self.len -= 1;
            self.head = node.next;
            &node.element
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.len, Some(self.len))
    }
}

impl<'a, T> DoubleEndedIterator for Iter<'a, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.len == 0 {
            return None;
        }
        self.tail.map(|node| {
            let node = unsafe { &*node.as_ptr() };
            self.len -= 1;
            self.tail = node.prev;
            &node.element
        })
    }
}

impl<'a, T> ExactSizeIterator for Iter<'a, T> {}

#[cfg(test)]
mod tests {
    use super::{DeqNode, Deque};

    #[test]
    fn basics() {
        let mut deque: Deque<String> = Deque::new();
        assert_eq!(deque.len(), 0);
        assert!(deque.peek_front().is_none());

        // push_back(node1)
        let node1 = DeqNode::new("a".to_string());
        assert!(!deque.contains(&node1));
        let node1_ptr = deque.push_back(Box::new(node1));
        assert_eq!(deque.len(), 1);

        let head = deque.peek_front().unwrap();
        assert!(deque.contains(head));
        assert_eq!(head.element, "a".to_string());
        assert!(head.prev.is_none());
        assert!(head.next.is_none());

        // Moving a single node to the back must be a no-op.
        unsafe { deque.move_to_back(node1_ptr) };
        assert_eq!(deque.len(), 1);
        assert!(std::ptr::eq(deque.peek_front().unwrap(), unsafe {
            node1_ptr.as_ref()
        }));

        // push_back(node2)
        let node2 = DeqNode::new("b".to_string());
        let node2_ptr = deque.push_back(Box::new(node2));
        assert_eq!(deque.len(), 2);

        let head = deque.peek_front().unwrap();
        assert!(std::ptr::eq(head, unsafe { node1_ptr.as_ref() }));
        assert!(std::ptr::eq(unsafe { head.next.unwrap().as_ref() }, unsafe {
            node2_ptr.as_ref()
        }));

        // move_to_back(node1): "a" -> "b" becomes "b" -> "a"
        unsafe { deque.move_to_back(node1_ptr) };
        assert_eq!(deque.len(), 2);
        let head = deque.peek_front().unwrap();
        assert!(std::ptr::eq(head, unsafe { node2_ptr.as_ref() }));
        assert!(head.prev.is_none());
        let tail = unsafe { head.next.unwrap().as_ref() };
        assert!(std::ptr::eq(tail, unsafe { node1_ptr.as_ref() }));
        assert!(tail.next.is_none());

        // push_back(node3): "b" -> "a" -> "c"
        let node3 = DeqNode::new("c".to_string());
        let node3_ptr = deque.push_back(Box::new(node3));
        assert_eq!(deque.len(), 3);

        // unlink(node1) from the middle: "b" -> "c"
        unsafe { deque.unlink(node1_ptr) };
        assert_eq!(deque.len(), 2);
        let node1_ref = unsafe { node1_ptr.as_ref() };
        assert!(!deque.contains(node1_ref));
        assert!(node1_ref.prev.is_none());
        assert!(node1_ref.next.is_none());
        std::mem::drop(unsafe { Box::from_raw(node1_ptr.as_ptr()) });

        let head = deque.peek_front().unwrap();
        assert!(std::ptr::eq(head, unsafe { node2_ptr.as_ref() }));
        assert!(std::ptr::eq(unsafe { head.next.unwrap().as_ref() }, unsafe {
            node3_ptr.as_ref()
        }));

        // pop_front() -> "b", then "c", then empty.
        let popped = deque.pop_front().unwrap();
        assert_eq!(popped.element, "b".to_string());
        assert_eq!(deque.len(), 1);
        let popped = deque.pop_front().unwrap();
        assert_eq!(popped.element, "c".to_string());
        assert_eq!(deque.len(), 0);
        assert!(deque.pop_front().is_none());
        assert!(deque.peek_front().is_none());
    }

    #[test]
    fn unlink_and_drop() {
        let mut deque: Deque<String> = Deque::new();
        deque.push_back(Box::new(DeqNode::new("a".into())));
        let node2_ptr = deque.push_back(Box::new(DeqNode::new("b".into())));
        deque.push_back(Box::new(DeqNode::new("c".into())));

        unsafe { deque.unlink_and_drop(node2_ptr) };
        assert_eq!(deque.len(), 2);

        let elements: Vec<_> = deque.iter().cloned().collect();
        assert_eq!(elements, vec!["a".to_string(), "c".to_string()]);
    }

    #[test]
    fn iter() {
        let mut deque: Deque<String> = Deque::new();
        assert!(deque.iter().next().is_none());

        deque.push_back(Box::new(DeqNode::new("a".into())));
        let node2_ptr = deque.push_back(Box::new(DeqNode::new("b".into())));
        deque.push_back(Box::new(DeqNode::new("c".into())));

        let ascending: Vec<_> = deque.iter().cloned().collect();
        assert_eq!(
            ascending,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );

        let descending: Vec<_> = deque.iter().rev().cloned().collect();
        assert_eq!(
            descending,
            vec!["c".to_string(), "b".to_string(), "a".to_string()]
        );

        // "a" -> "c" -> "b"
        unsafe { deque.move_to_back(node2_ptr) };
        let ascending: Vec<_> = deque.iter().cloned().collect();
        assert_eq!(
            ascending,
            vec!["a".to_string(), "c".to_string(), "b".to_string()]
        );

        assert_eq!(deque.iter().len(), 3);
        assert_eq!(deque.iter().take(2).count(), 2);
    }

    #[test]
    fn drop() {
        use std::{cell::RefCell, rc::Rc};

        struct X(u32, Rc<RefCell<Vec<u32>>>);

        impl Drop for X {
            fn drop(&mut self) {
                self.1.borrow_mut().push(self.0)
            }
        }

        let mut deque: Deque<X> = Deque::new();
        let dropped = Rc::new(RefCell::new(Vec::default()));

        for i in 1..=4 {
            deque.push_back(Box::new(DeqNode::new(X(i, Rc::clone(&dropped)))));
        }
        assert_eq!(deque.len(), 4);

        std::mem::drop(deque);

        assert_eq!(*dropped.borrow(), &[1, 2, 3, 4]);
    }
}
