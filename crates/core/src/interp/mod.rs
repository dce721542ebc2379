//! Lightweight interpreters used while walking the CFG.
//!
//! Both interpreters keep their operand stack in a [`PStack`], a persistent singly linked stack
//! with a shared tail. Cloning one is O(1), so a depth-first walk can hand every child frame its
//! own copy of the parent's state.

pub mod eval;
mod simplified;
mod tag;

pub use simplified::SimplifiedExecutor;
pub use tag::{TagItem, TagStack};

use std::fmt;
use std::rc::Rc;

#[derive(Debug)]
struct Node<T> {
    value: T,
    next: Option<Rc<Node<T>>>,
}

/// Persistent stack. `push`/`pop` touch only the head; clones share every node.
pub struct PStack<T> {
    head: Option<Rc<Node<T>>>,
    len: usize,
}

impl<T> Clone for PStack<T> {
    fn clone(&self) -> Self {
        Self {
            head: self.head.clone(),
            len: self.len,
        }
    }
}

impl<T> Default for PStack<T> {
    fn default() -> Self {
        Self { head: None, len: 0 }
    }
}

impl<T: Clone + fmt::Debug> fmt::Debug for PStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T: Clone> PStack<T> {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push(&mut self, value: T) {
        let next = self.head.take();
        self.head = Some(Rc::new(Node { value, next }));
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<T> {
        let node = self.head.take()?;
        self.head = node.next.clone();
        self.len -= 1;
        Some(node.value.clone())
    }

    /// Item `depth` positions below the top (0 is the top).
    pub fn peek(&self, depth: usize) -> Option<&T> {
        self.iter().nth(depth)
    }

    /// Duplicates the `n`-th item (1-based, `DUPn`). Returns false on underflow.
    pub fn dup(&mut self, n: usize) -> bool {
        match n.checked_sub(1).and_then(|d| self.peek(d)).cloned() {
            Some(value) => {
                self.push(value);
                true
            }
            None => false,
        }
    }

    /// Exchanges the top with the item `n` below it (`SWAPn`). Returns false on underflow.
    pub fn swap(&mut self, n: usize) -> bool {
        if n == 0 || self.len <= n {
            return false;
        }
        let mut items = Vec::with_capacity(n + 1);
        for _ in 0..=n {
            if let Some(value) = self.pop() {
                items.push(value);
            }
        }
        items.swap(0, n);
        for value in items.into_iter().rev() {
            self.push(value);
        }
        true
    }

    /// Iterates from the top of the stack downwards.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head.as_deref(),
        }
    }

    /// Returns true if any item equals `value`.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.iter().any(|item| item == value)
    }
}

impl<T: Clone + fmt::Display> PStack<T> {
    /// Bottom-to-top rendering, used as a map key for per-context bookkeeping.
    pub fn key(&self) -> String {
        let mut items: Vec<String> = self.iter().map(ToString::to_string).collect();
        items.reverse();
        format!("[{}]", items.join(","))
    }
}

pub struct Iter<'a, T> {
    next: Option<&'a Node<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next.as_deref();
        Some(&node.value)
    }
}
