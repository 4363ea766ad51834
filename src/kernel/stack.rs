//! Thread stacks
//!
//! A [`Stack`] owns a mapped memory region (with a guard page below it)
//! handed out by a [`StackAllocator`]. The thread's context runs on that
//! memory; the region comes back to the allocator when the reaper destroys
//! the thread.

use corosensei::stack::DefaultStack;
use slab::Slab;
use std::io;

/// An allocated stack region, exclusively owned by one TCB
pub struct Stack {
    key: usize,
    size: usize,
    /// None while lent to a running context
    memory: Option<DefaultStack>,
}

// SAFETY: the region is plain mapped memory. Only the context built on it
// touches its contents, and that context never leaves the host OS thread.
unsafe impl Send for Stack {}

impl Stack {
    /// Map a fresh region of at least `size` bytes
    pub fn new(key: usize, size: usize) -> io::Result<Self> {
        Ok(Self {
            key,
            size,
            memory: Some(DefaultStack::new(size)?),
        })
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocator-specific handle
    pub fn key(&self) -> usize {
        self.key
    }

    /// True while a context is running on this memory
    pub fn is_lent(&self) -> bool {
        self.memory.is_none()
    }

    pub(crate) fn take_memory(&mut self) -> Option<DefaultStack> {
        self.memory.take()
    }

    pub(crate) fn restore_memory(&mut self, memory: DefaultStack) {
        self.memory = Some(memory);
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("key", &self.key)
            .field("size", &self.size)
            .field("lent", &self.is_lent())
            .finish()
    }
}

/// Raw stack allocator consumed by thread creation
pub trait StackAllocator: Send {
    /// Reserve `size` bytes, or None if the allocator is exhausted
    fn allocate(&mut self, size: usize) -> Option<Stack>;

    /// Give a stack back
    fn release(&mut self, stack: Stack);
}

/// Released regions kept mapped for reuse
const MAX_SPARE: usize = 8;

/// Default allocator: tracks live stacks in a slab against an optional
/// budget, and keeps a few released regions around for the next thread
#[derive(Default)]
pub struct StackPool {
    live: Slab<usize>,
    in_use: usize,
    budget: Option<usize>,
    spare: Vec<(usize, DefaultStack)>,
}

// SAFETY: spare regions are unmapped memory nobody runs on; see `Stack`.
unsafe impl Send for StackPool {}

impl StackPool {
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            live: Slab::new(),
            in_use: 0,
            budget,
            spare: Vec::new(),
        }
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Number of live stacks
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Released regions waiting for reuse
    pub fn spare_count(&self) -> usize {
        self.spare.len()
    }

    fn map(&mut self, size: usize) -> Option<DefaultStack> {
        match self.spare.iter().position(|(spare, _)| *spare == size) {
            Some(pos) => Some(self.spare.swap_remove(pos).1),
            None => DefaultStack::new(size).ok(),
        }
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("live", &self.live.len())
            .field("in_use", &self.in_use)
            .field("budget", &self.budget)
            .field("spare", &self.spare.len())
            .finish()
    }
}

impl StackAllocator for StackPool {
    fn allocate(&mut self, size: usize) -> Option<Stack> {
        if size == 0 {
            return None;
        }
        let total = self.in_use.checked_add(size)?;
        if let Some(budget) = self.budget
            && total > budget
        {
            return None;
        }
        let memory = self.map(size)?;
        let key = self.live.insert(size);
        self.in_use = total;
        Some(Stack {
            key,
            size,
            memory: Some(memory),
        })
    }

    fn release(&mut self, mut stack: Stack) {
        if let Some(size) = self.live.try_remove(stack.key) {
            self.in_use -= size;
        }
        // A region still lent out belongs to its context; only keep returned ones
        if let Some(memory) = stack.take_memory()
            && self.spare.len() < MAX_SPARE
        {
            self.spare.push((stack.size, memory));
        }
    }
}
