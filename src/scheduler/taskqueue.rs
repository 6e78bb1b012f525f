// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::scheduler::task::{
    Task,
    TaskRef,
};
use ::std::{
    marker::PhantomData,
    ptr,
    sync::{
        atomic::Ordering,
        Arc,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// An intrusive doubly-linked FIFO of tasks, threaded through the link
/// fields embedded in the task control block. The queue holds one strong
/// reference per linked task but does not own the tasks; the owning worker
/// does. Ready queues are private to their worker and never touched by
/// other threads.
pub(crate) struct TaskQueue {
    /// First task in the queue (next to be dispatched).
    head: *mut Task,
    /// Last task in the queue.
    tail: *mut Task,
    /// Number of linked tasks.
    count: usize,
    // Hint to the compiler that this struct holds an Arc<Task> per element
    // (for safety determinations).
    phantom: PhantomData<Arc<Task>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskQueue {
    /// Creates an empty task queue.
    pub const fn new() -> Self {
        TaskQueue {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
            phantom: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    #[allow(unused)]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Appends a task at the tail of the queue.
    pub fn append(&mut self, task: TaskRef) {
        // Convert to a raw pointer. Arc::into_raw does not decrement the
        // reference count; the queue keeps that reference until unlink.
        let added: *mut Task = Arc::into_raw(task) as *mut Task;

        unsafe {
            (*added).queue_next.store(ptr::null_mut(), Ordering::Relaxed);
            (*added).queue_prev.store(self.tail, Ordering::Relaxed);

            if self.tail.is_null() {
                // Nothing currently on the queue, so the new task also
                // becomes the head.
                self.head = added;
            } else {
                (*self.tail).queue_next.store(added, Ordering::Relaxed);
            }
        }

        self.tail = added;
        self.count += 1;
    }

    /// Pops the task at the head of the queue, or None if the queue is
    /// empty.
    pub fn remove(&mut self) -> Option<TaskRef> {
        if self.head.is_null() {
            return None;
        }

        let popped: *mut Task = self.head;
        unsafe {
            self.head = (*popped).queue_next.load(Ordering::Relaxed);
            if self.head.is_null() {
                // The queue is now empty; the tail was pointing at popped.
                self.tail = ptr::null_mut();
            } else {
                (*self.head).queue_prev.store(ptr::null_mut(), Ordering::Relaxed);
            }

            (*popped).queue_next.store(ptr::null_mut(), Ordering::Relaxed);
            (*popped).queue_prev.store(ptr::null_mut(), Ordering::Relaxed);

            self.count -= 1;
            Some(Arc::from_raw(popped))
        }
    }

    /// Walks the queue; every task for which `pred` holds is unlinked in
    /// place and handed to `action`.
    pub fn iterate_remove<P, A>(&mut self, pred: P, mut action: A)
    where
        P: Fn(&Task) -> bool,
        A: FnMut(TaskRef),
    {
        let mut cur: *mut Task = self.head;

        while !cur.is_null() {
            let next: *mut Task = unsafe { (*cur).queue_next.load(Ordering::Relaxed) };

            if pred(unsafe { &*cur }) {
                unsafe {
                    let prev: *mut Task = (*cur).queue_prev.load(Ordering::Relaxed);

                    if prev.is_null() {
                        self.head = next;
                    } else {
                        (*prev).queue_next.store(next, Ordering::Relaxed);
                    }

                    if next.is_null() {
                        self.tail = prev;
                    } else {
                        (*next).queue_prev.store(prev, Ordering::Relaxed);
                    }

                    (*cur).queue_next.store(ptr::null_mut(), Ordering::Relaxed);
                    (*cur).queue_prev.store(ptr::null_mut(), Ordering::Relaxed);

                    self.count -= 1;
                    action(Arc::from_raw(cur));
                }
            }

            cur = next;
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

// We need an explicit drop implementation because the queue holds one
// strong reference per linked task, stored as raw pointers that would not
// drop automatically.
impl Drop for TaskQueue {
    fn drop(&mut self) {
        while self.remove().is_some() {}
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
