//! Loop work that partitions itself: every participant that calls `do_work` keeps
//! claiming the next share until nothing is left, so the scheduler never splits ranges.

use super::{
    object_pool::Recycle,
    work::{Work, WorkOptions},
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const DEFAULT_STRIDE: usize = 8;

type IndexBody = Box<dyn Fn(usize) + Send + Sync>;

/// `for i in start..end` claimed in slices of `stride` through an atomic cursor.
#[derive(Default)]
pub(crate) struct ForLoopWork {
    body: Option<IndexBody>,
    cursor: AtomicUsize,
    end: usize,
    stride: usize,
}

impl ForLoopWork {
    pub(crate) fn prepare<F>(&mut self, start: usize, end: usize, stride: usize, body: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.body = Some(Box::new(body));
        *self.cursor.get_mut() = start;
        self.end = end;
        self.stride = stride.max(1);
    }

    /// Claims `[start, start + stride)`; `None` once the cursor has passed `end`.
    #[inline]
    fn claim(&self) -> Option<usize> {
        let (end, stride) = (self.end, self.stride);
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |index| {
                (index < end).then(|| index.saturating_add(stride))
            })
            .ok()
    }
}

impl Recycle for ForLoopWork {
    fn reset(&mut self) {
        self.body = None;
        *self.cursor.get_mut() = 0;
        self.end = 0;
        self.stride = DEFAULT_STRIDE;
    }
}

impl Work for ForLoopWork {
    fn options(&self) -> WorkOptions {
        WorkOptions::unbounded()
    }

    fn do_work(&self) {
        let Some(body) = &self.body else {
            return;
        };
        while let Some(start) = self.claim() {
            let end = start.saturating_add(self.stride).min(self.end);
            for index in start..end {
                body(index);
            }
        }
    }
}

type ItemBody<T> = Box<dyn Fn(T) + Send + Sync>;
type Items<T> = Box<dyn Iterator<Item = T> + Send>;

/// Hands out one element per lock acquisition; the body always runs outside the lock.
pub(crate) struct ForEachLoopWork<T> {
    body: Option<ItemBody<T>>,
    items: Mutex<Option<Items<T>>>,
    exhausted: AtomicBool,
}

impl<T> Default for ForEachLoopWork<T> {
    fn default() -> Self {
        Self {
            body: None,
            items: Mutex::new(None),
            exhausted: AtomicBool::new(true),
        }
    }
}

impl<T: Send + 'static> ForEachLoopWork<T> {
    pub(crate) fn prepare<I, F>(&mut self, items: I, body: F)
    where
        I: Iterator<Item = T> + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.body = Some(Box::new(body));
        *self.items.get_mut() = Some(Box::new(items));
        *self.exhausted.get_mut() = false;
    }

    fn next_item(&self) -> Option<T> {
        let mut items = self.items.lock();
        let next = items.as_mut().and_then(|items| items.next());
        if next.is_none() {
            self.exhausted.store(true, Ordering::Release);
            *items = None;
        }
        next
    }
}

impl<T> Recycle for ForEachLoopWork<T> {
    fn reset(&mut self) {
        self.body = None;
        *self.items.get_mut() = None;
        *self.exhausted.get_mut() = true;
    }
}

impl<T: Send + 'static> Work for ForEachLoopWork<T> {
    fn options(&self) -> WorkOptions {
        WorkOptions::unbounded()
    }

    fn do_work(&self) {
        let Some(body) = &self.body else {
            return;
        };
        while !self.exhausted.load(Ordering::Acquire) {
            if let Some(item) = self.next_item() {
                body(item);
            }
        }
    }
}
