//! Free-list recycler for objects the runtime allocates on every submission.
//!
//! A pool is a reuse cache, not a capacity limit: `acquire` never blocks and never fails,
//! `release` never evicts. Objects are reset when they come back, so whatever `acquire`
//! hands out carries nothing over from its previous use.

use parking_lot::Mutex;
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::OnceLock,
};

/// State that must be cleared before a pooled object can back a new logical task.
pub trait Recycle {
    fn reset(&mut self);
}

impl<T> Recycle for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

pub struct Pool<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Pool<T> {
    pub const fn new() -> Self {
        Self {
            items: parking_lot::const_mutex(Vec::new()),
        }
    }

    /// Number of idle objects currently held.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Recycle + Default> Pool<T> {
    #[inline]
    pub fn acquire(&self) -> T {
        self.items.lock().pop().unwrap_or_default()
    }

    /// Takes ownership of `item`, so nothing else can still be using it.
    #[inline]
    pub fn release(&self, mut item: T) {
        item.reset();
        self.items.lock().push(item);
    }
}

type Registry = Mutex<HashMap<TypeId, &'static (dyn Any + Send + Sync)>>;

impl<T: Recycle + Default + Send + 'static> Pool<T> {
    /// Process-wide pool shared by every caller that recycles a `T`.
    pub fn instance() -> &'static Pool<T> {
        static REGISTRY: OnceLock<Registry> = OnceLock::new();

        let entry: &'static (dyn Any + Send + Sync) = *REGISTRY
            .get_or_init(Default::default)
            .lock()
            .entry(TypeId::of::<T>())
            .or_insert_with(|| -> &'static (dyn Any + Send + Sync) {
                Box::leak(Box::new(Pool::<T>::new()))
            });
        match entry.downcast_ref::<Pool<T>>() {
            Some(pool) => pool,
            None => unreachable!("pool registry is keyed by TypeId"),
        }
    }
}
