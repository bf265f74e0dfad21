//! Callback registries with scoped unsubscription.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Table<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// A set of callbacks invoked with `&T` on every [`Listeners::emit`].
pub struct Listeners<T> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self { table: self.table.clone() }
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table { next_id: 0, entries: Vec::new() })),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.table.lock().entries.clear();
    }

    /// Invoke every callback. The table is not locked while callbacks run,
    /// so a callback may subscribe or unsubscribe.
    pub fn emit(&self, value: &T) {
        let callbacks: Vec<Callback<T>> =
            self.table.lock().entries.iter().map(|(_, cb)| cb.clone()).collect();
        for cb in callbacks {
            cb(value);
        }
    }
}

impl<T: 'static> Listeners<T> {
    pub fn add<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut table = self.table.lock();
            let id = table.next_id;
            table.next_id += 1;
            table.entries.push((id, Arc::new(callback)));
            id
        };
        let weak: Weak<Mutex<Table<T>>> = Arc::downgrade(&self.table);
        Subscription::new(move || {
            if let Some(table) = weak.upgrade() {
                table.lock().entries.retain(|(entry, _)| *entry != id);
            }
        })
    }
}

/// Removes its callback when dropped or when [`Subscription::unsubscribe`] is called.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { remove: Some(Box::new(remove)) }
    }

    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the callback registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.remove.is_some()).finish()
    }
}
