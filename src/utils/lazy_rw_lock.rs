pub use std::sync::RwLock;

#[derive(Debug, PartialEq, Eq)]
pub enum LazyFillError<E> {
    /// A previous holder of the lock panicked.
    Poisoned,
    /// The loader itself failed; the lock stays empty.
    Load(E),
}

pub const fn new_lazy_fill_rw_lock<T>() -> RwLock<Option<T>> {
    RwLock::new(None)
}

pub trait LazyFillRwLock<T> {
    /// Run `getter` on the content, filling it with `loader` first if it is empty.
    fn get_or_try_load<G, L, R, E>(&self, getter: G, loader: L) -> Result<R, LazyFillError<E>>
    where
        G: Fn(&T) -> R,
        L: FnOnce() -> Result<T, E>;

    /// Reset the lock to its default state, whether its poisoned or not.
    fn reset(&self);
}

impl<T> LazyFillRwLock<T> for RwLock<Option<T>> {
    fn get_or_try_load<G, L, R, E>(&self, getter: G, loader: L) -> Result<R, LazyFillError<E>>
    where
        G: Fn(&T) -> R,
        L: FnOnce() -> Result<T, E>,
    {
        let read_lock = self.read().map_err(|_| {
            log::error!("A read lock was poisoned.");
            LazyFillError::Poisoned
        })?;
        if let Some(instance) = read_lock.as_ref() {
            return Ok(getter(instance));
        }
        drop(read_lock);
        let mut write_lock = self.write().map_err(|_| {
            log::error!("A write lock was poisoned.");
            LazyFillError::Poisoned
        })?;
        // Someone else may have filled it while we waited for the write lock.
        if let Some(instance) = write_lock.as_ref() {
            Ok(getter(instance))
        } else {
            let instance = loader().map_err(LazyFillError::Load)?;
            let res = getter(&instance);
            *write_lock = Some(instance);
            Ok(res)
        }
    }

    fn reset(&self) {
        match self.write() {
            Ok(mut guard) => *guard = None,
            Err(e) => {
                let mut guard = e.into_inner();
                *guard = None;
            }
        }
        self.clear_poison();
    }
}
