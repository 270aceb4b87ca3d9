//! Scoped acquisition of device resources
//!
//! Every mode-setting object read from a device comes back wrapped in a
//! [`Scoped`] value. The wrapped data is reachable through `Deref`, and the
//! backend's release action runs exactly once when the value is dropped, so
//! early returns and `?` release whatever was fetched along the way.

use std::fmt;
use std::ops::{Deref, DerefMut};

pub struct Scoped<T> {
    value: T,
    release: Option<Box<dyn FnOnce()>>,
}

impl<T> Scoped<T> {
    /// Wrap a value that needs no release action.
    pub fn new(value: T) -> Self {
        Self { value, release: None }
    }

    /// Wrap a value whose release action runs when it goes out of scope.
    pub fn with_release(value: T, release: impl FnOnce() + 'static) -> Self {
        Self {
            value,
            release: Some(Box::new(release)),
        }
    }
}

impl<T> Deref for Scoped<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Scoped<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> Drop for Scoped<T> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Scoped<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_release_runs_once_on_drop() {
        let released = Rc::new(Cell::new(0));
        let counter = Rc::clone(&released);
        {
            let mut scoped = Scoped::with_release(5u32, move || counter.set(counter.get() + 1));
            *scoped += 1;
            assert_eq!(*scoped, 6);
            assert_eq!(released.get(), 0);
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn test_release_runs_on_early_return() {
        fn fetch_then_fail(counter: Rc<Cell<u32>>) -> Result<(), ()> {
            let _held = Scoped::with_release((), move || counter.set(counter.get() + 1));
            Err(())
        }

        let released = Rc::new(Cell::new(0));
        assert!(fetch_then_fail(Rc::clone(&released)).is_err());
        assert_eq!(released.get(), 1);
    }
}
