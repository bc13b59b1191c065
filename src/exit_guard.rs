/// [`ExitGuard`] invokes the supplied closure over the captured value when the scope is left.
///
/// The cell table growth path holds a tag on the table pointer as its mutex; the guard makes
/// sure the tag is cleared even if the scope unwinds before the new table is published.
pub(crate) struct ExitGuard<T, F: FnOnce(&mut T)> {
    captured: T,
    exit_callback: Option<F>,
}

impl<T, F: FnOnce(&mut T)> ExitGuard<T, F> {
    /// Creates a new [`ExitGuard`] capturing the supplied value.
    #[inline]
    pub(crate) fn new(captured: T, exit_callback: F) -> Self {
        Self {
            captured,
            exit_callback: Some(exit_callback),
        }
    }

    /// Returns a mutable reference to the captured value.
    #[inline]
    pub(crate) fn captured_mut(&mut self) -> &mut T {
        &mut self.captured
    }
}

impl<T, F: FnOnce(&mut T)> Drop for ExitGuard<T, F> {
    #[inline]
    fn drop(&mut self) {
        if let Some(exit_callback) = self.exit_callback.take() {
            exit_callback(&mut self.captured);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::cell::Cell;

    #[test]
    fn callback_sees_the_final_value() {
        let observed = Cell::new(0);
        {
            let mut guard = ExitGuard::new(1, |captured: &mut i32| observed.set(*captured));
            *guard.captured_mut() = 7;
        }
        assert_eq!(observed.get(), 7);
    }
}
