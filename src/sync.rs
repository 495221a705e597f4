pub use std::sync::Arc;

#[cfg(feature = "parking_lot")]
pub mod parking_lot {

    /// A mutex
    #[repr(transparent)]
    #[derive(Debug, Default)]
    pub struct Mutex<T: ?Sized>(pub parking_lot::Mutex<T>);

    impl<T> Mutex<T> {
        #[must_use]
        pub fn new(value: T) -> Self {
            Self(parking_lot::Mutex::new(value))
        }

        #[must_use]
        pub fn into_inner(self) -> T {
            self.0.into_inner()
        }
    }

    impl<T: ?Sized> Mutex<T> {
        pub fn lock(&self) -> parking_lot::MutexGuard<T> {
            self.0.lock()
        }

        /// Locks without waiting.
        ///
        /// The simulation is single threaded, so a held lock means a memory
        /// object called back into itself.
        pub fn try_lock(&self) -> parking_lot::MutexGuard<T> {
            match self.0.try_lock() {
                Some(guard) => guard,
                None => panic!("memory object re-entered while locked"),
            }
        }
    }
}

#[cfg(not(feature = "parking_lot"))]
pub mod default {
    /// A mutex
    #[repr(transparent)]
    #[derive(Debug, Default)]
    pub struct Mutex<T: ?Sized>(pub std::sync::Mutex<T>);

    impl<T> Mutex<T> {
        #[must_use]
        pub fn new(value: T) -> Self {
            Self(std::sync::Mutex::new(value))
        }

        #[must_use]
        pub fn into_inner(self) -> T {
            self.0.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    impl<T: ?Sized> Mutex<T> {
        pub fn lock(&self) -> std::sync::MutexGuard<T> {
            self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }

        pub fn try_lock(&self) -> std::sync::MutexGuard<T> {
            match self.0.try_lock() {
                Ok(guard) => guard,
                Err(err) => panic!("memory object re-entered while locked: {err}"),
            }
        }
    }
}

#[cfg(feature = "parking_lot")]
pub use self::parking_lot::Mutex;

#[cfg(not(feature = "parking_lot"))]
pub use default::Mutex;

#[cfg(test)]
mod tests {
    use super::{Arc, Mutex};

    #[test]
    #[should_panic(expected = "re-entered")]
    fn try_lock_panics_on_reentry() {
        let object = Arc::new(Mutex::new(0u32));
        let _guard = object.try_lock();
        let _again = object.try_lock();
    }
}
