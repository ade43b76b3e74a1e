//! Exactly-once release of an owned resource.
//!
//! Both [`Listener`](crate::Listener) and [`RxSocket`](crate::RxSocket) own a
//! [`Disposer`] for their OS socket. Disposal may be requested from several
//! places at once: an explicit `dispose()` call, the loop thread reacting to
//! a fault, or a supervising tracker. The disposer guarantees that
//!
//! - the flag moves from "not requested" to "requested" exactly once,
//! - only the caller that performed that transition releases the resource,
//! - every other caller returns only after that release has finished.
//!
//! Loop threads read [`Disposer::was_disposal_requested`] after a failed
//! blocking call to tell an intentional close from an unexpected fault.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Guards the release of a single resource `R`.
pub struct Disposer<R> {
    requested: AtomicBool,
    resource: Mutex<Option<R>>,
}

impl<R> Disposer<R> {
    /// Take ownership of `resource`.
    pub fn new(resource: R) -> Self {
        Self {
            requested: AtomicBool::new(false),
            resource: Mutex::new(Some(resource)),
        }
    }

    /// Request disposal, releasing the resource with `release` if this call
    /// performs the transition.
    ///
    /// Returns `true` only for the first caller. The flag is set before
    /// `release` runs, so a loop that fails because of the release always
    /// observes the request.
    pub fn request_disposal(&self, release: impl FnOnce(R)) -> bool {
        // Held across the release so that later callers wait for it.
        let mut slot = self.resource.lock();
        if self.requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(resource) = slot.take() {
            release(resource);
        }
        true
    }

    /// Non-blocking read of the flag.
    #[inline]
    pub fn was_disposal_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Borrow the resource if it has not been released yet.
    pub fn with_resource<T>(&self, f: impl FnOnce(&R) -> T) -> Option<T> {
        self.resource.lock().as_ref().map(f)
    }

    /// Whether the resource has been handed to a release function.
    pub fn is_released(&self) -> bool {
        self.resource.lock().is_none()
    }
}

impl<R> fmt::Debug for Disposer<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("requested", &self.was_disposal_requested())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_first_caller_releases() {
        let disposer = Disposer::new(5u32);
        assert!(!disposer.was_disposal_requested());
        assert_eq!(disposer.with_resource(|v| *v), Some(5));

        let mut released = None;
        assert!(disposer.request_disposal(|v| released = Some(v)));
        assert_eq!(released, Some(5));
        assert!(disposer.was_disposal_requested());
        assert!(disposer.is_released());
        assert_eq!(disposer.with_resource(|v| *v), None);

        assert!(!disposer.request_disposal(|_| panic!("released twice")));
    }

    #[test]
    fn test_concurrent_requests_release_once() {
        for threads in 1..=16 {
            let disposer = Arc::new(Disposer::new(()));
            let releases = Arc::new(AtomicUsize::new(0));
            let winners = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    let disposer = disposer.clone();
                    let releases = releases.clone();
                    let winners = winners.clone();
                    thread::spawn(move || {
                        let won = disposer.request_disposal(|()| {
                            releases.fetch_add(1, Ordering::SeqCst);
                        });
                        if won {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                        // Every caller returns after the release finished.
                        assert!(disposer.is_released());
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(releases.load(Ordering::SeqCst), 1);
            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_losers_wait_for_slow_release() {
        let disposer = Arc::new(Disposer::new(()));
        let done = Arc::new(AtomicBool::new(false));

        let first = {
            let disposer = disposer.clone();
            let done = done.clone();
            thread::spawn(move || {
                disposer.request_disposal(|()| {
                    thread::sleep(Duration::from_millis(50));
                    done.store(true, Ordering::SeqCst);
                })
            })
        };

        while !disposer.was_disposal_requested() {
            thread::yield_now();
        }
        assert!(!disposer.request_disposal(|()| {}));
        assert!(done.load(Ordering::SeqCst));
        assert!(first.join().unwrap());
    }
}
