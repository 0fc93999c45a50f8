use std::fmt;
use std::sync::Arc;

use log::trace;
use luabridge_vm::State;
use parking_lot::ReentrantMutex;

/// A shared, lockable runtime.
///
/// Clones refer to the same [`State`]. [`Runtime::enter`] is the critical
/// section every adapter goes through; the lock is reentrant so a host
/// function called from a script may enter again on the same thread.
///
/// Tables are never freed while the runtime lives: every `{}` a script
/// evaluates and every [`TableRef::create`](crate::TableRef::create) grows
/// the heap until the last clone is dropped. Long-lived hosts should
/// recycle runtimes rather than keep one forever.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<ReentrantMutex<State>>,
}

impl Runtime {
    /// A runtime with the standard library opened.
    pub fn new() -> Self {
        Self::from_state(State::with_libs())
    }

    /// A runtime with an empty global table.
    pub fn bare() -> Self {
        Self::from_state(State::new())
    }

    pub fn from_state(state: State) -> Self {
        Self {
            inner: Arc::new(ReentrantMutex::new(state)),
        }
    }

    /// Runs `f` with exclusive access to the state.
    ///
    /// Other threads block until `f` returns, including while a script runs.
    pub fn enter<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        let state = self.inner.lock();
        f(&state)
    }

    pub fn ptr_eq(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Restores the stack depth it saw on creation when dropped.
pub struct StackGuard<'a> {
    state: &'a State,
    top: usize,
}

impl<'a> StackGuard<'a> {
    pub fn new(state: &'a State) -> Self {
        Self {
            state,
            top: state.get_top(),
        }
    }

    pub fn top(&self) -> usize {
        self.top
    }
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let now = self.state.get_top();
        if now != self.top {
            trace!("stack guard: {now} -> {}", self.top);
            self.state.set_top(self.top);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn guard_restores_depth_on_early_exit() {
        let rt = Runtime::new();
        let depth = rt.enter(|state| {
            let _guard = StackGuard::new(state);
            state.push_number(1.0);
            state.push_number(2.0);
            state.get_top()
        });
        assert_eq!(depth, 2);
        assert_eq!(rt.enter(|s| s.get_top()), 0);
    }

    #[test]
    fn enter_is_reentrant() {
        let rt = Runtime::new();
        let inner = rt.clone();
        let n = rt.enter(|state| {
            state.push_number(1.0);
            inner.enter(|state| state.get_top())
        });
        assert_eq!(n, 1);
        assert!(rt.ptr_eq(&inner));
        assert!(!rt.ptr_eq(&Runtime::bare()));
    }

    #[test]
    fn shared_across_threads() {
        let rt = Runtime::new();
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let rt = rt.clone();
                thread::spawn(move || {
                    rt.enter(|state| {
                        let _guard = StackGuard::new(state);
                        state.push_number(i as f64);
                        state.set_global(&format!("g{i}")).unwrap();
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        rt.enter(|state| {
            for i in 0..4 {
                state.get_global(&format!("g{i}")).unwrap();
            }
            assert_eq!(state.get_top(), 4);
        });
    }

    #[test]
    fn table_ids_are_never_reused() {
        let rt = Runtime::new();
        let first = crate::TableRef::create(&rt).id();
        rt.enter(|state| {
            let _guard = StackGuard::new(state);
            state.load(b"for i = 1, 10 do local t = {} end", "t").unwrap();
            state.call(0, Some(0)).unwrap();
        });
        let next = crate::TableRef::create(&rt).id();
        assert_eq!(next.index(), first.index() + 11);
    }
}
