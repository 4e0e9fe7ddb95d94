use core::fmt;
use std::sync::Arc;

use derive_where::derive_where;
use generational_arena::{Arena, Index};
use newt::{NumEnum, NumEnumMap};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

// === Errors === //

#[derive(Debug, Clone, Error)]
#[error("failed to spawn new task: shutdown already requested")]
#[non_exhaustive]
pub struct ShutdownAlreadyRequested;

// === MultiShutdownSignal === //

#[derive_where(Clone, Default)]
pub struct MultiShutdownSignal<P: NumEnum> {
    signals: Arc<NumEnumMap<P, ShutdownSignal>>,
}

impl<P: NumEnum> fmt::Debug for MultiShutdownSignal<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiShutdownSignal")
            .finish_non_exhaustive()
    }
}

impl<P: NumEnum> MultiShutdownSignal<P> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        &self,
        phase: P,
        kick: impl 'static + Send + Sync + FnOnce(),
    ) -> Result<ShutdownTask, ShutdownAlreadyRequested> {
        self.signals[phase].spawn_ref(kick)
    }

    pub fn shutdown(&self) {
        for signal in self.signals.values() {
            signal.shutdown();
        }
    }
}

// === ShutdownSignal === //

#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<ShutdownSignalInner>);

impl fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownSignal").finish_non_exhaustive()
    }
}

#[derive(Default)]
struct ShutdownSignalInner {
    state: Mutex<State>,
    condvar: Condvar,
}

#[derive(Default)]
struct State {
    shutting_down: bool,
    tasks: Arena<Box<dyn Send + Sync + FnMut()>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn(
        self,
        kick: impl 'static + Send + Sync + FnOnce(),
    ) -> Result<ShutdownTask, ShutdownAlreadyRequested> {
        let mut guard = self.0.state.lock();

        if guard.shutting_down {
            return Err(ShutdownAlreadyRequested);
        }

        let mut kick = Some(kick);
        let index = guard.tasks.insert(Box::new(move || {
            if let Some(kick) = kick.take() {
                kick();
            }
        }));

        drop(guard);

        Ok(ShutdownTask {
            signal: self,
            index,
        })
    }

    pub fn spawn_ref(
        &self,
        kick: impl 'static + Send + Sync + FnOnce(),
    ) -> Result<ShutdownTask, ShutdownAlreadyRequested> {
        self.clone().spawn(kick)
    }

    pub fn shutdown(&self) {
        let mut guard = self.0.state.lock();
        guard.shutting_down = true;

        for (_, task) in &mut guard.tasks {
            // This is technically calling userland code but that routine should already be quite
            // reentrancy-aware so this is unlikely to be the source of bugs.
            task();
        }

        self.0.condvar.wait(&mut guard);
        assert!(guard.tasks.is_empty());
    }
}

// === ShutdownTask === //

#[derive(Debug)]
pub struct ShutdownTask {
    signal: ShutdownSignal,
    index: Index,
}

impl ShutdownTask {
    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }
}

impl Drop for ShutdownTask {
    fn drop(&mut self) {
        let mut guard = self.signal.0.state.lock();

        guard.tasks.remove(self.index);
        if guard.shutting_down && guard.tasks.is_empty() {
            self.signal.0.condvar.notify_all();
        }
    }
}

// === Tests === //

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn does_notify() {
        let subscriber_barrier = Barrier::new(2);
        let shutdown = ShutdownSignal::new();
        let notified = AtomicBool::new(false);

        std::thread::scope(|s| {
            s.spawn(|| {
                let task = shutdown
                    .clone()
                    .spawn(|| notified.store(true, Ordering::SeqCst))
                    .unwrap();

                subscriber_barrier.wait();

                while !notified.load(Ordering::SeqCst) {
                    std::thread::yield_now();
                }

                assert!(shutdown
                    .clone()
                    .spawn(|| notified.store(true, Ordering::SeqCst))
                    .is_err());

                drop(task);
            });

            s.spawn(|| {
                subscriber_barrier.wait();
                shutdown.shutdown();
            });
        });
    }
}
