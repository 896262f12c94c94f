//! Leading and trailing throttling.
//!
//! The first call in a quiet period runs at once and opens a window. Calls
//! that arrive while the window is open share one pending slot: each
//! overwrites the slot's arguments and joins its waiters. When the window
//! closes the slot runs once, every waiter gets that result, and a new
//! window opens. No call is ever rejected. A waiter whose pending call is
//! cancelled gets `None`.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

type Action<A, R> = Arc<dyn Fn(A) -> BoxFuture<'static, R> + Send + Sync>;

struct Pending<A, R> {
    args: A,
    waiters: Vec<oneshot::Sender<R>>,
}

struct Slot<A, R> {
    window_ends: Option<Instant>,
    pending: Option<Pending<A, R>>,
}

enum Admission<A, R> {
    Leading(A),
    Queued(oneshot::Receiver<R>),
}

/// Throttles calls to an async action.
pub struct Throttle<A, R> {
    window: Duration,
    action: Action<A, R>,
    slot: Arc<Mutex<Slot<A, R>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<A, R> Throttle<A, R>
where
    A: Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new<F, Fut>(window: Duration, action: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        Self {
            window,
            action: Arc::new(move |args| action(args).boxed()),
            slot: Arc::new(Mutex::new(Slot {
                window_ends: None,
                pending: None,
            })),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Call the action, or join the pending trailing call.
    pub async fn call(&self, args: A) -> Option<R> {
        let admission = {
            let mut slot = lock(&self.slot);
            let now = Instant::now();
            match slot.window_ends {
                Some(end) if now < end => {
                    let (tx, rx) = oneshot::channel();
                    match &mut slot.pending {
                        Some(pending) => {
                            pending.args = args;
                            pending.waiters.push(tx);
                        }
                        None => {
                            slot.pending = Some(Pending {
                                args,
                                waiters: vec![tx],
                            });
                            self.arm(end);
                        }
                    }
                    Admission::Queued(rx)
                }
                _ => {
                    slot.window_ends = Some(now + self.window);
                    Admission::Leading(args)
                }
            }
        };

        match admission {
            Admission::Leading(args) => Some((self.action)(args).await),
            Admission::Queued(rx) => rx.await.ok(),
        }
    }

    /// Drop the pending call. Its waiters resolve with `None`.
    pub fn cancel(&self) -> bool {
        lock(&self.slot).pending.take().is_some()
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }

    fn arm(&self, deadline: Instant) {
        let slot = Arc::clone(&self.slot);
        let action = Arc::clone(&self.action);
        let window = self.window;

        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let pending = {
                let mut slot = lock(&slot);
                let pending = slot.pending.take();
                if pending.is_some() {
                    slot.window_ends = Some(Instant::now() + window);
                }
                pending
            };
            let Some(pending) = pending else {
                return;
            };

            let result = action(pending.args).await;
            for waiter in pending.waiters {
                // The caller may have gone away.
                let _ = waiter.send(result.clone());
            }
        });
    }
}
