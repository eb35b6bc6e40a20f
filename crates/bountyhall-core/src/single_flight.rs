//! Single-flight execution of an async operation.
//!
//! `SingleFlight::run_exclusive` lets the first caller run an operation
//! while everyone arriving during that run joins it and receives a clone
//! of its result. At most one run is in flight at any time.
//!
//! Joiners are handed the result one at a time in the order they joined.
//! Each joiner also receives a `Turn`; the leader does not hand the result
//! to the next joiner, or return itself, until the current `Turn` has been
//! passed or dropped. This lets joiners start their follow-up work in queue
//! order, ahead of the leader's own.
//!
//! State lives behind a `std::sync::Mutex` that is never held across an
//! `.await`, and joiners rendezvous through `oneshot` channels, so this is
//! safe on the multi-threaded tokio runtime.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// How a caller took part in a run.
#[derive(Debug)]
pub enum Flight<T> {
    /// This caller ran the operation
    Led(T),
    /// This caller joined a run started by someone else
    Joined(T, Turn),
    /// The leading future was dropped before producing a result
    Abandoned,
}

impl<T> Flight<T> {
    /// The result, passing the turn straight away if there is one.
    pub fn into_inner(self) -> Option<T> {
        match self {
            Flight::Led(value) | Flight::Joined(value, _) => Some(value),
            Flight::Abandoned => None,
        }
    }
}

/// A joiner's place in the hand-off queue.
///
/// The leader waits until this is passed (or dropped) before moving on to
/// the next joiner.
#[derive(Debug)]
pub struct Turn {
    done: Option<oneshot::Sender<()>>,
}

impl Turn {
    pub fn pass(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        self.release();
    }
}

type Waiter<T> = oneshot::Sender<(T, Turn)>;

struct FlightState<T> {
    in_flight: bool,
    waiters: VecDeque<Waiter<T>>,
}

pub struct SingleFlight<T> {
    state: Mutex<FlightState<T>>,
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FlightState {
                in_flight: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.lock().in_flight
    }

    /// Number of callers currently waiting on the in-flight run
    pub fn waiter_count(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Run `f` unless a run is already in flight, in which case wait for
    /// that run's result instead.
    ///
    /// When the leader finishes, the in-flight flag is cleared first. Then
    /// every waiter is handed the result in the order it joined, each one
    /// only after the previous waiter's `Turn` was released.
    pub async fn run_exclusive<F, Fut>(&self, f: F) -> Flight<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let joined = {
            let mut state = self.lock();
            if state.in_flight {
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                Some(rx)
            } else {
                state.in_flight = true;
                None
            }
        };

        if let Some(rx) = joined {
            return match rx.await {
                Ok((value, turn)) => Flight::Joined(value, turn),
                Err(_) => Flight::Abandoned,
            };
        }

        let mut cycle = Cycle {
            flight: self,
            armed: true,
        };
        let value = f().await;

        for waiter in cycle.finish() {
            let (done, passed) = oneshot::channel();
            let turn = Turn { done: Some(done) };
            // A waiter that stopped listening is simply skipped
            if waiter.send((value.clone(), turn)).is_ok() {
                let _ = passed.await;
            }
        }
        Flight::Led(value)
    }

    fn lock(&self) -> MutexGuard<'_, FlightState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Resets the flight when the leading future completes or is dropped.
struct Cycle<'a, T: Clone> {
    flight: &'a SingleFlight<T>,
    armed: bool,
}

impl<T: Clone> Cycle<'_, T> {
    fn finish(&mut self) -> VecDeque<Waiter<T>> {
        self.armed = false;
        let mut state = self.flight.lock();
        state.in_flight = false;
        std::mem::take(&mut state.waiters)
    }
}

impl<T: Clone> Drop for Cycle<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            // Dropping the senders wakes every waiter with `Abandoned`
            let waiters = self.finish();
            drop(waiters);
        }
    }
}
