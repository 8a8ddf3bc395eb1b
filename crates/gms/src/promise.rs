//! Reusable reply collectors
//!
//! A [`Promise`] turns an asynchronous message exchange into a bounded wait:
//! the dispatch path stores replies with [`Promise::set_result`] while the
//! requesting role awaits them with a deadline. Roles reuse one promise
//! across retries and call [`Promise::reset`] between attempts.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

struct PromiseState<T> {
    results: Vec<T>,
    expected: usize,
}

/// Collector for an expected number of replies.
pub struct Promise<T> {
    state: Mutex<PromiseState<T>>,
    notify: Notify,
}

impl<T: Clone + Send> Promise<T> {
    /// Promise expecting a single reply
    pub fn new() -> Self {
        Self::with_expected(1)
    }

    /// Promise expecting `expected` replies
    pub fn with_expected(expected: usize) -> Self {
        Self {
            state: Mutex::new(PromiseState {
                results: Vec::new(),
                expected,
            }),
            notify: Notify::new(),
        }
    }

    /// Store a reply and wake waiters
    pub fn set_result(&self, result: T) {
        self.state.lock().results.push(result);
        self.notify.notify_waiters();
    }

    /// Clear replies and set a new expected count
    pub fn reset(&self, expected: usize) {
        let mut state = self.state.lock();
        state.results.clear();
        state.expected = expected;
    }

    /// Whether every expected reply arrived
    pub fn all_results_received(&self) -> bool {
        let state = self.state.lock();
        state.results.len() >= state.expected
    }

    /// Whether any reply arrived
    pub fn has_result(&self) -> bool {
        !self.state.lock().results.is_empty()
    }

    /// Replies received so far
    pub fn results(&self) -> Vec<T> {
        self.state.lock().results.clone()
    }

    /// Wait for the first reply, `None` on timeout
    pub async fn wait_result(&self, timeout: Duration) -> Option<T> {
        self.wait_until(timeout, |state| !state.results.is_empty())
            .await;
        self.state.lock().results.first().cloned()
    }

    /// Wait for every expected reply, returning whether all arrived
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.results.len() >= state.expected)
            .await
    }

    async fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&PromiseState<T>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let finished = done(&self.state.lock());
            if finished {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done(&self.state.lock());
            }
        }
    }
}

impl<T: Clone + Send + PartialEq> Promise<T> {
    /// Store a reply unless an equal one is already present
    pub fn set_result_if_absent(&self, result: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.results.contains(&result) {
                return false;
            }
            state.results.push(result);
        }
        self.notify.notify_waiters();
        true
    }
}

impl<T: Clone + Send> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}
