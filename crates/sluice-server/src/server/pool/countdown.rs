use portable_atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

/// A completion counter that wakes waiters when it reaches zero.
///
/// Workers call [`Countdown::count_down`] once per settled item. The
/// coordinator awaits [`Countdown::wait`], which re-checks the remaining count
/// after every wake-up, so completions racing with the wait are never missed.
#[derive(Debug)]
pub struct Countdown {
    remaining: AtomicUsize,
    zero: Notify,
}

impl Countdown {
    pub const fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            zero: Notify::const_new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    /// Records one completion. Calls beyond the initial count are ignored.
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.zero.notify_waiters();
        }
    }

    /// Resolves once every expected completion has been recorded.
    pub async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // Register interest before checking so a concurrent final
            // `count_down` cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.remaining() == 0 {
                return;
            }
            notified.await;
        }
    }
}
