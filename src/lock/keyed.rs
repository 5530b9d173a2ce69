//! Binary permit with a usage counter, one per in-flight session key.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// How a request waits when the permit for its key is already held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentionPolicy {
    /// Wait for the permit, giving up if the request is cancelled
    BlockInterruptibly,
    /// Wait for the permit, ignoring cancellation
    BlockUninterruptibly,
    /// Try once and reject the request if the permit is held
    Reject,
}

impl ContentionPolicy {
    pub fn from_flags(block_on_contention: bool, interruptible_wait: bool) -> Self {
        match (block_on_contention, interruptible_wait) {
            (false, _) => Self::Reject,
            (true, true) => Self::BlockInterruptibly,
            (true, false) => Self::BlockUninterruptibly,
        }
    }

    pub fn blocks(&self) -> bool {
        !matches!(self, Self::Reject)
    }
}

/// Why a permit was not obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NotAcquired {
    /// The permit was held and the policy does not wait
    #[error("session permit is held by another request")]
    Busy,

    /// The request was cancelled while waiting
    #[error("wait for session permit was interrupted")]
    Interrupted,
}

/// Permit state without FIFO hand-off: a released permit goes to whichever
/// task claims it first, including one that never waited.
#[derive(Debug, Default)]
struct BargingPermit {
    held: AtomicBool,
    notify: Notify,
}

impl BargingPermit {
    fn try_claim(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn claim(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and the
            // await is not lost.
            notified.as_mut().enable();
            if self.try_claim() {
                return;
            }
            notified.await;
        }
    }

    fn unclaim(&self) {
        self.held.store(false, Ordering::Release);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
enum PermitSource {
    Fair(Arc<Semaphore>),
    Barging(Arc<BargingPermit>),
}

/// Holding this value means holding the permit. Dropping it releases the permit,
/// so a permit can only be released once per acquisition.
#[derive(Debug)]
pub struct PermitGuard {
    inner: GuardInner,
}

#[derive(Debug)]
enum GuardInner {
    Fair(#[allow(dead_code)] OwnedSemaphorePermit),
    Barging(Arc<BargingPermit>),
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if let GuardInner::Barging(permit) = &self.inner {
            permit.unclaim();
        }
    }
}

/// A single-holder permit plus the number of requests referencing it.
///
/// The usage counter is only read and written while the owning
/// [`LockRegistry`](super::LockRegistry) holds its map lock.
#[derive(Debug)]
pub struct KeyedLock {
    source: PermitSource,
    fair: bool,
    usage: AtomicUsize,
}

impl KeyedLock {
    /// Create a lock whose usage count starts at one (the creating request)
    pub fn new(fair: bool) -> Self {
        let source = if fair {
            PermitSource::Fair(Arc::new(Semaphore::new(1)))
        } else {
            PermitSource::Barging(Arc::new(BargingPermit::default()))
        };

        Self {
            source,
            fair,
            usage: AtomicUsize::new(1),
        }
    }

    pub fn is_fair(&self) -> bool {
        self.fair
    }

    /// Number of requests currently holding a handle to this lock
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Acquire)
    }

    pub(crate) fn increment_usage(&self) -> usize {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement and return the new count. Returns `None` instead of wrapping
    /// below zero.
    pub(crate) fn decrement_usage(&self) -> Option<usize> {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Whether some request currently holds the permit
    pub fn is_held(&self) -> bool {
        match &self.source {
            PermitSource::Fair(semaphore) => semaphore.available_permits() == 0,
            PermitSource::Barging(permit) => permit.held.load(Ordering::Acquire),
        }
    }

    /// Attempt to take the permit without waiting
    pub fn try_acquire(&self) -> Option<PermitGuard> {
        match &self.source {
            PermitSource::Fair(semaphore) => Arc::clone(semaphore)
                .try_acquire_owned()
                .ok()
                .map(|permit| PermitGuard {
                    inner: GuardInner::Fair(permit),
                }),
            PermitSource::Barging(permit) => permit.try_claim().then(|| PermitGuard {
                inner: GuardInner::Barging(Arc::clone(permit)),
            }),
        }
    }

    /// Wait for the permit, ignoring cancellation
    pub async fn acquire(&self) -> PermitGuard {
        match &self.source {
            PermitSource::Fair(semaphore) => {
                loop {
                    // The semaphore is never closed, so this only loops in theory.
                    if let Ok(permit) = Arc::clone(semaphore).acquire_owned().await {
                        return PermitGuard {
                            inner: GuardInner::Fair(permit),
                        };
                    }
                    tokio::task::yield_now().await;
                }
            }
            PermitSource::Barging(permit) => {
                permit.claim().await;
                PermitGuard {
                    inner: GuardInner::Barging(Arc::clone(permit)),
                }
            }
        }
    }

    /// Wait for the permit unless `cancel` fires first. A token that is
    /// already cancelled wins even when the permit is free.
    pub async fn acquire_interruptibly(
        &self,
        cancel: &CancellationToken,
    ) -> Result<PermitGuard, NotAcquired> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NotAcquired::Interrupted),
            guard = self.acquire() => Ok(guard),
        }
    }

    /// Acquire according to `policy`
    pub async fn acquire_with(
        &self,
        policy: ContentionPolicy,
        cancel: &CancellationToken,
    ) -> Result<PermitGuard, NotAcquired> {
        match policy {
            ContentionPolicy::BlockInterruptibly => self.acquire_interruptibly(cancel).await,
            ContentionPolicy::BlockUninterruptibly => Ok(self.acquire().await),
            ContentionPolicy::Reject => self.try_acquire().ok_or(NotAcquired::Busy),
        }
    }
}
