use crate::error::{CacheError, Result};

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::select_all;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct CancelState {
  cancelled: AtomicBool,
  notify: Notify,
  parent: Option<Arc<CancelState>>,
}

impl CancelState {
  /// True once this state or any ancestor has been cancelled.
  fn is_cancelled(&self) -> bool {
    std::iter::successors(Some(self), |state| state.parent.as_deref())
      .any(|state| state.cancelled.load(Ordering::SeqCst))
  }
}

/// Cancels the [`Context`] it was created with and every context derived from it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  state: Arc<CancelState>,
}

impl CancelHandle {
  pub fn cancel(&self) {
    self.state.cancelled.store(true, Ordering::SeqCst);
    self.state.notify.notify_waiters();
  }

  /// Also true when an ancestor context was cancelled.
  pub fn is_cancelled(&self) -> bool {
    self.state.is_cancelled()
  }
}

/// Carries an optional deadline and cancellation signal into a cache call.
///
/// When the context ends, the call stops waiting and returns
/// [`CacheError::Cancelled`] or [`CacheError::DeadlineExceeded`]. Work that
/// other callers share, such as a coalesced load, keeps running for them.
#[derive(Debug, Clone, Default)]
pub struct Context {
  deadline: Option<Instant>,
  cancel: Option<Arc<CancelState>>,
}

impl Context {
  /// A context that never ends.
  pub fn background() -> Self {
    Self::default()
  }

  pub fn with_timeout(timeout: Duration) -> Self {
    Self::background().timeout(timeout)
  }

  /// A context that can be ended through the returned handle.
  pub fn with_cancel() -> (Self, CancelHandle) {
    Self::background().cancellable()
  }

  /// Derives a context that also ends after `timeout`. An earlier deadline
  /// is kept.
  pub fn timeout(&self, timeout: Duration) -> Self {
    self.deadline(Instant::now() + timeout)
  }

  pub fn deadline(&self, deadline: Instant) -> Self {
    let deadline = match self.deadline {
      Some(existing) if existing < deadline => existing,
      _ => deadline,
    };
    Self {
      deadline: Some(deadline),
      cancel: self.cancel.clone(),
    }
  }

  /// Derives a cancellable context.
  ///
  /// The derived context still ends when this one is cancelled. The new
  /// handle only reaches the derived context and its own descendants.
  pub fn cancellable(&self) -> (Self, CancelHandle) {
    let state = Arc::new(CancelState {
      parent: self.cancel.clone(),
      ..CancelState::default()
    });
    let ctx = Self {
      deadline: self.deadline,
      cancel: Some(state.clone()),
    };
    (ctx, CancelHandle { state })
  }

  pub fn deadline_instant(&self) -> Option<Instant> {
    self.deadline
  }

  /// Returns the reason this context has ended, if it has.
  pub fn err(&self) -> Option<CacheError> {
    if self.cancel.as_ref().is_some_and(|state| state.is_cancelled()) {
      return Some(CacheError::Cancelled);
    }
    match self.deadline {
      Some(deadline) if Instant::now() >= deadline => Some(CacheError::DeadlineExceeded),
      _ => None,
    }
  }

  async fn cancelled(&self) {
    let Some(state) = &self.cancel else {
      return std::future::pending().await;
    };
    let chain: Vec<&CancelState> =
      std::iter::successors(Some(state.as_ref()), |state| state.parent.as_deref()).collect();
    loop {
      // Register before checking the flags so a concurrent cancel is not lost.
      let notified: Vec<_> = chain
        .iter()
        .map(|state| Box::pin(state.notify.notified()))
        .collect();
      if state.is_cancelled() {
        return;
      }
      select_all(notified).await;
    }
  }

  async fn expired(&self) {
    match self.deadline {
      Some(deadline) => tokio::time::sleep_until(deadline).await,
      None => std::future::pending().await,
    }
  }

  /// Runs `fut` until it completes or this context ends, whichever is first.
  pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T>
  where
    F: Future<Output = Result<T>>,
  {
    if let Some(err) = self.err() {
      return Err(err);
    }
    if self.deadline.is_none() && self.cancel.is_none() {
      return fut.await;
    }

    tokio::select! {
      biased;
      _ = self.cancelled() => Err(CacheError::Cancelled),
      _ = self.expired() => Err(CacheError::DeadlineExceeded),
      out = fut => out,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn background_runs_to_completion() {
    let out = Context::background().run(async { Ok(7) }).await.unwrap();
    assert_eq!(out, 7);
  }

  #[tokio::test(start_paused = true)]
  async fn deadline_interrupts_slow_work() {
    let ctx = Context::with_timeout(Duration::from_millis(50));
    let res: Result<()> = ctx
      .run(async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(())
      })
      .await;
    assert!(matches!(res, Err(CacheError::DeadlineExceeded)));
    assert!(matches!(ctx.err(), Some(CacheError::DeadlineExceeded)));
  }

  #[tokio::test]
  async fn cancel_wakes_a_running_call() {
    let (ctx, handle) = Context::with_cancel();
    let task = tokio::spawn({
      let ctx = ctx.clone();
      async move {
        ctx
          .run(async {
            std::future::pending::<()>().await;
            Ok(())
          })
          .await
      }
    });
    tokio::task::yield_now().await;
    handle.cancel();
    assert!(matches!(task.await.unwrap(), Err(CacheError::Cancelled)));
    assert!(handle.is_cancelled());
  }

  #[tokio::test]
  async fn parent_cancel_reaches_derived_contexts() {
    let (parent, handle) = Context::with_cancel();
    let (child, child_handle) = parent.cancellable();
    let grandchild = child.timeout(Duration::from_secs(60));
    let task = tokio::spawn({
      let grandchild = grandchild.clone();
      async move {
        grandchild
          .run(async {
            std::future::pending::<()>().await;
            Ok(())
          })
          .await
      }
    });
    tokio::task::yield_now().await;
    handle.cancel();
    assert!(matches!(task.await.unwrap(), Err(CacheError::Cancelled)));
    assert!(matches!(child.err(), Some(CacheError::Cancelled)));
    assert!(child_handle.is_cancelled());
  }

  #[tokio::test]
  async fn child_cancel_leaves_the_parent_running() {
    let (parent, _handle) = Context::with_cancel();
    let (child, child_handle) = parent.cancellable();
    child_handle.cancel();
    assert!(matches!(child.err(), Some(CacheError::Cancelled)));
    assert!(parent.err().is_none());
    assert_eq!(parent.run(async { Ok(2) }).await.unwrap(), 2);
  }

  #[tokio::test]
  async fn ended_context_short_circuits() {
    let (ctx, handle) = Context::with_cancel();
    handle.cancel();
    let res = ctx.run(async { Ok(1) }).await;
    assert!(matches!(res, Err(CacheError::Cancelled)));
  }

  #[test]
  fn derived_deadline_keeps_the_earlier_one() {
    let rt = tokio::runtime::Builder::new_current_thread()
      .enable_time()
      .build()
      .unwrap();
    rt.block_on(async {
      let short = Context::with_timeout(Duration::from_secs(1));
      let longer = short.timeout(Duration::from_secs(60));
      assert_eq!(short.deadline_instant(), longer.deadline_instant());
    });
  }
}
