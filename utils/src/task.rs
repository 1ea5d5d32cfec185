use tokio::task::{AbortHandle, JoinHandle};

/// Owns a spawned task and aborts it on drop.
///
/// Task ownership in this workspace is expressed by holding the guard: when
/// a parent task's future is dropped, every child guard in its locals drops
/// with it and the whole tree winds down.
pub struct TaskGuard<T> {
  handle: JoinHandle<T>
}

impl<T> TaskGuard<T> {
  pub fn new(handle: JoinHandle<T>) -> Self {
    Self { handle }
  }

  pub fn abort_handle(&self) -> AbortHandle {
    self.handle.abort_handle()
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }
}

impl<T> Drop for TaskGuard<T> {
  fn drop(&mut self) {
    self.handle.abort();
  }
}
