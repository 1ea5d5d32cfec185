use std::sync::{Arc, RwLock};

use tokio::sync::watch::{self, Receiver, Sender};

/// A single-writer, multi-reader slot.
///
/// Handshake tasks use these to report values (ssrc, secret key, task
/// handles) back to whoever launched them without holding a lock across an
/// await point.
pub struct Cell<T> {
  inner: Arc<Inner<T>>
}

struct Inner<T> {
  value: RwLock<Option<T>>,
  notify: Sender<()>,
  subscribe: Receiver<()>
}

impl<T: Clone> Cell<T> {
  pub fn new() -> Self {
    let (notify, subscribe) = watch::channel(());
    Self {
      inner: Arc::new(Inner {
        value: RwLock::new(None),
        notify,
        subscribe
      })
    }
  }

  pub fn fill(&self, value: T) {
    *self.inner.value.write().unwrap() = Some(value);
    self.inner.notify.send(()).unwrap() // It is not possible that the receiver will be dropped
  }

  pub fn get(&self) -> Option<T> {
    self.inner.value.read().unwrap().clone()
  }

  pub async fn wait(&self) -> T {
    let mut receiver = self.inner.subscribe.clone();
    receiver.borrow_and_update();

    loop {
      if let Some(value) = self.get() {
        return value;
      }
      receiver.changed().await.unwrap(); // It is not possible that the sender will be dropped
    }
  }
}

impl<T: Clone> Default for Cell<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Clone for Cell<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn wait_returns_immediately_when_filled() {
    let cell = Cell::new();
    cell.fill(42u32);
    assert_eq!(cell.wait().await, 42);
    assert_eq!(cell.get(), Some(42));
  }

  #[tokio::test]
  async fn wait_observes_a_later_fill() {
    let cell = Cell::<u32>::new();
    let writer = cell.clone();

    let waiter = tokio::spawn(async move { cell.wait().await });
    tokio::task::yield_now().await;
    writer.fill(7);

    assert_eq!(waiter.await.unwrap(), 7);
  }

  #[tokio::test]
  async fn get_is_none_until_filled() {
    let cell = Cell::<u32>::new();
    assert_eq!(cell.get(), None);
  }
}
