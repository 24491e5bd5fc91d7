//! A single asynchronous read shared by every consumer of one tick.
//!
//! `Memoized` wraps one fetch. The first `get_value` drives it, every other call (concurrent or
//! later) awaits the very same operation and gets the very same result, failures included.

use std::cell::RefCell;
use std::future::Future;
use std::path::PathBuf;
use std::rc::Rc;

use futures::future::{FutureExt, LocalBoxFuture, Shared};

use crate::errors::*;
use crate::util;

/// The shared handle returned by [`Memoized::get_value`].
pub type Fetch<T> = Shared<LocalBoxFuture<'static, Result<Rc<T>>>>;

type Producer<T> = Box<dyn FnOnce() -> LocalBoxFuture<'static, Result<T>>>;

enum State<T> {
    Pending(Producer<T>),
    Started(Fetch<T>),
    Starting,
}

pub struct Memoized<T>(Rc<RefCell<State<T>>>);

impl<T> Clone for Memoized<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: 'static> Memoized<T> {
    /// Wrap an already created operation.
    pub fn new<F>(fetch: F) -> Self
    where
        F: Future<Output = Result<T>> + 'static,
    {
        Self(Rc::new(RefCell::new(State::Started(share(fetch)))))
    }

    /// Defer creating the operation until the first `get_value`. A holder which is never read
    /// never issues a fetch.
    pub fn lazy<P, F>(producer: P) -> Self
    where
        P: FnOnce() -> F + 'static,
        F: Future<Output = Result<T>> + 'static,
    {
        Self(Rc::new(RefCell::new(State::Pending(Box::new(move || {
            producer().boxed_local()
        })))))
    }

    pub fn get_value(&self) -> Fetch<T> {
        let mut state = self.0.borrow_mut();
        let fetch = match std::mem::replace(&mut *state, State::Starting) {
            State::Started(fetch) => fetch,
            State::Pending(producer) => share(producer()),
            State::Starting => unreachable!("memoized producer re-entered itself"),
        };
        *state = State::Started(fetch.clone());
        fetch
    }

    /// Whether the result is cached. A never-read lazy holder is not settled.
    pub fn is_settled(&self) -> bool {
        match &*self.0.borrow() {
            State::Started(fetch) => fetch.peek().is_some(),
            State::Pending(_) | State::Starting => false,
        }
    }
}

impl Memoized<String> {
    /// Lazily read a text file.
    pub fn read_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self::lazy(move || async move {
            util::read_file(&path)
                .await
                .or_error(|| format!("Failed to read {}", path.display()))
        })
    }
}

fn share<T: 'static>(fetch: impl Future<Output = Result<T>> + 'static) -> Fetch<T> {
    fetch.map(|res| res.map(Rc::new)).boxed_local().shared()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    fn counting(calls: &Rc<Cell<u32>>, fail: bool) -> Memoized<u32> {
        let calls = calls.clone();
        Memoized::lazy(move || async move {
            calls.set(calls.get() + 1);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fail {
                Err(Error::new("no such file"))
            } else {
                Ok(7)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn invoked_once_for_concurrent_and_later_reads() {
        let calls = Rc::new(Cell::new(0));
        let memo = counting(&calls, false);
        let results = futures::future::join_all((0..5).map(|_| memo.get_value())).await;
        assert!(results.iter().all(|r| **r.as_ref().unwrap() == 7));
        assert!(memo.is_settled());
        assert_eq!(*memo.clone().get_value().await.unwrap(), 7);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_is_settled_and_not_retried() {
        let calls = Rc::new(Cell::new(0));
        let memo = counting(&calls, true);
        assert_eq!(
            memo.get_value().await.unwrap_err().to_string(),
            "no such file"
        );
        assert!(memo.get_value().await.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn lazy_holder_never_read_never_fetches() {
        let calls = Rc::new(Cell::new(0));
        let memo = counting(&calls, false);
        assert!(!memo.is_settled());
        drop(memo);
        assert_eq!(calls.get(), 0);
    }

    #[tokio::test]
    async fn eager_holder() {
        let memo = Memoized::new(async { Ok(String::from("cpu 1 2 3")) });
        assert_eq!(memo.get_value().await.unwrap().as_str(), "cpu 1 2 3");
        assert!(memo.is_settled());
    }

    #[tokio::test]
    async fn read_missing_file_fails() {
        let memo = Memoized::read_file("/nonexistent/sysmon/stat");
        let err = memo.get_value().await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to read /nonexistent/sysmon/stat"));
    }
}
