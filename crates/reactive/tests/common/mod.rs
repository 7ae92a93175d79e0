//! Shared fixtures for keysync-reactive integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use keysync_reactive::{BoxError, CacheEntry, Deliver, Key, Source};

/// Counts fetch and stop calls and keeps the latest delivery handle.
///
/// Every fetch immediately delivers its own ordinal (1 for the first fetch,
/// 2 for the second, ...).
#[derive(Default)]
pub struct Log {
    pub fetches: Cell<u32>,
    pub stops: Cell<u32>,
    pub deliver: RefCell<Option<Deliver<u32, String>>>,
    pub fail_fetch: Cell<bool>,
    pub fail_stop: Cell<bool>,
}

impl Log {
    pub fn deliver(&self) -> Deliver<u32, String> {
        self.deliver
            .borrow()
            .clone()
            .expect("fetch was never called")
    }
}

pub struct Recording(pub Rc<Log>);

impl Recording {
    pub fn new() -> (Self, Rc<Log>) {
        let log = Rc::new(Log::default());
        (Self(Rc::clone(&log)), log)
    }
}

#[async_trait(?Send)]
impl Source<u32, String> for Recording {
    async fn fetch(&self, _key: Key, deliver: Deliver<u32, String>) -> Result<(), BoxError> {
        let ordinal = self.0.fetches.get() + 1;
        self.0.fetches.set(ordinal);
        *self.0.deliver.borrow_mut() = Some(deliver.clone());
        if self.0.fail_fetch.get() {
            return Err("upstream unavailable".into());
        }
        deliver.data(ordinal);
        Ok(())
    }

    async fn stop(&self, _key: Key) -> Result<(), BoxError> {
        self.0.stops.set(self.0.stops.get() + 1);
        if self.0.fail_stop.get() {
            return Err("upstream refused to close".into());
        }
        Ok(())
    }
}

pub type Seen<C> = Rc<RefCell<Vec<Option<C>>>>;

/// Returns a callback recording the data of every delivery.
pub fn recorder<C: Clone + 'static, CE: 'static>() -> (Seen<C>, impl Fn(&CacheEntry<C, CE>)) {
    let seen: Seen<C> = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = Rc::clone(&seen);
    (seen, move |entry: &CacheEntry<C, CE>| {
        seen_clone.borrow_mut().push(entry.data.clone())
    })
}

/// Lets spawned local tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
