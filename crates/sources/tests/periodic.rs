//! Integration tests for the periodic source on a paused clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use keysync_core::{BoxError, CacheConfig, CacheEntry, RetryConfig};
use keysync_reactive::{Identity, SubscriptionFamily, View};
use keysync_sources::{Periodic, PeriodicOptions, Phase};
use tokio::task::LocalSet;
use tokio::time::Instant;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Records the instant of every call; fails while `fail` is set.
#[derive(Default)]
struct Calls {
    at: RefCell<Vec<Instant>>,
    fail: Cell<bool>,
}

impl Calls {
    fn gaps(&self) -> Vec<u64> {
        self.at
            .borrow()
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }

    fn count(&self) -> usize {
        self.at.borrow().len()
    }
}

fn periodic(retry: RetryConfig, terminal: Option<&str>) -> (Periodic<u32, String>, Rc<Calls>) {
    let calls = Rc::new(Calls::default());
    let body_calls = Rc::clone(&calls);
    let mut options = PeriodicOptions::new(retry);
    if let Some(terminal) = terminal {
        options = options.with_terminal_error(terminal.to_string());
    }
    let source = Periodic::with_options(options, move |_key| {
        let calls = Rc::clone(&body_calls);
        async move {
            calls.at.borrow_mut().push(Instant::now());
            if calls.fail.get() {
                Err::<u32, BoxError>("unreachable upstream".into())
            } else {
                Ok(calls.count() as u32)
            }
        }
    })
    .unwrap();
    (source, calls)
}

fn backoff() -> RetryConfig {
    RetryConfig::new(ms(10_000)).with_error_interval(vec![ms(1000), ms(2000), ms(5000)])
}

type Seen = Rc<RefCell<Vec<CacheEntry<u32, String>>>>;

fn record() -> (Seen, impl Fn(&CacheEntry<u32, String>)) {
    let seen: Seen = Rc::default();
    let seen_clone = Rc::clone(&seen);
    (seen, move |entry: &CacheEntry<u32, String>| {
        seen_clone.borrow_mut().push(entry.clone())
    })
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_backoff_sequence_clamps_to_last_delay() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(backoff(), None);
            calls.fail.set(true);
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();

            let _session = family.attach("feed", &View::new("raw", Identity), |_| {}).unwrap();
            tokio::time::sleep(ms(19_000)).await;

            assert_eq!(calls.gaps(), vec![1000, 2000, 5000, 5000, 5000]);
            assert_eq!(source.retry_count("feed"), 6);
            assert_eq!(source.phase("feed"), Phase::Scheduled);
            assert_eq!(source.last_delay("feed"), Some(ms(5000)));
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_terminal_error_after_retry_cap() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(backoff().with_maximum_retry_count(5), Some("gave up"));
            calls.fail.set(true);
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();

            let (seen, callback) = record();
            let _session = family.attach("feed", &View::new("raw", Identity), callback).unwrap();
            tokio::time::sleep(ms(60_000)).await;

            assert_eq!(calls.count(), 5);
            assert_eq!(calls.gaps(), vec![1000, 2000, 5000, 5000]);
            assert_eq!(source.phase("feed"), Phase::Terminal);
            assert_eq!(
                *seen.borrow(),
                vec![CacheEntry::new(None, Some("gave up".to_string()))]
            );
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_success_resets_retry_count() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(backoff(), None);
            calls.fail.set(true);
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();

            let (seen, callback) = record();
            let _session = family.attach("feed", &View::new("raw", Identity), callback).unwrap();
            tokio::time::sleep(ms(2000)).await;
            assert_eq!(source.retry_count("feed"), 2);

            calls.fail.set(false);
            tokio::time::sleep(ms(2000)).await;

            assert_eq!(source.retry_count("feed"), 0);
            assert_eq!(source.last_delay("feed"), Some(ms(10_000)));
            assert_eq!(seen.borrow().last().and_then(|e| e.data), Some(3));
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_success_reschedules_on_interval() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(RetryConfig::new(ms(500)), None);
            let family = SubscriptionFamily::new(source, CacheConfig::new()).unwrap();

            let (seen, callback) = record();
            let _session = family.attach("feed", &View::new("raw", Identity), callback).unwrap();
            tokio::time::sleep(ms(1200)).await;

            assert_eq!(calls.gaps(), vec![500, 500]);
            let data: Vec<_> = seen.borrow().iter().map(|e| e.data).collect();
            assert_eq!(data, vec![Some(1), Some(2), Some(3)]);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_retry_disabled_halts_after_failure() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(backoff().with_retry_on_error(false), None);
            calls.fail.set(true);
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();

            let _session = family.attach("feed", &View::new("raw", Identity), |_| {}).unwrap();
            tokio::time::sleep(ms(30_000)).await;

            assert_eq!(calls.count(), 1);
            assert_eq!(source.retry_count("feed"), 0);
            assert_eq!(source.phase("feed"), Phase::Idle);
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_stop_cancels_timer_and_keeps_retry_count() {
    LocalSet::new()
        .run_until(async {
            let (source, calls) = periodic(backoff(), None);
            calls.fail.set(true);
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();
            let view = View::new("raw", Identity);

            let session = family.attach("feed", &view, |_| {}).unwrap();
            tokio::time::sleep(ms(1500)).await;
            assert_eq!(source.retry_count("feed"), 2);

            drop(session);
            tokio::time::sleep(ms(30_000)).await;

            assert_eq!(calls.count(), 2);
            assert_eq!(source.phase("feed"), Phase::Idle);
            assert_eq!(source.retry_count("feed"), 2);

            // Restarting continues the backoff where it stopped.
            let _session = family.attach("feed", &view, |_| {}).unwrap();
            tokio::time::sleep(ms(100)).await;
            assert_eq!(source.retry_count("feed"), 3);
            assert_eq!(source.last_delay("feed"), Some(ms(5000)));
        })
        .await;
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_in_flight_attempt_after_stop_is_ignored() {
    LocalSet::new()
        .run_until(async {
            let calls = Rc::new(Cell::new(0u32));
            let body_calls = Rc::clone(&calls);
            let source = Periodic::<u32, String>::new(RetryConfig::new(ms(1000)), move |_key| {
                body_calls.set(body_calls.get() + 1);
                async {
                    tokio::time::sleep(ms(100)).await;
                    Ok(7)
                }
            })
            .unwrap();
            let family = SubscriptionFamily::new(source.clone(), CacheConfig::new()).unwrap();

            let (seen, callback) = record();
            let session = family.attach("feed", &View::new("raw", Identity), callback).unwrap();
            tokio::time::sleep(ms(50)).await;
            assert_eq!(source.phase("feed"), Phase::Fetching);

            drop(session);
            tokio::time::sleep(ms(5000)).await;

            assert_eq!(calls.get(), 1);
            assert!(seen.borrow().is_empty());
            assert_eq!(source.phase("feed"), Phase::Idle);
        })
        .await;
}
