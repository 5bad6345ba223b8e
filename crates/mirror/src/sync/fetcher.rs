//! Paginated listing with rate-limit backoff

use log::{debug, error, warn};
use serde_json::Value;
use std::time::Duration;

use super::{Sleeper, Slept};
use crate::error::ListError;
use crate::models::Resource;

/// Exponential backoff for rate-limited requests
///
/// The delay before retry `n` (zero-based) is `initial_delay * decay_base^n`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub decay_base: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            decay_base: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Longest single wait between retries
    pub const MAX_DELAY: Duration = Duration::from_secs(60 * 60);

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.decay_base.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(Self::MAX_DELAY)
            .min(Self::MAX_DELAY)
    }
}

/// One listing request
#[derive(Debug, Clone, PartialEq)]
pub struct ListRequest {
    pub resource: Resource,
    pub limit: usize,
    pub cursor: Option<String>,
}

/// One page of raw records and the cursor to the next page
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub records: Vec<Value>,
    pub cursor: Option<String>,
}

/// Remote API that lists a resource newest-first, page by page
pub trait ListingSource: Send + Sync {
    fn list(&self, access_token: &str, request: &ListRequest) -> Result<ListPage, ListError>;
}

/// Why a fetch ended before the last page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStop {
    /// Still rate limited after every allowed retry
    RateLimited { attempts: u32 },
    /// A non-retryable request failure
    Remote(String),
    /// Shutdown requested while backing off
    Interrupted,
}

impl std::fmt::Display for FetchStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchStop::RateLimited { attempts } => {
                write!(f, "rate limited after {} retries", attempts)
            }
            FetchStop::Remote(msg) => write!(f, "remote error: {}", msg),
            FetchStop::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Lazily walks every page of a resource
///
/// Yields the raw records of each page in order. Iteration ends when a page
/// comes back without a cursor, or early on a [`FetchStop`], which is then
/// available from [`PageFetcher::stop_reason`]. Rate-limited requests are
/// retried per the [`BackoffPolicy`]; a successful page resets the count.
pub struct PageFetcher<'a> {
    source: &'a dyn ListingSource,
    sleeper: &'a dyn Sleeper,
    policy: BackoffPolicy,
    access_token: &'a str,
    resource: Resource,
    page_size: usize,
    cursor: Option<String>,
    done: bool,
    stop: Option<FetchStop>,
    retries: u32,
    backoff_total: Duration,
}

impl<'a> PageFetcher<'a> {
    pub fn new(
        source: &'a dyn ListingSource,
        sleeper: &'a dyn Sleeper,
        policy: BackoffPolicy,
        access_token: &'a str,
        resource: Resource,
        page_size: usize,
    ) -> Self {
        Self {
            source,
            sleeper,
            policy,
            access_token,
            resource,
            page_size,
            cursor: None,
            done: false,
            stop: None,
            retries: 0,
            backoff_total: Duration::ZERO,
        }
    }

    /// Set once iteration ended early
    pub fn stop_reason(&self) -> Option<&FetchStop> {
        self.stop.as_ref()
    }

    /// Retries performed across all pages
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Time spent backing off across all pages
    pub fn backoff_total(&self) -> Duration {
        self.backoff_total
    }

    fn stop(&mut self, reason: FetchStop) -> Option<Vec<Value>> {
        self.done = true;
        self.stop = Some(reason);
        None
    }
}

impl Iterator for PageFetcher<'_> {
    type Item = Vec<Value>;

    fn next(&mut self) -> Option<Vec<Value>> {
        if self.done {
            return None;
        }

        let request = ListRequest {
            resource: self.resource,
            limit: self.page_size,
            cursor: self.cursor.clone(),
        };
        let mut attempt = 0;

        loop {
            match self.source.list(self.access_token, &request) {
                Ok(page) => {
                    debug!(
                        "Fetched {} {} (cursor: {})",
                        page.records.len(),
                        self.resource,
                        page.cursor.is_some()
                    );
                    match page.cursor {
                        Some(next) if request.cursor.as_deref() == Some(next.as_str()) => {
                            error!("Listing {} returned the same cursor twice", self.resource);
                            self.done = true;
                            self.stop =
                                Some(FetchStop::Remote("cursor did not advance".to_string()));
                        }
                        Some(next) => self.cursor = Some(next),
                        None => self.done = true,
                    }
                    return Some(page.records);
                }
                Err(ListError::RateLimited) => {
                    if attempt >= self.policy.max_retries {
                        warn!(
                            "Rate limit on {} persisted after {} retries, stopping",
                            self.resource, attempt
                        );
                        return self.stop(FetchStop::RateLimited { attempts: attempt });
                    }
                    let delay = self.policy.delay_for(attempt);
                    attempt += 1;
                    self.retries += 1;
                    self.backoff_total = self.backoff_total.saturating_add(delay);
                    warn!(
                        "Rate limited listing {}, retry {}/{} in {:?}",
                        self.resource, attempt, self.policy.max_retries, delay
                    );
                    if self.sleeper.sleep(delay) == Slept::Interrupted {
                        warn!("Shutdown requested while backing off on {}", self.resource);
                        return self.stop(FetchStop::Interrupted);
                    }
                }
                Err(ListError::Remote(e)) => {
                    error!("Listing {} failed: {:#}", self.resource, e);
                    return self.stop(FetchStop::Remote(format!("{:#}", e)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
        interrupt: bool,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Slept {
            self.slept.lock().unwrap().push(duration);
            if self.interrupt {
                Slept::Interrupted
            } else {
                Slept::Elapsed
            }
        }
    }

    enum Reply {
        Page(usize, Option<&'static str>),
        Limited,
        Broken,
    }

    struct ScriptedSource {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<ListRequest>>,
    }

    impl ScriptedSource {
        fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl ListingSource for ScriptedSource {
        fn list(&self, _token: &str, request: &ListRequest) -> Result<ListPage, ListError> {
            self.requests.lock().unwrap().push(request.clone());
            match self.replies.lock().unwrap().pop_front() {
                Some(Reply::Page(n, cursor)) => Ok(ListPage {
                    records: (0..n).map(|i| json!({ "id": i })).collect(),
                    cursor: cursor.map(str::to_string),
                }),
                Some(Reply::Limited) => Err(ListError::RateLimited),
                Some(Reply::Broken) | None => Err(ListError::Remote(anyhow::anyhow!("HTTP 500"))),
            }
        }
    }

    fn policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_retries,
            initial_delay: Duration::from_secs(1),
            decay_base: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let p = policy(3);
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(u32::MAX), BackoffPolicy::MAX_DELAY);
    }

    #[test]
    fn test_delay_is_capped() {
        let p = BackoffPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            decay_base: 1e20,
        };
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), BackoffPolicy::MAX_DELAY);
        assert_eq!(p.delay_for(2), BackoffPolicy::MAX_DELAY);
    }

    #[test]
    fn test_walks_every_page_in_order() {
        let source = ScriptedSource::new(vec![
            Reply::Page(2, Some("c1")),
            Reply::Page(2, Some("c2")),
            Reply::Page(1, None),
        ]);
        let sleeper = RecordingSleeper::default();
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(3),
            "tok",
            Resource::Payments,
            2,
        );

        let sizes: Vec<usize> = fetcher.by_ref().map(|page| page.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(fetcher.stop_reason().is_none());

        let cursors: Vec<Option<String>> = source
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.cursor.clone())
            .collect();
        assert_eq!(
            cursors,
            vec![None, Some("c1".to_string()), Some("c2".to_string())]
        );
    }

    #[test]
    fn test_backoff_terminates() {
        let source = ScriptedSource::new(vec![
            Reply::Limited,
            Reply::Limited,
            Reply::Limited,
            Reply::Limited,
            Reply::Page(5, None),
        ]);
        let sleeper = RecordingSleeper::default();
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(3),
            "tok",
            Resource::Orders,
            10,
        );

        assert!(fetcher.next().is_none());
        assert_eq!(
            fetcher.stop_reason(),
            Some(&FetchStop::RateLimited { attempts: 3 })
        );
        assert_eq!(source.calls(), 4);

        let slept = sleeper.slept.lock().unwrap().clone();
        assert_eq!(
            slept,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert!(slept.iter().sum::<Duration>() >= Duration::from_secs(7));
        assert_eq!(fetcher.retries(), 3);

        // Stopped fetchers stay stopped
        assert!(fetcher.next().is_none());
        assert_eq!(source.calls(), 4);
    }

    #[test]
    fn test_success_resets_retry_count() {
        let source = ScriptedSource::new(vec![
            Reply::Limited,
            Reply::Limited,
            Reply::Page(1, Some("c1")),
            Reply::Limited,
            Reply::Limited,
            Reply::Page(1, None),
        ]);
        let sleeper = RecordingSleeper::default();
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(2),
            "tok",
            Resource::Customers,
            1,
        );

        assert_eq!(fetcher.by_ref().count(), 2);
        assert!(fetcher.stop_reason().is_none());
        assert_eq!(fetcher.retries(), 4);
        assert_eq!(fetcher.backoff_total(), Duration::from_secs(6));
    }

    #[test]
    fn test_remote_error_stops_without_retry() {
        let source = ScriptedSource::new(vec![Reply::Page(3, Some("c1")), Reply::Broken]);
        let sleeper = RecordingSleeper::default();
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(5),
            "tok",
            Resource::Payments,
            3,
        );

        assert_eq!(fetcher.next().map(|p| p.len()), Some(3));
        assert!(fetcher.next().is_none());
        assert!(matches!(fetcher.stop_reason(), Some(FetchStop::Remote(_))));
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_backoff_stops() {
        let source = ScriptedSource::new(vec![Reply::Limited, Reply::Page(1, None)]);
        let sleeper = RecordingSleeper {
            interrupt: true,
            ..Default::default()
        };
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(5),
            "tok",
            Resource::Payments,
            3,
        );

        assert!(fetcher.next().is_none());
        assert_eq!(fetcher.stop_reason(), Some(&FetchStop::Interrupted));
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_repeated_cursor_stops() {
        let source = ScriptedSource::new(vec![
            Reply::Page(1, Some("same")),
            Reply::Page(1, Some("same")),
            Reply::Page(1, None),
        ]);
        let sleeper = RecordingSleeper::default();
        let mut fetcher = PageFetcher::new(
            &source,
            &sleeper,
            policy(5),
            "tok",
            Resource::Orders,
            1,
        );

        assert_eq!(fetcher.by_ref().count(), 2);
        assert!(matches!(fetcher.stop_reason(), Some(FetchStop::Remote(_))));
    }
}
