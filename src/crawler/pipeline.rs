use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use super::config::CrawlerConfig;
use super::error::CrawlError;
use super::events::{CrawlOutcome, CrawlStatus, NewCrawlEvent};
use super::reconcile::ReconcileReport;
use super::tags::UnmappedTags;
use super::{Enricher, TargetRef};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CrawlerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.backoff_base,
        }
    }

    /// Sleep after the given (1-based) failed attempt: base, 2*base, 4*base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&CrawlerConfig::default())
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts
/// run out. Returns the result together with the attempt count.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> (Result<T, CrawlError>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, CrawlError>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return (Ok(v), attempt),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(item = label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "attempt failed; backing off");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
            Err(e) => return (Err(e), attempt),
        }
    }
}

/// Per-batch tally of target outcomes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub discovered: usize,
    pub succeeded: usize,
    pub partial: usize,
    pub failed: usize,
    pub unmapped: UnmappedTags,
}

impl RunSummary {
    pub fn tally(&mut self, result: &Result<ReconcileReport, CrawlError>) {
        match result {
            Ok(report) => {
                match report.status() {
                    CrawlStatus::Partial => self.partial += 1,
                    _ => self.succeeded += 1,
                }
                self.unmapped.merge(&report.unmapped);
            }
            Err(_) => self.failed += 1,
        }
    }
}

/// Drives one target through an [`Enricher`] and writes exactly one crawl
/// event for it, whatever the outcome.
pub struct Pipeline {
    store: SharedStore,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(store: SharedStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    #[instrument(skip_all, fields(source = %enricher.source()))]
    pub async fn run_target<E: Enricher>(&self, enricher: &E, target: &E::Target) -> Result<ReconcileReport, CrawlError> {
        let target_ref = enricher.target_ref(target);
        let started_at = Utc::now();
        let label = target_ref.label.as_str();
        let (result, attempts) = with_retries(self.retry, label, |attempt| async move {
            info!(item = label, attempt, "processing");
            let document = enricher.fetch(target).await?;
            let record = enricher.extract(target, document)?;
            enricher.reconcile(target, record).await
        })
        .await;

        match result {
            Ok(report) => {
                let status = report.status();
                let message = report.error_message();
                let event = NewCrawlEvent::new(enricher.source(), &target_ref.label, status, started_at)
                    .for_entry(Some(report.entry_id))
                    .with_message(message.clone())
                    .with_details(report.details(attempts));
                self.finish(report.entry_id, &event).await?;
                if report.is_noop() && status == CrawlStatus::Success {
                    info!(item = label, entry_id = report.entry_id, "no-op update");
                } else {
                    info!(
                        item = label,
                        entry_id = report.entry_id,
                        %status,
                        created = report.created,
                        updated = %report.updated_fields.join(","),
                        conflicts = %report.conflicts.join(","),
                        uploaded_assets = report.uploaded_assets,
                        categories = report.linked_categories,
                        mechanics = report.linked_mechanics,
                        "reconciled"
                    );
                }
                Ok(report)
            }
            Err(err) => {
                error!(item = label, attempts, error = %err, "target failed");
                let entry_id = self.resolve_entry(&target_ref).await;
                let event = NewCrawlEvent::new(enricher.source(), &target_ref.label, CrawlStatus::Error, started_at)
                    .for_entry(entry_id)
                    .with_http_status(err.http_status())
                    .with_message(Some(err.to_string()))
                    .with_details(serde_json::json!({ "attempts": attempts }));
                if let Err(record_err) = self.record(entry_id, &event).await {
                    error!(item = label, error = %record_err, "failed to record error event");
                }
                Err(err)
            }
        }
    }

    async fn resolve_entry(&self, target: &TargetRef) -> Option<i64> {
        if target.entry_id.is_some() {
            return target.entry_id;
        }
        let slug = target.slug.as_deref()?;
        match self.store.entry_by_slug(slug).await {
            Ok(found) => found.map(|e| e.id),
            Err(e) => {
                warn!(slug, error = %e, "entry lookup for error event failed");
                None
            }
        }
    }

    async fn finish(&self, entry_id: i64, event: &NewCrawlEvent) -> Result<(), CrawlError> {
        self.record(Some(entry_id), event).await.map_err(CrawlError::Store)
    }

    /// Event row plus crawl bookkeeping on the entry, when there is one.
    async fn record(&self, entry_id: Option<i64>, event: &NewCrawlEvent) -> anyhow::Result<()> {
        self.store.insert_crawl_event(event).await?;
        if let Some(id) = entry_id {
            self.store
                .record_crawl_outcome(
                    id,
                    &CrawlOutcome {
                        status: event.status,
                        finished_at: event.finished_at,
                        error_message: event.error_message.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::events::CrawlSource;
    use crate::store::{CatalogEntry, MemoryCatalogStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        entry_id: i64,
    }

    #[async_trait]
    impl Enricher for Flaky {
        type Target = String;
        type Document = String;
        type Record = String;

        fn source(&self) -> CrawlSource {
            CrawlSource::StartPlaying
        }

        fn target_ref(&self, target: &String) -> TargetRef {
            TargetRef {
                label: target.clone(),
                entry_id: None,
                slug: Some(target.clone()),
            }
        }

        async fn fetch(&self, target: &String) -> Result<String, CrawlError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(CrawlError::HttpStatus {
                    url: target.clone(),
                    status: 503,
                });
            }
            Ok(target.clone())
        }

        fn extract(&self, _target: &String, document: String) -> Result<String, CrawlError> {
            Ok(document)
        }

        async fn reconcile(&self, _target: &String, _record: String) -> Result<ReconcileReport, CrawlError> {
            Ok(ReconcileReport::for_entry(self.entry_id))
        }
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(4000));
    }

    #[tokio::test]
    async fn retries_then_succeeds_with_single_event() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = store.seed_entry(CatalogEntry {
            slug: "pbta".into(),
            name: "Powered by the Apocalypse".into(),
            ..Default::default()
        });
        let pipeline = Pipeline::new(store.clone(), no_backoff());
        let flaky = Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
            entry_id: id,
        };
        let report = pipeline.run_target(&flaky, &"pbta".to_string()).await.unwrap();
        assert_eq!(report.entry_id, id);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, CrawlStatus::Success);
        assert_eq!(events[0].details.as_ref().unwrap()["attempts"], 3);
        let entry = &store.entries()[0];
        assert_eq!(entry.crawl_status.as_deref(), Some("success"));
        assert!(entry.last_success_at.is_some());
    }

    #[tokio::test]
    async fn exhausted_retries_record_one_error_event() {
        let store = Arc::new(MemoryCatalogStore::new());
        let id = store.seed_entry(CatalogEntry {
            slug: "pbta".into(),
            name: "Powered by the Apocalypse".into(),
            ..Default::default()
        });
        let pipeline = Pipeline::new(store.clone(), no_backoff());
        let flaky = Flaky {
            failures: 10,
            calls: AtomicU32::new(0),
            entry_id: id,
        };
        let err = pipeline.run_target(&flaky, &"pbta".to_string()).await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, CrawlStatus::Error);
        assert_eq!(events[0].catalog_entry_id, Some(id));
        assert_eq!(events[0].http_status, Some(503));
        assert!(events[0].error_message.is_some());
        let entry = &store.entries()[0];
        assert_eq!(entry.crawl_status.as_deref(), Some("error"));
        assert!(entry.last_success_at.is_none());
    }

    #[tokio::test]
    async fn non_retryable_errors_stop_immediately() {
        let (res, attempts) = with_retries(no_backoff(), "x", |_| async {
            Err::<(), _>(CrawlError::EntryNotFound(7))
        })
        .await;
        assert!(res.is_err());
        assert_eq!(attempts, 1);
    }
}
