use crate::alarm_event::{AlarmEvent, IndexSpace};
use crate::bitfield::{self, BitfieldStateTracker, Edge, Transition};
use crate::catalog::AlarmCatalog;
use crate::code_band::{self, AlarmStatus, BandError, CodeStatusTable, StatusChange};
use crate::subscription::{SubscriberList, SubscriptionHandle};
use crate::word_source::{ReadError, WordSource};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::Receiver;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub alarm_bits: usize,
    pub poll_interval: Duration,
    /// Maximum number of word reads in flight at once
    pub read_concurrency: usize,
    /// Substituted for `{equipment}` in descriptions
    pub equipment: Option<String>,
}

impl Default for MonitorSettings {
    fn default() -> MonitorSettings {
        MonitorSettings {
            alarm_bits: bitfield::DEFAULT_ALARM_BITS,
            poll_interval: Duration::from_secs(1),
            read_concurrency: 1,
            equipment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed,
    /// No word could be read or the source disconnected
    Aborted,
    /// Another cycle was still running
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub words_read: usize,
    pub words_failed: usize,
    pub events: usize,
}

impl CycleReport {
    fn new(outcome: CycleOutcome) -> CycleReport {
        CycleReport {
            outcome,
            words_read: 0,
            words_failed: 0,
            events: 0,
        }
    }
}

/// Polls the alarm table of a controller and publishes alarm events.
///
/// All alarm state belongs to the monitor instance. Poll cycles never
/// overlap and the events of one cycle are published in ascending index
/// order, even when several words are read concurrently.
pub struct AlarmMonitor {
    settings: MonitorSettings,
    source: Arc<dyn WordSource>,
    catalog: AlarmCatalog,
    code_catalog: AlarmCatalog,
    tracker: Mutex<BitfieldStateTracker>,
    codes: Mutex<CodeStatusTable>,
    session: AtomicU64,
    subscribers: SubscriberList,
    cycle_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AlarmMonitor {
    pub fn new(
        settings: MonitorSettings,
        source: Arc<dyn WordSource>,
        catalog: AlarmCatalog,
    ) -> AlarmMonitor {
        let session = source.session();
        AlarmMonitor {
            tracker: Mutex::new(BitfieldStateTracker::new(settings.alarm_bits)),
            settings,
            source,
            catalog,
            code_catalog: AlarmCatalog::default(),
            codes: Mutex::new(CodeStatusTable::new()),
            session: AtomicU64::new(session),
            subscribers: SubscriberList::new(),
            cycle_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Catalog used for banded alarm codes, separate from the bitfield catalog
    pub fn with_code_catalog(mut self, code_catalog: AlarmCatalog) -> AlarmMonitor {
        self.code_catalog = code_catalog;
        self
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn word_count(&self) -> usize {
        bitfield::word_count(self.settings.alarm_bits)
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: FnMut(&AlarmEvent) + Send + 'static,
    {
        self.subscribers.add_callback(handler)
    }

    pub fn subscribe_queue(&self, capacity: usize) -> (SubscriptionHandle, Receiver<AlarmEvent>) {
        self.subscribers.add_queue(capacity)
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.subscribers.remove(handle)
    }

    pub fn active_alarm_count(&self) -> usize {
        lock(&self.tracker).active_count()
    }

    pub fn active_alarm_indices(&self) -> BTreeSet<usize> {
        lock(&self.tracker).active_indices()
    }

    /// Last known value of a bitfield alarm
    pub fn alarm_state(&self, index: usize) -> Option<bool> {
        lock(&self.tracker).state(index)
    }

    /// Last reported status of a banded alarm code
    pub fn code_status(&self, index: usize) -> Option<AlarmStatus> {
        lock(&self.codes).status(index)
    }

    /// Forget all bitfield state, the next poll establishes a new baseline.
    pub fn reset(&self) {
        lock(&self.tracker).reset();
    }

    // Reset the tracker if the source has reconnected since last checked
    fn sync_session(&self) {
        let session = self.source.session();
        if self.session.swap(session, Ordering::AcqRel) != session {
            info!("Word source reconnected, establishing new alarm baseline");
            self.reset();
        }
    }

    fn transition_event(&self, transition: &Transition) -> AlarmEvent {
        let timestamp = Utc::now();
        match transition.edge {
            Edge::Triggered => {
                let description = self
                    .catalog
                    .describe(transition.index, self.settings.equipment.as_deref());
                AlarmEvent::Triggered {
                    index: transition.index,
                    space: IndexSpace::Bit,
                    description: description.text,
                    severity: description.severity,
                    timestamp,
                }
            }
            Edge::Cleared => AlarmEvent::Cleared {
                index: transition.index,
                space: IndexSpace::Bit,
                timestamp,
            },
        }
    }

    fn apply_word(&self, word_index: usize, word: u32) -> Vec<AlarmEvent> {
        let transitions = lock(&self.tracker).apply(word_index, word);
        transitions
            .iter()
            .map(|t| self.transition_event(t))
            .collect()
    }

    /// Run one poll cycle.
    ///
    /// A word that can't be read is skipped and keeps its previous state.
    /// Cancelling abandons the cycle between two words.
    pub async fn poll_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Poll cycle still running, skipping");
                return CycleReport::new(CycleOutcome::Skipped);
            }
        };
        self.sync_session();
        let word_count = self.word_count();
        let source = self.source.clone();
        // Reads may complete in any order but are yielded in word order
        let reads = stream::iter(0..word_count)
            .map(move |word_index| {
                let read = source.read(word_index);
                async move { (word_index, read.await) }
            })
            .buffered(self.settings.read_concurrency.max(1));
        tokio::pin!(reads);

        let mut report = CycleReport::new(CycleOutcome::Completed);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.outcome = CycleOutcome::Cancelled;
                    break;
                }
                next = reads.next() => next
            };
            let (word_index, res) = match next {
                Some(r) => r,
                None => break,
            };
            match res {
                Ok(word) => {
                    self.sync_session();
                    report.words_read += 1;
                    let events = self.apply_word(word_index, word);
                    report.events += events.len();
                    if !self.subscribers.publish(&events, cancel).await {
                        info!("Poll cycle cancelled while delivering events");
                        report.outcome = CycleOutcome::Cancelled;
                        break;
                    }
                }
                Err(ReadError::Disconnected) => {
                    warn!(
                        "Word source disconnected while reading word {}, cycle abandoned",
                        word_index
                    );
                    report.words_failed += 1;
                    report.outcome = CycleOutcome::Aborted;
                    break;
                }
                Err(e) => {
                    warn!("Failed to read alarm word {}: {}", word_index, e);
                    report.words_failed += 1;
                }
            }
        }
        if report.outcome == CycleOutcome::Completed && word_count > 0 && report.words_read == 0 {
            warn!("No alarm word could be read, cycle abandoned");
            report.outcome = CycleOutcome::Aborted;
        }
        report
    }

    /// Poll at the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.settings.poll_interval.max(Duration::from_millis(1));
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Monitoring {} alarms in {} words every {:?}",
            self.settings.alarm_bits,
            self.word_count(),
            period
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let report = self.poll_cycle(&cancel).await;
            match report.outcome {
                CycleOutcome::Completed => {
                    if report.events > 0 || report.words_failed > 0 {
                        debug!(
                            "Poll cycle done: {} words read, {} failed, {} events",
                            report.words_read, report.words_failed, report.events
                        );
                    }
                }
                CycleOutcome::Aborted => {
                    warn!(
                        "Poll cycle aborted after {} words, alarm state kept",
                        report.words_read
                    );
                }
                CycleOutcome::Skipped => {}
                CycleOutcome::Cancelled => break,
            }
        }
        info!("Alarm monitoring stopped");
    }

    /// Handle an alarm reported as a banded code.
    ///
    /// Returns the published event, or `None` if the code repeats the
    /// status already known for that alarm number.
    pub async fn ingest_code(&self, code: i64) -> Result<Option<AlarmEvent>, BandError> {
        let decoded = code_band::decode(code)?;
        let previous = match lock(&self.codes).update(decoded) {
            StatusChange::Changed { previous } => previous,
            StatusChange::Unchanged => return Ok(None),
        };
        debug!(
            "Alarm code {}: number {} {:?} -> {}",
            code,
            decoded.index,
            previous.map(|s| s.as_str()),
            decoded.status.as_str()
        );
        let timestamp = Utc::now();
        let event = match decoded.status {
            AlarmStatus::Active => {
                let description = self
                    .code_catalog
                    .describe(decoded.index, self.settings.equipment.as_deref());
                AlarmEvent::Triggered {
                    index: decoded.index,
                    space: IndexSpace::Code,
                    description: description.text,
                    severity: description.severity,
                    timestamp,
                }
            }
            AlarmStatus::AcknowledgedActive | AlarmStatus::AcknowledgedInactive => {
                AlarmEvent::Acknowledged {
                    index: decoded.index,
                    space: IndexSpace::Code,
                    active: decoded.status.is_active(),
                    timestamp,
                }
            }
            AlarmStatus::Cleared => AlarmEvent::Cleared {
                index: decoded.index,
                space: IndexSpace::Code,
                timestamp,
            },
        };
        self.subscribers
            .publish(std::slice::from_ref(&event), &CancellationToken::new())
            .await;
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogEntry, Severity};
    use crate::word_source::MemoryWordSource;
    use test_log::test;

    fn setup(settings: MonitorSettings) -> (Arc<MemoryWordSource>, AlarmMonitor) {
        let source = Arc::new(MemoryWordSource::new(bitfield::word_count(
            settings.alarm_bits,
        )));
        let catalog = AlarmCatalog::new(
            vec![CatalogEntry {
                index: 33,
                template: "Pump failure on {equipment}".to_string(),
                warning: false,
            }],
            vec![81],
        );
        let monitor = AlarmMonitor::new(settings, source.clone(), catalog);
        (source, monitor)
    }

    fn collect(monitor: &AlarmMonitor) -> Arc<Mutex<Vec<AlarmEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        monitor.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    fn kinds(events: &Mutex<Vec<AlarmEvent>>) -> Vec<(usize, AlarmStatus)> {
        events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.index(), e.status()))
            .collect()
    }

    #[test(tokio::test)]
    async fn baseline_then_edges() {
        let (source, monitor) = setup(MonitorSettings {
            equipment: Some("Kiln 2".to_string()),
            ..MonitorSettings::default()
        });
        let events = collect(&monitor);
        let cancel = CancellationToken::new();
        source.set_word(0, 0b10);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.words_read, 28);
        assert_eq!(report.events, 0);
        assert_eq!(monitor.active_alarm_indices(), BTreeSet::from([1]));

        source.set_word(0, 0b00);
        source.set_word(1, 0b10);
        source.set_word(2, 1 << 17);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.events, 3);
        assert_eq!(
            kinds(&events),
            vec![
                (1, AlarmStatus::Cleared),
                (33, AlarmStatus::Active),
                (81, AlarmStatus::Active)
            ]
        );
        {
            let events = events.lock().unwrap();
            assert_eq!(
                events[1],
                AlarmEvent::Triggered {
                    index: 33,
                    space: IndexSpace::Bit,
                    description: "Pump failure on Kiln 2".to_string(),
                    severity: Severity::Alarm,
                    timestamp: events[1].timestamp(),
                }
            );
            assert_eq!(events[2].severity(), Some(Severity::Warning));
        }
        assert_eq!(monitor.active_alarm_count(), 2);

        // Nothing changed
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.events, 0);
    }

    #[test(tokio::test)]
    async fn failed_word_keeps_state() {
        let (source, monitor) = setup(MonitorSettings::default());
        let events = collect(&monitor);
        let cancel = CancellationToken::new();
        source.set_word(5, 0xffff_0000);
        monitor.poll_cycle(&cancel).await;
        assert_eq!(monitor.active_alarm_count(), 16);

        source.fail_word(5, ReadError::Failed("bad quality".to_string()));
        source.set_word(6, 1);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.words_failed, 1);
        assert_eq!(report.words_read, 27);
        assert_eq!(kinds(&events), vec![(192, AlarmStatus::Active)]);
        for index in 160..192 {
            assert_eq!(monitor.alarm_state(index), Some(index >= 176));
        }

        // A value that doesn't parse is skipped the same way
        source.fail_word(5, ReadError::Parse("TRUE".to_string()));
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Completed);
        assert_eq!(report.words_failed, 1);
        assert_eq!(report.words_read, 27);
        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(monitor.active_alarm_count(), 17);

        // Recovers on the next cycle
        source.set_word(5, 0);
        monitor.poll_cycle(&cancel).await;
        assert_eq!(events.lock().unwrap().len(), 17);
        assert_eq!(monitor.active_alarm_indices(), BTreeSet::from([192]));
    }

    #[test(tokio::test)]
    async fn unreadable_source_aborts() {
        let (source, monitor) = setup(MonitorSettings::default());
        let events = collect(&monitor);
        let cancel = CancellationToken::new();
        source.set_word(0, 0b111);
        monitor.poll_cycle(&cancel).await;

        source.fail_all(ReadError::Timeout);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Aborted);
        assert_eq!(report.words_failed, 28);
        assert_eq!(monitor.active_alarm_count(), 3);

        source.fail_word(0, ReadError::Disconnected);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Aborted);
        assert_eq!(report.words_failed, 1);
        assert_eq!(monitor.active_alarm_count(), 3);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn reconnect_resets_baseline() {
        let (source, monitor) = setup(MonitorSettings::default());
        let events = collect(&monitor);
        let cancel = CancellationToken::new();
        source.set_word(0, 0b1);
        monitor.poll_cycle(&cancel).await;
        source.reconnect();
        source.set_word(0, 0b10);
        monitor.poll_cycle(&cancel).await;
        assert!(events.lock().unwrap().is_empty());
        assert_eq!(monitor.active_alarm_indices(), BTreeSet::from([1]));
    }

    #[test(tokio::test)]
    async fn concurrent_reads_publish_in_order() {
        let (source, monitor) = setup(MonitorSettings {
            read_concurrency: 8,
            ..MonitorSettings::default()
        });
        let events = collect(&monitor);
        let cancel = CancellationToken::new();
        monitor.poll_cycle(&cancel).await;
        for word_index in (0..28).rev() {
            source.set_word(word_index, 0x8000_0001);
        }
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.events, 56);
        let indices: Vec<usize> = events.lock().unwrap().iter().map(|e| e.index()).collect();
        let mut sorted = indices.clone();
        sorted.sort_unstable();
        assert_eq!(indices, sorted);
    }

    #[test(tokio::test)]
    async fn cancelled_cycle_changes_nothing() {
        let (source, monitor) = setup(MonitorSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        source.set_word(0, 1);
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        assert_eq!(report.words_read, 0);
        assert_eq!(monitor.alarm_state(0), None);
    }

    #[test(tokio::test)]
    async fn cancel_reaches_blocked_queue() {
        let (source, monitor) = setup(MonitorSettings::default());
        let monitor = Arc::new(monitor);
        let (_handle, _rx) = monitor.subscribe_queue(1);
        let cancel = CancellationToken::new();
        monitor.poll_cycle(&cancel).await;

        // Three events but room for one, and the queue is never read
        source.set_word(0, 0b111);
        let cycle = {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.poll_cycle(&cancel).await })
        };
        time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let report = time::timeout(Duration::from_secs(1), cycle)
            .await
            .expect("cycle still blocked after cancel")
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::Cancelled);
        // The word itself was applied completely
        assert_eq!(monitor.active_alarm_count(), 3);
        assert!(monitor.cycle_lock.try_lock().is_ok());
    }

    #[test(tokio::test)]
    async fn overlapping_cycle_is_skipped() {
        let (_source, monitor) = setup(MonitorSettings::default());
        let cancel = CancellationToken::new();
        let _running = monitor.cycle_lock.lock().await;
        let report = monitor.poll_cycle(&cancel).await;
        assert_eq!(report.outcome, CycleOutcome::Skipped);
    }

    #[test(tokio::test)]
    async fn queue_subscriber_and_unsubscribe() {
        let (source, monitor) = setup(MonitorSettings::default());
        let cancel = CancellationToken::new();
        let (handle, mut rx) = monitor.subscribe_queue(16);
        monitor.poll_cycle(&cancel).await;
        source.set_word(3, 1 << 4);
        monitor.poll_cycle(&cancel).await;
        let event = rx.recv().await;
        assert_eq!(event.map(|e| (e.index(), e.status())), Some((100, AlarmStatus::Active)));
        assert!(monitor.unsubscribe(handle));
        source.set_word(3, 0);
        monitor.poll_cycle(&cancel).await;
        assert!(rx.recv().await.is_none());
    }

    #[test(tokio::test)]
    async fn banded_codes() {
        let (_source, monitor) = setup(MonitorSettings::default());
        let monitor = monitor.with_code_catalog(AlarmCatalog::new(
            vec![CatalogEntry {
                index: 501,
                template: "Conveyor {index} stopped".to_string(),
                warning: false,
            }],
            vec![],
        ));
        let events = collect(&monitor);
        let event = monitor.ingest_code(501).await.unwrap();
        assert!(matches!(
            event,
            Some(AlarmEvent::Triggered { index: 501, space: IndexSpace::Code, ref description, .. })
                if description == "Conveyor 501 stopped"
        ));
        assert_eq!(monitor.ingest_code(501).await, Ok(None));
        monitor.ingest_code(2501).await.unwrap();
        monitor.ingest_code(3501).await.unwrap();
        assert_eq!(
            monitor.ingest_code(4000).await,
            Err(BandError::InvalidBand { code: 4000, band: 4 })
        );
        assert_eq!(
            kinds(&events),
            vec![
                (501, AlarmStatus::Active),
                (501, AlarmStatus::AcknowledgedInactive),
                (501, AlarmStatus::Cleared)
            ]
        );
        assert_eq!(monitor.code_status(501), Some(AlarmStatus::Cleared));
        // Code numbers don't touch the bitfield
        assert_eq!(monitor.alarm_state(501), None);
        assert_eq!(monitor.active_alarm_count(), 0);
    }

    #[test(tokio::test)]
    async fn run_until_cancelled() {
        let (source, monitor) = setup(MonitorSettings {
            poll_interval: Duration::from_millis(10),
            ..MonitorSettings::default()
        });
        let monitor = Arc::new(monitor);
        let (_handle, mut rx) = monitor.subscribe_queue(4);
        let cancel = CancellationToken::new();
        let running = tokio::spawn({
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            async move { monitor.run(cancel).await }
        });
        time::sleep(Duration::from_millis(50)).await;
        source.set_word(0, 1);
        let event = time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(event, Ok(Some(AlarmEvent::Triggered { index: 0, .. }))));
        cancel.cancel();
        assert!(running.await.is_ok());
    }
}
