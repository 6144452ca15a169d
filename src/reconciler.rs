// Reconciler - periodic merge of the in-memory registry with the persisted client set
//
// Each cycle: fetch persisted clients, probe registry clients then persisted ones
// (each identifier at most once), write the reachable set back, sleep a jittered interval.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::client::ClientRecord;
use crate::net::messages::StatusMessage;
use crate::net::prober::StatusProber;
use crate::registry::Registry;
use crate::store::ClientStore;

/// Inclusive bounds, in whole seconds, for the sleep between cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollInterval {
    lower: u64,
    upper: u64,
}

impl PollInterval {
    /// Returns None if `lower > upper`.
    pub fn new(lower: u64, upper: u64) -> Option<Self> {
        (lower <= upper).then_some(PollInterval { lower, upper })
    }

    pub fn lower(&self) -> u64 {
        self.lower
    }

    pub fn upper(&self) -> u64 {
        self.upper
    }

    /// Uniformly random duration in `[lower, upper]` seconds
    pub fn sample(&self) -> Duration {
        Duration::from_secs(rand::thread_rng().gen_range(self.lower..=self.upper))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    /// Sleeping between cycles
    Idle,
    /// A cycle is running
    Polling,
}

/// Where a probe target came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Registry,
    Store,
}

/// One client to probe this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub identifier: u32,
    pub host: String,
    pub port: u16,
    pub origin: Origin,
    /// Counter persisted last cycle; None for registry-derived targets
    pub previous_count: Option<u32>,
}

impl ProbeTarget {
    /// Status request seeded with the last known counter (0 when unknown)
    pub fn request(&self) -> StatusMessage {
        StatusMessage::request(self.identifier, self.previous_count.unwrap_or(0))
    }
}

/// Ordered probe list for one cycle: every registry client, then every persisted
/// client whose identifier was not already taken from the registry.
pub fn plan_cycle(registry: &[ClientRecord], persisted: &[ClientRecord]) -> Vec<ProbeTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::with_capacity(registry.len() + persisted.len());

    for rec in registry {
        if seen.insert(rec.identifier) {
            targets.push(ProbeTarget {
                identifier: rec.identifier,
                host: rec.host.clone(),
                port: rec.port,
                origin: Origin::Registry,
                previous_count: None,
            });
        }
    }
    for rec in persisted {
        if seen.insert(rec.identifier) {
            targets.push(ProbeTarget {
                identifier: rec.identifier,
                host: rec.host.trim().to_string(),
                port: rec.port,
                origin: Origin::Store,
                previous_count: Some(rec.status_count),
            });
        } else {
            debug!(identifier = rec.identifier, "already probed via registry this cycle");
        }
    }
    targets
}

/// Summary of one reconciliation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub registry_clients: usize,
    pub persisted_clients: usize,
    /// Identifiers probed, in probe order
    pub probed: Vec<u32>,
    /// Snapshot handed to the store (or that would have been, if the write was skipped)
    pub snapshot: HashMap<u32, ClientRecord>,
    /// Store-derived identifiers whose probed counter differed from the persisted one
    pub count_mismatches: Vec<u32>,
    /// False when the persisted list could not be read this cycle
    pub store_available: bool,
    pub written: bool,
}

/// Drives the polling loop. Owns nothing global: registry, store and prober are injected.
pub struct Reconciler {
    registry: Arc<Registry>,
    store: Arc<dyn ClientStore>,
    prober: Arc<dyn StatusProber>,
    interval: PollInterval,
    state: RwLock<ReconcilerState>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn ClientStore>,
        prober: Arc<dyn StatusProber>,
        interval: PollInterval,
    ) -> Self {
        Reconciler {
            registry,
            store,
            prober,
            interval,
            state: RwLock::new(ReconcilerState::Idle),
        }
    }

    pub async fn state(&self) -> ReconcilerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: ReconcilerState) {
        *self.state.write().await = state;
    }

    /// Run one fetch -> probe-all -> write pass.
    pub async fn run_cycle(&self) -> CycleReport {
        self.set_state(ReconcilerState::Polling).await;

        // A failed read must not turn into an empty write that erases every tracked client.
        let (persisted, store_available) = match self.store.fetch_connected().await {
            Ok(rows) => (rows, true),
            Err(e) => {
                error!("Fetching persisted clients failed, continuing with registry only: {}", e);
                (Vec::new(), false)
            }
        };
        let registry_clients = self.registry.snapshot().await;
        debug!(
            registry = registry_clients.len(),
            persisted = persisted.len(),
            "reconciliation cycle started"
        );

        let targets = plan_cycle(&registry_clients, &persisted);
        let mut report = CycleReport {
            registry_clients: registry_clients.len(),
            persisted_clients: persisted.len(),
            store_available,
            ..CycleReport::default()
        };

        for target in &targets {
            let outcome = self.prober.probe(&target.host, target.port, target.request()).await;
            report.probed.push(target.identifier);
            info!(
                "Client status for {}:{} (id {}, {:?}) is {}",
                target.host, target.port, target.identifier, target.origin, outcome.reachable
            );
            if !outcome.reachable {
                continue;
            }
            if let Some(previous) = target.previous_count {
                if previous != outcome.status_count {
                    warn!(
                        "Status count for client id {} is different from database ({}) and actual from client ({})",
                        target.identifier, previous, outcome.status_count
                    );
                    report.count_mismatches.push(target.identifier);
                }
            }
            report.snapshot.insert(
                target.identifier,
                ClientRecord::probed(target.identifier, target.host.clone(), target.port, outcome.status_count),
            );
        }

        if store_available {
            match self.store.replace_connected(report.snapshot.clone()).await {
                Ok(()) => report.written = true,
                Err(e) => error!("Writing client snapshot failed, write skipped this cycle: {}", e),
            }
        } else {
            warn!(
                "Skipping snapshot write ({} reachable): persisted client list was unavailable",
                report.snapshot.len()
            );
        }

        self.log_status(&report);
        self.set_state(ReconcilerState::Idle).await;
        report
    }

    fn log_status(&self, report: &CycleReport) {
        info!(
            "Status: ({} registry {} persisted) ({} probed {} reachable) (written: {})",
            report.registry_clients,
            report.persisted_clients,
            report.probed.len(),
            report.snapshot.len(),
            report.written
        );
    }

    /// Loop forever until `shutdown` flips to true. The sleep between cycles is interruptible;
    /// a running cycle always completes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Reconciler started (interval {}-{}s)",
            self.interval.lower(),
            self.interval.upper()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.run_cycle().await;

            let pause = self.interval.sample();
            debug!("next reconciliation in {:?}", pause);
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::prober::ProbeOutcome;
    use crate::store::{SqliteStore, StoreError};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Prober that records every request and answers from a fixed table.
    #[derive(Default)]
    struct RecordingProber {
        answers: HashMap<u32, u32>,
        calls: Mutex<Vec<StatusMessage>>,
        /// Upserted into the registry during the first probe, to simulate a mid-cycle heartbeat
        late_arrival: Mutex<Option<(Arc<Registry>, ClientRecord)>>,
    }

    impl RecordingProber {
        fn answering(answers: &[(u32, u32)]) -> Self {
            RecordingProber {
                answers: answers.iter().copied().collect(),
                ..Default::default()
            }
        }

        fn probed_ids(&self) -> Vec<u32> {
            self.calls.lock().unwrap().iter().map(|m| m.identifier).collect()
        }
    }

    #[async_trait]
    impl StatusProber for RecordingProber {
        async fn probe(&self, _host: &str, _port: u16, request: StatusMessage) -> ProbeOutcome {
            let late = self.late_arrival.lock().unwrap().take();
            if let Some((registry, rec)) = late {
                registry.upsert(rec).await;
            }
            let id = request.identifier;
            self.calls.lock().unwrap().push(request);
            match self.answers.get(&id) {
                Some(&count) => ProbeOutcome::reachable(count),
                None => ProbeOutcome::UNREACHABLE,
            }
        }
    }

    /// Store whose reads always fail; counts writes.
    #[derive(Default)]
    struct BrokenStore {
        writes: Mutex<usize>,
    }

    #[async_trait]
    impl ClientStore for BrokenStore {
        async fn fetch_connected(&self) -> Result<Vec<ClientRecord>, StoreError> {
            Err(StoreError::Poisoned)
        }

        async fn replace_connected(&self, _snapshot: HashMap<u32, ClientRecord>) -> Result<(), StoreError> {
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }
    }

    async fn seeded_store(records: &[ClientRecord]) -> Arc<SqliteStore> {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .replace_connected(records.iter().map(|r| (r.identifier, r.clone())).collect())
            .await
            .unwrap();
        Arc::new(store)
    }

    fn interval() -> PollInterval {
        PollInterval::new(1, 1).unwrap()
    }

    #[test]
    fn test_plan_cycle_orders_and_dedups() {
        let registry = vec![ClientRecord::new(3, "r3", 3), ClientRecord::new(5, "r5", 5)];
        let persisted = vec![
            ClientRecord::probed(1, "s1 ", 1, 10),
            ClientRecord::probed(3, "s3", 30, 7),
        ];
        let plan = plan_cycle(&registry, &persisted);
        let ids: Vec<(u32, Origin)> = plan.iter().map(|t| (t.identifier, t.origin)).collect();
        assert_eq!(ids, vec![(3, Origin::Registry), (5, Origin::Registry), (1, Origin::Store)]);
        assert_eq!(plan[0].host, "r3");
        assert_eq!(plan[0].request().message_count, 0);
        assert_eq!(plan[2].host, "s1");
        assert_eq!(plan[2].request().message_count, 10);
    }

    #[tokio::test]
    async fn test_identifier_in_registry_and_store_probed_once() {
        let registry = Arc::new(Registry::new());
        registry.upsert(ClientRecord::new(3, "10.0.0.3", 3000)).await;
        let store = seeded_store(&[ClientRecord::probed(3, "10.0.0.3", 3000, 2)]).await;
        let prober = Arc::new(RecordingProber::answering(&[(3, 4)]));

        let reconciler = Reconciler::new(registry, store.clone(), prober.clone(), interval());
        let report = reconciler.run_cycle().await;

        assert_eq!(prober.probed_ids(), vec![3]);
        assert_eq!(prober.calls.lock().unwrap()[0].message_count, 0);
        assert!(report.count_mismatches.is_empty());
        assert_eq!(report.snapshot[&3].status_count, 4);
    }

    #[tokio::test]
    async fn test_store_count_mismatch_probed_value_wins() {
        let registry = Arc::new(Registry::new());
        let store = seeded_store(&[ClientRecord::probed(7, "10.0.0.7", 7000, 5)]).await;
        let prober = Arc::new(RecordingProber::answering(&[(7, 9)]));

        let reconciler = Reconciler::new(registry, store.clone(), prober.clone(), interval());
        let report = reconciler.run_cycle().await;

        assert_eq!(prober.calls.lock().unwrap()[0], StatusMessage::request(7, 5));
        assert_eq!(report.count_mismatches, vec![7]);
        assert!(report.written);
        let rows = store.fetch_connected().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].identifier, 7);
        assert_eq!(rows[0].status_count, 9);
    }

    #[tokio::test]
    async fn test_unreachable_client_dropped_from_snapshot() {
        let registry = Arc::new(Registry::new());
        registry.upsert(ClientRecord::new(1, "up", 1)).await;
        registry.upsert(ClientRecord::new(2, "down", 2)).await;
        let store = seeded_store(&[ClientRecord::probed(8, "gone", 8, 1)]).await;
        let prober = Arc::new(RecordingProber::answering(&[(1, 0)]));

        let reconciler = Reconciler::new(registry, store.clone(), prober.clone(), interval());
        let report = reconciler.run_cycle().await;

        assert_eq!(prober.probed_ids(), vec![1, 2, 8]);
        assert_eq!(report.snapshot.len(), 1);
        assert!(report.snapshot.contains_key(&1));
        let ids: Vec<u32> = store.fetch_connected().await.unwrap().iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_late_heartbeat_probed_next_cycle() {
        let registry = Arc::new(Registry::new());
        registry.upsert(ClientRecord::new(1, "a", 1)).await;
        let store = seeded_store(&[]).await;
        let prober = Arc::new(RecordingProber::answering(&[(1, 0), (2, 0)]));
        *prober.late_arrival.lock().unwrap() = Some((registry.clone(), ClientRecord::new(2, "b", 2)));

        let reconciler = Reconciler::new(registry.clone(), store, prober.clone(), interval());
        reconciler.run_cycle().await;
        assert_eq!(prober.probed_ids(), vec![1]);
        assert!(registry.get(2).await.is_some());

        reconciler.run_cycle().await;
        assert_eq!(prober.probed_ids(), vec![1, 1, 2]);
    }

    #[tokio::test]
    async fn test_failed_fetch_skips_write() {
        let registry = Arc::new(Registry::new());
        registry.upsert(ClientRecord::new(1, "a", 1)).await;
        let store = Arc::new(BrokenStore::default());
        let prober = Arc::new(RecordingProber::answering(&[(1, 3)]));

        let reconciler = Reconciler::new(registry, store.clone(), prober.clone(), interval());
        let report = reconciler.run_cycle().await;

        assert!(!report.store_available);
        assert!(!report.written);
        assert_eq!(prober.probed_ids(), vec![1]);
        assert_eq!(*store.writes.lock().unwrap(), 0);
        assert_eq!(reconciler.state().await, ReconcilerState::Idle);
    }

    #[tokio::test]
    async fn test_unreadable_row_does_not_block_writes() {
        let store = seeded_store(&[ClientRecord::probed(9, "b", 9, 1)]).await;
        // Port out of u16 range, as another writer might leave behind
        store
            .execute_batch(
                "INSERT INTO client_record (client_identifier, is_connected, client_host, client_port, status_count)
                 VALUES (5, 1, 'h', 70000, 0)",
            )
            .await
            .unwrap();

        let registry = Arc::new(Registry::new());
        registry.upsert(ClientRecord::new(1, "a", 1)).await;
        let prober = Arc::new(RecordingProber::answering(&[(1, 0), (9, 2)]));
        let reconciler = Reconciler::new(registry, store.clone(), prober.clone(), interval());

        for _ in 0..2 {
            let report = reconciler.run_cycle().await;
            assert!(report.store_available);
            assert!(report.written);
        }
        assert_eq!(prober.probed_ids(), vec![1, 9, 1, 9]);
        let ids: Vec<u32> = store.fetch_connected().await.unwrap().iter().map(|r| r.identifier).collect();
        assert_eq!(ids, vec![1, 9]);
    }

    #[test]
    fn test_poll_interval_bounds() {
        assert!(PollInterval::new(35, 30).is_none());
        let iv = PollInterval::new(30, 35).unwrap();
        for _ in 0..100 {
            let d = iv.sample().as_secs();
            assert!((30..=35).contains(&d));
        }
        assert_eq!(PollInterval::new(4, 4).unwrap().sample(), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let registry = Arc::new(Registry::new());
        let store = seeded_store(&[]).await;
        let prober = Arc::new(RecordingProber::default());
        let reconciler = Arc::new(Reconciler::new(
            registry,
            store,
            prober,
            PollInterval::new(3600, 3600).unwrap(),
        ));

        let (tx, rx) = watch::channel(false);
        let task = {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.run(rx).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(reconciler.state().await, ReconcilerState::Idle);
    }
}
