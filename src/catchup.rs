//! Historical replay for new subscriptions.
//!
//! Subscribe registers first, then hands a job to this worker pool. A worker
//! queries the store for commands strictly after the requested timestamp and
//! pushes each one through the subscription's delivery gate, which skips ids
//! the live path already delivered. The gate is then switched to live.
//!
//! Replay is not a publisher: it waits for room on the connection queue, up
//! to a stall timeout per event. A replay that stalls stops and is reported
//! as `CatchUpFailed` instead of `CaughtUp`.
//!
//! The query runs under the device locks of the subscription's scope, so a
//! concurrent insert is either dispatched live before the query or only
//! dispatched live after it, never both replayed and dispatched.

use crate::error::{DeliveryError, HubError, Result};
use crate::ordering::DeviceLocks;
use crate::store::CommandStore;
use crate::subscriptions::{Delivery, SubscriptionEntry};
use crate::types::Timestamp;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of catch-up worker threads.
pub const DEFAULT_WORKERS: usize = 2;

/// Default time a replay waits for space on a full connection queue.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// One pending replay.
pub(crate) struct CatchUpJob {
    pub entry: Arc<SubscriptionEntry>,
    pub since: Timestamp,
}

/// Counts from one replay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CatchUpSummary {
    pub replayed: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// Worker pool running catch-up queries off the subscribing thread.
pub struct CatchUpResolver {
    sender: Option<Sender<CatchUpJob>>,
    workers: Vec<JoinHandle<()>>,
    send_timeout: Duration,
}

impl CatchUpResolver {
    /// Start `workers` threads querying `store`. Each replayed event waits at
    /// most `send_timeout` for queue space.
    pub fn start(
        store: Arc<dyn CommandStore>,
        locks: Arc<DeviceLocks>,
        workers: usize,
        send_timeout: Duration,
    ) -> Result<Self> {
        let (sender, receiver) = unbounded::<CatchUpJob>();

        let mut handles = Vec::with_capacity(workers.max(1));
        for n in 0..workers.max(1) {
            let store = Arc::clone(&store);
            let locks = Arc::clone(&locks);
            let receiver: Receiver<CatchUpJob> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("catch-up-{}", n))
                .spawn(move || {
                    for job in receiver.iter() {
                        resolve(store.as_ref(), &locks, &job, send_timeout);
                    }
                })
                .map_err(|e| HubError::Internal(format!("failed to spawn catch-up worker: {}", e)))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            workers: handles,
            send_timeout,
        })
    }

    /// Queue a replay. The subscription must already be registered.
    pub(crate) fn schedule(&self, entry: Arc<SubscriptionEntry>, since: Timestamp) {
        let job = CatchUpJob { entry, since };
        let rejected = match self.sender {
            Some(ref sender) => sender.send(job).err().map(|e| e.into_inner()),
            None => Some(job),
        };

        if let Some(job) = rejected {
            warn!(subscription_id = %job.entry.id, "catch-up pool is shut down");
            job.entry
                .finish_catch_up(Some("catch-up unavailable".to_string()), self.send_timeout);
        }
    }
}

impl Drop for CatchUpResolver {
    fn drop(&mut self) {
        // Closing the channel lets workers finish queued jobs and exit.
        self.sender.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Run one replay to completion.
pub(crate) fn resolve(
    store: &dyn CommandStore,
    locks: &DeviceLocks,
    job: &CatchUpJob,
    send_timeout: Duration,
) -> CatchUpSummary {
    let entry = &job.entry;
    let mut summary = CatchUpSummary::default();

    if entry.is_closed() {
        debug!(subscription_id = %entry.id, "catch-up abandoned, subscription removed");
        return summary;
    }

    let queried = {
        let _ordering = locks.lock_scope(entry.filter.scope());
        store.query_range(entry.filter.scope(), entry.filter.names(), job.since)
    };
    let commands = match queried {
        Ok(commands) => commands,
        Err(e) => {
            warn!(subscription_id = %entry.id, error = %e, "catch-up query failed");
            entry.finish_catch_up(Some(e.to_string()), send_timeout);
            return summary;
        }
    };

    for (position, command) in commands.iter().enumerate() {
        // An update may have renamed the command since the store matched it.
        if !entry.filter.matches(command) {
            continue;
        }
        match entry.deliver_replayed(command, send_timeout) {
            Delivery::Sent => summary.replayed += 1,
            Delivery::Skipped if entry.is_closed() => {
                debug!(subscription_id = %entry.id, "catch-up stopped, subscription removed");
                return summary;
            }
            Delivery::Skipped => summary.skipped += 1,
            Delivery::Failed(DeliveryError::ConnectionClosed) => {
                debug!(subscription_id = %entry.id, "catch-up stopped, connection closed");
                return summary;
            }
            Delivery::Failed(error) => {
                summary.dropped = commands.len() - position;
                warn!(
                    subscription_id = %entry.id,
                    replayed = summary.replayed,
                    dropped = summary.dropped,
                    error = %error,
                    "catch-up stalled"
                );
                let reason = format!(
                    "replay stalled: {} of {} commands not delivered",
                    summary.dropped,
                    commands.len()
                );
                entry.finish_catch_up(Some(reason), send_timeout);
                return summary;
            }
        }
    }

    entry.finish_catch_up(None, send_timeout);
    debug!(
        subscription_id = %entry.id,
        replayed = summary.replayed,
        skipped = summary.skipped,
        "catch-up complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{MemoryCommandStore, StoreResult};
    use crate::subscriptions::{DeviceScope, Filter, HubEvent, SubscriptionRegistry};
    use crate::types::{Command, CommandId, CommandInput, CommandPatch, DeviceId, UserId};
    use std::collections::BTreeSet;
    use std::time::Duration;

    struct FailingStore;

    impl CommandStore for FailingStore {
        fn insert(&self, _: &DeviceId, _: CommandInput, _: Option<UserId>) -> StoreResult<Command> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn update_by_id(
            &self,
            _: CommandId,
            _: &DeviceId,
            _: &CommandPatch,
        ) -> StoreResult<Option<Command>> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn find_by_id(&self, _: CommandId, _: &DeviceId) -> StoreResult<Option<Command>> {
            Err(StoreError::Unavailable("down".into()))
        }

        fn query_range(
            &self,
            _: &DeviceScope,
            _: Option<&BTreeSet<String>>,
            _: Timestamp,
        ) -> StoreResult<Vec<Command>> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[test]
    fn test_resolve_replays_and_goes_live() {
        let store = MemoryCommandStore::new();
        let since = Timestamp::now().minus(Duration::from_secs(10));
        store.insert(&DeviceId::new("a"), CommandInput::new("x"), None).unwrap();
        store.insert(&DeviceId::new("b"), CommandInput::new("x"), None).unwrap();

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(8);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();

        let summary = resolve(&store, &DeviceLocks::new(4), &CatchUpJob { entry, since }, DEFAULT_SEND_TIMEOUT);
        assert_eq!(summary.replayed, 1);

        let events = conn.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].command().unwrap().device_id, DeviceId::new("a"));
        assert!(matches!(events[1], HubEvent::CaughtUp { .. }));
    }

    #[test]
    fn test_resolve_failure_keeps_subscription() {
        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(8);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();
        let id = entry.id;

        resolve(
            &FailingStore,
            &DeviceLocks::new(4),
            &CatchUpJob { entry, since: Timestamp(0) },
            DEFAULT_SEND_TIMEOUT,
        );

        let events = conn.drain();
        assert!(matches!(events[0], HubEvent::CatchUpFailed { .. }));
        assert!(registry.get(id).is_some());
    }

    #[test]
    fn test_resolve_skips_removed_subscription() {
        let store = MemoryCommandStore::new();
        store.insert(&DeviceId::new("a"), CommandInput::new("x"), None).unwrap();

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(8);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();
        registry.remove_by_id(entry.id);

        let summary = resolve(
            &store,
            &DeviceLocks::new(4),
            &CatchUpJob { entry, since: Timestamp(0) },
            DEFAULT_SEND_TIMEOUT,
        );
        assert_eq!(summary, CatchUpSummary::default());
        assert!(conn.drain().is_empty());
    }

    #[test]
    fn test_pool_runs_scheduled_jobs() {
        let store: Arc<dyn CommandStore> = Arc::new(MemoryCommandStore::new());
        let pool = CatchUpResolver::start(
            Arc::clone(&store),
            Arc::new(DeviceLocks::new(4)),
            2,
            DEFAULT_SEND_TIMEOUT,
        )
        .unwrap();

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(8);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();
        pool.schedule(entry, Timestamp(0));

        let event = conn.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, HubEvent::CaughtUp { .. }));
    }

    #[test]
    fn test_history_larger_than_live_window_is_deduplicated() {
        const HISTORY: usize = 6_000;

        let store = MemoryCommandStore::new();
        let device = DeviceId::new("a");
        for _ in 0..HISTORY {
            store.insert(&device, CommandInput::new("x"), None).unwrap();
        }

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(HISTORY * 2);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();

        // Committed after registration, dispatched before the query runs.
        let mut live = Vec::new();
        for _ in 0..5 {
            let command = store.insert(&device, CommandInput::new("x"), None).unwrap();
            entry.deliver_live(&command);
            live.push(command.id);
        }

        let summary = resolve(
            &store,
            &DeviceLocks::new(4),
            &CatchUpJob { entry, since: Timestamp(0) },
            DEFAULT_SEND_TIMEOUT,
        );
        assert_eq!(summary.replayed, HISTORY);
        assert_eq!(summary.skipped, live.len());

        let mut seen = std::collections::HashSet::new();
        for event in conn.drain() {
            if let Some(command) = event.command() {
                assert!(seen.insert(command.id), "{} delivered twice", command.id);
            }
        }
        assert_eq!(seen.len(), HISTORY + live.len());
    }

    #[test]
    fn test_replay_larger_than_buffer_reaches_reader() {
        let store = MemoryCommandStore::new();
        for _ in 0..20 {
            store.insert(&DeviceId::new("a"), CommandInput::new("x"), None).unwrap();
        }

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(4);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();

        let reader = std::thread::spawn(move || {
            let mut commands = 0;
            loop {
                match conn.recv_timeout(Duration::from_secs(2)).unwrap() {
                    HubEvent::Command { .. } => commands += 1,
                    HubEvent::CaughtUp { .. } => return commands,
                    other => panic!("Unexpected event {:?}", other),
                }
            }
        });

        let summary = resolve(
            &store,
            &DeviceLocks::new(4),
            &CatchUpJob { entry, since: Timestamp(0) },
            DEFAULT_SEND_TIMEOUT,
        );
        assert_eq!(summary.replayed, 20);
        assert_eq!(reader.join().unwrap(), 20);
    }

    #[test]
    fn test_stalled_replay_reports_failure() {
        let store = MemoryCommandStore::new();
        for _ in 0..5 {
            store.insert(&DeviceId::new("a"), CommandInput::new("x"), None).unwrap();
        }

        let registry = SubscriptionRegistry::new();
        let conn = registry.open_connection(2);
        let entry = registry
            .add(conn.id, Filter::devices(["a"]).unwrap(), true)
            .unwrap();

        // Reader wakes after the replay stalls but before the notice gives up.
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            let mut events = Vec::new();
            while let Ok(event) = conn.recv_timeout(Duration::from_millis(500)) {
                events.push(event);
            }
            events
        });

        let summary = resolve(
            &store,
            &DeviceLocks::new(4),
            &CatchUpJob { entry, since: Timestamp(0) },
            Duration::from_millis(200),
        );
        assert_eq!(summary.replayed, 2);
        assert_eq!(summary.dropped, 3);

        let events = reader.join().unwrap();
        assert_eq!(events.len(), 3);
        match &events[2] {
            HubEvent::CatchUpFailed { reason, .. } => assert!(reason.contains("3 of 5")),
            other => panic!("Expected CatchUpFailed event, got {:?}", other),
        }
    }
}
