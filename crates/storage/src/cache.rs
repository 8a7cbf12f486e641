use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use super::error::{AllTiersExhaustedSnafu, StorageResult};
use super::events::{EventSink, StorageEvent};
use super::export::DatasetExporter;
use super::ids::RecordId;
use super::reduce::{ReductionPolicy, reduce_record};
use super::tier::TierKind;
use super::types::ConversationRecord;
use super::StorageTier;

/// Consecutive whole-chain failures that trigger the terminal export.
pub const EXPORT_AFTER_EXHAUSTIONS: u32 = 3;

/// One entry of the write chain. A slot with `reduce` set stores the degraded
/// copy of the record on its backend.
#[derive(Clone)]
pub struct TierSlot {
    pub kind: TierKind,
    pub backend: Arc<dyn StorageTier>,
    pub reduce: bool,
}

impl TierSlot {
    pub fn new(kind: TierKind, backend: Arc<dyn StorageTier>) -> Self {
        Self {
            kind,
            backend,
            reduce: false,
        }
    }

    pub fn reduced(kind: TierKind, backend: Arc<dyn StorageTier>) -> Self {
        Self {
            kind,
            backend,
            reduce: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { tier: TierKind, reduced: bool },
    /// A copy with a higher `last_modified` is already held; nothing was written.
    Stale { held_last_modified: u64 },
}

impl PutOutcome {
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            Self::Stored { tier, .. } => Some(*tier),
            Self::Stale { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    slot: usize,
    last_modified: u64,
}

#[derive(Default)]
struct CacheState {
    locations: HashMap<RecordId, Location>,
    consecutive_exhaustions: u32,
    export_done: bool,
}

/// Ordered tier chain behind the `put`/`get`/`list`/`delete` contract.
///
/// Every write starts at the first slot. Reads go to the slot that last
/// accepted the record. The internal lock serializes writes so an older copy
/// never replaces a newer one.
pub struct TieredCache {
    slots: Vec<TierSlot>,
    policy: ReductionPolicy,
    exporter: Option<Arc<dyn DatasetExporter>>,
    events: EventSink,
    state: Mutex<CacheState>,
    export_lock: Mutex<()>,
}

impl TieredCache {
    pub fn new(
        slots: Vec<TierSlot>,
        policy: ReductionPolicy,
        exporter: Option<Arc<dyn DatasetExporter>>,
        events: EventSink,
    ) -> Self {
        Self {
            slots,
            policy,
            exporter,
            events,
            state: Mutex::new(CacheState::default()),
            export_lock: Mutex::new(()),
        }
    }

    /// Primary, primary-reduced, secondary, volatile.
    pub fn standard(
        primary: Arc<dyn StorageTier>,
        secondary: Arc<dyn StorageTier>,
        volatile: Arc<dyn StorageTier>,
        policy: ReductionPolicy,
        exporter: Option<Arc<dyn DatasetExporter>>,
        events: EventSink,
    ) -> Self {
        let slots = vec![
            TierSlot::new(TierKind::Primary, primary.clone()),
            TierSlot::reduced(TierKind::PrimaryReduced, primary),
            TierSlot::new(TierKind::Secondary, secondary),
            TierSlot::new(TierKind::Volatile, volatile),
        ];
        Self::new(slots, policy, exporter, events)
    }

    pub fn tier_kinds(&self) -> Vec<TierKind> {
        self.slots.iter().map(|slot| slot.kind).collect()
    }

    /// Scans every slot and tracks the freshest copy of each record.
    pub async fn rebuild_index(&self) -> StorageResult<usize> {
        let mut locations: HashMap<RecordId, Location> = HashMap::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.reduce && self.shares_backend_with_earlier(index) {
                continue;
            }
            let records = match slot.backend.list().await {
                Ok(records) => records,
                Err(error) if error.is_fallthrough() => {
                    tracing::warn!(tier = %slot.kind, %error, "skipping unavailable tier during index rebuild");
                    continue;
                }
                Err(error) => return Err(error),
            };

            for record in records {
                let slot_index = self.resolve_slot_for(index, record.reduced);
                let candidate = Location {
                    slot: slot_index,
                    last_modified: record.last_modified,
                };
                locations
                    .entry(record.id)
                    .and_modify(|current| {
                        if candidate.last_modified > current.last_modified {
                            *current = candidate;
                        }
                    })
                    .or_insert(candidate);
            }
        }

        let tracked = locations.len();
        self.state.lock().await.locations = locations;
        tracing::debug!(tracked, "rebuilt tier index");
        Ok(tracked)
    }

    pub async fn put(&self, record: &ConversationRecord) -> StorageResult<PutOutcome> {
        let mut state = self.state.lock().await;

        if let Some(location) = state.locations.get(&record.id)
            && location.last_modified > record.last_modified
        {
            tracing::debug!(
                record_id = %record.id,
                held = location.last_modified,
                incoming = record.last_modified,
                "refusing stale cache write"
            );
            return Ok(PutOutcome::Stale {
                held_last_modified: location.last_modified,
            });
        }

        let mut attempted = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            attempted.push(slot.kind);
            let reduced_copy;
            let candidate = if slot.reduce {
                reduced_copy = reduce_record(record, &self.policy);
                &reduced_copy
            } else {
                record
            };

            match slot.backend.put(candidate).await {
                Ok(()) => {
                    let stored_slot = self.resolve_slot_for(index, candidate.reduced);
                    let previous = state.locations.insert(
                        record.id,
                        Location {
                            slot: stored_slot,
                            last_modified: record.last_modified,
                        },
                    );
                    state.consecutive_exhaustions = 0;
                    drop(state);

                    if index > 0 {
                        tracing::info!(record_id = %record.id, tier = %slot.kind, "record stored on fallback tier");
                    }
                    self.evict_other_copies(record.id, index, previous).await;
                    return Ok(PutOutcome::Stored {
                        tier: self.slots[stored_slot].kind,
                        reduced: candidate.reduced,
                    });
                }
                Err(error) if error.is_fallthrough() => {
                    tracing::warn!(record_id = %record.id, tier = %slot.kind, %error, "tier refused record");
                }
                Err(error) => return Err(error),
            }
        }

        state.consecutive_exhaustions += 1;
        let consecutive = state.consecutive_exhaustions;
        self.events.emit(StorageEvent::CapacityExhausted {
            record_id: record.id,
            consecutive,
        });
        tracing::error!(record_id = %record.id, consecutive, "every local tier refused record");

        let export_due = consecutive >= EXPORT_AFTER_EXHAUSTIONS && !state.export_done;
        drop(state);
        let export_path = if export_due {
            self.export_once(record).await
        } else {
            None
        };

        AllTiersExhaustedSnafu {
            stage: "cache-put-exhausted",
            record_id: record.id.to_string(),
            consecutive,
            attempted,
            export_path,
        }
        .fail()
    }

    pub async fn get(&self, record_id: RecordId) -> StorageResult<Option<ConversationRecord>> {
        let tracked = self.state.lock().await.locations.get(&record_id).copied();
        if let Some(location) = tracked {
            let slot = &self.slots[location.slot];
            if let Some(record) = slot.backend.get(record_id).await? {
                return Ok(Some(record));
            }
            tracing::warn!(record_id = %record_id, tier = %slot.kind, "tracked tier lost record; probing all tiers");
        }

        let located = self.locate(record_id).await?;
        let mut state = self.state.lock().await;
        match &located {
            Some((slot, record)) => {
                state.locations.insert(
                    record_id,
                    Location {
                        slot: *slot,
                        last_modified: record.last_modified,
                    },
                );
            }
            None => {
                state.locations.remove(&record_id);
            }
        }
        Ok(located.map(|(_, record)| record))
    }

    /// Union of every tier, one copy per record, newest first.
    pub async fn list(&self) -> StorageResult<Vec<ConversationRecord>> {
        let tracked = self.state.lock().await.locations.clone();
        let mut merged: HashMap<RecordId, (usize, ConversationRecord)> = HashMap::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.reduce && self.shares_backend_with_earlier(index) {
                continue;
            }
            let records = match slot.backend.list().await {
                Ok(records) => records,
                Err(error) if error.is_fallthrough() => continue,
                Err(error) => return Err(error),
            };

            for record in records {
                let slot_index = self.resolve_slot_for(index, record.reduced);
                let preferred = tracked
                    .get(&record.id)
                    .is_some_and(|location| location.slot == slot_index);
                let replace = match merged.get(&record.id) {
                    None => true,
                    Some((held_slot, held)) => {
                        let held_preferred = tracked
                            .get(&record.id)
                            .is_some_and(|location| location.slot == *held_slot);
                        preferred
                            || (!held_preferred && record.last_modified > held.last_modified)
                    }
                };
                if replace {
                    merged.insert(record.id, (slot_index, record));
                }
            }
        }

        let mut records = merged
            .into_values()
            .map(|(_, record)| record)
            .collect::<Vec<_>>();
        records.sort_by(|left, right| {
            right
                .last_modified
                .cmp(&left.last_modified)
                .then_with(|| right.id.cmp(&left.id))
        });
        Ok(records)
    }

    /// Removes the record from every tier. Returns whether any copy existed.
    pub async fn delete(&self, record_id: RecordId) -> StorageResult<bool> {
        let mut state = self.state.lock().await;
        let mut removed = false;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.reduce && self.shares_backend_with_earlier(index) {
                continue;
            }
            match slot.backend.delete(record_id).await {
                Ok(existed) => removed |= existed,
                Err(error) if error.is_fallthrough() => {
                    tracing::warn!(record_id = %record_id, tier = %slot.kind, %error, "tier unavailable during delete");
                }
                Err(error) => return Err(error),
            }
        }
        state.locations.remove(&record_id);
        Ok(removed)
    }

    pub async fn tracked_tier(&self, record_id: RecordId) -> Option<TierKind> {
        self.state
            .lock()
            .await
            .locations
            .get(&record_id)
            .map(|location| self.slots[location.slot].kind)
    }

    pub async fn consecutive_exhaustions(&self) -> u32 {
        self.state.lock().await.consecutive_exhaustions
    }

    async fn locate(&self, record_id: RecordId) -> StorageResult<Option<(usize, ConversationRecord)>> {
        let mut best: Option<(usize, ConversationRecord)> = None;
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.reduce && self.shares_backend_with_earlier(index) {
                continue;
            }
            let found = match slot.backend.get(record_id).await {
                Ok(found) => found,
                Err(error) if error.is_fallthrough() => continue,
                Err(error) => return Err(error),
            };
            if let Some(record) = found {
                let newer = best
                    .as_ref()
                    .is_none_or(|(_, held)| record.last_modified > held.last_modified);
                if newer {
                    best = Some((self.resolve_slot_for(index, record.reduced), record));
                }
            }
        }
        Ok(best)
    }

    async fn evict_other_copies(&self, record_id: RecordId, kept: usize, previous: Option<Location>) {
        let kept_backend = &self.slots[kept].backend;
        let Some(previous) = previous else {
            return;
        };
        if previous.slot == kept {
            return;
        }
        let stale = &self.slots[previous.slot];
        if Arc::ptr_eq(&stale.backend, kept_backend) {
            return;
        }
        if let Err(error) = stale.backend.delete(record_id).await {
            tracing::warn!(record_id = %record_id, tier = %stale.kind, %error, "failed to evict stale copy");
        }
    }

    // The session's single export is spent only once a file was written.
    async fn export_once(&self, failing: &ConversationRecord) -> Option<PathBuf> {
        let _exporting = self.export_lock.lock().await;
        if self.state.lock().await.export_done {
            return None;
        }
        let path = self.export_dataset(failing).await?;
        self.state.lock().await.export_done = true;
        Some(path)
    }

    async fn export_dataset(&self, failing: &ConversationRecord) -> Option<PathBuf> {
        let Some(exporter) = self.exporter.as_ref() else {
            self.events.emit(StorageEvent::ExportFailed {
                reason: "no dataset exporter configured".to_string(),
            });
            return None;
        };

        let mut records = match self.list().await {
            Ok(records) => records,
            Err(error) => {
                tracing::warn!(%error, "partial dataset listing for export");
                Vec::new()
            }
        };
        records.retain(|record| record.id != failing.id);
        records.push(failing.clone());

        match exporter.export(&records).await {
            Ok(path) => {
                tracing::warn!(path = %path.display(), record_count = records.len(), "exported dataset after capacity exhaustion");
                self.events.emit(StorageEvent::DatasetExported {
                    path: path.clone(),
                    record_count: records.len(),
                });
                Some(path)
            }
            Err(error) => {
                tracing::error!(%error, "dataset export failed");
                self.events.emit(StorageEvent::ExportFailed {
                    reason: error.to_string(),
                });
                None
            }
        }
    }

    fn shares_backend_with_earlier(&self, index: usize) -> bool {
        self.slots[..index]
            .iter()
            .any(|earlier| Arc::ptr_eq(&earlier.backend, &self.slots[index].backend))
    }

    // A backend shared by a full and a reduced slot reports which one by the
    // record's own flag.
    fn resolve_slot_for(&self, index: usize, reduced: bool) -> usize {
        let backend = &self.slots[index].backend;
        self.slots
            .iter()
            .position(|slot| Arc::ptr_eq(&slot.backend, backend) && slot.reduce == reduced)
            .unwrap_or(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStorage;
    use crate::types::{ContentKind, MediaPart, Message, MessageContent, MessageRole, Payload};

    fn cache_over(
        primary: Arc<MemoryStorage>,
        secondary: Arc<MemoryStorage>,
        volatile: Arc<MemoryStorage>,
    ) -> TieredCache {
        TieredCache::standard(
            primary,
            secondary,
            volatile,
            ReductionPolicy {
                inline_part_threshold_bytes: 64,
                text_budget_chars: 100,
            },
            None,
            EventSink::disabled(),
        )
    }

    fn record_at(last_modified: u64) -> ConversationRecord {
        let mut record = ConversationRecord::new(RecordId::new_v7(), "cache", last_modified);
        record.messages.push(Message::new(
            MessageRole::User,
            MessageContent::Parts(vec![
                MediaPart::inline(ContentKind::Image, "image/png", vec![7; 2_048]).into_part(),
            ]),
        ));
        record
    }

    #[tokio::test]
    async fn older_write_never_replaces_newer_copy() {
        let cache = cache_over(
            Arc::new(MemoryStorage::new("primary")),
            Arc::new(MemoryStorage::new("secondary")),
            Arc::new(MemoryStorage::new("volatile")),
        );
        let mut record = record_at(200);
        cache.put(&record).await.expect("put newer");

        record.last_modified = 150;
        let outcome = cache.put(&record).await.expect("put older");

        assert_eq!(
            outcome,
            PutOutcome::Stale {
                held_last_modified: 200
            }
        );
        let held = cache.get(record.id).await.expect("get");
        assert_eq!(held.map(|record| record.last_modified), Some(200));
    }

    #[tokio::test]
    async fn primary_recovers_once_space_frees_up() {
        let primary = Arc::new(MemoryStorage::with_quota("primary", 300));
        let secondary = Arc::new(MemoryStorage::new("secondary"));
        let cache = cache_over(
            primary.clone(),
            secondary.clone(),
            Arc::new(MemoryStorage::new("volatile")),
        );
        let big = {
            let mut record = record_at(1);
            record.messages.push(Message::text(MessageRole::User, "y".repeat(2_000)));
            record
        };

        let first = cache.put(&big).await.expect("put big");
        assert_eq!(first.tier(), Some(TierKind::Secondary));

        let small = ConversationRecord {
            last_modified: 2,
            messages: Vec::new(),
            ..big.clone()
        };
        let second = cache.put(&small).await.expect("put small");

        assert_eq!(second.tier(), Some(TierKind::Primary));
        assert_eq!(secondary.record_count(), 0);
        assert_eq!(cache.tracked_tier(big.id).await, Some(TierKind::Primary));
    }

    #[tokio::test]
    async fn reduced_copy_is_read_back_with_stripped_flags() {
        let primary = Arc::new(MemoryStorage::with_quota("primary", 1_000));
        let cache = cache_over(
            primary,
            Arc::new(MemoryStorage::new("secondary")),
            Arc::new(MemoryStorage::new("volatile")),
        );
        let record = record_at(10);

        let outcome = cache.put(&record).await.expect("put");
        let loaded = cache
            .get(record.id)
            .await
            .expect("get")
            .expect("record present");

        assert_eq!(
            outcome,
            PutOutcome::Stored {
                tier: TierKind::PrimaryReduced,
                reduced: true
            }
        );
        assert!(loaded.reduced);
        assert_eq!(
            loaded.media_parts().next().map(|part| part.payload.clone()),
            Some(Payload::Stripped {
                original_bytes: 2_048
            })
        );
    }

    #[tokio::test]
    async fn rebuild_index_prefers_freshest_copy() {
        let primary = Arc::new(MemoryStorage::new("primary"));
        let secondary = Arc::new(MemoryStorage::new("secondary"));
        let mut record = record_at(5);
        secondary.put(&record).await.expect("seed secondary");
        record.last_modified = 9;
        primary.put(&record).await.expect("seed primary");

        let cache = cache_over(primary, secondary, Arc::new(MemoryStorage::new("volatile")));
        let tracked = cache.rebuild_index().await.expect("rebuild");

        assert_eq!(tracked, 1);
        assert_eq!(cache.tracked_tier(record.id).await, Some(TierKind::Primary));
        let listed = cache.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].last_modified, 9);
    }

    /// Fails its first export, then writes a path per call.
    struct FailOnceExporter {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl DatasetExporter for FailOnceExporter {
        fn export<'a>(
            &'a self,
            _records: &'a [ConversationRecord],
        ) -> crate::BoxFuture<'a, StorageResult<PathBuf>> {
            Box::pin(async move {
                let call = self
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if call == 0 {
                    return Err(crate::StorageError::WriteExport {
                        stage: "test-export",
                        path: PathBuf::from("/exports"),
                        source: std::io::Error::other("disk full"),
                    });
                }
                Ok(PathBuf::from(format!("/exports/export-{call}.json")))
            })
        }
    }

    #[tokio::test]
    async fn failed_export_is_retried_on_the_next_exhaustion() {
        let (sink, mut events) = EventSink::channel();
        let exporter = Arc::new(FailOnceExporter {
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let cache = TieredCache::standard(
            Arc::new(MemoryStorage::with_quota("primary", 10)),
            Arc::new(MemoryStorage::with_quota("secondary", 10)),
            Arc::new(MemoryStorage::with_quota("volatile", 10)),
            ReductionPolicy::default(),
            Some(exporter.clone()),
            sink,
        );

        let mut export_paths = Vec::new();
        for attempt in 1..=5 {
            let error = cache
                .put(&record_at(attempt))
                .await
                .expect_err("every tier is full");
            export_paths.push(error.export_path().cloned());
        }

        assert_eq!(
            export_paths,
            vec![
                None,
                None,
                None,
                Some(PathBuf::from("/exports/export-1.json")),
                None
            ]
        );
        assert_eq!(exporter.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        let drained = events.drain();
        assert_eq!(
            drained
                .iter()
                .filter(|event| matches!(event, StorageEvent::ExportFailed { .. }))
                .count(),
            1
        );
        assert_eq!(
            drained
                .iter()
                .filter(|event| matches!(event, StorageEvent::DatasetExported { .. }))
                .count(),
            1
        );
    }
}
