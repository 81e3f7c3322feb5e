//! Room cache: key → live [`Room`], hydrated lazily from the store.
//!
//! ```text
//! get_or_create(key) ─► rooms[key] ─► OnceCell ──(first caller)──► store.get(key)
//!                                        │                            │
//!                                        └──(everyone else)── await ◄─┘
//!
//! Room ─persist hook─► PersistQueue ─► RoomStore
//! Room ─idle hook────► evict_if_idle(key, epoch) ─► final persist (acked) ─► drop
//! Room ─recover hook─► recover(key) ─► store.get(key) ─► resume writes if vacant
//! ```
//!
//! Concurrent first resolutions of one key share a single hydration, so a
//! key never has two live rooms.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OnceCell, RwLock};

use crate::config::{PersistConfig, RoomConfig};
use crate::room::{Room, RoomHooks};
use crate::session::Session;
use crate::storage::{decode_record, PersistQueue, PersistStats, RoomStore};

/// Shared handle to a cached room.
pub type RoomHandle = Arc<Mutex<Room>>;

/// Owns the key → room mapping and wires each room's hooks back into
/// itself.
pub struct RoomDirectory {
    store: Arc<dyn RoomStore>,
    queue: PersistQueue,
    config: RoomConfig,
    rooms: RwLock<HashMap<String, Arc<OnceCell<RoomHandle>>>>,
    /// Handed to idle hooks so a pending timer never keeps the directory alive
    this: Weak<RoomDirectory>,
}

impl RoomDirectory {
    /// Create the directory and spawn its persistence worker.
    pub fn new(
        store: Arc<dyn RoomStore>,
        config: RoomConfig,
        persist: PersistConfig,
    ) -> Arc<Self> {
        let queue = PersistQueue::spawn(Arc::clone(&store), persist);
        Arc::new_cyclic(|this| Self {
            store,
            queue,
            config,
            rooms: RwLock::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// The cached room for `key`, hydrating it on a miss.
    pub async fn get_or_create(&self, key: &str) -> RoomHandle {
        let cell = {
            let mut rooms = self.rooms.write().await;
            Arc::clone(rooms.entry(key.to_string()).or_default())
        };
        Arc::clone(cell.get_or_init(|| self.hydrate(key)).await)
    }

    /// Resolve `key` and try to admit `session`. Returns the room handle on
    /// admission.
    ///
    /// A room evicted between resolution and locking is resolved again.
    pub async fn join(
        &self,
        key: &str,
        session: &Arc<Session>,
        password: Option<&str>,
    ) -> Option<RoomHandle> {
        loop {
            let handle = self.get_or_create(key).await;
            let mut room = handle.lock().await;
            if room.is_evicted() {
                continue;
            }
            let admitted = room.join(session, password);
            drop(room);
            return admitted.then_some(handle);
        }
    }

    async fn hydrate(&self, key: &str) -> RoomHandle {
        let mut durable = true;
        let record = match self.store.get(key).await {
            Ok(Some(bytes)) => match decode_record(&bytes) {
                Ok(record) => {
                    log::info!("Room {key} hydrated from store");
                    Some(record)
                }
                Err(e) => {
                    log::warn!("Stored record for room {key} unreadable: {e}, using defaults");
                    durable = false;
                    None
                }
            },
            Ok(None) => {
                log::info!("Room {key} created with defaults");
                None
            }
            Err(e) => {
                log::warn!("Store read for room {key} failed: {e}, using defaults");
                durable = false;
                None
            }
        };

        let hooks = self.hooks();
        let mut room = match record {
            Some(record) => Room::from_record(key, record, self.config.clone(), hooks),
            None => Room::new(key, self.config.clone(), hooks),
        };
        if !durable {
            room.suspend_persistence();
        }
        Arc::new(Mutex::new(room))
    }

    fn hooks(&self) -> RoomHooks {
        let queue = self.queue.clone();
        let directory = self.this.clone();
        let recovering = self.this.clone();
        RoomHooks {
            persist: Arc::new(move |key, record| {
                queue.enqueue(key, record);
            }),
            idle: Arc::new(move |key, epoch| {
                let Some(directory) = directory.upgrade() else {
                    return;
                };
                let key = key.to_string();
                tokio::spawn(async move {
                    directory.evict_if_idle(&key, epoch).await;
                });
            }),
            recover: Arc::new(move |key| {
                let Some(directory) = recovering.upgrade() else {
                    return;
                };
                let key = key.to_string();
                tokio::spawn(async move {
                    directory.recover(&key).await;
                });
            }),
        }
    }

    /// Re-check the store for a room whose persistence is suspended. Writes
    /// resume, starting with the current state, once the store answers
    /// without a record for `key`.
    pub async fn recover(&self, key: &str) -> bool {
        let Some(handle) = self.cached(key).await else {
            return false;
        };
        let mut room = handle.lock().await;
        if room.is_evicted() || room.is_durable() {
            room.end_recovery();
            return false;
        }
        if !self.recover_locked(key, &mut room).await {
            return false;
        }
        room.persist();
        true
    }

    /// A stored record, even an unreadable one, keeps the room suspended
    /// until eviction.
    async fn recover_locked(&self, key: &str, room: &mut Room) -> bool {
        match self.store.get(key).await {
            Ok(None) => {
                log::info!("Store reachable again, resuming persistence of room {key}");
                room.resume_persistence();
                true
            }
            Ok(Some(_)) => {
                log::warn!("Room {key} shadows a stored record, persistence stays suspended");
                false
            }
            Err(e) => {
                log::debug!("Store still unavailable for room {key}: {e}");
                room.end_recovery();
                false
            }
        }
    }

    /// Cached room for `key`, without hydrating.
    pub async fn cached(&self, key: &str) -> Option<RoomHandle> {
        self.rooms
            .read()
            .await
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.cached(key).await.is_some()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }

    /// Queue a write of the room's current state.
    pub async fn persist(&self, key: &str) -> bool {
        match self.cached(key).await {
            Some(handle) => {
                handle.lock().await.persist();
                true
            }
            None => false,
        }
    }

    /// Write every cached room and wait for the writes. Returns how many
    /// were stored.
    pub async fn persist_all(&self) -> usize {
        let handles: Vec<(String, RoomHandle)> = {
            let rooms = self.rooms.read().await;
            rooms
                .iter()
                .filter_map(|(key, cell)| cell.get().map(|h| (key.clone(), Arc::clone(h))))
                .collect()
        };

        let mut stored = 0;
        for (key, handle) in handles {
            let record = {
                let mut room = handle.lock().await;
                if room.is_evicted() {
                    continue;
                }
                if !room.is_durable() && !self.recover_locked(&key, &mut room).await {
                    continue;
                }
                room.record()
            };
            if self.queue.persist_now(&key, record).await {
                stored += 1;
            }
        }
        log::info!("Persisted {stored} rooms");
        stored
    }

    /// Evict after the idle grace period, unless someone joined meanwhile.
    pub async fn evict_if_idle(&self, key: &str, epoch: u64) -> bool {
        let Some(handle) = self.cached(key).await else {
            return false;
        };
        let mut room = handle.lock().await;
        if room.is_evicted() || !room.is_empty() || room.idle_epoch() != epoch {
            return false;
        }
        self.evict_locked(key, &handle, &mut room).await;
        true
    }

    /// Final-persist the room and drop it from the cache, disconnecting
    /// anyone still in it.
    pub async fn evict(&self, key: &str) -> bool {
        let Some(handle) = self.cached(key).await else {
            return false;
        };
        let mut room = handle.lock().await;
        if room.is_evicted() {
            return false;
        }
        room.disconnect_all();
        self.evict_locked(key, &handle, &mut room).await;
        true
    }

    /// Runs with the room locked, so no join can slip in between the final
    /// write and the removal.
    async fn evict_locked(&self, key: &str, handle: &RoomHandle, room: &mut Room) {
        room.mark_evicted();
        if !room.is_durable() {
            self.recover_locked(key, room).await;
        }
        if room.is_durable() && !self.queue.persist_now(key, room.record()).await {
            log::warn!("Final write of room {key} failed, evicting anyway");
        }

        let mut rooms = self.rooms.write().await;
        let same = rooms
            .get(key)
            .and_then(|cell| cell.get())
            .is_some_and(|cached| Arc::ptr_eq(cached, handle));
        if same {
            rooms.remove(key);
        }
        log::info!("Room {key} evicted");
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    pub fn persist_stats(&self) -> PersistStats {
        self.queue.stats()
    }
}
