//! The public `DiskCache` type: lock/condition core (§4.1), bootstrap
//! (§4.3), get/put/remove (§4.4-4.6), trim policies (§4.7), and
//! configuration/callback accessors (§6).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;

use crate::codec::{KeyDecoder, KeyEncoder, MessagePackCodec, PercentKeyCodec, Serializer as SerializerTrait};
use crate::codec::Deserializer as DeserializerTrait;
use crate::error::{CacheError, Result};
use crate::metadata::{Entry, Metadata};
use crate::queue::{OperationQueue, Priority};
use crate::trash;

type AddCallback<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;
type RemoveCallback = Arc<dyn Fn(&str) + Send + Sync>;
type VoidCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks<V> {
    will_add: Option<AddCallback<V>>,
    did_add: Option<AddCallback<V>>,
    will_remove: Option<RemoveCallback>,
    did_remove: Option<RemoveCallback>,
    will_remove_all: Option<VoidCallback>,
    did_remove_all: Option<VoidCallback>,
}

/// A same-identifier trim submission pending in the queue, not yet
/// running. Further submissions with the same identifier merge into
/// this rather than scheduling a second pass (§4.9).
struct PendingTrim<T> {
    target: T,
    waiters: Vec<oneshot::Sender<()>>,
}

struct State<V> {
    metadata: Metadata,
    disk_writable: bool,
    disk_state_known: bool,
    byte_limit: u64,
    age_limit: u64,
    ttl_cache: bool,
    writing_protection: u32,
    callbacks: Callbacks<V>,
    pending_trim_size: Option<PendingTrim<u64>>,
    pending_trim_date: Option<PendingTrim<SystemTime>>,
    pending_trim_size_by_date: Option<PendingTrim<u64>>,
}

struct Shared<V> {
    cache_url: PathBuf,
    state: Mutex<State<V>>,
    disk_writable_cv: Condvar,
    disk_state_known_cv: Condvar,
    queue: OperationQueue,
    ttl_generation: AtomicU64,
    key_encoder: Box<dyn KeyEncoder>,
    key_decoder: Box<dyn KeyDecoder>,
    serializer: Box<dyn SerializerTrait<V>>,
    deserializer: Box<dyn DeserializerTrait<V>>,
}

/// A persistent, on-disk keyed object cache bounded by a total byte
/// budget and an optional per-entry age limit.
///
/// Cheap to clone: internally an `Arc` handle onto shared state.
pub struct DiskCache<V> {
    shared: Arc<Shared<V>>,
}

impl<V> Clone for DiskCache<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

pub struct CacheBuilder<V> {
    name: String,
    prefix: String,
    root: PathBuf,
    byte_limit: u64,
    age_limit: u64,
    ttl_cache: bool,
    writing_protection: u32,
    queue_concurrency: usize,
    key_encoder: Box<dyn KeyEncoder>,
    key_decoder: Box<dyn KeyDecoder>,
    serializer: Box<dyn SerializerTrait<V>>,
    deserializer: Box<dyn DeserializerTrait<V>>,
}

const DEFAULT_BYTE_LIMIT: u64 = 50 * 1024 * 1024;
const DEFAULT_AGE_LIMIT: u64 = 30 * 24 * 60 * 60;
const DEFAULT_QUEUE_CONCURRENCY: usize = 6;

impl<V> CacheBuilder<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            prefix: "com.diskcache".to_owned(),
            root: root.into(),
            byte_limit: DEFAULT_BYTE_LIMIT,
            age_limit: DEFAULT_AGE_LIMIT,
            ttl_cache: false,
            writing_protection: 0,
            queue_concurrency: DEFAULT_QUEUE_CONCURRENCY,
            key_encoder: Box::new(PercentKeyCodec),
            key_decoder: Box::new(PercentKeyCodec),
            serializer: Box::new(MessagePackCodec),
            deserializer: Box::new(MessagePackCodec),
        }
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn byte_limit(mut self, limit: u64) -> Self {
        self.byte_limit = limit;
        self
    }

    pub fn age_limit(mut self, seconds: u64) -> Self {
        self.age_limit = seconds;
        self
    }

    pub fn ttl_cache(mut self, enabled: bool) -> Self {
        self.ttl_cache = enabled;
        self
    }

    pub fn writing_protection(mut self, mask: u32) -> Self {
        self.writing_protection = mask;
        self
    }

    pub fn key_encoder(mut self, encoder: impl KeyEncoder + 'static) -> Self {
        self.key_encoder = Box::new(encoder);
        self
    }

    pub fn key_decoder(mut self, decoder: impl KeyDecoder + 'static) -> Self {
        self.key_decoder = Box::new(decoder);
        self
    }

    pub fn serializer(mut self, serializer: impl SerializerTrait<V> + 'static) -> Self {
        self.serializer = Box::new(serializer);
        self
    }

    pub fn deserializer(mut self, deserializer: impl DeserializerTrait<V> + 'static) -> Self {
        self.deserializer = Box::new(deserializer);
        self
    }

    /// Constructs the cache. Returns immediately; the directory bootstrap
    /// (§4.3) runs on a background task distinct from the operation
    /// queue, so callers blocking on `disk_writable`/`disk_state_known`
    /// never deadlock behind other queued work.
    pub fn build(self) -> Result<DiskCache<V>> {
        if self.name.is_empty() {
            return Err(CacheError::NotConfigured);
        }

        let cache_url = self.root.join(format!("{}.{}", self.prefix, self.name));

        let shared = Arc::new(Shared {
            cache_url,
            state: Mutex::new(State {
                metadata: Metadata::default(),
                disk_writable: false,
                disk_state_known: false,
                byte_limit: self.byte_limit,
                age_limit: self.age_limit,
                ttl_cache: self.ttl_cache,
                writing_protection: self.writing_protection,
                callbacks: Callbacks::default(),
                pending_trim_size: None,
                pending_trim_date: None,
                pending_trim_size_by_date: None,
            }),
            disk_writable_cv: Condvar::new(),
            disk_state_known_cv: Condvar::new(),
            queue: OperationQueue::new(self.queue_concurrency),
            ttl_generation: AtomicU64::new(0),
            key_encoder: self.key_encoder,
            key_decoder: self.key_decoder,
            serializer: self.serializer,
            deserializer: self.deserializer,
        });

        let bootstrap_target = shared.clone();
        tokio::spawn(async move {
            DiskCache::bootstrap(bootstrap_target).await;
        });

        let cache = DiskCache { shared };
        if cache.shared.state.lock().age_limit > 0 {
            DiskCache::rearm_ttl_sweep(&cache.shared);
        }

        Ok(cache)
    }
}

impl<V> DiskCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Convenience constructor equivalent to
    /// `CacheBuilder::new(name, root).build()`.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self> {
        CacheBuilder::new(name, root).build()
    }

    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.shared.state.lock()
    }

    fn lock_for_writing(shared: &Shared<V>) -> MutexGuard<'_, State<V>> {
        let mut guard = shared.state.lock();
        while !guard.disk_writable {
            shared.disk_writable_cv.wait(&mut guard);
        }
        guard
    }

    fn lock_and_wait_for_known_state(shared: &Shared<V>) -> MutexGuard<'_, State<V>> {
        let mut guard = shared.state.lock();
        while !guard.disk_state_known {
            shared.disk_state_known_cv.wait(&mut guard);
        }
        guard
    }

    // ---- bootstrap (§4.3) ----

    async fn bootstrap(shared: Arc<Shared<V>>) {
        {
            let mut guard = shared.state.lock();
            if let Err(e) = std::fs::create_dir_all(&shared.cache_url) {
                tracing::warn!(error = %e, path = %shared.cache_url.display(), "failed to create cache directory");
            }
            guard.disk_writable = true;
        }
        shared.disk_writable_cv.notify_all();

        let entries = match std::fs::read_dir(&shared.cache_url) {
            Ok(read_dir) => read_dir
                .filter_map(|entry| entry.ok())
                .filter(|entry| {
                    !entry
                        .file_name()
                        .to_string_lossy()
                        .starts_with('.')
                })
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to enumerate cache directory during bootstrap");
                Vec::new()
            }
        };

        for dir_entry in entries {
            let filename = dir_entry.file_name().to_string_lossy().into_owned();
            let metadata = match dir_entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let key = match shared.key_decoder.decode(&filename) {
                Ok(key) => key,
                Err(_) => {
                    tracing::warn!(filename = %filename, "skipping file with undecodable name during bootstrap");
                    continue;
                }
            };
            let date = metadata.modified().unwrap_or(SystemTime::now());
            let size = metadata.len();

            let mut guard = shared.state.lock();
            guard.metadata.insert_or_replace(key, date, size);
        }

        let over_limit = {
            let guard = shared.state.lock();
            guard.byte_limit > 0 && guard.metadata.byte_count() > guard.byte_limit
        };
        if over_limit {
            let limit = shared.state.lock().byte_limit;
            let target = shared.clone();
            tokio::spawn(async move {
                Self::schedule_trim_to_size_by_date(&target, limit, Priority::Default).await;
            });
        }

        {
            let mut guard = shared.state.lock();
            guard.disk_state_known = true;
        }
        shared.disk_state_known_cv.notify_all();
        tracing::debug!(path = %shared.cache_url.display(), "bootstrap complete");
    }

    // ---- get (§4.4) ----

    fn get_sync(shared: &Arc<Shared<V>>, key: &str) -> Result<Option<V>> {
        {
            let guard = shared.state.lock();
            if guard.disk_state_known && guard.metadata.get(key).is_none() {
                return Ok(None);
            }
        }

        let filename = shared.key_encoder.encode(key);
        let file_path = shared.cache_url.join(&filename);

        let ttl_cache = shared.state.lock().ttl_cache;
        let guard = if ttl_cache {
            Self::lock_and_wait_for_known_state(shared)
        } else {
            shared.state.lock()
        };

        let entry_date = guard.metadata.get(key).map(|e| e.date);
        let age_limit = guard.age_limit;
        drop(guard);

        let expired = ttl_cache
            && age_limit > 0
            && entry_date
                .map(|date| {
                    SystemTime::now()
                        .duration_since(date)
                        .unwrap_or_default()
                        >= Duration::from_secs(age_limit)
                })
                .unwrap_or(false);

        if expired {
            return Ok(None);
        }

        let bytes = match std::fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let value = match shared.deserializer.deserialize(&bytes, key) {
            Ok(value) => value,
            Err(fault) => {
                // Deleting the file on a deserialization fault but
                // leaving the metadata entry dangling is the observed
                // behavior this preserves; see DESIGN.md.
                let _ = std::fs::remove_file(&file_path);
                return Err(fault);
            }
        };

        if !ttl_cache {
            let shared = shared.clone();
            let key = key.to_owned();
            let file_path = file_path.clone();
            tokio::spawn(async move {
                let now = SystemTime::now();
                if filetime::set_file_mtime(&file_path, filetime::FileTime::from_system_time(now)).is_ok() {
                    let mut guard = shared.state.lock();
                    guard.metadata.touch(&key, now);
                }
            });
        }

        Ok(Some(value))
    }

    pub fn get(&self, key: &str) -> Result<Option<V>> {
        Self::get_sync(&self.shared, key)
    }

    pub async fn get_async(&self, key: &str) -> Result<Option<V>> {
        Self::run_on_queue(&self.shared, Priority::Default, key.to_owned(), |shared, key| {
            Self::get_sync(shared, &key)
        })
        .await
    }

    pub fn contains(&self, key: &str) -> bool {
        let guard = self.lock();
        if guard.disk_state_known {
            return guard.metadata.get(key).is_some();
        }
        drop(guard);
        self.shared
            .cache_url
            .join(self.shared.key_encoder.encode(key))
            .exists()
    }

    pub fn file_url(&self, key: &str) -> Option<PathBuf> {
        let path = self.shared.cache_url.join(self.shared.key_encoder.encode(key));
        if !path.exists() {
            return None;
        }
        if !self.lock().ttl_cache {
            let _ = filetime::set_file_mtime(&path, filetime::FileTime::from_system_time(SystemTime::now()));
        }
        Some(path)
    }

    // ---- put (§4.5) ----

    fn set_sync(shared: &Arc<Shared<V>>, key: &str, value: V) -> Result<()> {
        let bytes = shared.serializer.serialize(&value, key)?;

        let mut guard = Self::lock_for_writing(shared);

        // A payload destined for immediate eviction is refused silently:
        // no file written, no metadata change, byte_count unchanged.
        if guard.byte_limit > 0 && bytes.len() as u64 > guard.byte_limit {
            return Ok(());
        }

        drop(guard);
        if let Some(cb) = shared.state.lock().callbacks.will_add.clone() {
            cb(key, &value);
        }
        guard = Self::lock_for_writing(shared);

        let filename = shared.key_encoder.encode(key);
        let final_path = shared.cache_url.join(&filename);
        let tmp_path = shared
            .cache_url
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));

        std::fs::write(&tmp_path, &bytes)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if guard.writing_protection != 0 {
                if let Ok(metadata) = std::fs::metadata(&tmp_path) {
                    let mut perms = metadata.permissions();
                    perms.set_mode(perms.mode() & !guard.writing_protection);
                    let _ = std::fs::set_permissions(&tmp_path, perms);
                }
            }
        }

        std::fs::rename(&tmp_path, &final_path)?;

        let file_meta = std::fs::metadata(&final_path)?;
        let date = file_meta.modified().unwrap_or(SystemTime::now());
        let size = file_meta.len();

        guard.metadata.insert_or_replace(key.to_owned(), date, size);
        let over_limit = guard.byte_limit > 0 && guard.metadata.byte_count() > guard.byte_limit;
        drop(guard);

        if over_limit {
            let limit = shared.state.lock().byte_limit;
            let target = shared.clone();
            tokio::spawn(async move {
                Self::schedule_trim_to_size_by_date(&target, limit, Priority::Default).await;
            });
        }

        if let Some(cb) = shared.state.lock().callbacks.did_add.clone() {
            cb(key, &value);
        }

        Ok(())
    }

    pub fn set(&self, key: &str, value: V) -> Result<()> {
        Self::set_sync(&self.shared, key, value)
    }

    pub async fn set_async(&self, key: &str, value: V) -> Result<()> {
        let key = key.to_owned();
        Self::run_on_queue(&self.shared, Priority::Default, (key, value), |shared, (key, value)| {
            Self::set_sync(shared, &key, value)
        })
        .await
    }

    // ---- remove (§4.6) ----

    fn remove_sync(shared: &Arc<Shared<V>>, key: &str) -> Result<bool> {
        let filename = shared.key_encoder.encode(key);
        let path = shared.cache_url.join(&filename);

        let mut guard = Self::lock_for_writing(shared);
        if !path.exists() {
            return Ok(false);
        }

        drop(guard);
        if let Some(cb) = shared.state.lock().callbacks.will_remove.clone() {
            cb(key);
        }
        guard = Self::lock_for_writing(shared);

        if let Err(e) = trash::global().move_to_trash(&path) {
            tracing::warn!(error = %e, key = %key, "failed to move file to trash");
            return Ok(false);
        }
        trash::global().empty_trash();

        guard.metadata.remove(key);
        drop(guard);

        if let Some(cb) = shared.state.lock().callbacks.did_remove.clone() {
            cb(key);
        }

        Ok(true)
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        Self::remove_sync(&self.shared, key)
    }

    pub async fn remove_async(&self, key: &str) -> Result<bool> {
        Self::run_on_queue(&self.shared, Priority::Default, key.to_owned(), |shared, key| {
            Self::remove_sync(shared, &key)
        })
        .await
    }

    fn remove_all_sync(shared: &Arc<Shared<V>>) -> Result<()> {
        let mut guard = Self::lock_for_writing(shared);

        drop(guard);
        if let Some(cb) = shared.state.lock().callbacks.will_remove_all.clone() {
            cb();
        }
        guard = Self::lock_for_writing(shared);

        if let Err(e) = trash::global().move_dir_to_trash(&shared.cache_url) {
            tracing::warn!(error = %e, path = %shared.cache_url.display(), "failed to move cache directory to trash");
        }
        trash::global().empty_trash();
        std::fs::create_dir_all(&shared.cache_url)?;

        guard.metadata.clear();
        drop(guard);

        if let Some(cb) = shared.state.lock().callbacks.did_remove_all.clone() {
            cb();
        }

        Ok(())
    }

    pub fn remove_all(&self) -> Result<()> {
        Self::remove_all_sync(&self.shared)
    }

    pub async fn remove_all_async(&self) -> Result<()> {
        Self::run_on_queue(&self.shared, Priority::Default, (), |shared, ()| {
            Self::remove_all_sync(shared)
        })
        .await
    }

    // ---- trim policies (§4.7) ----

    fn trim_to_size_sync(shared: &Arc<Shared<V>>, n: u64) -> Result<()> {
        if n == 0 {
            return Self::remove_all_sync(shared);
        }
        loop {
            let next = {
                let guard = shared.state.lock();
                if guard.metadata.byte_count() <= n {
                    None
                } else {
                    guard.metadata.keys_sorted_by_size_desc().into_iter().next()
                }
            };
            match next {
                Some(key) => {
                    Self::remove_sync(shared, &key)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn trim_to_size_by_date_sync(shared: &Arc<Shared<V>>, n: u64) -> Result<()> {
        if n == 0 {
            return Self::remove_all_sync(shared);
        }
        loop {
            let next = {
                let guard = shared.state.lock();
                if guard.metadata.byte_count() <= n {
                    None
                } else {
                    guard.metadata.keys_sorted_by_date_asc().into_iter().next()
                }
            };
            match next {
                Some(key) => {
                    Self::remove_sync(shared, &key)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn trim_to_date_sync(shared: &Arc<Shared<V>>, d: SystemTime) -> Result<()> {
        if d <= SystemTime::UNIX_EPOCH {
            return Self::remove_all_sync(shared);
        }
        loop {
            let next = {
                let guard = shared.state.lock();
                let sorted = guard.metadata.keys_sorted_by_date_asc();
                match sorted.first() {
                    Some(key) if guard.metadata.get(key).map(|e| e.date < d).unwrap_or(false) => {
                        Some(key.clone())
                    }
                    _ => None,
                }
            };
            match next {
                Some(key) => {
                    Self::remove_sync(shared, &key)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    pub fn trim_to_size(&self, n: u64) -> Result<()> {
        Self::trim_to_size_sync(&self.shared, n)
    }

    pub fn trim_to_size_by_date(&self, n: u64) -> Result<()> {
        Self::trim_to_size_by_date_sync(&self.shared, n)
    }

    pub fn trim_to_date(&self, d: SystemTime) -> Result<()> {
        Self::trim_to_date_sync(&self.shared, d)
    }

    /// Deprecated: dispatches to `trim_to_size_async`, not
    /// `trim_to_size_by_date_async`. This reproduces a copy-paste bug
    /// observed in the source this crate is modeled on; callers should
    /// use [`Self::trim_to_size_by_date_async`] instead. See DESIGN.md.
    #[deprecated(note = "dispatches to trim_to_size_async, not trim_to_size_by_date_async; use trim_to_size_by_date_async")]
    pub async fn trim_to_size_by_date_deprecated(&self, n: u64) {
        self.trim_to_size_async(n, Priority::Default).await;
    }

    async fn schedule_trim_to_size_by_date(shared: &Arc<Shared<V>>, n: u64, priority: Priority) {
        let (tx, rx) = oneshot::channel();
        let should_schedule = {
            let mut guard = shared.state.lock();
            match &mut guard.pending_trim_size_by_date {
                Some(pending) => {
                    // "larger target wins": preserved literally per §9.
                    pending.target = pending.target.max(n);
                    pending.waiters.push(tx);
                    false
                }
                None => {
                    guard.pending_trim_size_by_date = Some(PendingTrim {
                        target: n,
                        waiters: vec![tx],
                    });
                    true
                }
            }
        };

        if should_schedule {
            let shared = shared.clone();
            shared.queue.clone().schedule(priority, move || {
                let shared = shared.clone();
                async move {
                    let pending = shared.state.lock().pending_trim_size_by_date.take();
                    if let Some(pending) = pending {
                        if let Err(e) = Self::trim_to_size_by_date_sync(&shared, pending.target) {
                            tracing::warn!(error = %e, "trim_to_size_by_date failed");
                        }
                        for waiter in pending.waiters {
                            let _ = waiter.send(());
                        }
                    }
                }
            });
        }

        let _ = rx.await;
    }

    pub async fn trim_to_size_async(&self, n: u64, priority: Priority) {
        let (tx, rx) = oneshot::channel();
        let should_schedule = {
            let mut guard = self.lock();
            match &mut guard.pending_trim_size {
                Some(pending) => {
                    pending.target = pending.target.max(n);
                    pending.waiters.push(tx);
                    false
                }
                None => {
                    guard.pending_trim_size = Some(PendingTrim {
                        target: n,
                        waiters: vec![tx],
                    });
                    true
                }
            }
        };

        if should_schedule {
            let shared = self.shared.clone();
            self.shared.queue.clone().schedule(priority, move || {
                let shared = shared.clone();
                async move {
                    let pending = shared.state.lock().pending_trim_size.take();
                    if let Some(pending) = pending {
                        if let Err(e) = Self::trim_to_size_sync(&shared, pending.target) {
                            tracing::warn!(error = %e, "trim_to_size failed");
                        }
                        for waiter in pending.waiters {
                            let _ = waiter.send(());
                        }
                    }
                }
            });
        }

        let _ = rx.await;
    }

    pub async fn trim_to_size_by_date_async(&self, n: u64, priority: Priority) {
        Self::schedule_trim_to_size_by_date(&self.shared, n, priority).await;
    }

    pub async fn trim_to_date_async(&self, d: SystemTime, priority: Priority) {
        let (tx, rx) = oneshot::channel();
        let should_schedule = {
            let mut guard = self.lock();
            match &mut guard.pending_trim_date {
                Some(pending) => {
                    // "later date wins": the more aggressive cut.
                    pending.target = pending.target.max(d);
                    pending.waiters.push(tx);
                    false
                }
                None => {
                    guard.pending_trim_date = Some(PendingTrim {
                        target: d,
                        waiters: vec![tx],
                    });
                    true
                }
            }
        };

        if should_schedule {
            let shared = self.shared.clone();
            self.shared.queue.clone().schedule(priority, move || {
                let shared = shared.clone();
                async move {
                    let pending = shared.state.lock().pending_trim_date.take();
                    if let Some(pending) = pending {
                        if let Err(e) = Self::trim_to_date_sync(&shared, pending.target) {
                            tracing::warn!(error = %e, "trim_to_date failed");
                        }
                        for waiter in pending.waiters {
                            let _ = waiter.send(());
                        }
                    }
                }
            });
        }

        let _ = rx.await;
    }

    // ---- recursive TTL sweep ----

    fn rearm_ttl_sweep(shared: &Arc<Shared<V>>) {
        let generation = shared.ttl_generation.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        let shared = shared.clone();
        tokio::spawn(async move {
            Self::ttl_sweep_loop(shared, generation).await;
        });
    }

    async fn ttl_sweep_loop(shared: Arc<Shared<V>>, generation: u64) {
        loop {
            let age_limit = shared.state.lock().age_limit;
            if age_limit == 0 || shared.ttl_generation.load(AtomicOrdering::SeqCst) != generation {
                return;
            }

            let cutoff = SystemTime::now()
                .checked_sub(Duration::from_secs(age_limit))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if let Err(e) = Self::trim_to_date_sync(&shared, cutoff) {
                tracing::warn!(error = %e, "recursive age-limit trim failed");
            }

            tokio::time::sleep(Duration::from_secs(age_limit)).await;
            if shared.ttl_generation.load(AtomicOrdering::SeqCst) != generation {
                return;
            }
        }
    }

    // ---- enumerate (§6) ----

    /// Iterates the in-memory index once it is fully known, skipping
    /// expired entries under TTL mode. Stop early by returning `false`
    /// from `f`.
    pub fn enumerate(&self, mut f: impl FnMut(&str, &Entry) -> bool) {
        let guard = Self::lock_and_wait_for_known_state(&self.shared);
        let ttl_cache = guard.ttl_cache;
        let age_limit = guard.age_limit;
        let now = SystemTime::now();

        for (key, entry) in guard.metadata.iter() {
            if ttl_cache && age_limit > 0 {
                let expired = now
                    .duration_since(entry.date)
                    .unwrap_or_default()
                    >= Duration::from_secs(age_limit);
                if expired {
                    continue;
                }
            }
            if !f(key, entry) {
                break;
            }
        }
    }

    // ---- configuration (§6) ----

    pub fn byte_limit(&self) -> u64 {
        self.lock().byte_limit
    }

    pub fn set_byte_limit(&self, limit: u64) {
        {
            let mut guard = self.lock();
            guard.byte_limit = limit;
        }
        if limit > 0 {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                Self::schedule_trim_to_size_by_date(&shared, limit, Priority::High).await;
            });
        }
    }

    pub fn age_limit(&self) -> u64 {
        self.lock().age_limit
    }

    pub fn set_age_limit(&self, seconds: u64) {
        {
            let mut guard = self.lock();
            guard.age_limit = seconds;
        }
        Self::rearm_ttl_sweep(&self.shared);
    }

    pub fn ttl_cache(&self) -> bool {
        self.lock().ttl_cache
    }

    pub fn set_ttl_cache(&self, enabled: bool) {
        self.lock().ttl_cache = enabled;
    }

    pub fn writing_protection(&self) -> u32 {
        self.lock().writing_protection
    }

    pub fn set_writing_protection(&self, mask: u32) {
        self.lock().writing_protection = mask;
    }

    pub fn byte_count(&self) -> u64 {
        self.lock().metadata.byte_count()
    }

    pub fn set_will_add(&self, cb: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.will_add = Some(Arc::new(cb));
        });
    }

    pub fn set_did_add(&self, cb: impl Fn(&str, &V) + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.did_add = Some(Arc::new(cb));
        });
    }

    pub fn set_will_remove(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.will_remove = Some(Arc::new(cb));
        });
    }

    pub fn set_did_remove(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.did_remove = Some(Arc::new(cb));
        });
    }

    pub fn set_will_remove_all(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.will_remove_all = Some(Arc::new(cb));
        });
    }

    pub fn set_did_remove_all(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.enqueue_callback_write(Priority::High, move |callbacks| {
            callbacks.did_remove_all = Some(Arc::new(cb));
        });
    }

    fn enqueue_callback_write(
        &self,
        priority: Priority,
        write: impl FnOnce(&mut Callbacks<V>) + Send + 'static,
    ) {
        let shared = self.shared.clone();
        self.shared.queue.clone().schedule(priority, move || async move {
            write(&mut shared.state.lock().callbacks);
        });
    }

    /// Runs `work` on the operation queue's executor and awaits its
    /// result; this is the machinery behind every `*_async` method that
    /// is not itself a coalescable trim.
    async fn run_on_queue<A, R>(
        shared: &Arc<Shared<V>>,
        priority: Priority,
        arg: A,
        work: impl FnOnce(&Arc<Shared<V>>, A) -> Result<R> + Send + 'static,
    ) -> Result<R>
    where
        A: Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let shared_for_job = shared.clone();
        shared.queue.clone().schedule(priority, move || async move {
            let result = work(&shared_for_job, arg);
            let _ = tx.send(result);
        });

        rx.await.map_err(|_| {
            CacheError::Generic {
                source: anyhow::anyhow!("operation dropped before completion"),
            }
        })?
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn init_tracing() {
        static ONCE: std::sync::Once = std::sync::Once::new();
        ONCE.call_once(|| {
            let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        });
    }

    fn cache(dir: &tempfile::TempDir) -> DiskCache<Vec<u8>> {
        init_tracing();
        DiskCache::new("test", dir.path()).unwrap()
    }

    async fn wait_known<V>(cache: &DiskCache<V>)
    where
        V: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let shared = cache.shared.clone();
        tokio::task::spawn_blocking(move || {
            DiskCache::<V>::lock_and_wait_for_known_state(&shared);
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        cache.set("a", vec![1, 2, 3]).unwrap();
        assert_eq!(cache.get("a").unwrap(), Some(vec![1, 2, 3]));
        assert!(cache.byte_count() >= 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn byte_limit_evicts_down_to_newest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::<Vec<u8>>::new("test", dir.path()).unwrap();
        cache.set_byte_limit(10);
        cache.set("x", vec![0u8; 6]).unwrap();
        cache.set("y", vec![0u8; 6]).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.byte_count() <= 10);
        assert!(cache.get("y").unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ttl_cache_hides_expired_entries_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::<Vec<u8>>::new("test", dir.path()).unwrap();
        cache.set_ttl_cache(true);
        cache.set_age_limit(1);
        cache.set("k", vec![1]).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.contains("k"));

        wait_known(&cache).await;
        let mut seen = Vec::new();
        cache.enumerate(|key, _| {
            seen.push(key.to_owned());
            true
        });
        assert!(!seen.contains(&"k".to_owned()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_deletes_file_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        cache.set("k", vec![1, 2]).unwrap();
        assert!(cache.remove("k").unwrap());
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(!cache.contains("k"));
        assert!(!cache.remove("k").unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn payload_larger_than_byte_limit_is_silently_refused() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::<Vec<u8>>::new("test", dir.path()).unwrap();
        cache.set_byte_limit(4);
        cache.set("k", vec![0u8; 10]).unwrap();
        assert!(!cache.contains("k"));
        assert_eq!(cache.byte_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_all_empties_metadata_and_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        cache.set("a", vec![1]).unwrap();
        cache.set("b", vec![2]).unwrap();
        cache.remove_all().unwrap();
        assert_eq!(cache.byte_count(), 0);
        assert!(dir.path().join("com.diskcache.test").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trim_to_size_by_date_evicts_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        for i in 0..10u8 {
            cache.set(&format!("k{i}"), vec![0u8; 100]).unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cache.trim_to_size_by_date(500).unwrap();
        assert!(cache.byte_count() <= 500);
        assert!(cache.get("k9").unwrap().is_some());
        assert!(cache.get("k0").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coalesced_trim_submissions_both_complete_at_larger_target() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        for i in 0..5u8 {
            cache.set(&format!("k{i}"), vec![0u8; 100]).unwrap();
        }

        let a = cache.trim_to_size_async(100, Priority::Default);
        let b = cache.trim_to_size_async(200, Priority::Default);
        let (_, _) = tokio::join!(a, b);

        assert!(cache.byte_count() <= 200);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn trim_to_size_zero_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir);
        cache.set("a", vec![1]).unwrap();
        cache.trim_to_size(0).unwrap();
        assert_eq!(cache.byte_count(), 0);
        assert!(!cache.contains("a"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn construct_then_immediate_get_does_not_deadlock() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::<Vec<u8>>::new("test", dir.path()).unwrap();
        assert_eq!(cache.get("absent").unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deserialization_fault_deletes_file_but_leaves_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::<Vec<u8>>::new("test", dir.path()).unwrap();
        cache.set("k", vec![1, 2, 3]).unwrap();

        // corrupt the file on disk directly, bypassing the cache.
        let path = dir.path().join("com.diskcache.test").join("k");
        std::fs::write(&path, b"\xff\xff\xff not valid msgpack for a Vec<u8>").unwrap();

        let err = cache.get("k").unwrap_err();
        assert!(matches!(err, CacheError::Deserialize { .. }));
        assert!(!path.exists());
        // metadata entry is left dangling until next bootstrap, per §9.
        assert!(cache.lock().metadata.contains("k"));
    }
}
