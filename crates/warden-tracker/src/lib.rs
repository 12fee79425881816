//! Sensor release tracking
//!
//! One long-lived task owns the table of tracked resources. Each entry knows
//! how to ask for the current version of its sensor and what to do when the
//! answer changes. Reconcilers register and unregister resources through a
//! cloneable [`TrackerHandle`]; nothing else touches the table.
//!
//! Every `interval` the task queries each tracked resource and calls its
//! handler when the version differs from the last one seen, or on every
//! poll when the resource asked for forced resyncs. A handler reporting
//! [`Resync::ResourceGone`] drops the entry. A failing query or
//! handler ends [`track_changes`] with that error; [`run_tracker`] restarts
//! it after a delay with an empty table, and the next reconciliation of each
//! resource registers it again.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_common::catalog::{SensorCatalog, SensorKind};
use warden_common::crd::AutoUpdateSpec;
use warden_common::store::{Object, ObjectKey, StateStore};
use warden_common::{Error, Result};

/// Default polling interval
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(900);

/// Default delay before a failed tracker loop is restarted
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Capacity of the registration channel
const CHANNEL_CAPACITY: usize = 64;

/// Asks the catalog for the current version of one sensor
pub type VersionQuery = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Reacts to a version change of the resource identified by the key
pub type ChangeHandler = Arc<dyn Fn(TrackId) -> BoxFuture<'static, Result<Resync>> + Send + Sync>;

/// Outcome of a change handler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resync {
    /// A reconciliation was requested
    Requested,
    /// The resource no longer exists; its entry is removed
    ResourceGone,
}

/// Identity of a tracked sensor resource
///
/// Both sensor kinds are cluster-scoped and may share names, so the kind is
/// part of the identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TrackId {
    /// Sensor kind
    pub sensor: SensorKind,
    /// Resource key within the kind
    pub key: ObjectKey,
}

impl TrackId {
    /// Identity of `key` among sensors of kind `sensor`
    pub fn new(sensor: SensorKind, key: ObjectKey) -> Self {
        Self { sensor, key }
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sensor, self.key)
    }
}

/// Requests processed by the tracker task
pub enum TrackerMessage {
    /// Start tracking `id`, or replace the closures and flag of an existing entry
    Upsert {
        /// Resource being tracked
        id: TrackId,
        /// Version source
        get_version: VersionQuery,
        /// Change reaction
        handler: ChangeHandler,
        /// Call the handler on every poll
        force: bool,
    },
    /// Stop tracking `id`
    Remove {
        /// Resource to forget
        id: TrackId,
    },
}

impl fmt::Debug for TrackerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert { id, force, .. } => f
                .debug_struct("Upsert")
                .field("id", id)
                .field("force", force)
                .finish_non_exhaustive(),
            Self::Remove { id } => f.debug_struct("Remove").field("id", id).finish(),
        }
    }
}

struct Track {
    get_version: VersionQuery,
    handler: ChangeHandler,
    force: bool,
    prior_version: String,
}

/// Timing of the tracker loop
#[derive(Clone, Debug)]
pub struct TrackerConfig {
    /// Time between polls
    pub interval: Duration,
    /// Pause before restarting after a failure
    pub restart_delay: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// Client side of the tracker
#[derive(Clone)]
pub struct TrackerHandle {
    tx: mpsc::Sender<TrackerMessage>,
    cancel: CancellationToken,
}

impl TrackerHandle {
    /// Create a handle and the receiver the tracker task consumes
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::Receiver<TrackerMessage>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        (Self { tx, cancel }, rx)
    }

    /// Track `id`, calling `handler` when `get_version` reports a new version
    /// (or on every poll with `force`)
    pub async fn track(
        &self,
        id: TrackId,
        get_version: VersionQuery,
        handler: ChangeHandler,
        force: bool,
    ) -> Result<()> {
        self.send(TrackerMessage::Upsert {
            id,
            get_version,
            handler,
            force,
        })
        .await
    }

    /// Stop tracking `id`; unknown ids are ignored
    pub async fn stop_tracking(&self, id: TrackId) -> Result<()> {
        self.send(TrackerMessage::Remove { id }).await
    }

    /// Make the registration of `id` follow its auto-update policy
    ///
    /// `normal` and `force` track (the latter with forced resyncs), `off`
    /// stops tracking.
    pub async fn sync(
        &self,
        id: TrackId,
        policy: &AutoUpdateSpec,
        get_version: VersionQuery,
        handler: ChangeHandler,
    ) -> Result<()> {
        if policy.enabled() {
            self.track(id, get_version, handler, policy.forced()).await
        } else {
            self.stop_tracking(id).await
        }
    }

    async fn send(&self, message: TrackerMessage) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::TrackerStopped),
            sent = self.tx.send(message) => sent.map_err(|_| Error::TrackerStopped),
        }
    }
}

/// Version query asking `catalog` for the latest release on `channel`
pub fn catalog_query(
    catalog: Arc<dyn SensorCatalog>,
    sensor: SensorKind,
    channel: &str,
) -> VersionQuery {
    let channel = channel.to_string();
    Arc::new(move || {
        let catalog = catalog.clone();
        let channel = channel.clone();
        async move { catalog.latest_version(sensor, &channel).await }.boxed()
    })
}

/// Change handler that enqueues a reconciliation of the changed resource
///
/// The resource is read back from `store` first. When it is gone (its
/// finalizer was stripped, so no reconcile will stop tracking it) nothing is
/// enqueued and the handler reports [`Resync::ResourceGone`].
pub fn resync_handler<K, S>(store: Arc<S>, tx: mpsc::Sender<ObjectKey>) -> ChangeHandler
where
    K: Object,
    S: StateStore<K> + ?Sized + 'static,
{
    Arc::new(move |id: TrackId| {
        let store = store.clone();
        let tx = tx.clone();
        async move {
            if StateStore::<K>::get_latest(&*store, &id.key).await?.is_none() {
                return Ok(Resync::ResourceGone);
            }
            tx.send(id.key)
                .await
                .map_err(|_| Error::internal_with_context("resync", "controller stopped"))?;
            Ok(Resync::Requested)
        }
        .boxed()
    })
}

/// Run `fut` unless `cancel` fires first
async fn unless_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Process registrations and poll tracked resources until cancelled
///
/// Returns `Ok(())` on cancellation or when every handle is dropped, and the
/// first query or handler error otherwise.
pub async fn track_changes(
    rx: &mut mpsc::Receiver<TrackerMessage>,
    cancel: &CancellationToken,
    interval: Duration,
) -> Result<()> {
    let mut tracks: HashMap<TrackId, Track> = HashMap::new();
    let timer = tokio::time::sleep(interval);
    tokio::pin!(timer);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            message = rx.recv() => match message {
                None => {
                    debug!("all tracker handles dropped");
                    return Ok(());
                }
                Some(TrackerMessage::Upsert { id, get_version, handler, force }) => {
                    if let Some(track) = tracks.get_mut(&id) {
                        track.get_version = get_version;
                        track.handler = handler;
                        track.force = force;
                        continue;
                    }
                    let Some(version) = unless_cancelled(cancel, get_version()).await else {
                        return Ok(());
                    };
                    let version = version?;
                    info!(sensor = %id, %version, force, "tracking sensor releases");
                    tracks.insert(id, Track { get_version, handler, force, prior_version: version });
                }
                Some(TrackerMessage::Remove { id }) => {
                    if tracks.remove(&id).is_some() {
                        info!(sensor = %id, "stopped tracking sensor releases");
                    }
                }
            },
            () = &mut timer => {
                if !poll(&mut tracks, cancel).await? {
                    return Ok(());
                }
                timer.as_mut().reset(Instant::now() + interval);
            }
        }
    }
}

/// One polling cycle; returns `false` when cancelled midway
async fn poll(tracks: &mut HashMap<TrackId, Track>, cancel: &CancellationToken) -> Result<bool> {
    debug!(tracked = tracks.len(), "polling sensor releases");
    let mut gone = Vec::new();
    for (id, track) in tracks.iter_mut() {
        let Some(version) = unless_cancelled(cancel, (track.get_version)()).await else {
            return Ok(false);
        };
        let version = version?;

        let changed = version != track.prior_version;
        if changed || track.force {
            if changed {
                info!(sensor = %id, from = %track.prior_version, to = %version, "new sensor release");
            } else {
                debug!(sensor = %id, %version, "forced resync");
            }
            let Some(handled) = unless_cancelled(cancel, (track.handler)(id.clone())).await else {
                return Ok(false);
            };
            if handled? == Resync::ResourceGone {
                gone.push(id.clone());
            }
        }
        track.prior_version = version;
    }
    for id in gone {
        tracks.remove(&id);
        info!(sensor = %id, "sensor resource gone, stopped tracking releases");
    }
    Ok(true)
}

/// Keep [`track_changes`] running until `cancel` fires
///
/// Failures are logged and the loop restarts after `restart_delay` with an
/// empty table.
pub async fn run_tracker(
    mut rx: mpsc::Receiver<TrackerMessage>,
    cancel: CancellationToken,
    config: TrackerConfig,
) {
    loop {
        match track_changes(&mut rx, &cancel, config.interval).await {
            Ok(()) => {
                info!("version tracker stopped");
                return;
            }
            Err(e) => {
                error!(error = %e, restart_in = ?config.restart_delay, "version tracker failed");
                if unless_cancelled(&cancel, tokio::time::sleep(config.restart_delay))
                    .await
                    .is_none()
                {
                    return;
                }
                warn!("restarting version tracker, registrations will be replayed by reconciles");
            }
        }
    }
}

/// Spawn the supervised tracker on the current runtime
pub fn spawn_tracker(
    config: TrackerConfig,
    cancel: CancellationToken,
) -> (TrackerHandle, JoinHandle<()>) {
    let (handle, rx) = TrackerHandle::new(cancel.clone());
    let task = tokio::spawn(run_tracker(rx, cancel, config));
    (handle, task)
}
