//! Watches installations and schedules reconciliation passes.
//!
//! Every object gets its own task, so at most one pass per key is in flight
//! while distinct keys are reconciled concurrently. A task for a deleted key
//! keeps the key busy until its final pass is done; a task started for the
//! same key afterwards waits for it. Watch events only wake a task up; the
//! task always reconciles from the store's current state.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams};
use kube::Client;
use kube_runtime::watcher::{self, Event};
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{Outcome, RateLimiter};
use crate::object::ObjectKey;
use crate::reconciler::{Reconcile, Requeue};
use crate::resource::Installation;

const EVENT_BUFFER: usize = 128;
const WATCH_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Why a task was woken up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake {
    /// The object was added or modified. Carries its `metadata.generation`.
    Changed(Option<i64>),
    /// The object is gone from the store.
    Deleted,
}

#[derive(Debug)]
enum PrettyEvent {
    Applied { key: String },
    Deleted { key: String },
    Restarted { count: usize },
}

impl<K: Installation> From<&Event<K>> for PrettyEvent {
    fn from(event: &Event<K>) -> Self {
        match event {
            Event::Applied(object) => PrettyEvent::Applied {
                key: object.key().to_string(),
            },
            Event::Deleted(object) => PrettyEvent::Deleted {
                key: object.key().to_string(),
            },
            Event::Restarted(objects) => PrettyEvent::Restarted {
                count: objects.len(),
            },
        }
    }
}

struct ObjectTask {
    sender: Sender<Wake>,
    handle: JoinHandle<()>,
}

/// Routes watch events to one task per object.
pub struct Dispatcher {
    handlers: HashMap<ObjectKey, ObjectTask>,
    // Tasks of deleted objects that may still be running their final pass.
    finishing: HashMap<ObjectKey, JoinHandle<()>>,
    reconciler: Arc<dyn Reconcile>,
    limiter: Arc<dyn RateLimiter>,
}

impl Dispatcher {
    /// Create a dispatcher with no running tasks.
    pub fn new(reconciler: Arc<dyn Reconcile>, limiter: Arc<dyn RateLimiter>) -> Self {
        Dispatcher {
            handlers: HashMap::new(),
            finishing: HashMap::new(),
            reconciler,
            limiter,
        }
    }

    /// Keys that currently have a task.
    pub fn keys(&self) -> impl Iterator<Item = &ObjectKey> {
        self.handlers.keys()
    }

    /// Handle one watch event.
    #[tracing::instrument(level = "trace", skip(self, event), fields(event = ?PrettyEvent::from(&event)))]
    pub async fn handle_event<K: Installation>(&mut self, event: Event<K>) {
        match event {
            Event::Applied(object) => {
                let wake = Wake::Changed(object.meta().generation);
                self.dispatch(object.key(), wake).await
            }
            Event::Deleted(object) => self.dispatch(object.key(), Wake::Deleted).await,
            Event::Restarted(objects) => {
                info!("Got a watch restart. Resyncing tasks...");
                let objects = objects
                    .iter()
                    .map(|object| (object.key(), object.meta().generation))
                    .collect();
                self.resync(objects).await;
            }
        }
    }

    /// Wake the task for `key`, starting one if needed. A deleted key's task
    /// is woken once more and then forgotten.
    pub async fn dispatch(&mut self, key: ObjectKey, wake: Wake) {
        self.handlers.retain(|_, task| !task.sender.is_closed());
        self.finishing.retain(|_, handle| !handle.is_finished());
        match wake {
            Wake::Changed(generation) => {
                let sent = match self.handlers.get(&key) {
                    Some(task) => Some(task.sender.send(wake).await),
                    None => None,
                };
                match sent {
                    Some(Ok(())) => {}
                    Some(Err(error)) => {
                        error!(object = %key, %error, "Error while sending event. Will retry on next event.");
                        self.handlers.remove(&key);
                    }
                    None => {
                        debug!(object = %key, "Creating task for object.");
                        let task = self.start_object(key.clone(), generation);
                        self.handlers.insert(key, task);
                    }
                }
            }
            Wake::Deleted => match self.handlers.remove(&key) {
                Some(task) => {
                    debug!(object = %key, "Removed task for object.");
                    let _ = task.sender.send(wake).await;
                    self.finishing.insert(key, task.handle);
                }
                None => {
                    // Never seen alive, still give the reconciler a chance
                    // to observe the removal.
                    let task = self.start_object(key.clone(), None);
                    let _ = task.sender.try_send(Wake::Deleted);
                    self.finishing.insert(key, task.handle);
                }
            },
        }
    }

    /// Bring the task set in line with the objects listed after a watch
    /// restart: missing objects are treated as deleted, listed ones as
    /// changed.
    #[tracing::instrument(level = "trace", skip(self, objects), fields(count = objects.len()))]
    pub async fn resync(&mut self, objects: HashMap<ObjectKey, Option<i64>>) {
        let missing: Vec<ObjectKey> = self
            .handlers
            .keys()
            .filter(|key| !objects.contains_key(*key))
            .cloned()
            .collect();
        for key in missing {
            trace!(object = %key, "object deleted while watch was down");
            self.dispatch(key, Wake::Deleted).await;
        }
        let mut objects: Vec<(ObjectKey, Option<i64>)> = objects.into_iter().collect();
        objects.sort();
        for (key, generation) in objects {
            self.dispatch(key, Wake::Changed(generation)).await;
        }
    }

    fn start_object(&mut self, key: ObjectKey, generation: Option<i64>) -> ObjectTask {
        let (sender, receiver) = mpsc::channel(EVENT_BUFFER);
        let previous = self.finishing.remove(&key);
        let reconciler = Arc::clone(&self.reconciler);
        let limiter = Arc::clone(&self.limiter);
        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                trace!(object = %key, "waiting for the previous task to finish");
                if let Err(error) = previous.await {
                    warn!(object = %key, %error, "previous task did not finish cleanly");
                }
            }
            run_object_task(key, generation, reconciler, limiter, receiver).await
        });
        ObjectTask { sender, handle }
    }
}

/// Reconcile `key` until its object is deleted or the sender side hangs up.
///
/// One pass runs right away and then after every wake-up. The directive of
/// a pass decides how long to wait for the next one if nothing wakes the task:
/// `Never` waits for an event, `Immediately` does not wait, `After` waits the
/// given time and `Backoff` (or an error) waits as long as `limiter` says.
///
/// A backoff is only cut short by a deletion or by a new `generation`.
/// Updates that leave the generation alone, like status and finalizer
/// writes, are dropped while it runs.
pub async fn run_object_task(
    key: ObjectKey,
    mut generation: Option<i64>,
    reconciler: Arc<dyn Reconcile>,
    limiter: Arc<dyn RateLimiter>,
    mut events: Receiver<Wake>,
) {
    loop {
        let wake = match reconciler.reconcile(&key).await {
            Ok(Requeue::Never) => {
                limiter.next_delay(&key, Outcome::Success);
                events.recv().await
            }
            Ok(Requeue::Immediately) => Some(Wake::Changed(generation)),
            Ok(Requeue::After(delay)) => {
                limiter.next_delay(&key, Outcome::Success);
                trace!(object = %key, ?delay, "requeued");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Some(Wake::Changed(generation)),
                    wake = events.recv() => wake,
                }
            }
            Ok(Requeue::Backoff) => {
                let delay = limiter.next_delay(&key, Outcome::Failure);
                back_off(&key, delay, generation, &mut events).await
            }
            Err(error) => {
                let delay = limiter.next_delay(&key, Outcome::Failure);
                warn!(object = %key, %error, transient = error.is_transient(), ?delay, "reconcile failed");
                back_off(&key, delay, generation, &mut events).await
            }
        };

        match coalesce(wake, &mut events) {
            Some(Wake::Changed(latest)) => generation = latest,
            Some(Wake::Deleted) => {
                debug!(object = %key, "object deleted, running final pass");
                if let Err(error) = reconciler.reconcile(&key).await {
                    warn!(object = %key, %error, "final reconcile failed");
                }
                break;
            }
            None => {
                debug!(object = %key, "event sender hung up");
                break;
            }
        }
    }
    limiter.forget(&key);
}

async fn back_off(
    key: &ObjectKey,
    delay: Duration,
    generation: Option<i64>,
    events: &mut Receiver<Wake>,
) -> Option<Wake> {
    trace!(object = %key, ?delay, "backing off");
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return Some(Wake::Changed(generation)),
            wake = events.recv() => match wake {
                Some(Wake::Changed(latest)) if latest == generation => {
                    trace!(object = %key, "same generation, still backing off");
                }
                other => return other,
            },
        }
    }
}

// Fold every queued event into one wake-up. Deletion wins, otherwise the
// latest generation does.
fn coalesce(first: Option<Wake>, events: &mut Receiver<Wake>) -> Option<Wake> {
    let mut wake = first?;
    loop {
        match events.try_recv() {
            Ok(Wake::Deleted) => wake = Wake::Deleted,
            Ok(Wake::Changed(latest)) => {
                if wake != Wake::Deleted {
                    wake = Wake::Changed(latest);
                }
            }
            Err(TryRecvError::Empty) => return Some(wake),
            Err(TryRecvError::Disconnected) => return Some(wake),
        }
    }
}

/// Watches installations of kind `K` and runs a reconciler for each.
pub struct OperatorRuntime<K: Installation> {
    client: Client,
    dispatcher: Dispatcher,
    namespace: Option<String>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: Installation> OperatorRuntime<K> {
    /// Create a runtime watching all namespaces.
    pub fn new(client: Client, reconciler: Arc<dyn Reconcile>, limiter: Arc<dyn RateLimiter>) -> Self {
        OperatorRuntime {
            client,
            dispatcher: Dispatcher::new(reconciler, limiter),
            namespace: None,
            _kind: PhantomData,
        }
    }

    /// Only watch `namespace`.
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    /// Listens for updates to objects and forwards them to their tasks.
    pub async fn main_loop(&mut self) {
        let api: Api<K> = match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        };
        let mut informer = watcher::watcher(api, ListParams::default()).boxed();
        loop {
            match informer.try_next().await {
                Ok(Some(event)) => self.dispatcher.handle_event(event).await,
                Ok(None) => break,
                Err(error) => {
                    warn!(?error, "Error streaming object events.");
                    tokio::time::sleep(WATCH_ERROR_DELAY).await;
                }
            }
        }
    }

    /// Run until `shutdown` completes.
    pub async fn run_until<F: Future<Output = ()>>(&mut self, shutdown: F) {
        let kind = K::kind(&());
        info!(%kind, namespace = ?self.namespace, "starting controller");
        tokio::select! {
            _ = self.main_loop() => warn!(%kind, "watch stream ended"),
            _ = shutdown => info!(%kind, "shutting down controller"),
        }
    }
}
