use std::{
    any::Any,
    collections::HashMap,
    fmt::{self, Debug},
    future::Future,
    hash::Hash,
    panic::{resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures::FutureExt;
use tokio::sync::watch::{channel as watch_channel, Receiver, Sender};

use crate::{Error, GroupConfig};

type Outcome<Value, E> = Result<Arc<Value>, Error<E>>;

/// Registered record of an in-flight wave.
struct Call<Value, E> {
    wave: u64,
    receiver: Receiver<Option<Outcome<Value, E>>>,
}

enum Role<Value, E> {
    Leader(Sender<Option<Outcome<Value, E>>>, u64),
    Joiner(Receiver<Option<Outcome<Value, E>>>),
}

/// Coalesces concurrent calls for the same key so the operation only runs once
/// per wave, every caller in the wave receives the same outcome.
///
/// Clones share the same set of in-flight calls.
#[allow(clippy::type_complexity)]
pub struct Group<Id, Value, E> {
    config: Arc<GroupConfig>,
    calls: Arc<Mutex<HashMap<Id, Call<Value, E>>>>,
    waves: Arc<AtomicU64>,
}

impl<Id: Hash + Eq + Clone + Debug, Value, E> Group<Id, Value, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: GroupConfig) -> Self {
        Self {
            config: Arc::new(config),
            calls: Arc::new(Mutex::new(HashMap::new())),
            waves: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Critical sections never panic so a poisoned map is still consistent
    fn calls(&self) -> MutexGuard<'_, HashMap<Id, Call<Value, E>>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join the wave in flight for this key or register a new one
    fn join_or_lead(&self, id: &Id) -> Role<Value, E> {
        let mut calls = self.calls();

        if let Some(call) = calls.get(id) {
            return Role::Joiner(call.receiver.clone());
        }

        let wave = self.waves.fetch_add(1, Ordering::Relaxed);
        let (send, recv) = watch_channel(None);
        calls.insert(id.clone(), Call { wave, receiver: recv });

        Role::Leader(send, wave)
    }

    /// Unregister a wave, unless the key has since moved on to a newer one
    fn remove(&self, id: &Id, wave: u64) -> bool {
        let mut calls = self.calls();

        if calls.get(id).is_some_and(|call| call.wave == wave) {
            calls.remove(id);
            true
        } else {
            false
        }
    }

    async fn wait_for(mut receiver: Receiver<Option<Outcome<Value, E>>>) -> Outcome<Value, E> {
        match receiver.wait_for(|v| v.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(Error::RecvError)),
            Err(_) => Err(Error::RecvError),
        }
    }

    async fn lead<F: FnOnce() -> Fut, Fut: Future<Output = Result<Value, E>>>(
        &self,
        id: Id,
        send: Sender<Option<Outcome<Value, E>>>,
        wave: u64,
        func: F,
    ) -> (Outcome<Value, E>, bool) {
        debug!("Leading wave {wave} for {id:?}");

        let mut leader = Leader {
            group: self,
            id,
            wave,
            published: false,
        };

        let (outcome, panic) = match AssertUnwindSafe(async move { func().await })
            .catch_unwind()
            .await
        {
            Ok(Ok(value)) => (Ok(Arc::new(value)), None),
            Ok(Err(err)) => (Err(Error::Operation(Arc::new(err))), None),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!("Operation for {:?} panicked: {message}", leader.id);
                (Err(Error::Panicked(message)), Some(payload))
            }
        };

        self.remove(&leader.id, wave);
        leader.published = true;

        // Every receiver left belongs to a joiner now that the record is gone
        let shared = send.receiver_count() > 0;
        send.send_replace(Some(outcome.clone()));

        debug!("Finished wave {wave} for {:?} (shared: {shared})", leader.id);

        if let Some(payload) = panic {
            if self.config.propagate_panics {
                resume_unwind(payload);
            }
        }

        (outcome, shared)
    }

    /// Run `func` for this key, or wait for the run already in flight and
    /// share its outcome.
    ///
    /// The operation must not call back into the group with the same key,
    /// it would end up waiting on itself.
    pub async fn execute<F: FnOnce() -> Fut, Fut: Future<Output = Result<Value, E>>>(
        &self,
        id: Id,
        func: F,
    ) -> Outcome<Value, E> {
        self.execute_shared(id, func).await.0
    }

    /// Same as [`Group::execute`], also reports whether the outcome was
    /// handed to more than one caller.
    pub async fn execute_shared<F: FnOnce() -> Fut, Fut: Future<Output = Result<Value, E>>>(
        &self,
        id: Id,
        func: F,
    ) -> (Outcome<Value, E>, bool) {
        match self.join_or_lead(&id) {
            Role::Joiner(receiver) => {
                trace!("Joining wave in flight for {id:?}");
                (Self::wait_for(receiver).await, true)
            }
            Role::Leader(send, wave) => self.lead(id, send, wave, func).await,
        }
    }

    /// Stop coalescing onto the wave in flight for this key, the next call
    /// starts a new one. Callers that already joined still get its outcome.
    pub fn forget(&self, id: &Id) -> bool {
        let forgotten = self.calls().remove(id).is_some();
        if forgotten {
            warn!("Forgot wave in flight for {id:?}");
        }

        forgotten
    }

    pub fn is_in_flight(&self, id: &Id) -> bool {
        self.calls().contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.calls().len()
    }
}

/// Unregisters the wave if the leader goes away before publishing, dropping
/// the sender alongside releases the joiners with [`Error::RecvError`].
struct Leader<'a, Id: Hash + Eq + Clone + Debug, Value, E> {
    group: &'a Group<Id, Value, E>,
    id: Id,
    wave: u64,
    published: bool,
}

impl<Id: Hash + Eq + Clone + Debug, Value, E> Drop for Leader<'_, Id, Value, E> {
    fn drop(&mut self) {
        if !self.published && self.group.remove(&self.id, self.wave) {
            warn!("Leader for {:?} dropped before publishing", self.id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<Id, Value, E> Clone for Group<Id, Value, E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            calls: self.calls.clone(),
            waves: self.waves.clone(),
        }
    }
}

impl<Id: Hash + Eq + Clone + Debug, Value, E> Debug for Group<Id, Value, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<Id: Hash + Eq + Clone + Debug, Value, E> Default for Group<Id, Value, E> {
    fn default() -> Self {
        Self::from_config(GroupConfig::default())
    }
}
