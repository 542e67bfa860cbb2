//! Session Registry: the only state shared between session tasks.
//!
//! Entries are keyed by `(ClientId, SessionKind)` and spread over a fixed set
//! of shards, each behind its own `std::sync::RwLock`, so clients hashing to
//! different shards never contend. Locks are held only for map operations and
//! never across an `.await`.

use super::recognition::RecognitionCommand;
use super::{ClientId, SessionId, SessionKind};
use crate::error::SessionError;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

type Shard = HashMap<(ClientId, SessionKind), SessionHandle>;

/// How the gateway talks to a running session.
#[derive(Debug, Clone)]
pub(crate) enum SessionControl {
    Recognition(mpsc::Sender<RecognitionCommand>),
    Synthesis,
}

/// Cheap, cloneable reference to a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub client_id: ClientId,
    pub kind: SessionKind,
    pub created_at: DateTime<Utc>,
    control: SessionControl,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(client_id: ClientId, kind: SessionKind, control: SessionControl) -> Self {
        Self {
            session_id: SessionId::new(),
            client_id,
            kind,
            created_at: Utc::now(),
            control,
            cancel: CancellationToken::new(),
            finished: CancellationToken::new(),
        }
    }

    /// Token the session task watches for cancellation.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Token the session task cancels (through a drop guard) when it is gone.
    pub(crate) fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    /// Forward one PCM frame without waiting.
    ///
    /// A full command queue drops the frame; the caller decides whether that
    /// is worth reporting.
    pub fn send_audio(&self, pcm: Vec<u8>) -> Result<(), SessionError> {
        match &self.control {
            SessionControl::Recognition(commands) => match commands.try_send(RecognitionCommand::Audio(pcm)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SessionError::ClientInput(
                    "audio arriving faster than it can be relayed, frame dropped".to_string(),
                )),
                Err(TrySendError::Closed(_)) => Err(SessionError::InvalidTransition {
                    action: "send audio",
                    state: "closed",
                }),
            },
            SessionControl::Synthesis => Err(SessionError::InvalidTransition {
                action: "send audio",
                state: "synthesizing",
            }),
        }
    }

    /// Ask a recognition session to finish and report its final result.
    ///
    /// Never waits: a session whose command queue is full reports `Busy`.
    pub fn stop(&self) -> Result<(), SessionError> {
        match &self.control {
            SessionControl::Recognition(commands) => match commands.try_send(RecognitionCommand::Stop) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(SessionError::Busy {
                    session_id: self.session_id.to_string(),
                }),
                Err(TrySendError::Closed(_)) => Err(SessionError::InvalidTransition {
                    action: "stop",
                    state: "closed",
                }),
            },
            SessionControl::Synthesis => Err(SessionError::InvalidTransition {
                action: "stop",
                state: "synthesizing",
            }),
        }
    }

    /// Signal the task to tear down silently.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once the task has released everything it owned.
    pub async fn finished(&self) {
        self.finished.cancelled().await
    }

    /// Cancel and wait for teardown to complete.
    pub async fn shutdown(&self) {
        self.cancel();
        self.finished().await;
    }
}

pub struct SessionRegistry {
    shards: Vec<RwLock<Shard>>,
    live: AtomicUsize,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(shards: usize, max_sessions: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| RwLock::new(HashMap::new())).collect(),
            live: AtomicUsize::new(0),
            max_sessions,
        }
    }

    fn shard(&self, client: &ClientId) -> &RwLock<Shard> {
        let mut hasher = DefaultHasher::new();
        client.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn write(&self, client: &ClientId) -> RwLockWriteGuard<'_, Shard> {
        self.shard(client).write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session.
    ///
    /// Fails with `Busy` if the client already has a session of this kind, and
    /// with `Capacity` once the server-wide limit is reached.
    pub fn create(&self, handle: SessionHandle) -> Result<(), SessionError> {
        let mut shard = self.write(&handle.client_id);
        match shard.entry((handle.client_id, handle.kind)) {
            Entry::Occupied(existing) => Err(SessionError::Busy {
                session_id: existing.get().session_id.to_string(),
            }),
            Entry::Vacant(slot) => {
                self.live
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < self.max_sessions).then_some(n + 1))
                    .map_err(|_| SessionError::Capacity(self.max_sessions))?;
                slot.insert(handle);
                Ok(())
            }
        }
    }

    pub fn get(&self, client: ClientId, kind: SessionKind) -> Option<SessionHandle> {
        self.shard(&client)
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(client, kind))
            .cloned()
    }

    /// Remove the entry only if it still belongs to `session_id`.
    ///
    /// Session tasks use this so a finished session never evicts its successor.
    pub fn remove_if(&self, client: ClientId, kind: SessionKind, session_id: SessionId) -> bool {
        let mut shard = self.write(&client);
        match shard.get(&(client, kind)) {
            Some(handle) if handle.session_id == session_id => {
                shard.remove(&(client, kind));
                self.live.fetch_sub(1, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    /// Detach every session of a client, e.g. on disconnect.
    pub fn take_client(&self, client: ClientId) -> Vec<SessionHandle> {
        let mut shard = self.write(&client);
        let taken: Vec<SessionHandle> = [SessionKind::Recognition, SessionKind::Synthesis]
            .into_iter()
            .filter_map(|kind| shard.remove(&(client, kind)))
            .collect();
        self.live.fetch_sub(taken.len(), Ordering::SeqCst);
        taken
    }

    /// Cancel the client's session of `kind` and wait until it is gone.
    ///
    /// Returns whether there was anything to shut down.
    pub async fn shutdown(&self, client: ClientId, kind: SessionKind) -> bool {
        match self.get(client, kind) {
            Some(handle) => {
                handle.shutdown().await;
                // The task normally removed itself already.
                self.remove_if(client, kind, handle.session_id);
                true
            }
            None => false,
        }
    }

    /// Cancel every live session and wait for all of them.
    pub async fn shutdown_all(&self) {
        let handles: Vec<SessionHandle> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drain()
                    .map(|(_, handle)| handle)
                    .collect::<Vec<_>>()
            })
            .collect();
        self.live.fetch_sub(handles.len(), Ordering::SeqCst);

        for handle in &handles {
            handle.cancel();
        }
        join_all(handles.iter().map(|handle| handle.finished())).await;
    }

    pub fn count(&self, kind: SessionKind) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .keys()
                    .filter(|(_, k)| *k == kind)
                    .count()
            })
            .sum()
    }

    pub fn len(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn synthesis_handle(client: ClientId) -> SessionHandle {
        SessionHandle::new(client, SessionKind::Synthesis, SessionControl::Synthesis)
    }

    fn recognition_handle(client: ClientId) -> (SessionHandle, mpsc::Receiver<RecognitionCommand>) {
        let (tx, rx) = mpsc::channel(4);
        (
            SessionHandle::new(client, SessionKind::Recognition, SessionControl::Recognition(tx)),
            rx,
        )
    }

    #[test]
    fn test_create_rejects_duplicate_kind() {
        let registry = SessionRegistry::new(4, 10);
        let client = ClientId::new();
        let first = synthesis_handle(client);
        registry.create(first.clone()).unwrap();

        let err = registry.create(synthesis_handle(client)).unwrap_err();
        assert_eq!(
            err,
            SessionError::Busy {
                session_id: first.session_id.to_string()
            }
        );

        // Other kinds and other clients are independent.
        let (recognition, _rx) = recognition_handle(client);
        registry.create(recognition).unwrap();
        registry.create(synthesis_handle(ClientId::new())).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.count(SessionKind::Synthesis), 2);
    }

    #[test]
    fn test_remove_if_only_matches_own_session() {
        let registry = SessionRegistry::new(4, 10);
        let client = ClientId::new();
        let old = synthesis_handle(client);
        registry.create(old.clone()).unwrap();
        assert!(registry.remove_if(client, SessionKind::Synthesis, old.session_id));

        let new = synthesis_handle(client);
        registry.create(new.clone()).unwrap();

        assert!(!registry.remove_if(client, SessionKind::Synthesis, old.session_id));
        assert!(registry.get(client, SessionKind::Synthesis).is_some());
        assert!(registry.remove_if(client, SessionKind::Synthesis, new.session_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(2, 2);
        let first = ClientId::new();
        let first_handle = synthesis_handle(first);
        registry.create(first_handle.clone()).unwrap();
        registry.create(synthesis_handle(ClientId::new())).unwrap();
        assert_eq!(
            registry.create(synthesis_handle(ClientId::new())).unwrap_err(),
            SessionError::Capacity(2)
        );

        // Rejected duplicates don't consume capacity, removals free it.
        assert!(matches!(
            registry.create(synthesis_handle(first)),
            Err(SessionError::Busy { .. })
        ));
        assert!(registry.remove_if(first, SessionKind::Synthesis, first_handle.session_id));
        registry.create(synthesis_handle(ClientId::new())).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_take_client_removes_every_kind() {
        let registry = SessionRegistry::new(8, 10);
        let client = ClientId::new();
        let (recognition, _rx) = recognition_handle(client);
        registry.create(recognition).unwrap();
        registry.create(synthesis_handle(client)).unwrap();
        registry.create(synthesis_handle(ClientId::new())).unwrap();

        let taken = registry.take_client(client);
        assert_eq!(taken.len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(client, SessionKind::Recognition).is_none());
    }

    #[test]
    fn test_send_audio_on_wrong_kind() {
        let handle = synthesis_handle(ClientId::new());
        assert!(matches!(
            handle.send_audio(vec![0, 0]),
            Err(SessionError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_send_audio_after_session_ended() {
        let (handle, rx) = recognition_handle(ClientId::new());
        drop(rx);
        assert_eq!(
            handle.send_audio(vec![0, 0]).unwrap_err(),
            SessionError::InvalidTransition {
                action: "send audio",
                state: "closed"
            }
        );
    }

    #[test]
    fn test_stop_never_waits_on_a_full_queue() {
        let (handle, mut rx) = recognition_handle(ClientId::new());
        while handle.send_audio(vec![0, 0]).is_ok() {}

        assert_eq!(
            handle.stop().unwrap_err(),
            SessionError::Busy {
                session_id: handle.session_id.to_string()
            }
        );

        // Once the task drains a frame the stop goes through.
        assert!(matches!(rx.try_recv(), Ok(RecognitionCommand::Audio(_))));
        handle.stop().unwrap();

        drop(rx);
        assert!(matches!(
            handle.stop(),
            Err(SessionError::InvalidTransition { state: "closed", .. })
        ));
        assert!(matches!(
            synthesis_handle(ClientId::new()).stop(),
            Err(SessionError::InvalidTransition { state: "synthesizing", .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_task() {
        let registry = Arc::new(SessionRegistry::new(4, 10));
        let client = ClientId::new();
        let handle = synthesis_handle(client);
        registry.create(handle.clone()).unwrap();

        let task_registry = registry.clone();
        let cancel = handle.cancel_token();
        let finished = handle.finished_token();
        let session_id = handle.session_id;
        tokio::spawn(async move {
            let _done = finished.drop_guard();
            cancel.cancelled().await;
            tokio::task::yield_now().await;
            task_registry.remove_if(client, SessionKind::Synthesis, session_id);
        });

        assert!(registry.shutdown(client, SessionKind::Synthesis).await);
        assert!(handle.finished_token().is_cancelled());
        assert!(registry.is_empty());
        assert!(!registry.shutdown(client, SessionKind::Synthesis).await);
    }

    #[tokio::test]
    async fn test_concurrent_clients_do_not_interfere() {
        let registry = Arc::new(SessionRegistry::new(16, 1_000));
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let client = ClientId::new();
                for _ in 0..20 {
                    let handle = synthesis_handle(client);
                    registry.create(handle.clone()).unwrap();
                    tokio::task::yield_now().await;
                    assert!(registry.remove_if(client, SessionKind::Synthesis, handle.session_id));
                }
            }));
        }
        for task in join_all(tasks).await {
            task.unwrap();
        }
        assert!(registry.is_empty());
    }
}
