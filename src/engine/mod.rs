mod availability;
mod conflict;
mod directory;
mod error;
mod mutations;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_intervals};
pub use conflict::can_place;
pub(crate) use conflict::now_ms;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::model::*;
use crate::outbox::Outbox;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit:
/// take one append, drain whatever else is already queued, then write the
/// whole batch with a single fsync and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Commands after the batch must observe it on disk.
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush of {} events failed: {e}", batch.len());
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply a committed event to the in-memory state. Caller holds the write
/// lock (or owns the state during replay).
fn apply_event(state: &mut HouseState, event: &Event) {
    match event {
        Event::UserRegistered {
            id,
            name,
            email,
            password_hash,
            role,
            created_at,
        } => {
            state.emails.insert(email.clone(), *id);
            state.users.insert(
                *id,
                UserRecord {
                    id: *id,
                    name: name.clone(),
                    email: email.clone(),
                    password_hash: password_hash.clone(),
                    role: *role,
                    created_at: *created_at,
                },
            );
        }
        Event::UserRoleChanged { id, role } => {
            if let Some(user) = state.users.get_mut(id) {
                user.role = *role;
            }
        }
        Event::UserDeleted { id } => {
            if let Some(user) = state.users.remove(id) {
                state.emails.remove(&user.email);
            }
            state.timeline.bookings.retain(|b| b.user_id != *id);
        }
        Event::BookingCreated {
            id,
            user_id,
            span,
            note,
            created_at,
        } => {
            state.timeline.insert(BookingRecord {
                id: *id,
                user_id: *user_id,
                span: *span,
                note: note.clone(),
                created_at: *created_at,
            });
        }
        Event::BookingUpdated { id, span, note } => {
            if let Some(mut booking) = state.timeline.remove(*id) {
                booking.span = *span;
                booking.note = note.clone();
                state.timeline.insert(booking);
            }
        }
        Event::BookingDeleted { id } => {
            state.timeline.remove(*id);
        }
    }
}

/// Owner of the shared house: user directory, booking timeline and WAL.
///
/// Every mutation runs its checks and its WAL append under one write lock,
/// so check-then-write sequences never interleave.
pub struct Engine {
    pub(super) state: RwLock<HouseState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) outbox: Outbox,
    pub(super) bcrypt_cost: u32,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("bcrypt_cost", &self.bcrypt_cost)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(wal_path: PathBuf, outbox: Outbox) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut state = HouseState::default();
        for event in &events {
            apply_event(&mut state, event);
        }
        tracing::info!(
            "replayed {} events: {} users, {} bookings",
            events.len(),
            state.users.len(),
            state.timeline.bookings.len()
        );

        Ok(Self {
            state: RwLock::new(state),
            wal_tx,
            outbox,
            bcrypt_cost: bcrypt::DEFAULT_COST,
        })
    }

    pub fn with_bcrypt_cost(mut self, cost: u32) -> Self {
        self.bcrypt_cost = cost;
        self
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. State is untouched if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        state: &mut HouseState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(state, event);
        Ok(())
    }

    /// Rewrite the WAL as the minimal event set for the current state.
    /// Holds the read lock throughout, so no commit can land in the old log
    /// after the snapshot is taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let guard = self.state.read().await;

        let mut users: Vec<&UserRecord> = guard.users.values().collect();
        users.sort_by_key(|u| (u.created_at, u.id));
        let mut events: Vec<Event> = users
            .into_iter()
            .map(|u| Event::UserRegistered {
                id: u.id,
                name: u.name.clone(),
                email: u.email.clone(),
                password_hash: u.password_hash.clone(),
                role: u.role,
                created_at: u.created_at,
            })
            .collect();
        events.extend(guard.timeline.bookings.iter().map(|b| Event::BookingCreated {
            id: b.id,
            user_id: b.user_id,
            span: b.span,
            note: b.note.clone(),
            created_at: b.created_at,
        }));

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guard);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
