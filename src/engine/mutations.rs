use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::outbox::Notification;

use super::conflict::{check_no_conflict, now_ms, validate_booking_span, validate_note};
use super::{Engine, EngineError};

impl Engine {
    pub async fn create_booking(
        &self,
        id: Ulid,
        user_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    ) -> Result<BookingInfo, EngineError> {
        let span = validate_booking_span(start, end)?;
        validate_note(&note)?;

        let mut guard = self.state.write().await;
        if guard.timeline.bookings.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }
        if guard.timeline.get(&id).is_some() {
            return Err(EngineError::AlreadyExists(format!("booking {id}")));
        }
        if !guard.users.contains_key(&user_id) {
            return Err(EngineError::NotFound(user_id));
        }
        check_no_conflict(&guard.timeline, &span, None)?;

        let event = Event::BookingCreated {
            id,
            user_id,
            span,
            note,
            created_at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;

        let booking = guard
            .timeline
            .get(&id)
            .map(|b| guard.booking_info(b))
            .ok_or(EngineError::NotFound(id))?;
        let queued = self.fan_out(&guard, &booking);
        drop(guard);

        info!(booking = %id, user = %user_id, start, end, "booking created");
        debug!("queued {queued} notifications for booking {id}");
        Ok(booking)
    }

    /// Queue one notification for every user except the booker. Never blocks.
    fn fan_out(&self, state: &HouseState, booking: &BookingInfo) -> usize {
        state
            .users
            .values()
            .filter(|u| u.id != booking.user_id)
            .filter(|u| {
                self.outbox.enqueue(Notification {
                    recipient_email: u.email.clone(),
                    recipient_name: u.name.clone(),
                    booker_name: booking.user_name.clone(),
                    start: booking.start,
                    end: booking.end,
                    note: booking.note.clone(),
                })
            })
            .count()
    }

    /// Owner-only. Administrators do not bypass the ownership check here.
    /// `note: None` keeps the stored note, `Some(None)` clears it.
    pub async fn update_booking(
        &self,
        id: Ulid,
        requester: Ulid,
        start: Ms,
        end: Ms,
        note: Option<Option<String>>,
    ) -> Result<BookingInfo, EngineError> {
        let mut guard = self.state.write().await;
        let current = guard.timeline.get(&id).ok_or(EngineError::NotFound(id))?;
        if current.user_id != requester {
            return Err(EngineError::Forbidden("only the owner may modify a booking"));
        }
        let note = note.unwrap_or_else(|| current.note.clone());
        let span = validate_booking_span(start, end)?;
        validate_note(&note)?;
        check_no_conflict(&guard.timeline, &span, Some(id))?;

        let event = Event::BookingUpdated { id, span, note };
        self.persist_and_apply(&mut guard, &event).await?;

        info!(booking = %id, start, end, "booking updated");
        guard
            .timeline
            .get(&id)
            .map(|b| guard.booking_info(b))
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn delete_booking(&self, id: Ulid, requester: Ulid) -> Result<(), EngineError> {
        let mut guard = self.state.write().await;
        let owner = guard
            .timeline
            .get(&id)
            .map(|b| b.user_id)
            .ok_or(EngineError::NotFound(id))?;
        if owner != requester {
            return Err(EngineError::Forbidden("only the owner may delete a booking"));
        }
        self.persist_and_apply(&mut guard, &Event::BookingDeleted { id })
            .await?;
        info!(booking = %id, "booking deleted");
        Ok(())
    }

    /// Privileged delete: skips the ownership check, still requires existence.
    pub async fn admin_delete_booking(
        &self,
        principal: &Principal,
        id: Ulid,
    ) -> Result<(), EngineError> {
        if !principal.is_admin() {
            return Err(EngineError::Forbidden("administrator role required"));
        }
        let mut guard = self.state.write().await;
        if guard.timeline.get(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&mut guard, &Event::BookingDeleted { id })
            .await?;
        info!(booking = %id, admin = %principal.user_id, "booking deleted by administrator");
        Ok(())
    }
}
