use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::conflict::{can_place, validate_booking_span, validate_query_window};
use super::{Engine, EngineError};

impl Engine {
    /// `true` iff `span` could be booked right now, ignoring `exclude`.
    pub async fn can_place(&self, span: &Span, exclude: Option<Ulid>) -> bool {
        let guard = self.state.read().await;
        can_place(&guard.timeline, span, exclude)
    }

    /// Advisory pre-check. Validates exactly as `create_booking` does so the
    /// answer agrees with a create issued immediately after.
    pub async fn check_availability(&self, start: Ms, end: Ms) -> Result<bool, EngineError> {
        let span = validate_booking_span(start, end)?;
        Ok(self.can_place(&span, None).await)
    }

    pub async fn free_windows(&self, start: Ms, end: Ms) -> Result<Vec<Span>, EngineError> {
        let query = validate_query_window(start, end)?;
        let guard = self.state.read().await;
        Ok(free_windows(&guard.timeline, &query))
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<BookingInfo, EngineError> {
        let guard = self.state.read().await;
        guard
            .timeline
            .get(&id)
            .map(|b| guard.booking_info(b))
            .ok_or(EngineError::NotFound(id))
    }

    /// Every booking, ordered by start.
    pub async fn list_bookings(&self) -> Vec<BookingInfo> {
        let guard = self.state.read().await;
        guard
            .timeline
            .bookings
            .iter()
            .map(|b| guard.booking_info(b))
            .collect()
    }

    pub async fn list_bookings_for(&self, user_id: Ulid) -> Vec<BookingInfo> {
        let guard = self.state.read().await;
        guard
            .timeline
            .owned_by(user_id)
            .map(|b| guard.booking_info(b))
            .collect()
    }
}
