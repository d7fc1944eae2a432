use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Validate a proposed booking span. Ordering is checked first so that
/// `start >= end` is always a validation error, whatever else is wrong.
pub(crate) fn validate_booking_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("start must precede end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::LimitExceeded("booking too long"));
    }
    Ok(span)
}

pub(crate) fn validate_query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("start must precede end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

pub(crate) fn validate_note(note: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = note
        && n.len() > MAX_NOTE_LEN
    {
        return Err(EngineError::LimitExceeded("note too long"));
    }
    Ok(())
}

/// First booking (other than `exclude`) overlapping `span`, if any.
pub(crate) fn find_conflict(timeline: &Timeline, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    timeline
        .overlapping(span)
        .find(|b| Some(b.id) != exclude)
        .map(|b| b.id)
}

/// `true` iff no booking other than `exclude` overlaps `span`.
/// Callers must have checked `span.start < span.end`.
pub fn can_place(timeline: &Timeline, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(timeline, span, exclude).is_none()
}

pub(crate) fn check_no_conflict(
    timeline: &Timeline,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(timeline, span, exclude) {
        Some(id) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(id))
        }
        None => Ok(()),
    }
}
