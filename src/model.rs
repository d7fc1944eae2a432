use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching spans (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Standard,
    Administrator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Standard => "user",
            Role::Administrator => "admin",
        }
    }

    /// Accepts the wire names plus the long forms, case-insensitively.
    pub fn parse(s: &str) -> Option<Role> {
        match s.to_lowercase().as_str() {
            "user" | "standard" => Some(Role::Standard),
            "admin" | "administrator" => Some(Role::Administrator),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The acting user of a request, as resolved by the identity layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Ulid,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrator
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub user_id: Ulid,
    pub span: Span,
    pub note: Option<String>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub created_at: Ms,
}

/// The shared house's reservation timeline.
#[derive(Debug, Clone, Default)]
pub struct Timeline {
    /// All bookings, sorted by `span.start`. Pairwise non-overlapping.
    pub bookings: Vec<BookingRecord>,
}

impl Timeline {
    /// Insert booking maintaining sort order by span.start.
    pub fn insert(&mut self, booking: BookingRecord) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BookingRecord> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: &Ulid) -> Option<&BookingRecord> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    /// Return only bookings whose span overlaps the query window.
    /// Uses binary search to skip bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &BookingRecord> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn owned_by(&self, user_id: Ulid) -> impl Iterator<Item = &BookingRecord> {
        self.bookings.iter().filter(move |b| b.user_id == user_id)
    }
}

/// Everything the engine owns: the user directory and the house timeline.
#[derive(Debug, Clone, Default)]
pub struct HouseState {
    pub users: HashMap<Ulid, UserRecord>,
    /// email → user id. Emails are compared exactly as stored.
    pub emails: HashMap<String, Ulid>,
    pub timeline: Timeline,
}

impl HouseState {
    pub fn user_by_email(&self, email: &str) -> Option<&UserRecord> {
        self.emails.get(email).and_then(|id| self.users.get(id))
    }

    pub fn admin_count(&self) -> usize {
        self.users
            .values()
            .filter(|u| u.role == Role::Administrator)
            .count()
    }

    pub fn booking_info(&self, b: &BookingRecord) -> BookingInfo {
        let (user_name, user_email) = self
            .users
            .get(&b.user_id)
            .map(|u| (u.name.clone(), u.email.clone()))
            .unwrap_or_default();
        BookingInfo {
            id: b.id,
            user_id: b.user_id,
            user_name,
            user_email,
            start: b.span.start,
            end: b.span.end,
            note: b.note.clone(),
            created_at: b.created_at,
        }
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: String,
        email: String,
        password_hash: String,
        role: Role,
        created_at: Ms,
    },
    UserRoleChanged {
        id: Ulid,
        role: Role,
    },
    /// Also removes every booking owned by the user.
    UserDeleted {
        id: Ulid,
    },
    BookingCreated {
        id: Ulid,
        user_id: Ulid,
        span: Span,
        note: Option<String>,
        created_at: Ms,
    },
    BookingUpdated {
        id: Ulid,
        span: Span,
        note: Option<String>,
    },
    BookingDeleted {
        id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A booking with its owner's name and email denormalized for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub user_name: String,
    pub user_email: String,
    pub start: Ms,
    pub end: Ms,
    pub note: Option<String>,
    pub created_at: Ms,
}

/// Public view of a user. Never carries the credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub created_at: Ms,
}

impl From<&UserRecord> for UserInfo {
    fn from(u: &UserRecord) -> Self {
        Self {
            id: u.id,
            name: u.name.clone(),
            email: u.email.clone(),
            role: u.role,
            created_at: u.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSummary {
    pub user: UserInfo,
    pub booking_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub total_users: usize,
    pub total_bookings: usize,
    pub active_bookings: usize,
    pub past_bookings: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> BookingRecord {
        BookingRecord {
            id: Ulid::new(),
            user_id: Ulid::new(),
            span: Span::new(start, end),
            note: None,
            created_at: 0,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.overlaps(&Span::new(199, 300)));
        assert!(!s.overlaps(&Span::new(200, 300))); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn span_overlap_containment() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
        assert!(outer.overlaps(&outer));
    }

    #[test]
    fn role_parse() {
        assert_eq!(Role::parse("admin"), Some(Role::Administrator));
        assert_eq!(Role::parse("Administrator"), Some(Role::Administrator));
        assert_eq!(Role::parse("USER"), Some(Role::Standard));
        assert_eq!(Role::parse("standard"), Some(Role::Standard));
        assert_eq!(Role::parse("root"), None);
        assert_eq!(Role::Administrator.to_string(), "admin");
    }

    #[test]
    fn timeline_ordering() {
        let mut tl = Timeline::default();
        tl.insert(booking(300, 400));
        tl.insert(booking(100, 200));
        tl.insert(booking(200, 300));
        assert_eq!(tl.bookings[0].span.start, 100);
        assert_eq!(tl.bookings[1].span.start, 200);
        assert_eq!(tl.bookings[2].span.start, 300);
    }

    #[test]
    fn timeline_remove() {
        let mut tl = Timeline::default();
        let b = booking(100, 200);
        let id = b.id;
        tl.insert(b);
        assert!(tl.get(&id).is_some());
        assert_eq!(tl.remove(id).map(|b| b.id), Some(id));
        assert!(tl.bookings.is_empty());
        assert!(tl.remove(id).is_none());
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut tl = Timeline::default();
        let bookings: Vec<_> = (0..3).map(|i| booking(i * 100, i * 100 + 50)).collect();
        let ids: Vec<Ulid> = bookings.iter().map(|b| b.id).collect();
        for b in bookings {
            tl.insert(b);
        }
        tl.remove(ids[1]);
        assert_eq!(tl.bookings.len(), 2);
        assert_eq!(tl.bookings[0].id, ids[0]);
        assert_eq!(tl.bookings[1].id, ids[2]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut tl = Timeline::default();
        tl.insert(booking(100, 200));
        tl.insert(booking(450, 600));
        tl.insert(booking(1000, 1100));

        let query = Span::new(500, 800);
        let hits: Vec<_> = tl.overlapping(&query).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut tl = Timeline::default();
        tl.insert(booking(100, 200));
        tl.insert(booking(300, 400));
        let query = Span::new(200, 300);
        assert_eq!(tl.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_single_ms_overlap() {
        let mut tl = Timeline::default();
        tl.insert(booking(100, 201));
        let query = Span::new(200, 300);
        assert_eq!(tl.overlapping(&query).count(), 1);
    }

    #[test]
    fn overlapping_long_booking_spanning_query() {
        let mut tl = Timeline::default();
        tl.insert(booking(0, 10_000));
        let query = Span::new(500, 600);
        assert_eq!(tl.overlapping(&query).count(), 1);
    }

    #[test]
    fn owned_by_filters_owner() {
        let mut tl = Timeline::default();
        let mine = booking(0, 10);
        let owner = mine.user_id;
        tl.insert(mine);
        tl.insert(booking(20, 30));
        assert_eq!(tl.owned_by(owner).count(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::BookingCreated {
            id: Ulid::new(),
            user_id: Ulid::new(),
            span: Span::new(1000, 2000),
            note: Some("ski week".into()),
            created_at: 42,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
