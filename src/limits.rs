use crate::model::Ms;

const DAY_MS: Ms = 86_400_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_BOOKING_DURATION_MS: Ms = 366 * DAY_MS;
pub const MAX_QUERY_WINDOW_MS: Ms = 5 * 366 * DAY_MS;

pub const MAX_USERS: usize = 10_000;
pub const MAX_BOOKINGS: usize = 100_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;
pub const MAX_NOTE_LEN: usize = 4096;

pub const MIN_PASSWORD_LEN: usize = 6;
/// bcrypt ignores input past 72 bytes.
pub const MAX_PASSWORD_LEN: usize = 72;
