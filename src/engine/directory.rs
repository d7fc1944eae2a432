use tracing::{info, warn};
use ulid::Ulid;

use crate::auth::{hash_password_blocking, verify_password_blocking};
use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

fn validate_profile(name: &str, email: &str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if !email.contains('@') {
        return Err(EngineError::Validation("email must contain '@'"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    Ok(())
}

fn require_admin(principal: &Principal) -> Result<(), EngineError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(EngineError::Forbidden("administrator role required"))
    }
}

impl Engine {
    /// Create a Standard user. The password is hashed on the blocking pool
    /// before the write lock is taken.
    pub async fn register_user(
        &self,
        id: Ulid,
        name: String,
        email: String,
        password: &str,
    ) -> Result<UserInfo, EngineError> {
        validate_profile(&name, &email)?;
        let password_hash = hash_password_blocking(password.to_owned(), self.bcrypt_cost).await?;

        let mut guard = self.state.write().await;
        self.insert_user(&mut guard, id, name, email, password_hash, Role::Standard)
            .await
    }

    async fn insert_user(
        &self,
        state: &mut HouseState,
        id: Ulid,
        name: String,
        email: String,
        password_hash: String,
        role: Role,
    ) -> Result<UserInfo, EngineError> {
        if state.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if state.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("user {id}")));
        }
        if state.emails.contains_key(&email) {
            return Err(EngineError::AlreadyExists(format!("email {email}")));
        }

        let event = Event::UserRegistered {
            id,
            name,
            email,
            password_hash,
            role,
            created_at: now_ms(),
        };
        self.persist_and_apply(state, &event).await?;

        let user = state
            .users
            .get(&id)
            .map(UserInfo::from)
            .ok_or(EngineError::NotFound(id))?;
        info!(user = %id, role = %role, "user registered");
        Ok(user)
    }

    /// Unknown email and wrong password both yield `Unauthorized`.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<UserInfo, EngineError> {
        let candidate = {
            let guard = self.state.read().await;
            guard
                .user_by_email(email)
                .map(|u| (UserInfo::from(u), u.password_hash.clone()))
        };
        // Verify outside the lock.
        let verified = match candidate {
            Some((user, hash)) if verify_password_blocking(password.to_owned(), hash.clone()).await => {
                Some(user)
            }
            _ => None,
        };
        verified.ok_or_else(|| {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            EngineError::Unauthorized
        })
    }

    /// Idempotent administrator seeding. If any administrator exists this is
    /// a no-op returning the oldest one; otherwise the user with `email` is
    /// promoted, or created as an administrator.
    pub async fn ensure_admin(
        &self,
        name: String,
        email: String,
        password: &str,
    ) -> Result<UserInfo, EngineError> {
        validate_profile(&name, &email)?;
        let password_hash = hash_password_blocking(password.to_owned(), self.bcrypt_cost).await?;

        // Check and insert under one write lock so concurrent seedings agree.
        let mut guard = self.state.write().await;
        if let Some(admin) = guard
            .users
            .values()
            .filter(|u| u.role == Role::Administrator)
            .min_by_key(|u| (u.created_at, u.id))
        {
            return Ok(UserInfo::from(admin));
        }
        if let Some(id) = guard.user_by_email(&email).map(|u| u.id) {
            let event = Event::UserRoleChanged {
                id,
                role: Role::Administrator,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            info!(user = %id, "promoted existing user to administrator");
            return guard
                .users
                .get(&id)
                .map(UserInfo::from)
                .ok_or(EngineError::NotFound(id));
        }

        let admin = self
            .insert_user(&mut guard, Ulid::new(), name, email, password_hash, Role::Administrator)
            .await?;
        warn!(user = %admin.id, email = %admin.email, "seeded initial administrator");
        Ok(admin)
    }

    pub async fn principal(&self, user_id: Ulid) -> Option<Principal> {
        let guard = self.state.read().await;
        guard.users.get(&user_id).map(|u| Principal {
            user_id: u.id,
            role: u.role,
        })
    }

    pub async fn get_user(&self, user_id: Ulid) -> Option<UserInfo> {
        let guard = self.state.read().await;
        guard.users.get(&user_id).map(UserInfo::from)
    }

    /// All users with their booking counts, oldest first.
    pub async fn list_users(&self, principal: &Principal) -> Result<Vec<UserSummary>, EngineError> {
        require_admin(principal)?;
        let guard = self.state.read().await;
        let mut users: Vec<UserSummary> = guard
            .users
            .values()
            .map(|u| UserSummary {
                user: UserInfo::from(u),
                booking_count: guard.timeline.owned_by(u.id).count(),
            })
            .collect();
        users.sort_by_key(|s| (s.user.created_at, s.user.id));
        Ok(users)
    }

    /// Remove a user and every booking they own.
    pub async fn delete_user(&self, principal: &Principal, target: Ulid) -> Result<(), EngineError> {
        require_admin(principal)?;
        let mut guard = self.state.write().await;
        let role = guard
            .users
            .get(&target)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(target))?;
        if target == principal.user_id {
            return Err(EngineError::Forbidden("cannot delete your own account"));
        }
        if role == Role::Administrator && guard.admin_count() < 2 {
            return Err(EngineError::Forbidden("cannot delete the last administrator"));
        }

        let removed = guard.timeline.owned_by(target).count();
        self.persist_and_apply(&mut guard, &Event::UserDeleted { id: target })
            .await?;
        info!(user = %target, bookings = removed, "user deleted");
        Ok(())
    }

    pub async fn change_role(
        &self,
        principal: &Principal,
        target: Ulid,
        role: Role,
    ) -> Result<UserInfo, EngineError> {
        require_admin(principal)?;
        let mut guard = self.state.write().await;
        let current = guard
            .users
            .get(&target)
            .map(|u| u.role)
            .ok_or(EngineError::NotFound(target))?;
        if target == principal.user_id {
            return Err(EngineError::Forbidden("cannot change your own role"));
        }
        if current == Role::Administrator && role == Role::Standard && guard.admin_count() < 2 {
            return Err(EngineError::Forbidden("cannot demote the last administrator"));
        }

        if current != role {
            self.persist_and_apply(&mut guard, &Event::UserRoleChanged { id: target, role })
                .await?;
            info!(user = %target, role = %role, "role changed");
        }
        guard
            .users
            .get(&target)
            .map(UserInfo::from)
            .ok_or(EngineError::NotFound(target))
    }

    /// Counts as of `now`: a booking is active while `end > now`.
    pub async fn stats(&self, principal: &Principal, now: Ms) -> Result<Stats, EngineError> {
        require_admin(principal)?;
        let guard = self.state.read().await;
        let active = guard
            .timeline
            .bookings
            .iter()
            .filter(|b| b.span.end > now)
            .count();
        let total = guard.timeline.bookings.len();
        Ok(Stats {
            total_users: guard.users.len(),
            total_bookings: total,
            active_bookings: active,
            past_bookings: total - active,
        })
    }
}
