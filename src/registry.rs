//! In-memory user registry: tracks endpoints and their liveness.
//!
//! Grounded on `examples/original_source/backend/user_manager.py`
//! (`UserManager.register_user`/`generate_internal_ip`/`get_active_users`)
//! for the exact allocation and reaping semantics, and on the teacher
//! crate's `B2buaManager` for the manager-owns-a-`HashMap` shape. The
//! whole registry lives behind one `Mutex` rather than a lock-free map
//! (e.g. `dashmap`, as `eisenzopf-rvoip`'s `registrar-core` uses)
//! because SPEC_FULL §5 asks for every public operation to be an
//! atomic step, and a single coarse lock gets that for free.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::audit::AuditBus;
use crate::clock::{Clock, MonoTime};
use crate::error::RegistryError;

/// Address pool bounds (SPEC_FULL §4.2 / spec.md §9 open question,
/// resolved as `[10, 254]`).
const ADDRESS_POOL_LOW: u8 = 10;
const ADDRESS_POOL_HIGH: u8 = 254;
const BASE_SIP_PORT: u16 = 5060;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserStatus {
    Online,
    Busy,
    Offline,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Busy => "busy",
            UserStatus::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub extension: String,
    pub internal_address: String,
    pub sip_port: u16,
    pub registered_at: MonoTime,
    pub last_heartbeat: MonoTime,
    pub status: UserStatus,
}

struct Inner {
    users: HashMap<String, User>,
    used_suffixes: HashSet<u8>,
    pool_cursor: u8,
}

/// Returns `Err` unless `extension` matches `^[0-9]{3,}$`.
pub fn validate_extension(extension: &str) -> Result<(), RegistryError> {
    if extension.len() >= 3 && extension.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(RegistryError::InvalidExtension(extension.to_string()))
    }
}

pub struct UserRegistry {
    inner: Mutex<Inner>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                users: HashMap::new(),
                used_suffixes: HashSet::new(),
                // Starts one below the pool floor so the first
                // allocation lands on ADDRESS_POOL_LOW.
                pool_cursor: ADDRESS_POOL_LOW - 1,
            }),
        }
    }

    /// Register (or refresh) a user. Returns the existing record with
    /// a bumped heartbeat if already present, else allocates a fresh
    /// address/port (SPEC_FULL §4.2).
    pub fn register(&self, extension: &str, clock: &dyn Clock) -> Result<User, RegistryError> {
        validate_extension(extension)?;
        let now = clock.now();
        let mut inner = self.inner.lock().unwrap();

        if let Some(user) = inner.users.get_mut(extension) {
            user.last_heartbeat = now;
            user.status = UserStatus::Online;
            return Ok(user.clone());
        }

        let suffix = allocate_suffix(&mut inner)?;
        let sip_port = BASE_SIP_PORT + inner.users.len() as u16;
        let user = User {
            extension: extension.to_string(),
            internal_address: format!("192.168.100.{}", suffix),
            sip_port,
            registered_at: now,
            last_heartbeat: now,
            status: UserStatus::Online,
        };
        inner.users.insert(extension.to_string(), user.clone());
        Ok(user)
    }

    /// Update `last_heartbeat` for `extension` if it exists. Emits
    /// `HEARTBEAT_RECEIVED` with the old and new timestamps
    /// regardless of outcome being observed by a caller, per
    /// SPEC_FULL §4.2.
    pub fn heartbeat(&self, extension: &str, clock: &dyn Clock, audit: &AuditBus) -> bool {
        let now = clock.now();
        let mut inner = self.inner.lock().unwrap();
        match inner.users.get_mut(extension) {
            Some(user) => {
                let old = user.last_heartbeat;
                user.last_heartbeat = now;
                if user.status == UserStatus::Offline {
                    user.status = UserStatus::Online;
                }
                drop(inner);
                audit.publish(crate::audit::AuditEvent::new(
                    now,
                    "HEARTBEAT_RECEIVED",
                    [
                        ("extension".to_string(), extension.to_string()),
                        ("old_heartbeat_ms".to_string(), old.0.to_string()),
                        ("new_heartbeat_ms".to_string(), now.0.to_string()),
                    ],
                ));
                true
            }
            None => false,
        }
    }

    /// Snapshot of users whose heartbeat is within `timeout_sec`.
    /// Users exceeding the threshold are flipped to `Offline`, with a
    /// debounced `USER_TIMED_OUT` event (at most once per transition).
    pub fn active(&self, timeout_sec: u64, clock: &dyn Clock, audit: &AuditBus) -> Vec<User> {
        let now = clock.now();
        let timeout_ms = timeout_sec.saturating_mul(1000);
        let mut inner = self.inner.lock().unwrap();
        let mut timed_out = Vec::new();
        let mut active = Vec::new();

        for user in inner.users.values_mut() {
            let idle_ms = now.saturating_sub(user.last_heartbeat);
            if idle_ms > timeout_ms {
                if user.status != UserStatus::Offline {
                    user.status = UserStatus::Offline;
                    timed_out.push(user.extension.clone());
                }
            } else {
                active.push(user.clone());
            }
        }
        drop(inner);

        for extension in timed_out {
            audit.publish(crate::audit::AuditEvent::new(
                now,
                "USER_TIMED_OUT",
                [("extension".to_string(), extension)],
            ));
        }
        active
    }

    pub fn get(&self, extension: &str) -> Option<User> {
        self.inner.lock().unwrap().users.get(extension).cloned()
    }

    pub fn all(&self) -> Vec<User> {
        self.inner.lock().unwrap().users.values().cloned().collect()
    }

    /// Mark a user `Busy` because they now appear in an active
    /// dialog, or drop them back to `Online` when the dialog ends
    /// (SPEC_FULL §3: `status = busy ⇒ user appears in some active dialog`).
    pub fn set_busy(&self, extension: &str, busy: bool) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.get_mut(extension) {
            if user.status != UserStatus::Offline {
                user.status = if busy { UserStatus::Busy } else { UserStatus::Online };
            }
        }
    }
}

impl Default for UserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn allocate_suffix(inner: &mut Inner) -> Result<u8, RegistryError> {
    let mut attempts = 0u16;
    loop {
        inner.pool_cursor = if inner.pool_cursor >= ADDRESS_POOL_HIGH {
            1
        } else {
            inner.pool_cursor + 1
        };
        if !inner.used_suffixes.contains(&inner.pool_cursor) {
            inner.used_suffixes.insert(inner.pool_cursor);
            return Ok(inner.pool_cursor);
        }
        attempts += 1;
        if attempts > 254 {
            return Err(RegistryError::AddressPoolExhausted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn first_two_registrations_get_expected_addresses_and_ports() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        let first = registry.register("200", &clock).unwrap();
        assert_eq!(first.internal_address, "192.168.100.10");
        assert_eq!(first.sip_port, 5060);

        let second = registry.register("201", &clock).unwrap();
        assert_eq!(second.internal_address, "192.168.100.11");
        assert_eq!(second.sip_port, 5061);
    }

    #[test]
    fn re_registering_preserves_address_and_port() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        let first = registry.register("200", &clock).unwrap();
        clock.advance(5_000);
        let again = registry.register("200", &clock).unwrap();
        assert_eq!(first.internal_address, again.internal_address);
        assert_eq!(first.sip_port, again.sip_port);
        assert_eq!(again.last_heartbeat, MonoTime(5_000));
    }

    #[test]
    fn rejects_short_or_non_numeric_extension() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        assert!(registry.register("99", &clock).is_err());
        assert!(registry.register("abc", &clock).is_err());
    }

    #[test]
    fn reaper_flips_stale_user_offline_and_active_excludes_them() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        let bus = AuditBus::new(16);
        registry.register("200", &clock).unwrap();
        clock.advance(31_000);
        let active = registry.active(30, &clock, &bus);
        assert!(active.is_empty());
        assert_eq!(registry.get("200").unwrap().status, UserStatus::Offline);
    }

    #[test]
    fn heartbeat_within_window_never_goes_offline() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        let bus = AuditBus::new(16);
        registry.register("200", &clock).unwrap();
        clock.advance(20_000);
        assert!(registry.heartbeat("200", &clock, &bus));
        clock.advance(20_000);
        let active = registry.active(30, &clock, &bus);
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn heartbeat_for_unknown_extension_returns_false() {
        let registry = UserRegistry::new();
        let clock = FakeClock::new();
        let bus = AuditBus::new(16);
        assert!(!registry.heartbeat("999", &clock, &bus));
    }
}
