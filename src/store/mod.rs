mod json;
mod sqlite;

pub use json::JsonStore;
pub use sqlite::SqliteStore;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    sched::Scheduler,
    util::{day_ordinal, fnv32a, now_ts},
};

pub const RANK_ADMIN: i32 = 100;
pub const RANK_MOD: i32 = 10;
pub const RANK_USER: i32 = 0;
pub const RANK_BANNED: i32 = -10;

pub fn rank_name(rank: i32) -> &'static str {
    match rank {
        RANK_ADMIN => "admin",
        RANK_MOD => "mod",
        RANK_USER => "user",
        RANK_BANNED => "banned",
        _ => "?",
    }
}

// Cooldown ladder in minutes for warnings 0..5, then linear:
// 3d steps starting at 7d.
const COOLDOWN_LADDER_MIN: [i64; 6] = [1, 5, 25, 120, 720, 4320];
const COOLDOWN_LINEAR_M: i64 = 4320;
const COOLDOWN_LINEAR_B: i64 = 10080;

pub const WARN_EXPIRE_SECS: i64 = 7 * 24 * 3600;
pub const KARMA_PLUS_ONE: i64 = 1;
pub const KARMA_WARN_PENALTY: i64 = 10;
pub const MOTD_REMIND_DAYS: i64 = 181;

/// A lounge participant, persisted forever once created (blacklisting
/// keeps the row). All instants are unix epoch seconds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub realname: String,
    pub rank: i32,
    pub joined: i64,
    pub left: Option<i64>,
    pub last_active: i64,
    pub cooldown_until: Option<i64>,
    pub blacklist_reason: Option<String>,
    pub warnings: u32,
    pub warn_expiry: Option<i64>,
    pub karma: i64,
    pub hide_karma: bool,
    pub debug_enabled: bool,
    #[serde(default)]
    pub tripcode: Option<String>,
}

impl User {
    pub fn new(id: i64, now: i64) -> Self {
        Self {
            id,
            username: None,
            realname: String::new(),
            rank: RANK_USER,
            joined: now,
            left: None,
            last_active: now,
            cooldown_until: None,
            blacklist_reason: None,
            warnings: 0,
            warn_expiry: None,
            karma: 0,
            hide_karma: false,
            debug_enabled: false,
            tripcode: None,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.left.is_none()
    }

    pub fn is_blacklisted(&self) -> bool {
        self.rank < 0
    }

    pub fn is_in_cooldown(&self, now: i64) -> bool {
        matches!(self.cooldown_until, Some(until) if until >= now)
    }

    pub fn formatted_name(&self) -> String {
        match &self.username {
            Some(name) => format!("@{name}"),
            None => self.realname.clone(),
        }
    }

    /// Daily-rotating 4-character base-32 id shown in place of the real
    /// one. Without a salt it is a masked multiply with the day ordinal;
    /// with one, FNV-1a mixes the salt in.
    pub fn obfuscated_id(&self, salt: &[u8]) -> String {
        self.obfuscated_id_at(day_ordinal(now_ts()), salt)
    }

    pub(crate) fn obfuscated_id_at(&self, day: i64, salt: &[u8]) -> String {
        let mut mult = day;
        if mult & 0xff == 0 {
            // zero bits are bad for hashing
            mult >>= 8;
        }
        let value = if salt.is_empty() {
            self.id.unsigned_abs().wrapping_mul(mult as u64) & 0xff_ffff
        } else {
            fnv32a(&[self.id, day], salt) as u64 & 0xff_ffff
        };
        const ALPHA: &[u8] = b"0123456789abcdefghijklmnopqrstuv";
        [value, value >> 5, value >> 10, value >> 15]
            .iter()
            .map(|n| ALPHA[(n % 32) as usize] as char)
            .collect()
    }

    /// Karma rounded to the nearest bracket so moderators can gauge a user
    /// without identifying them by an exact number.
    pub fn obfuscated_karma(&self) -> i64 {
        for cutoff in [100, 50, 10] {
            if self.karma.abs() >= cutoff {
                return self.karma.clamp(-cutoff, cutoff);
            }
        }
        0
    }

    /// Delivery priority: higher rank first, then recently active first.
    /// Lower value means higher priority.
    pub fn message_priority(&self, now: i64) -> u64 {
        let inactive_min = ((now - self.last_active).max(0) / 60) as u64;
        let class = (RANK_ADMIN - self.rank.max(0)).max(0) as u64;
        class << 16 | inactive_min.min(0xffff)
    }

    pub fn set_left(&mut self, left: bool, now: i64) {
        self.left = left.then_some(now);
    }

    pub fn set_blacklisted(&mut self, reason: Option<String>, now: i64) {
        self.set_left(true, now);
        self.rank = RANK_BANNED;
        self.blacklist_reason = reason;
    }

    /// Issues a warning: puts the user in cooldown for the next ladder
    /// step and schedules the warning to expire in a week. Returns the
    /// cooldown duration in seconds.
    pub fn add_warning(&mut self, now: i64) -> i64 {
        let w = self.warnings as i64;
        let minutes = match COOLDOWN_LADDER_MIN.get(self.warnings as usize) {
            Some(m) => *m,
            None => COOLDOWN_LINEAR_M * (w - COOLDOWN_LADDER_MIN.len() as i64) + COOLDOWN_LINEAR_B,
        };
        let duration = minutes * 60;
        self.cooldown_until = Some(now + duration);
        self.warnings += 1;
        self.warn_expiry = Some(now + WARN_EXPIRE_SECS);
        duration
    }

    pub fn remove_warning(&mut self, now: i64) {
        self.warnings = self.warnings.saturating_sub(1);
        self.warn_expiry = (self.warnings > 0).then_some(now + WARN_EXPIRE_SECS);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub privacy: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user not found")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] sonic_rs::Error),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Persistent user and system-config storage. Implementations serialize
/// all access behind an internal lock; `modify_*` holds it for the whole
/// read-mutate-persist cycle so concurrent modifications cannot interleave.
pub trait UserStore: Send + Sync {
    fn get_user(&self, id: i64) -> Result<User, StoreError>;
    fn add_user(&self, user: &User) -> Result<(), StoreError>;
    /// Copy of every user row. Callers iterate the copy so no store lock
    /// is held while they take other locks.
    fn users(&self) -> Result<Vec<User>, StoreError>;
    fn user_ids(&self) -> Result<Vec<i64>, StoreError>;
    /// Atomic read-modify-write; returns the persisted user.
    fn modify_user(&self, id: i64, f: &mut dyn FnMut(&mut User)) -> Result<User, StoreError>;
    fn get_system_config(&self) -> Result<Option<SystemConfig>, StoreError>;
    fn set_system_config(&self, config: &SystemConfig) -> Result<(), StoreError>;
    fn modify_system_config(&self, f: &mut dyn FnMut(&mut SystemConfig)) -> Result<(), StoreError>;
    /// Lets the backend install periodic maintenance (e.g. commit flushes).
    fn register_tasks(self: Arc<Self>, sched: &mut Scheduler);
    fn close(&self);
}
