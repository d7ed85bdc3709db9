use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use log::debug;

use crate::util::now_ts;

pub const MESSAGE_EXPIRE_SECS: i64 = 24 * 3600;

/// Internal id of a relayed message, shared by all per-recipient copies.
pub type Msid = u64;

/// Telegram-side message id of one delivered copy.
pub type ExternalId = i32;

/// Ephemeral metadata for one relayed message.
pub struct CachedMessage {
    /// Author, or None for system messages visible to many recipients.
    pub user_id: Option<i64>,
    pub time: i64,
    /// A moderator warning has been issued for this message.
    pub warned: bool,
    /// Already collected by a /cleanup pass.
    pub cleanup_seen: bool,
    upvoted: HashSet<i64>,
}

impl CachedMessage {
    pub fn new(user_id: Option<i64>) -> Self {
        Self {
            user_id,
            time: now_ts(),
            warned: false,
            cleanup_seen: false,
            upvoted: HashSet::new(),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.time + MESSAGE_EXPIRE_SECS
    }

    pub fn has_upvoted(&self, uid: i64) -> bool {
        self.upvoted.contains(&uid)
    }

    pub fn add_upvote(&mut self, uid: i64) {
        self.upvoted.insert(uid);
    }

    pub fn upvote_count(&self) -> usize {
        self.upvoted.len()
    }
}

struct Inner {
    counter: Msid,
    msgs: HashMap<Msid, CachedMessage>,
    idmap: HashMap<i64, HashMap<Msid, ExternalId>>,
}

/// In-memory mapping between msids, their metadata and the external message
/// ids each recipient got. All access goes through closure-style accessors
/// so the internal lock is never held across calls into other subsystems.
pub struct Cache {
    inner: Mutex<Inner>,
}

impl Cache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                counter: 0,
                msgs: HashMap::new(),
                idmap: HashMap::new(),
            }),
        }
    }

    /// Allocates a fresh msid for `cm`. Msids are never reused within a
    /// process lifetime.
    pub fn assign_message_id(&self, cm: CachedMessage) -> Msid {
        let mut inner = self.inner.lock().unwrap();
        let msid = inner.counter;
        inner.counter += 1;
        inner.msgs.insert(msid, cm);
        msid
    }

    /// Runs `f` on the cached message, if present. The closure must not
    /// call back into the cache.
    pub fn with_message<R>(&self, msid: Msid, f: impl FnOnce(&mut CachedMessage) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.msgs.get_mut(&msid).map(f)
    }

    /// Visits every cached message under the lock. The visitor may mutate
    /// entries in place but must not call back into the cache.
    pub fn iterate(&self, mut f: impl FnMut(Msid, &mut CachedMessage)) {
        let mut inner = self.inner.lock().unwrap();
        for (msid, cm) in inner.msgs.iter_mut() {
            f(*msid, cm);
        }
    }

    pub fn save_mapping(&self, uid: i64, msid: Msid, data: ExternalId) {
        let mut inner = self.inner.lock().unwrap();
        inner.idmap.entry(uid).or_default().insert(msid, data);
    }

    pub fn lookup_by_msid(&self, uid: i64, msid: Msid) -> Option<ExternalId> {
        let inner = self.inner.lock().unwrap();
        inner.idmap.get(&uid)?.get(&msid).copied()
    }

    /// Reverse lookup by external id. Linear in the user's submap, which
    /// stays small thanks to expiry.
    pub fn lookup_by_data(&self, uid: i64, data: ExternalId) -> Option<Msid> {
        let inner = self.inner.lock().unwrap();
        let submap = inner.idmap.get(&uid)?;
        submap
            .iter()
            .find(|(_, ext)| **ext == data)
            .map(|(msid, _)| *msid)
    }

    /// Removes `msid` from every user's submap.
    pub fn delete_mappings(&self, msid: Msid) {
        let mut inner = self.inner.lock().unwrap();
        for submap in inner.idmap.values_mut() {
            submap.remove(&msid);
        }
    }

    /// Drops every expired message together with its mappings and returns
    /// the affected msids so callers can purge queued work.
    pub fn expire(&self) -> Vec<Msid> {
        let now = now_ts();
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<Msid> = inner
            .msgs
            .iter()
            .filter(|(_, cm)| cm.is_expired(now))
            .map(|(msid, _)| *msid)
            .collect();
        for msid in &expired {
            inner.msgs.remove(msid);
            for submap in inner.idmap.values_mut() {
                submap.remove(msid);
            }
        }
        if !expired.is_empty() {
            debug!("Expired {} entries from cache", expired.len());
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}
