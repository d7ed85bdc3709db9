use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::Context;
use log::{info, warn};

use crate::{
    cache::{Cache, CachedMessage, Msid},
    config::Config,
    replies::Reply,
    score::{ScoreKeeper, SPAM_INTERVAL_SECS},
    sched::Scheduler,
    stats::{Counter, Stats},
    store::{
        rank_name, StoreError, SystemConfig, User, UserStore, KARMA_PLUS_ONE, KARMA_WARN_PENALTY,
        MOTD_REMIND_DAYS, RANK_ADMIN, RANK_MOD,
    },
    util::now_ts,
};

const WARN_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Minimal identity of whoever triggered an event, as seen by the
/// transport. The core resolves this against the store itself.
pub struct UserContainer {
    pub id: i64,
    pub username: Option<String>,
    pub realname: String,
}

/// Outbound actions the core can ask of the transport adapter. All three
/// only enqueue work, so they are safe to call while no locks are held.
pub trait Sender: Send + Sync {
    /// `who` None means broadcast to everyone except `except_who`
    /// (who still gets it with debug mode on).
    fn reply(
        &self,
        m: Reply,
        msid: Option<Msid>,
        who: Option<&User>,
        except_who: Option<i64>,
        reply_to: Option<Msid>,
    );
    fn delete(&self, msids: &[Msid]);
    fn stop_invoked(&self, user: &User, delete_out: bool);
}

#[derive(Default, Clone, Copy)]
pub struct MessageFlags {
    pub is_media: bool,
    pub signed: bool,
    pub tripcode: bool,
}

#[derive(Clone, Copy, PartialEq)]
pub enum SystemText {
    Motd,
    Privacy,
}

impl SystemText {
    fn name(self) -> &'static str {
        match self {
            SystemText::Motd => "motd",
            SystemText::Privacy => "privacy",
        }
    }
}

/// The command engine: every user-visible operation of the lounge lives
/// here, decoupled from Telegram through `UserContainer` on the way in and
/// `Reply`/`Sender` on the way out.
pub struct Core {
    blacklist_contact: String,
    enable_signing: bool,
    allow_remove_command: bool,
    media_limit_secs: Option<i64>,
    sign_interval_secs: i64,
    salt: Vec<u8>,
    store: Arc<dyn UserStore>,
    cache: Arc<Cache>,
    scores: Arc<ScoreKeeper>,
    sender: OnceLock<Arc<dyn Sender>>,
    sign_last_used: Mutex<HashMap<i64, i64>>,
    active_users: Arc<Mutex<HashMap<i64, i64>>>,
    warnings_given: Counter,
    karma_given: Counter,
}

impl Core {
    pub fn new(
        config: &Config,
        store: Arc<dyn UserStore>,
        cache: Arc<Cache>,
        scores: Arc<ScoreKeeper>,
        stats: &Stats,
    ) -> anyhow::Result<Arc<Self>> {
        let salt = match &config.secret_salt {
            Some(s) => hex::decode(s).context("secret_salt is not valid hex")?,
            None => Vec::new(),
        };
        let core = Arc::new(Self {
            blacklist_contact: config.blacklist_contact.clone(),
            enable_signing: config.enable_signing,
            allow_remove_command: config.allow_remove_command,
            media_limit_secs: config.media_limit_period.map(|h| h as i64 * 3600),
            sign_interval_secs: config.sign_limit_interval as i64,
            salt,
            store,
            cache,
            scores,
            sender: OnceLock::new(),
            sign_last_used: Mutex::new(HashMap::new()),
            active_users: Arc::new(Mutex::new(HashMap::new())),
            warnings_given: stats.counter("warnings_given"),
            karma_given: stats.counter("karma_given"),
        });

        if core.store.get_system_config()?.is_none() {
            core.store.set_system_config(&SystemConfig::default())?;
        }

        let active = core.active_users.clone();
        stats.register_source(move |out| {
            let now = now_ts();
            let map = active.lock().unwrap();
            for (key, window) in [
                ("active_users_15m", 15 * 60),
                ("active_users_2h", 2 * 3600),
                ("active_users_12h", 12 * 3600),
            ] {
                let n = map.values().filter(|t| now - **t <= window).count();
                out.insert(key.into(), n as i64);
            }
        });

        Ok(core)
    }

    pub fn register_receiver(&self, sender: Arc<dyn Sender>) {
        if self.sender.set(sender).is_err() {
            panic!("receiver registered twice");
        }
    }

    fn sender(&self) -> &Arc<dyn Sender> {
        self.sender.get().expect("no receiver registered")
    }

    pub fn register_tasks(self: &Arc<Self>, sched: &mut Scheduler) {
        let scores = self.scores.clone();
        sched.register(
            Duration::from_secs(SPAM_INTERVAL_SECS),
            "spam score decay",
            move || {
                scores.decay();
                Ok(())
            },
        );
        let this = self.clone();
        sched.register(WARN_SWEEP_INTERVAL, "warning expiry", move || {
            this.expire_warnings()
        });
    }

    fn expire_warnings(&self) -> anyhow::Result<()> {
        let now = now_ts();
        for user in self.store.users()? {
            if !user.is_joined() {
                continue;
            }
            if matches!(user.warn_expiry, Some(t) if now >= t) {
                self.store
                    .modify_user(user.id, &mut |u| u.remove_warning(now))?;
            }
        }
        // signing timestamps past the rate-limit window are dead weight
        let cutoff = now - self.sign_interval_secs;
        self.sign_last_used.lock().unwrap().retain(|_, t| *t > cutoff);
        Ok(())
    }

    // -- caller resolution --------------------------------------------------

    fn update_user_from_event(&self, user: &mut User, c: &UserContainer) {
        user.username = c.username.clone();
        user.realname = c.realname.clone();
        user.last_active = now_ts();
        if user.is_joined() {
            self.active_users
                .lock()
                .unwrap()
                .insert(user.id, user.last_active);
        }
    }

    fn err_blacklisted(&self, user: &User) -> Reply {
        Reply::ErrBlacklisted {
            reason: user.blacklist_reason.clone(),
            contact: self.blacklist_contact.clone(),
        }
    }

    /// Resolves the event identity to a joined user, refreshing their
    /// store entry on the way. Every command goes through this first.
    fn resolve_user(&self, c: &UserContainer) -> Result<User, Reply> {
        let user = match self.store.get_user(c.id) {
            Ok(user) => user,
            Err(StoreError::NotFound) => return Err(Reply::UserNotInChat),
            Err(err) => {
                warn!("User lookup failed for {}: {err}", c.id);
                return Err(Reply::UserNotInChat);
            }
        };
        let user = match self
            .store
            .modify_user(user.id, &mut |u| self.update_user_from_event(u, c))
        {
            Ok(user) => user,
            Err(err) => {
                warn!("User update failed for {}: {err}", c.id);
                return Err(Reply::UserNotInChat);
            }
        };
        if user.is_blacklisted() {
            return Err(self.err_blacklisted(&user));
        }
        if !user.is_joined() {
            return Err(Reply::UserNotInChat);
        }
        Ok(user)
    }

    fn get_user_logged(&self, id: i64) -> Option<User> {
        match self.store.get_user(id) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!("User lookup failed for {id}: {err}");
                None
            }
        }
    }

    fn modify_user_logged(&self, id: i64, f: &mut dyn FnMut(&mut User)) -> Option<User> {
        match self.store.modify_user(id, f) {
            Ok(user) => Some(user),
            Err(err) => {
                warn!("User update failed for {id}: {err}");
                None
            }
        }
    }

    fn find_user_by_name(&self, username: &str) -> Option<User> {
        let username = username.trim_start_matches('@').to_lowercase();
        self.store.users().ok()?.into_iter().find(|u| {
            u.is_joined()
                && u.username
                    .as_deref()
                    .is_some_and(|n| n.to_lowercase() == username)
        })
    }

    fn find_user_by_oid(&self, oid: &str) -> Option<User> {
        self.store
            .users()
            .ok()?
            .into_iter()
            .find(|u| u.is_joined() && u.obfuscated_id(&self.salt) == oid)
    }

    fn motd(&self) -> String {
        self.store
            .get_system_config()
            .ok()
            .flatten()
            .map(|c| c.motd)
            .unwrap_or_default()
    }

    /// System messages: `who` targets a single user; a broadcast gets its
    /// own msid so recipients can reply to it.
    fn push_system_message(
        &self,
        m: Reply,
        who: Option<&User>,
        except_who: Option<i64>,
        reply_to: Option<Msid>,
    ) {
        let msid = match who {
            None => Some(self.cache.assign_message_id(CachedMessage::new(None))),
            Some(_) => None,
        };
        self.sender().reply(m, msid, who, except_who, reply_to);
    }

    // -- membership ---------------------------------------------------------

    pub fn user_join(&self, c: &UserContainer) -> Vec<Reply> {
        let now = now_ts();
        let user = match self.store.get_user(c.id) {
            Ok(user) => Some(user),
            Err(StoreError::NotFound) => None,
            Err(err) => {
                warn!("User lookup failed for {}: {err}", c.id);
                return Vec::new();
            }
        };

        if let Some(user) = user {
            let err = if user.is_blacklisted() {
                Some(self.err_blacklisted(&user))
            } else if user.is_joined() {
                Some(Reply::UserInChat)
            } else {
                None
            };
            if let Some(err) = err {
                let _ = self.modify_user_logged(user.id, &mut |u| self.update_user_from_event(u, c));
                return vec![err];
            }

            // user rejoins
            let absence = now - user.left.unwrap_or(now);
            let Some(user) = self.modify_user_logged(user.id, &mut |u| {
                self.update_user_from_event(u, c);
                u.set_left(false, now);
            }) else {
                return Vec::new();
            };
            info!("{} rejoined chat", user.formatted_name());
            let mut ret = vec![Reply::ChatJoin];
            let motd = self.motd();
            if !motd.is_empty() && absence >= MOTD_REMIND_DAYS * 86400 {
                ret.push(Reply::Custom { text: motd });
            }
            return ret;
        }

        // create a new user; the very first one becomes admin
        let mut user = User::new(c.id, now);
        user.username = c.username.clone();
        user.realname = c.realname.clone();
        if self.store.user_ids().map(|v| v.is_empty()).unwrap_or(false) {
            user.rank = RANK_ADMIN;
        }
        if let Err(err) = self.store.add_user(&user) {
            warn!("Failed to add user {}: {err}", user.id);
            return Vec::new();
        }
        self.active_users.lock().unwrap().insert(user.id, now);
        info!("{} joined chat", user.formatted_name());
        let mut ret = vec![Reply::ChatJoin];
        let motd = self.motd();
        if !motd.is_empty() {
            ret.push(Reply::Custom { text: motd });
        }
        ret
    }

    pub fn user_leave(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        self.force_user_leave(user.id, false);
        info!("{} left chat", user.formatted_name());
        Some(Reply::ChatLeave)
    }

    /// Marks the user as left and drops their queued traffic. Also invoked
    /// by the relay when Telegram reports the user gone.
    pub fn force_user_leave(&self, user_id: i64, blocked: bool) {
        let Some(user) = self.modify_user_logged(user_id, &mut |u| u.set_left(true, now_ts()))
        else {
            return;
        };
        if blocked {
            warn!(
                "Force leaving {} because bot is blocked",
                user.formatted_name()
            );
        }
        self.sender().stop_invoked(&user, false);
    }

    // -- informational ------------------------------------------------------

    pub fn get_info(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        let now = now_ts();
        Some(Reply::UserInfo {
            oid: user.obfuscated_id(&self.salt),
            username: user.formatted_name(),
            rank: user.rank,
            rank_name: rank_name(user.rank),
            karma: user.karma,
            warnings: user.warnings,
            warn_expiry: user.warn_expiry,
            cooldown: user.is_in_cooldown(now).then(|| user.cooldown_until).flatten(),
        })
    }

    pub fn get_info_mod(&self, c: &UserContainer, msid: Msid) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_MOD {
            return None;
        }
        let author_id = self.cache.with_message(msid, |cm| cm.user_id).flatten()?;
        let author = self.get_user_logged(author_id)?;
        let now = now_ts();
        Some(Reply::UserInfoMod {
            oid: author.obfuscated_id(&self.salt),
            karma: author.obfuscated_karma(),
            cooldown: author
                .is_in_cooldown(now)
                .then(|| author.cooldown_until)
                .flatten(),
        })
    }

    pub fn get_users(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        let users = match self.store.users() {
            Ok(users) => users,
            Err(err) => {
                warn!("User iteration failed: {err}");
                return None;
            }
        };
        if user.rank < RANK_MOD {
            let count = users.iter().filter(|u| u.is_joined()).count();
            return Some(Reply::UsersInfo { count });
        }
        let (mut active, mut inactive, mut blacklisted) = (0, 0, 0);
        for u in &users {
            if u.is_blacklisted() {
                blacklisted += 1;
            } else if !u.is_joined() {
                inactive += 1;
            } else {
                active += 1;
            }
        }
        Some(Reply::UsersInfoExtended {
            active,
            inactive,
            blacklisted,
        })
    }

    pub fn get_system_text(&self, c: &UserContainer, key: SystemText) -> Option<Reply> {
        if let Err(reply) = self.resolve_user(c) {
            return Some(reply);
        }
        let config = self.store.get_system_config().ok().flatten()?;
        let text = match key {
            SystemText::Motd => config.motd,
            SystemText::Privacy => config.privacy,
        };
        (!text.is_empty()).then(|| Reply::Custom { text })
    }

    pub fn set_system_text(&self, c: &UserContainer, key: SystemText, text: String) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let result = self.store.modify_system_config(&mut |config| match key {
            SystemText::Motd => config.motd = text.clone(),
            SystemText::Privacy => config.privacy = text.clone(),
        });
        if let Err(err) = result {
            warn!("Failed to update system config: {err}");
            return None;
        }
        info!("{} set {} to: {:?}", user.formatted_name(), key.name(), text);
        Some(Reply::Success)
    }

    // -- per-user toggles ---------------------------------------------------

    pub fn toggle_debug(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        let user = self.modify_user_logged(user.id, &mut |u| u.debug_enabled = !u.debug_enabled)?;
        Some(Reply::BooleanConfig {
            description: "Debug mode",
            enabled: user.debug_enabled,
        })
    }

    pub fn toggle_karma(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        let user = self.modify_user_logged(user.id, &mut |u| u.hide_karma = !u.hide_karma)?;
        Some(Reply::BooleanConfig {
            description: "Karma notifications",
            enabled: !user.hide_karma,
        })
    }

    // -- tripcodes ----------------------------------------------------------

    pub fn get_tripcode(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if !self.enable_signing {
            return Some(Reply::ErrCommandDisabled);
        }
        Some(Reply::TripcodeInfo {
            tripcode: user.tripcode,
        })
    }

    pub fn set_tripcode(&self, c: &UserContainer, text: String) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if !self.enable_signing {
            return Some(Reply::ErrCommandDisabled);
        }
        let valid = matches!(text.find('#'), Some(pos) if pos > 0 && pos < text.len() - 1)
            && !text.contains('\n')
            && text.chars().count() <= 30;
        if !valid {
            return Some(Reply::ErrInvalidTripFormat);
        }
        self.modify_user_logged(user.id, &mut |u| u.tripcode = Some(text.clone()))?;
        let (name, code) = crate::util::gen_tripcode(&text);
        Some(Reply::TripcodeSet { name, code })
    }

    // -- moderation ---------------------------------------------------------

    pub fn promote_user(&self, c: &UserContainer, username: &str, rank: i32) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let Some(target) = self.find_user_by_name(username) else {
            return Some(Reply::ErrNoUser);
        };
        if target.rank >= rank {
            return None;
        }
        let target = self.modify_user_logged(target.id, &mut |u| u.rank = rank)?;
        if rank >= RANK_ADMIN {
            self.push_system_message(Reply::PromotedAdmin, Some(&target), None, None);
        } else if rank >= RANK_MOD {
            self.push_system_message(Reply::PromotedMod, Some(&target), None, None);
        }
        info!(
            "{} was promoted by {} to: {rank}",
            target.formatted_name(),
            user.formatted_name()
        );
        Some(Reply::Success)
    }

    pub fn send_mod_message(&self, c: &UserContainer, text: &str) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_MOD {
            return None;
        }
        let m = Reply::Custom {
            text: format!("{text} ~<b>mods</b>"),
        };
        self.push_system_message(m, None, None, None);
        info!("{} sent mod message: {text}", user.formatted_name());
        None
    }

    pub fn send_admin_message(&self, c: &UserContainer, text: &str) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let m = Reply::Custom {
            text: format!("{text} ~<b>admins</b>"),
        };
        self.push_system_message(m, None, None, None);
        info!("{} sent admin message: {text}", user.formatted_name());
        None
    }

    pub fn warn_user(&self, c: &UserContainer, msid: Msid, delete: bool) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_MOD {
            return None;
        }
        let (author_id, warned) = match self.cache.with_message(msid, |cm| (cm.user_id, cm.warned))
        {
            Some((Some(author_id), warned)) => (author_id, warned),
            _ => return Some(Reply::ErrNotInCache),
        };

        let target;
        if !warned {
            let mut duration = 0;
            target = self.modify_user_logged(author_id, &mut |u| {
                duration = u.add_warning(now_ts());
                u.karma -= KARMA_WARN_PENALTY;
            })?;
            self.push_system_message(
                Reply::GivenCooldown { duration, deleted: delete },
                Some(&target),
                None,
                Some(msid),
            );
            let _ = self.cache.with_message(msid, |cm| cm.warned = true);
        } else {
            target = self.get_user_logged(author_id)?;
            if !delete {
                return Some(Reply::ErrAlreadyWarned);
            }
        }
        if delete {
            self.sender().delete(&[msid]);
        }
        info!(
            "{} warned [{}]{}",
            user.formatted_name(),
            target.obfuscated_id(&self.salt),
            if delete { " (message deleted)" } else { "" }
        );
        self.warnings_given.add(1);
        Some(Reply::Success)
    }

    pub fn delete_message(&self, c: &UserContainer, msid: Msid) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_MOD {
            return None;
        }
        if !self.allow_remove_command {
            return Some(Reply::ErrCommandDisabled);
        }
        let author_id = match self.cache.with_message(msid, |cm| cm.user_id) {
            Some(Some(author_id)) => author_id,
            _ => return Some(Reply::ErrNotInCache),
        };
        let target = self.get_user_logged(author_id)?;
        self.push_system_message(Reply::MessageDeleted, Some(&target), None, Some(msid));
        self.sender().delete(&[msid]);
        info!(
            "{} deleted a message from [{}]",
            user.formatted_name(),
            target.obfuscated_id(&self.salt)
        );
        Some(Reply::Success)
    }

    pub fn cleanup_messages(&self, c: &UserContainer) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let blacklisted: HashSet<i64> = match self.store.users() {
            Ok(users) => users
                .into_iter()
                .filter(User::is_blacklisted)
                .map(|u| u.id)
                .collect(),
            Err(err) => {
                warn!("User iteration failed: {err}");
                return None;
            }
        };
        let mut msids = Vec::new();
        self.cache.iterate(|msid, cm| {
            let Some(author_id) = cm.user_id else { return };
            if cm.cleanup_seen || !blacklisted.contains(&author_id) {
                return;
            }
            cm.cleanup_seen = true;
            msids.push(msid);
        });
        info!(
            "{} invoked cleanup (matched: {})",
            user.formatted_name(),
            msids.len()
        );
        self.sender().delete(&msids);
        Some(Reply::DeletionQueued { count: msids.len() })
    }

    pub fn uncooldown_user(
        &self,
        c: &UserContainer,
        oid: Option<&str>,
        username: Option<&str>,
    ) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let target = if let Some(oid) = oid {
            match self.find_user_by_oid(oid) {
                Some(target) => target,
                None => return Some(Reply::ErrNoUserById),
            }
        } else if let Some(username) = username {
            match self.find_user_by_name(username) {
                Some(target) => target,
                None => return Some(Reply::ErrNoUser),
            }
        } else {
            return None;
        };
        let now = now_ts();
        if !target.is_in_cooldown(now) {
            return Some(Reply::ErrNotInCooldown);
        }
        let was_until = target.cooldown_until;
        let target = self.modify_user_logged(target.id, &mut |u| {
            u.remove_warning(now);
            u.cooldown_until = None;
        })?;
        info!(
            "{} removed cooldown from {} (was until {:?})",
            user.formatted_name(),
            target.formatted_name(),
            was_until
        );
        Some(Reply::Success)
    }

    pub fn blacklist_user(&self, c: &UserContainer, msid: Msid, reason: String) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        if user.rank < RANK_ADMIN {
            return None;
        }
        let author_id = match self.cache.with_message(msid, |cm| cm.user_id) {
            Some(Some(author_id)) => author_id,
            _ => return Some(Reply::ErrNotInCache),
        };
        let target = self.get_user_logged(author_id)?;
        if target.rank >= user.rank {
            return None;
        }
        let target = self.modify_user_logged(author_id, &mut |u| {
            u.set_blacklisted(Some(reason.clone()), now_ts())
        })?;
        let _ = self.cache.with_message(msid, |cm| cm.warned = true);
        // stop their queued traffic before queueing the notice below
        self.sender().stop_invoked(&target, true);
        self.push_system_message(
            Reply::ErrBlacklisted {
                reason: Some(reason.clone()),
                contact: self.blacklist_contact.clone(),
            },
            Some(&target),
            None,
            Some(msid),
        );
        self.sender().delete(&[msid]);
        info!(
            "{} was blacklisted by {} for: {reason}",
            target.formatted_name(),
            user.formatted_name()
        );
        Some(Reply::Success)
    }

    // -- karma --------------------------------------------------------------

    pub fn give_karma(&self, c: &UserContainer, msid: Msid) -> Option<Reply> {
        let user = match self.resolve_user(c) {
            Ok(user) => user,
            Err(reply) => return Some(reply),
        };
        let (author_id, upvoted) = match self
            .cache
            .with_message(msid, |cm| (cm.user_id, cm.has_upvoted(user.id)))
        {
            Some((Some(author_id), upvoted)) => (author_id, upvoted),
            _ => return Some(Reply::ErrNotInCache),
        };
        if upvoted {
            return Some(Reply::ErrAlreadyUpvoted);
        }
        if user.id == author_id {
            return Some(Reply::ErrUpvoteOwnMessage);
        }
        let _ = self.cache.with_message(msid, |cm| cm.add_upvote(user.id));
        let author = self.modify_user_logged(author_id, &mut |u| u.karma += KARMA_PLUS_ONE)?;
        self.karma_given.add(1);
        if !author.hide_karma {
            self.push_system_message(Reply::KarmaNotification, Some(&author), None, Some(msid));
        }
        Some(Reply::KarmaThankYou)
    }

    // -- message gate -------------------------------------------------------

    /// Full send gate for a user message. On success the message has been
    /// scored, rate-checked and assigned a fresh msid.
    pub fn prepare_user_message(
        &self,
        c: &UserContainer,
        score: f32,
        flags: MessageFlags,
    ) -> Result<Msid, Reply> {
        let user = self.resolve_user(c)?;
        let now = now_ts();
        if user.is_in_cooldown(now) {
            return Err(Reply::ErrCooldown {
                until: user.cooldown_until.unwrap_or(now),
            });
        }
        if (flags.signed || flags.tripcode) && !self.enable_signing {
            return Err(Reply::ErrCommandDisabled);
        }
        if flags.tripcode && user.tripcode.is_none() {
            return Err(Reply::ErrNoTripcode);
        }
        if flags.is_media && user.rank < RANK_MOD {
            if let Some(limit) = self.media_limit_secs {
                if now - user.joined < limit {
                    return Err(Reply::ErrMediaLimit);
                }
            }
        }
        if !self.scores.increase_spam_score(user.id, score) {
            return Err(Reply::ErrSpammy);
        }
        if flags.signed && self.sign_interval_secs > 1 {
            let mut last = self.sign_last_used.lock().unwrap();
            if matches!(last.get(&user.id), Some(t) if now - t < self.sign_interval_secs) {
                return Err(Reply::ErrSpammySign);
            }
            last.insert(user.id, now);
        }
        Ok(self
            .cache
            .assign_message_id(CachedMessage::new(Some(user.id))))
    }

    /// The user's stored row, for callers that already hold a validated
    /// identity (the relay, after `prepare_user_message` succeeded).
    pub fn lookup_user(&self, id: i64) -> Option<User> {
        self.get_user_logged(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JsonStore;

    #[derive(Debug)]
    enum Event {
        Reply {
            m: Reply,
            msid: Option<Msid>,
            who: Option<i64>,
            reply_to: Option<Msid>,
        },
        Delete(Vec<Msid>),
        Stop {
            user_id: i64,
            delete_out: bool,
        },
    }

    #[derive(Default)]
    struct RecordingSender {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSender {
        fn take(&self) -> Vec<Event> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl Sender for RecordingSender {
        fn reply(
            &self,
            m: Reply,
            msid: Option<Msid>,
            who: Option<&User>,
            _except_who: Option<i64>,
            reply_to: Option<Msid>,
        ) {
            self.events.lock().unwrap().push(Event::Reply {
                m,
                msid,
                who: who.map(|u| u.id),
                reply_to,
            });
        }

        fn delete(&self, msids: &[Msid]) {
            self.events.lock().unwrap().push(Event::Delete(msids.to_vec()));
        }

        fn stop_invoked(&self, user: &User, delete_out: bool) {
            self.events.lock().unwrap().push(Event::Stop {
                user_id: user.id,
                delete_out,
            });
        }
    }

    struct Fixture {
        core: Arc<Core>,
        sender: Arc<RecordingSender>,
        cache: Arc<Cache>,
        store: Arc<dyn UserStore>,
        _dir: tempfile::TempDir,
    }

    fn test_config() -> Config {
        Config {
            bot_token: "123:abc".into(),
            database: vec!["json".into(), "unused".into()],
            blacklist_contact: String::new(),
            enable_signing: true,
            allow_remove_command: true,
            allow_contacts: false,
            allow_documents: true,
            media_limit_period: None,
            sign_limit_interval: 600,
            secret_salt: None,
            locale: None,
            linked_network: None,
        }
    }

    fn setup() -> Fixture {
        setup_with(test_config())
    }

    fn setup_with(config: Config) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn UserStore> =
            Arc::new(JsonStore::open(dir.path().join("db.json")).unwrap());
        let cache = Arc::new(Cache::new());
        let scores = Arc::new(ScoreKeeper::new());
        let stats = Stats::new();
        let core = Core::new(&config, store.clone(), cache.clone(), scores, &stats).unwrap();
        let sender = Arc::new(RecordingSender::default());
        core.register_receiver(sender.clone());
        Fixture {
            core,
            sender,
            cache,
            store,
            _dir: dir,
        }
    }

    fn container(id: i64, username: &str) -> UserContainer {
        UserContainer {
            id,
            username: Some(username.into()),
            realname: username.to_uppercase(),
        }
    }

    /// Joins `id` and optionally raises their rank out-of-band.
    fn join(fx: &Fixture, id: i64, username: &str, rank: Option<i32>) {
        let replies = fx.core.user_join(&container(id, username));
        assert!(matches!(replies[0], Reply::ChatJoin));
        if let Some(rank) = rank {
            fx.store.modify_user(id, &mut |u| u.rank = rank).unwrap();
        }
        fx.sender.take();
    }

    #[test]
    fn test_first_joiner_becomes_admin() {
        let fx = setup();
        let replies = fx.core.user_join(&container(1, "alice"));
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], Reply::ChatJoin));
        let users = fx.store.users().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].rank, RANK_ADMIN);

        // the second joiner is a plain user
        let replies = fx.core.user_join(&container(2, "bob"));
        assert!(matches!(replies[0], Reply::ChatJoin));
        assert_eq!(fx.store.get_user(2).unwrap().rank, 0);

        // joining again only says so
        let replies = fx.core.user_join(&container(1, "alice"));
        assert!(matches!(replies[0], Reply::UserInChat));
    }

    #[test]
    fn test_leave_and_rejoin() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        assert!(matches!(
            fx.core.user_leave(&container(1, "alice")),
            Some(Reply::ChatLeave)
        ));
        assert!(!fx.store.get_user(1).unwrap().is_joined());
        // left users cannot use commands
        assert!(matches!(
            fx.core.get_info(&container(1, "alice")),
            Some(Reply::UserNotInChat)
        ));
        let replies = fx.core.user_join(&container(1, "alice"));
        assert!(matches!(replies[0], Reply::ChatJoin));
        assert!(fx.store.get_user(1).unwrap().is_joined());
    }

    #[test]
    fn test_unknown_user_not_in_chat() {
        let fx = setup();
        assert!(matches!(
            fx.core.get_info(&container(9, "nobody")),
            Some(Reply::UserNotInChat)
        ));
    }

    #[test]
    fn test_warn_ladder() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let admin = container(1, "admin");

        let mut durations = Vec::new();
        for _ in 0..3 {
            let msid = fx
                .cache
                .assign_message_id(CachedMessage::new(Some(2)));
            let reply = fx.core.warn_user(&admin, msid, false);
            assert!(matches!(reply, Some(Reply::Success)));
            for event in fx.sender.take() {
                if let Event::Reply {
                    m: Reply::GivenCooldown { duration, .. },
                    who: Some(2),
                    reply_to,
                    ..
                } = event
                {
                    assert_eq!(reply_to, Some(msid));
                    durations.push(duration);
                }
            }
        }
        assert_eq!(durations, vec![60, 5 * 60, 25 * 60]);
        let bob = fx.store.get_user(2).unwrap();
        assert_eq!(bob.karma, -30);
        assert_eq!(bob.warnings, 3);
        assert!(bob.is_in_cooldown(now_ts()));
    }

    #[test]
    fn test_warn_twice_same_message() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let admin = container(1, "admin");
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        assert!(matches!(
            fx.core.warn_user(&admin, msid, false),
            Some(Reply::Success)
        ));
        assert!(matches!(
            fx.core.warn_user(&admin, msid, false),
            Some(Reply::ErrAlreadyWarned)
        ));
        // deleting an already warned message is allowed
        assert!(matches!(
            fx.core.warn_user(&admin, msid, true),
            Some(Reply::Success)
        ));
        assert_eq!(fx.store.get_user(2).unwrap().warnings, 1);
    }

    #[test]
    fn test_warn_requires_mod() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        // a plain user's warn is silently dropped
        assert!(fx.core.warn_user(&container(2, "bob"), msid, false).is_none());
        // a system message cannot be warned
        let sys = fx.cache.assign_message_id(CachedMessage::new(None));
        assert!(matches!(
            fx.core.warn_user(&container(1, "admin"), sys, false),
            Some(Reply::ErrNotInCache)
        ));
    }

    #[test]
    fn test_spam_gate() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        let alice = container(1, "alice");
        for _ in 0..3 {
            assert!(fx
                .core
                .prepare_user_message(&alice, 0.76, MessageFlags::default())
                .is_ok());
        }
        // the message crossing the soft cap still goes through once
        assert!(fx
            .core
            .prepare_user_message(&alice, 0.76, MessageFlags::default())
            .is_ok());
        assert!(matches!(
            fx.core
                .prepare_user_message(&alice, 0.76, MessageFlags::default()),
            Err(Reply::ErrSpammy)
        ));
        assert!(matches!(
            fx.core
                .prepare_user_message(&alice, 0.1, MessageFlags::default()),
            Err(Reply::ErrSpammy)
        ));
    }

    #[test]
    fn test_karma_on_own_message() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        let alice = container(1, "alice");
        let msid = fx
            .core
            .prepare_user_message(&alice, 0.76, MessageFlags::default())
            .unwrap();
        assert!(matches!(
            fx.core.give_karma(&alice, msid),
            Some(Reply::ErrUpvoteOwnMessage)
        ));
        assert_eq!(
            fx.cache.with_message(msid, |cm| cm.upvote_count()),
            Some(0)
        );
    }

    #[test]
    fn test_karma_flow() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        join(&fx, 2, "bob", None);
        let bob = container(2, "bob");
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(1)));

        assert!(matches!(
            fx.core.give_karma(&bob, msid),
            Some(Reply::KarmaThankYou)
        ));
        assert_eq!(fx.store.get_user(1).unwrap().karma, 1);
        let events = fx.sender.take();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Reply { m: Reply::KarmaNotification, who: Some(1), .. }
        )));
        assert!(matches!(
            fx.core.give_karma(&bob, msid),
            Some(Reply::ErrAlreadyUpvoted)
        ));

        // notification is suppressed once alice hides karma
        fx.store.modify_user(1, &mut |u| u.hide_karma = true).unwrap();
        join(&fx, 3, "carol", None);
        assert!(matches!(
            fx.core.give_karma(&container(3, "carol"), msid),
            Some(Reply::KarmaThankYou)
        ));
        assert!(!fx.sender.take().iter().any(|e| matches!(
            e,
            Event::Reply { m: Reply::KarmaNotification, .. }
        )));
    }

    #[test]
    fn test_blacklist_and_cleanup() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let admin = container(1, "admin");
        let m1 = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        let m2 = fx.cache.assign_message_id(CachedMessage::new(Some(2)));

        let reply = fx.core.blacklist_user(&admin, m1, "spam".into());
        assert!(matches!(reply, Some(Reply::Success)));
        let bob = fx.store.get_user(2).unwrap();
        assert!(bob.is_blacklisted());
        assert!(!bob.is_joined());
        assert_eq!(bob.blacklist_reason.as_deref(), Some("spam"));

        let events = fx.sender.take();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Stop { user_id: 2, delete_out: true })));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Delete(msids) if msids == &vec![m1])));

        // bob's cached messages are still there; cleanup queues them all
        let reply = fx.core.cleanup_messages(&admin);
        assert!(matches!(reply, Some(Reply::DeletionQueued { count: 2 })));
        let events = fx.sender.take();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Delete(msids) if msids.len() == 2 && msids.contains(&m1) && msids.contains(&m2)
        )));

        // a second pass finds nothing new
        assert!(matches!(
            fx.core.cleanup_messages(&admin),
            Some(Reply::DeletionQueued { count: 0 })
        ));

        // a blacklisted user is told so when they come back
        let replies = fx.core.user_join(&container(2, "bob"));
        assert!(matches!(replies[0], Reply::ErrBlacklisted { .. }));
    }

    #[test]
    fn test_blacklist_respects_rank() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "other", Some(RANK_ADMIN));
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        // equal rank cannot be blacklisted, silently
        assert!(fx
            .core
            .blacklist_user(&container(1, "admin"), msid, "no".into())
            .is_none());
        assert!(!fx.store.get_user(2).unwrap().is_blacklisted());
    }

    #[test]
    fn test_uncooldown() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let admin = container(1, "admin");
        assert!(matches!(
            fx.core.uncooldown_user(&admin, None, Some("bob")),
            Some(Reply::ErrNotInCooldown)
        ));

        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        let _ = fx.core.warn_user(&admin, msid, false);
        assert!(matches!(
            fx.core.uncooldown_user(&admin, None, Some("bob")),
            Some(Reply::Success)
        ));
        let bob = fx.store.get_user(2).unwrap();
        assert_eq!(bob.warnings, 0);
        assert_eq!(bob.cooldown_until, None);
        assert!(matches!(
            fx.core.uncooldown_user(&admin, None, Some("ghost")),
            Some(Reply::ErrNoUser)
        ));
        assert!(matches!(
            fx.core.uncooldown_user(&admin, Some("zzzz"), None),
            Some(Reply::ErrNoUserById)
        ));
    }

    #[test]
    fn test_cooldown_blocks_messages() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        fx.core.warn_user(&container(1, "admin"), msid, false);
        assert!(matches!(
            fx.core
                .prepare_user_message(&container(2, "bob"), 0.76, MessageFlags::default()),
            Err(Reply::ErrCooldown { .. })
        ));
    }

    #[test]
    fn test_tripcode_set_and_validation() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        let alice = container(1, "alice");
        for bad in ["nopound", "#startswith", "endswith#", "with\nnewline#x",
            "way-too-long-name-aaaaaaaaaaaaaaaaaaa#pw"] {
            assert!(matches!(
                fx.core.set_tripcode(&alice, bad.into()),
                Some(Reply::ErrInvalidTripFormat)
            ));
        }
        let reply = fx.core.set_tripcode(&alice, "alice#secret".into());
        match reply {
            Some(Reply::TripcodeSet { name, code }) => {
                assert_eq!(name, "alice");
                assert!(code.starts_with('!'));
            }
            other => panic!("unexpected reply: {other:?}"),
        }
        assert!(matches!(
            fx.core.get_tripcode(&alice),
            Some(Reply::TripcodeInfo { tripcode: Some(_) })
        ));
    }

    #[test]
    fn test_signing_gates() {
        let fx = setup();
        join(&fx, 1, "alice", None);
        let alice = container(1, "alice");
        let signed = MessageFlags {
            signed: true,
            ..Default::default()
        };
        // first signed message passes, the second hits the rate limit
        assert!(fx.core.prepare_user_message(&alice, 0.1, signed).is_ok());
        assert!(matches!(
            fx.core.prepare_user_message(&alice, 0.1, signed),
            Err(Reply::ErrSpammySign)
        ));
        // tripcode messages need a tripcode
        let trip = MessageFlags {
            tripcode: true,
            ..Default::default()
        };
        assert!(matches!(
            fx.core.prepare_user_message(&alice, 0.1, trip),
            Err(Reply::ErrNoTripcode)
        ));
    }

    #[test]
    fn test_signing_disabled() {
        let mut config = test_config();
        config.enable_signing = false;
        let fx = setup_with(config);
        join(&fx, 1, "alice", None);
        let alice = container(1, "alice");
        let signed = MessageFlags {
            signed: true,
            ..Default::default()
        };
        assert!(matches!(
            fx.core.prepare_user_message(&alice, 0.1, signed),
            Err(Reply::ErrCommandDisabled)
        ));
        assert!(matches!(
            fx.core.set_tripcode(&alice, "a#b".into()),
            Some(Reply::ErrCommandDisabled)
        ));
    }

    #[test]
    fn test_media_limit() {
        let mut config = test_config();
        config.media_limit_period = Some(24);
        let fx = setup_with(config);
        join(&fx, 1, "alice", None);
        let media = MessageFlags {
            is_media: true,
            ..Default::default()
        };
        assert!(matches!(
            fx.core
                .prepare_user_message(&container(1, "alice"), 0.1, media),
            Err(Reply::ErrMediaLimit)
        ));
        // an account older than the limit may send media
        fx.store
            .modify_user(1, &mut |u| u.joined -= 25 * 3600)
            .unwrap();
        assert!(fx
            .core
            .prepare_user_message(&container(1, "alice"), 0.1, media)
            .is_ok());
    }

    #[test]
    fn test_promote_user() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        let admin = container(1, "admin");
        assert!(matches!(
            fx.core.promote_user(&admin, "@bob", RANK_MOD),
            Some(Reply::Success)
        ));
        assert_eq!(fx.store.get_user(2).unwrap().rank, RANK_MOD);
        assert!(fx.sender.take().iter().any(|e| matches!(
            e,
            Event::Reply { m: Reply::PromotedMod, who: Some(2), .. }
        )));
        // promoting to the same or lower rank is a no-op
        assert!(fx.core.promote_user(&admin, "bob", RANK_MOD).is_none());
        assert!(matches!(
            fx.core.promote_user(&admin, "ghost", RANK_MOD),
            Some(Reply::ErrNoUser)
        ));
    }

    #[test]
    fn test_motd_on_join_and_remind() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        let _ = fx.core
            .set_system_text(&container(1, "admin"), SystemText::Motd, "welcome!".into());

        // new users get the motd right away
        let replies = fx.core.user_join(&container(2, "bob"));
        assert_eq!(replies.len(), 2);
        assert!(matches!(&replies[1], Reply::Custom { text } if text == "welcome!"));

        // short absences do not repeat it
        let _ = fx.core.user_leave(&container(2, "bob"));
        let replies = fx.core.user_join(&container(2, "bob"));
        assert_eq!(replies.len(), 1);

        // long absences do
        let _ = fx.core.user_leave(&container(2, "bob"));
        fx.store
            .modify_user(2, &mut |u| {
                u.left = u.left.map(|t| t - (MOTD_REMIND_DAYS + 1) * 86400)
            })
            .unwrap();
        let replies = fx.core.user_join(&container(2, "bob"));
        assert_eq!(replies.len(), 2);
    }

    #[test]
    fn test_get_users_by_rank() {
        let fx = setup();
        join(&fx, 1, "admin", Some(RANK_ADMIN));
        join(&fx, 2, "bob", None);
        join(&fx, 3, "carol", None);
        let _ = fx.core.user_leave(&container(3, "carol"));
        let msid = fx.cache.assign_message_id(CachedMessage::new(Some(2)));
        let _ = fx.core
            .blacklist_user(&container(1, "admin"), msid, "bye".into());

        assert!(matches!(
            fx.core.get_users(&container(1, "admin")),
            Some(Reply::UsersInfoExtended { active: 1, inactive: 1, blacklisted: 1 })
        ));
        // plain users only see the joined count
        join(&fx, 4, "dave", None);
        assert!(matches!(
            fx.core.get_users(&container(4, "dave")),
            Some(Reply::UsersInfo { count: 2 })
        ));
    }
}
