use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::sched::Scheduler;

use super::{StoreError, SystemConfig, User, UserStore};

const COMMIT_INTERVAL: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS `system_config` (
    `name` TEXT NOT NULL,
    `value` TEXT NOT NULL,
    PRIMARY KEY (`name`)
);
CREATE TABLE IF NOT EXISTS `users` (
    `id` BIGINT NOT NULL,
    `username` TEXT,
    `realname` TEXT NOT NULL,
    `rank` INTEGER NOT NULL,
    `joined` TIMESTAMP NOT NULL,
    `left` TIMESTAMP,
    `lastActive` TIMESTAMP NOT NULL,
    `cooldownUntil` TIMESTAMP,
    `blacklistReason` TEXT,
    `warnings` INTEGER NOT NULL,
    `warnExpiry` TIMESTAMP,
    `karma` INTEGER NOT NULL,
    `hideKarma` TINYINT NOT NULL,
    `debugEnabled` TINYINT NOT NULL,
    `tripcode` TEXT,
    PRIMARY KEY (`id`)
);
";

/// SQLite backend. Statements run inside a long-lived transaction that a
/// scheduled task commits every few seconds, trading sync writes for
/// throughput; `close()` commits whatever is pending.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Self::migrate(&conn)?;
        conn.execute_batch("BEGIN")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Additive migrations for databases created by older versions.
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let mut has_tripcode = false;
        let mut stmt = conn.prepare("PRAGMA table_info(`users`)")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "tripcode" {
                has_tripcode = true;
            }
        }
        drop(rows);
        drop(stmt);
        if !has_tripcode {
            conn.execute_batch("ALTER TABLE `users` ADD `tripcode` TEXT")?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch("COMMIT; BEGIN")?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get("id")?,
            username: row.get("username")?,
            realname: row.get("realname")?,
            rank: row.get("rank")?,
            joined: row.get("joined")?,
            left: row.get("left")?,
            last_active: row.get("lastActive")?,
            cooldown_until: row.get("cooldownUntil")?,
            blacklist_reason: row.get("blacklistReason")?,
            warnings: row.get("warnings")?,
            warn_expiry: row.get("warnExpiry")?,
            karma: row.get("karma")?,
            hide_karma: row.get("hideKarma")?,
            debug_enabled: row.get("debugEnabled")?,
            tripcode: row.get("tripcode")?,
        })
    }

    fn write_user(conn: &Connection, user: &User) -> Result<(), StoreError> {
        conn.execute(
            "UPDATE users SET `username` = ?, `realname` = ?, `rank` = ?, `joined` = ?,
             `left` = ?, `lastActive` = ?, `cooldownUntil` = ?, `blacklistReason` = ?,
             `warnings` = ?, `warnExpiry` = ?, `karma` = ?, `hideKarma` = ?,
             `debugEnabled` = ?, `tripcode` = ? WHERE id = ?",
            params![
                user.username,
                user.realname,
                user.rank,
                user.joined,
                user.left,
                user.last_active,
                user.cooldown_until,
                user.blacklist_reason,
                user.warnings,
                user.warn_expiry,
                user.karma,
                user.hide_karma,
                user.debug_enabled,
                user.tripcode,
                user.id,
            ],
        )?;
        Ok(())
    }
}

impl UserStore for SqliteStore {
    fn get_user(&self, id: i64) -> Result<User, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM users WHERE id = ?", [id], Self::from_row)
            .optional()?
            .ok_or(StoreError::NotFound)
    }

    fn add_user(&self, user: &User) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users(`id`, `username`, `realname`, `rank`, `joined`, `left`,
             `lastActive`, `cooldownUntil`, `blacklistReason`, `warnings`, `warnExpiry`,
             `karma`, `hideKarma`, `debugEnabled`, `tripcode`)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                user.id,
                user.username,
                user.realname,
                user.rank,
                user.joined,
                user.left,
                user.last_active,
                user.cooldown_until,
                user.blacklist_reason,
                user.warnings,
                user.warn_expiry,
                user.karma,
                user.hide_karma,
                user.debug_enabled,
                user.tripcode,
            ],
        )?;
        Ok(())
    }

    fn users(&self) -> Result<Vec<User>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM users")?;
        let users = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(users)
    }

    fn user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT `id` FROM users")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn modify_user(&self, id: i64, f: &mut dyn FnMut(&mut User)) -> Result<User, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut user = conn
            .query_row("SELECT * FROM users WHERE id = ?", [id], Self::from_row)
            .optional()?
            .ok_or(StoreError::NotFound)?;
        f(&mut user);
        Self::write_user(&conn, &user)?;
        Ok(user)
    }

    fn get_system_config(&self) -> Result<Option<SystemConfig>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT `name`, `value` FROM system_config")?;
        let mut rows = stmt.query([])?;
        let mut config = SystemConfig::default();
        let mut found = false;
        while let Some(row) = rows.next()? {
            found = true;
            let name: String = row.get(0)?;
            let value: String = row.get(1)?;
            match name.as_str() {
                "motd" => config.motd = value,
                "privacy" => config.privacy = value,
                _ => {}
            }
        }
        Ok(found.then_some(config))
    }

    fn set_system_config(&self, config: &SystemConfig) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("REPLACE INTO system_config(`name`, `value`) VALUES (?, ?)")?;
        stmt.execute(params!["motd", config.motd])?;
        stmt.execute(params!["privacy", config.privacy])?;
        Ok(())
    }

    fn modify_system_config(&self, f: &mut dyn FnMut(&mut SystemConfig)) -> Result<(), StoreError> {
        let mut config = self.get_system_config()?.unwrap_or_default();
        f(&mut config);
        self.set_system_config(&config)
    }

    fn register_tasks(self: Arc<Self>, sched: &mut Scheduler) {
        sched.register(COMMIT_INTERVAL, "sqlite commit", move || {
            self.commit()?;
            Ok(())
        });
    }

    fn close(&self) {
        let conn = self.conn.lock().unwrap();
        if let Err(err) = conn.execute_batch("COMMIT") {
            log::warn!("Final commit failed: {err}");
        }
    }
}
