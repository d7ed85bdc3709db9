use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::sched::Scheduler;

use super::{StoreError, SystemConfig, User, UserStore};

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Data {
    system_config: Option<SystemConfig>,
    users: Vec<User>,
}

/// Single-file JSON backend. Every mutation rewrites the whole file via a
/// write-to-`path~`-then-rename, so a crash can never leave a torn file.
/// Fine for development, too slow for a busy lounge.
pub struct JsonStore {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    data: Data,
    buf: Vec<u8>,
}

impl Inner {
    fn save(&mut self) -> Result<(), StoreError> {
        self.buf.clear();
        sonic_rs::to_writer(&mut self.buf, &self.data)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push("~");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, &self.buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl JsonStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let data = match fs::read(&path) {
            Ok(buf) if !buf.is_empty() => sonic_rs::from_slice(&buf)?,
            Ok(_) => Data::default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Data::default(),
            Err(err) => return Err(err.into()),
        };
        warn!("The JSON backend is meant for development only!");
        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                data,
                buf: Vec::new(),
            }),
        })
    }
}

impl UserStore for JsonStore {
    fn get_user(&self, id: i64) -> Result<User, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner
            .data
            .users
            .iter()
            .find(|u| u.id == id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn add_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.users.push(user.clone());
        inner.save()
    }

    fn users(&self) -> Result<Vec<User>, StoreError> {
        Ok(self.inner.lock().unwrap().data.users.clone())
    }

    fn user_ids(&self) -> Result<Vec<i64>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .data
            .users
            .iter()
            .map(|u| u.id)
            .collect())
    }

    fn modify_user(&self, id: i64, f: &mut dyn FnMut(&mut User)) -> Result<User, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .data
            .users
            .iter()
            .position(|u| u.id == id)
            .ok_or(StoreError::NotFound)?;
        let mut user = inner.data.users[idx].clone();
        f(&mut user);
        inner.data.users[idx] = user.clone();
        inner.save()?;
        Ok(user)
    }

    fn get_system_config(&self) -> Result<Option<SystemConfig>, StoreError> {
        Ok(self.inner.lock().unwrap().data.system_config.clone())
    }

    fn set_system_config(&self, config: &SystemConfig) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.data.system_config = Some(config.clone());
        inner.save()
    }

    fn modify_system_config(&self, f: &mut dyn FnMut(&mut SystemConfig)) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut config = inner.data.system_config.clone().unwrap_or_default();
        f(&mut config);
        inner.data.system_config = Some(config);
        inner.save()
    }

    fn register_tasks(self: Arc<Self>, _sched: &mut Scheduler) {
        // every write is already synchronous and atomic
    }

    fn close(&self) {}
}
