use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context;
use log::{info, warn};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixListener,
};

type Source = Box<dyn Fn(&mut BTreeMap<String, i64>) + Send + Sync>;

/// Registry of statistic sources, queried over a unix socket.
#[derive(Default)]
pub struct Stats {
    sources: Mutex<Vec<Source>>,
}

/// Monotonic counter whose value is reported and reset on every snapshot.
#[derive(Clone)]
pub struct Counter(Arc<AtomicI64>);

impl Counter {
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source<F>(&self, source: F)
    where
        F: Fn(&mut BTreeMap<String, i64>) + Send + Sync + 'static,
    {
        self.sources.lock().unwrap().push(Box::new(source));
    }

    /// Registers a gauge that reports a single value.
    pub fn register_gauge<F>(&self, name: &'static str, f: F)
    where
        F: Fn() -> i64 + Send + Sync + 'static,
    {
        self.register_source(move |out| {
            out.insert(name.into(), f());
        });
    }

    pub fn counter(&self, name: &'static str) -> Counter {
        let counter = Counter(Arc::new(AtomicI64::new(0)));
        let value = counter.0.clone();
        self.register_source(move |out| {
            out.insert(name.into(), value.swap(0, Ordering::Relaxed));
        });
        counter
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        let mut out = BTreeMap::new();
        for source in self.sources.lock().unwrap().iter() {
            source(&mut out);
        }
        out
    }
}

/// Socket path derived from the config path so several bots on one host
/// get distinct sockets.
pub fn socket_path(config_path: &Path) -> PathBuf {
    let suffix = config_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != ".")
        .map(|n| format!("_{n}"))
        .unwrap_or_default();
    PathBuf::from(format!("/tmp/parlor{suffix}"))
}

/// Serves JSON snapshots on a unix stream socket. Any non-empty request
/// payload yields one snapshot; connections stay open for repeated
/// requests.
pub async fn serve(stats: Arc<Stats>, sockpath: PathBuf) -> anyhow::Result<()> {
    if sockpath.exists() {
        std::fs::remove_file(&sockpath)?;
    }
    let listener = UnixListener::bind(&sockpath)
        .with_context(|| format!("cannot bind {}", sockpath.display()))?;
    info!("Statistic collector ready on {}", sockpath.display());
    loop {
        let (mut sock, _) = listener.accept().await?;
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let n = match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if buf[..n].iter().all(u8::is_ascii_whitespace) {
                    break;
                }
                let snapshot = stats.snapshot();
                let json = match sonic_rs::to_string(&snapshot) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!("Failed to encode stats: {err}");
                        break;
                    }
                };
                if sock.write_all(json.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_reads_and_zeros() {
        let stats = Stats::new();
        let counter = stats.counter("warnings_given");
        counter.add(2);
        counter.add(1);
        assert_eq!(stats.snapshot().get("warnings_given"), Some(&3));
        assert_eq!(stats.snapshot().get("warnings_given"), Some(&0));
    }

    #[test]
    fn test_gauge_and_merge() {
        let stats = Stats::new();
        stats.register_gauge("cache_size", || 5);
        stats.register_source(|out| {
            out.insert("a".into(), 1);
            out.insert("b".into(), 2);
        });
        let snap = stats.snapshot();
        assert_eq!(snap.get("cache_size"), Some(&5));
        assert_eq!(snap.len(), 3);
    }

    #[test]
    fn test_socket_path() {
        assert_eq!(
            socket_path(Path::new("/etc/mybot/config.yaml")),
            PathBuf::from("/tmp/parlor_mybot")
        );
        assert_eq!(
            socket_path(Path::new("./config.yaml")),
            PathBuf::from("/tmp/parlor")
        );
        assert_eq!(
            socket_path(Path::new("config.yaml")),
            PathBuf::from("/tmp/parlor")
        );
    }
}
