use std::time::Duration;

use log::{debug, warn};
use tokio::time::{sleep_until, Instant};

type Task = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

struct Entry {
    interval: Duration,
    next: Instant,
    name: &'static str,
    task: Task,
}

/// Runs registered tasks at fixed intervals on a single tokio task.
/// Tasks execute sequentially in registration order; a failing task is
/// logged and the loop keeps going. Intervals cannot be changed and tasks
/// cannot be cancelled once registered.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Entry>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, interval: Duration, name: &'static str, task: F)
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        assert!(interval > Duration::ZERO);
        self.tasks.push(Entry {
            interval,
            next: Instant::now(),
            name,
            task: Box::new(task),
        });
    }

    /// Executes every task due at `now` and returns the nearest next deadline.
    fn run_due(&mut self, now: Instant) -> Instant {
        for entry in &mut self.tasks {
            if now >= entry.next {
                debug!("Running scheduled task {}", entry.name);
                if let Err(err) = (entry.task)() {
                    warn!("Scheduled task {} failed: {err:#}", entry.name);
                }
                entry.next = now + entry.interval;
            }
        }
        self.tasks
            .iter()
            .map(|e| e.next)
            .min()
            .expect("scheduler has no tasks")
    }

    pub async fn run(mut self) -> ! {
        assert!(!self.tasks.is_empty());
        loop {
            let next = self.run_due(Instant::now());
            sleep_until(next).await;
        }
    }
}
