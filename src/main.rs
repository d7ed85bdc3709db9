use std::{path::PathBuf, process::exit, sync::Arc, time::Duration};

use clap::{error::ErrorKind, Parser};
use futures::StreamExt;
use log::{debug, error, info, warn, LevelFilter};
use teloxide::{
    update_listeners::{polling_default, AsUpdateStream},
    Bot, RequestError,
};
use tokio::time::sleep;

use parlor::{
    cache::Cache,
    config::{self, Config},
    core::Core,
    sched::Scheduler,
    score::ScoreKeeper,
    stats::{self, Stats},
    store::{JsonStore, SqliteStore, UserStore},
    telegram::Telegram,
};

const MAX_RETRY: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "parlor", version, about = "Anonymous Telegram lounge relay bot")]
struct Cli {
    /// Quiet, set log level to WARNING
    #[arg(short, conflicts_with = "debug")]
    quiet: bool,

    /// Debug, set log level to DEBUG
    #[arg(short)]
    debug: bool,

    /// Location of config file
    #[arg(short, default_value = "./config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            exit(0);
        }
        Err(err) => {
            let _ = err.print();
            exit(1);
        }
    };

    let level = if cli.quiet {
        LevelFilter::Warn
    } else if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(err) = run(cli).await {
        error!("{err:#}");
        exit(1);
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<dyn UserStore>> {
    let (kind, args) = config
        .database
        .split_first()
        .expect("validated by config::load");
    match kind.to_lowercase().as_str() {
        "json" => Ok(Arc::new(JsonStore::open(&args[0])?)),
        "sqlite" => {
            let path = std::path::Path::new(&args[0]);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStore::open(path)?))
        }
        other => anyhow::bail!("unknown database type {other:?}"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::load(&cli.config)?;
    info!("parlor v{} starting up", env!("CARGO_PKG_VERSION"));
    if let Some(locale) = config.locale.as_deref() {
        if locale != "en" {
            warn!("Locale {locale:?} is not available, using built-in replies");
        }
    }

    let store = open_store(&config)?;
    let cache = Arc::new(Cache::new());
    let scores = Arc::new(ScoreKeeper::new());
    let statistics = Arc::new(Stats::new());

    let core = Core::new(
        &config,
        store.clone(),
        cache.clone(),
        scores.clone(),
        &statistics,
    )?;
    let bot = Bot::new(config.bot_token.trim());
    let tg = Telegram::new(
        bot.clone(),
        &config,
        core.clone(),
        store.clone(),
        cache.clone(),
    );
    core.register_receiver(tg.clone());

    {
        let cache = cache.clone();
        statistics.register_gauge("cache_size", move || cache.len() as i64);
    }
    {
        let tg = tg.clone();
        statistics.register_gauge("queue_size", move || tg.queue_len() as i64);
    }

    let mut sched = Scheduler::new();
    store.clone().register_tasks(&mut sched);
    core.register_tasks(&mut sched);
    tg.register_tasks(&mut sched);

    tg.spawn_workers();
    tokio::spawn(sched.run());
    {
        let statistics = statistics.clone();
        let sockpath = stats::socket_path(&cli.config);
        tokio::spawn(async move {
            if let Err(err) = stats::serve(statistics, sockpath).await {
                warn!("Stats server stopped: {err:#}");
            }
        });
    }

    let result = tokio::select! {
        result = poll_updates(bot, tg) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, exiting");
            Ok(())
        }
    };
    store.close();
    result
}

async fn poll_updates(bot: Bot, tg: Arc<Telegram>) -> anyhow::Result<()> {
    let mut poll = polling_default(bot).await;
    let mut stream = Box::pin(poll.as_stream());
    let mut retry_count = 0u32;
    info!("Bot started");
    while let Some(update) = stream.next().await {
        debug!("Update: {:?}", update);
        let update = match update {
            Ok(update) => {
                retry_count = 0;
                update
            }
            Err(RequestError::Network(err)) if retry_count < MAX_RETRY => {
                warn!("Network error: {err}");
                sleep(RETRY_BASE_DELAY * 2u32.pow(retry_count)).await;
                retry_count += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        tg.handle_update(update).await;
    }
    Ok(())
}
