use anyhow::Context;
use clap::Parser;
use notifier::config::{Config, SenderKind};
use notifier::logging::{init_logging, LogArgs};
use notifier::models::{Contact, Event, Subscription, Trigger};
use notifier::senders::LogSender;
use notifier::{
    Coordinator, FetchEventsWorker, MemoryStore, Monitor, NotificationsWorker, Registry, Store,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Notifier is a daemon which delivers notifications of trigger state changes,
/// and alerts admins when the alerting platform itself is unhealthy.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, env = "NOTIFIER_CONFIG", default_value = "/etc/notifier/config.yml")]
    config: PathBuf,
    /// Path to a YAML file of triggers, subscriptions, contacts, and events
    /// with which the in-process store is seeded.
    #[arg(long, env = "NOTIFIER_FIXTURES")]
    fixtures: Option<PathBuf>,
    #[command(flatten)]
    log: LogArgs,
}

/// Fixtures of the in-process store.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Fixtures {
    triggers: Vec<Trigger>,
    subscriptions: Vec<Subscription>,
    contacts: Vec<Contact>,
    events: Vec<Event>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args.log)?;
    tracing::info!(?args, "started!");

    let config = Config::load(&args.config)
        .with_context(|| format!("loading config {}", args.config.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args, config));

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
    result
}

async fn async_main(args: Args, config: Config) -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());

    let mut senders = Registry::new(config.notifier.send_timeout);
    for (contact_type, kind) in &config.senders {
        senders = match kind {
            SenderKind::Log => senders.register(contact_type.clone(), LogSender),
        };
    }

    if let Some(path) = &args.fixtures {
        let fixtures = load_fixtures(path)
            .with_context(|| format!("loading fixtures {}", path.display()))?;

        senders
            .require(fixtures.contacts.iter().map(|c| c.type_.as_str()))
            .context("fixtures reference a contact type without a configured sender")?;

        seed(&store, fixtures).await?;
    }

    let coordinator = Coordinator::new();
    coordinator.spawn(FetchEventsWorker::new(
        store.clone(),
        config.notifier.events.clone(),
    ));
    coordinator.spawn(NotificationsWorker::new(
        store.clone(),
        senders.clone(),
        config.notifier.notifications.clone(),
    ));

    match Monitor::new(store.clone(), senders.clone(), config.selfstate.clone()) {
        Some(monitor) => coordinator.spawn(monitor),
        None => tracing::info!("self-state monitoring is disabled"),
    }

    coordinator.serve(shutdown_signal(), &senders).await;
    Ok(())
}

fn load_fixtures(path: &std::path::Path) -> anyhow::Result<Fixtures> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

async fn seed(store: &MemoryStore, fixtures: Fixtures) -> anyhow::Result<()> {
    let Fixtures {
        triggers,
        subscriptions,
        contacts,
        events,
    } = fixtures;

    tracing::info!(
        triggers = triggers.len(),
        subscriptions = subscriptions.len(),
        contacts = contacts.len(),
        events = events.len(),
        "seeding store"
    );

    triggers.into_iter().for_each(|t| store.put_trigger(t));
    subscriptions.into_iter().for_each(|s| store.put_subscription(s));
    contacts.into_iter().for_each(|c| store.put_contact(c));

    for event in events {
        store.push_event(event).await.context("pushing fixture event")?;
    }
    Ok(())
}

/// Resolves upon SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(?err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(?err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => (),
        () = terminate => (),
    }
}
