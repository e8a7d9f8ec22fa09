use std::sync::Arc;

use relay_assist::agent::{AdminSessions, DestructiveGate};
use relay_assist::channels::operator::spawn_command_loop;
use relay_assist::channels::{
    Dispatcher, GraphMailApi, MailApi, MailPoller, OperatorFeed, OperatorNotifier, SmsGateway,
    SmtpMailer, SyncCursorManager, build_app, spawn_sync_ticker,
};
use relay_assist::config::RelayConfig;
use relay_assist::contacts::ContactDirectory;
use relay_assist::llm::{Inference, OllamaInference};
use relay_assist::pipeline::channel_gate::ChannelGate;
use relay_assist::pipeline::dedup::Deduplicator;
use relay_assist::pipeline::rules::RuleEvaluator;
use relay_assist::pipeline::{Channel, MessageRouter, MessageSink, RouterServices};
use relay_assist::store::{LibSqlBackend, RecordStore};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = RelayConfig::from_env()?;

    // Console always; daily rolling file when a log dir is set.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "relay-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    eprintln!("📨 Relay Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   HTTP: http://0.0.0.0:{}/ingest/direct", config.port);
    eprintln!("   Operator WS: ws://0.0.0.0:{}/ws/operator", config.port);

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn RecordStore> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&config.db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path);

    // ── Services ────────────────────────────────────────────────────────
    let (dedup, _dedup_handle) = Deduplicator::spawn(config.dedup_ttl, config.dedup_capacity);
    let gate = Arc::new(ChannelGate::load(Arc::clone(&store)).await?);
    let contacts = Arc::new(ContactDirectory::load(Arc::clone(&store)).await?);
    let rules = Arc::new(RuleEvaluator::load(Arc::clone(&store)).await?);
    let admin = Arc::new(
        AdminSessions::load(
            Arc::clone(&store),
            config.admin_code.clone(),
            config.admin_window,
        )
        .await?,
    );
    let destructive = Arc::new(DestructiveGate::new(
        config.admin_code.clone(),
        config.pending_expiry,
    ));
    eprintln!("   Contacts: {}", contacts.len().await);

    let inference: Option<Arc<dyn Inference>> = match &config.inference {
        Some(cfg) => {
            eprintln!("   Inference: {} @ {}", cfg.model, cfg.url);
            Some(Arc::new(OllamaInference::new(cfg)?) as Arc<dyn Inference>)
        }
        None => {
            eprintln!("   Inference: disabled (keyword commands, canned replies)");
            None
        }
    };

    // ── Transports ──────────────────────────────────────────────────────
    let mut dispatcher = Dispatcher::new();
    if let Some(sms) = &config.sms {
        let gateway = Arc::new(SmsGateway::new(sms.clone())?);
        dispatcher = dispatcher
            .with(Channel::Direct, gateway.clone())
            .with(Channel::ForwardedVoice, gateway);
        eprintln!("   SMS gateway: {}", sms.url);
    }
    if let Some(smtp) = config.mail.as_ref().and_then(|m| m.smtp.clone()) {
        eprintln!("   SMTP: {}:{}", smtp.host, smtp.port);
        dispatcher = dispatcher.with(Channel::Mail, Arc::new(SmtpMailer::new(smtp)));
    }

    let mail_api: Option<Arc<dyn MailApi>> = match &config.mail {
        Some(mail) => Some(Arc::new(GraphMailApi::new(mail)?) as Arc<dyn MailApi>),
        None => None,
    };

    let feed = Arc::new(OperatorFeed::new());
    let notifier: Arc<dyn OperatorNotifier> = feed.clone();

    // ── Router ──────────────────────────────────────────────────────────
    let router = MessageRouter::new(
        RouterServices {
            dedup,
            gate,
            contacts: Arc::clone(&contacts),
            rules,
            admin,
            destructive,
            dispatcher,
            notifier: Arc::clone(&notifier),
            inference,
            mail: mail_api.clone(),
        },
        &config,
    );
    let sink: Arc<dyn MessageSink> = Arc::new(router);

    if let Some(commands) = feed.take_commands().await {
        let _command_handle = spawn_command_loop(commands, Arc::clone(&sink));
    }

    // ── Mail sync ───────────────────────────────────────────────────────
    let poller = match (&config.mail, mail_api) {
        (Some(mail), Some(api)) => {
            let cursor = Arc::new(SyncCursorManager::load(api, Arc::clone(&store)).await?);
            let poller = Arc::new(MailPoller::new(
                cursor,
                Arc::clone(&store),
                Arc::clone(&sink),
                Arc::clone(&notifier),
                config.voice_forward_senders.clone(),
            ));
            let (_sync_handle, _sync_shutdown) =
                spawn_sync_ticker(Arc::clone(&poller), mail.poll_interval);
            eprintln!(
                "   Mail sync: {} every {}s",
                mail.mailbox_folder,
                mail.poll_interval.as_secs()
            );
            Some(poller)
        }
        _ => {
            eprintln!("   Mail sync: disabled");
            None
        }
    };

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = build_app(sink, poller, contacts, &feed);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
