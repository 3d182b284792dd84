// telegram-sip-bridge/src/app.rs
use crate::config::Settings;
use crate::contacts::ContactCache;
use crate::gateway::{Gateway, GatewayConfig};
use crate::sip::client::SipClient;
use crate::sip::server::SipServer;
use crate::sip::transport::SipTransport;
use crate::telegram::tdjson::TdJson;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter, Registry};

const LOG_FILE: &str = "bridge.log";

pub struct App {
    settings: Arc<Settings>,
}

fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "trace",
        1 => "debug",
        2 => "info",
        3 => "warn",
        4 | 5 => "error",
        _ => "off",
    }
}

fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::TRACE,
        1 => LevelFilter::DEBUG,
        2 => LevelFilter::INFO,
        3 => LevelFilter::WARN,
        4 | 5 => LevelFilter::ERROR,
        _ => LevelFilter::OFF,
    }
}

impl App {
    pub async fn bootstrap() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings_path = env::args()
            .nth(1)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("settings.ini"));
        let settings = Arc::new(Settings::load(&settings_path)?);

        // Per-component levels become target directives; RUST_LOG wins.
        let logging = &settings.logging;
        let directives = format!(
            "{core},telegram_sip_bridge::sip={sip},telegram_sip_bridge::telegram={tdlib},telegram_sip_bridge::media={tgvoip}",
            core = level_directive(logging.core),
            sip = level_directive(logging.sip),
            tdlib = level_directive(logging.tdlib),
            tgvoip = level_directive(logging.tgvoip),
        );
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&directives))
            .context("invalid log filter")?;

        let log_file = std::fs::File::create(LOG_FILE)
            .with_context(|| format!("failed to create {}", LOG_FILE))?;
        Registry::default()
            .with(env_filter)
            .with(fmt::layer().with_filter(level_filter(logging.console_min_level)))
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(log_file))
                    .with_filter(level_filter(logging.file_min_level)),
            )
            .init();

        info!(
            service_name = "telegram-sip-bridge",
            settings = %settings_path.display(),
            "🚀 starting up"
        );
        Ok(Self { settings })
    }

    pub async fn run(self) -> Result<()> {
        let settings = self.settings;
        let shutdown = CancellationToken::new();

        // 1. SIP transport (bind failure across the port range is fatal)
        let transport = Arc::new(
            SipTransport::bind(
                "0.0.0.0",
                settings.sip.port,
                settings.sip.port_range,
                settings.logging.sip_messages,
            )
            .await
            .context("SIP bind failed")?,
        );
        let via_host = settings
            .sip
            .public_address
            .clone()
            .unwrap_or_else(|| transport.local_addr().to_string());

        // 2. Telegram client
        let (tg, updates) = TdJson::open(settings.logging.tdlib).context("tdlib start failed")?;
        tg.authorize(&settings.telegram)
            .await
            .context("telegram authorization failed")?;

        // 3. Gateway
        let sip_client = Arc::new(SipClient::new(transport.clone(), via_host));
        let contacts = Arc::new(ContactCache::new());
        if settings.sip.callback_uri.is_none() {
            warn!("sip.callback_uri not set, telegram-initiated calls will be dropped");
        }
        let gateway = Arc::new(Gateway::new(
            transport.clone(),
            sip_client.clone(),
            tg.clone(),
            contacts,
            GatewayConfig::from_settings(&settings),
            shutdown.clone(),
        ));

        let sip_server = SipServer::new(
            transport,
            sip_client,
            gateway.clone(),
            settings.logging.sip_messages,
        );
        let server_handle = tokio::spawn(sip_server.run(shutdown.clone()));
        let refresh_handle = tokio::spawn(gateway.clone().refresh_contacts_loop());
        let gateway_handle = tokio::spawn(gateway.clone().run(updates));

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        warn!("shutdown signal received");
        shutdown.cancel();

        // the gateway drains live calls before returning
        let _ = gateway_handle.await;
        let _ = server_handle.await;
        let _ = refresh_handle.await;

        info!("service stopped");
        Ok(())
    }
}
