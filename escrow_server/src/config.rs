//! Server configuration.
//!
//! Everything is read from `MKT_*` environment variables. Missing or unparseable values are logged and replaced with
//! defaults, so the server always starts; a provider whose configuration is incomplete is left disabled.
use std::{env, fmt::Display, str::FromStr, time::Duration as StdDuration};

use chrono::Duration;
use escrow_engine::{
    api::{escrow_api::DEFAULT_HOLDING_PERIOD_DAYS, reconciliation::DEFAULT_STUCK_PAYMENT_MINUTES},
    fees::FeeDefaults,
    gateway::{CardGatewayConfig, QrTransferGatewayConfig},
    ReconciliationConfig,
};
use log::*;
use market_common::{helpers::parse_boolean_flag, FeeRate, Secret};

const DEFAULT_MKT_HOST: &str = "127.0.0.1";
const DEFAULT_MKT_PORT: u16 = 8360;
const DEFAULT_DATABASE_URL: &str = "sqlite://data/marketplace.db";
const DEFAULT_RECONCILIATION_INTERVAL_SECS: u64 = 300;
const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Operators authenticate with this key. When empty, the admin routes are unreachable.
    pub admin_key: Secret<String>,
    pub fees: FeeDefaults,
    pub reconciliation: ReconciliationConfig,
    /// How often the reconciliation worker runs.
    pub reconciliation_interval: StdDuration,
    pub card: Option<CardGatewayConfig>,
    pub qr: Option<QrTransferGatewayConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_MKT_HOST.to_string(),
            port: DEFAULT_MKT_PORT,
            database_url: DEFAULT_DATABASE_URL.to_string(),
            admin_key: Secret::default(),
            fees: FeeDefaults::default(),
            reconciliation: ReconciliationConfig::default(),
            reconciliation_interval: StdDuration::from_secs(DEFAULT_RECONCILIATION_INTERVAL_SECS),
            card: None,
            qr: None,
        }
    }
}

impl ServerConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self { host: host.to_string(), port, ..Default::default() }
    }

    pub fn from_env_or_default() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from `lookup`, which returns the raw value of a variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Self
    where F: Fn(&str) -> Option<String> {
        let env = EnvReader { lookup };
        let defaults = Self::default();
        let host = env.string("MKT_HOST").unwrap_or(defaults.host);
        let port = env.parse_or("MKT_PORT", DEFAULT_MKT_PORT);
        let database_url = env.string("MKT_DATABASE_URL").unwrap_or_else(|| {
            warn!("🪛️ MKT_DATABASE_URL is not set. Using {DEFAULT_DATABASE_URL}");
            defaults.database_url
        });
        let admin_key = Secret::new(env.string("MKT_ADMIN_KEY").unwrap_or_else(|| {
            warn!("🪛️ MKT_ADMIN_KEY is not set. Admin routes are disabled.");
            String::default()
        }));
        let fees = FeeDefaults {
            base_rate: env.fee_rate_or("MKT_DEFAULT_FEE_BPS", defaults.fees.base_rate),
            minimum_rate: env.fee_rate_or("MKT_MINIMUM_FEE_BPS", defaults.fees.minimum_rate),
            legit_discount: env.fee_rate_or("MKT_LEGIT_DISCOUNT_BPS", defaults.fees.legit_discount),
            membership_discount: env.fee_rate_or("MKT_MEMBERSHIP_DISCOUNT_BPS", defaults.fees.membership_discount),
        };
        let holding_days = env.parse_or("MKT_HOLDING_PERIOD_DAYS", DEFAULT_HOLDING_PERIOD_DAYS);
        let stuck_minutes = env.parse_or("MKT_STUCK_PAYMENT_MINUTES", DEFAULT_STUCK_PAYMENT_MINUTES);
        let reconciliation = ReconciliationConfig {
            stuck_payment_after: Duration::minutes(stuck_minutes.max(1)),
            holding_period: Duration::days(holding_days.max(0)),
        };
        let interval_secs = env.parse_or("MKT_RECONCILIATION_INTERVAL_SECS", DEFAULT_RECONCILIATION_INTERVAL_SECS);
        let reconciliation_interval = StdDuration::from_secs(interval_secs.max(1));
        let timeout = StdDuration::from_millis(env.parse_or("MKT_GATEWAY_TIMEOUT_MS", DEFAULT_GATEWAY_TIMEOUT_MS));
        let card = card_config(&env, timeout);
        let qr = qr_config(&env, timeout);
        Self { host, port, database_url, admin_key, fees, reconciliation, reconciliation_interval, card, qr }
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where F: Fn(&str) -> Option<String>
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    fn secret(&self, name: &str) -> Option<Secret<String>> {
        self.string(name).map(Secret::new)
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        parse_boolean_flag((self.lookup)(name), default)
    }

    fn parse_or<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        match self.string(name) {
            None => default,
            Some(s) => s.parse::<T>().unwrap_or_else(|e| {
                error!("🪛️ {s} is not a valid value for {name}. {e} Using the default, {default}, instead.");
                default
            }),
        }
    }

    fn fee_rate_or(&self, name: &str, default: FeeRate) -> FeeRate {
        let bps = self.parse_or(name, default.bps());
        if bps < 0 {
            error!("🪛️ {name} cannot be negative. Using the default, {default}, instead.");
            return default;
        }
        FeeRate::from_bps(bps)
    }
}

fn card_config<F>(env: &EnvReader<F>, timeout: StdDuration) -> Option<CardGatewayConfig>
where F: Fn(&str) -> Option<String> {
    let api_key = env.secret("MKT_CARD_API_KEY");
    if !env.flag("MKT_CARD_ENABLED", api_key.is_some()) {
        info!("🪛️ Card payments are disabled");
        return None;
    }
    let (Some(api_url), Some(api_key), Some(webhook_secret)) =
        (env.string("MKT_CARD_API_URL"), api_key, env.secret("MKT_CARD_WEBHOOK_SECRET"))
    else {
        error!(
            "🪛️ Card payments are enabled, but MKT_CARD_API_URL, MKT_CARD_API_KEY and MKT_CARD_WEBHOOK_SECRET are not \
             all set. Card payments are disabled."
        );
        return None;
    };
    Some(CardGatewayConfig { api_url, api_key, webhook_secret, timeout })
}

fn qr_config<F>(env: &EnvReader<F>, timeout: StdDuration) -> Option<QrTransferGatewayConfig>
where F: Fn(&str) -> Option<String> {
    let api_key = env.secret("MKT_QR_API_KEY");
    if !env.flag("MKT_QR_ENABLED", api_key.is_some()) {
        info!("🪛️ QR transfer payments are disabled");
        return None;
    }
    let (Some(api_url), Some(client_id), Some(api_key), Some(checksum_key)) = (
        env.string("MKT_QR_API_URL"),
        env.string("MKT_QR_CLIENT_ID"),
        api_key,
        env.secret("MKT_QR_CHECKSUM_KEY"),
    ) else {
        error!(
            "🪛️ QR transfer payments are enabled, but MKT_QR_API_URL, MKT_QR_CLIENT_ID, MKT_QR_API_KEY and \
             MKT_QR_CHECKSUM_KEY are not all set. QR transfer payments are disabled."
        );
        return None;
    };
    Some(QrTransferGatewayConfig { api_url, client_id, api_key, checksum_key, timeout })
}
