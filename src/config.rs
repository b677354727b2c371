use serde::{Deserialize, Serialize};
use std::env;

use crate::entities::{PurchaseFunding, PurchaseKind};
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub provisioning: ProvisioningConfig,
    #[serde(default)]
    pub entitlement: EntitlementConfig,
    #[serde(default)]
    pub purchases: PurchasesConfig,
    #[serde(default)]
    pub referral: ReferralConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub auto_renewal: AutoRenewalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Per-transaction statement timeout for the finalizing transaction (Postgres only).
    #[serde(default = "default_statement_timeout_ms")]
    pub statement_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Bearer token the bot presents on /api/v1.
    pub api_token: String,
    /// Shared secret payment providers send in `X-Webhook-Secret`.
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningConfig {
    pub base_url: String,
    pub api_token: String,
    #[serde(default = "default_provisioning_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_provisioning_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_provisioning_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementConfig {
    /// Days after expiry during which a purchase still renews the same credential.
    pub stale_after_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanConfig {
    pub days: i32,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchasesConfig {
    pub pending_window_minutes: i64,
    pub topup_min: i64,
    pub topup_max: i64,
    pub plans: Vec<PlanConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Share of an externally funded purchase credited to the referrer; 0 disables rewards.
    pub reward_percent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    pub interval_secs: u64,
    /// Rows changed more recently than this are left to the post-commit sync.
    pub grace_secs: i64,
    pub batch_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub reminder_lead_hours: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoRenewalConfig {
    pub enabled: bool,
    pub lead_hours: i64,
    pub plan_days: i32,
}

fn default_statement_timeout_ms() -> u64 {
    10_000
}

fn default_provisioning_timeout_secs() -> u64 {
    10
}

fn default_provisioning_max_attempts() -> u32 {
    3
}

fn default_provisioning_backoff_ms() -> u64 {
    200
}

impl Default for EntitlementConfig {
    fn default() -> Self {
        Self {
            stale_after_days: 3,
        }
    }
}

impl Default for PurchasesConfig {
    fn default() -> Self {
        Self {
            pending_window_minutes: 30,
            topup_min: 100,
            topup_max: 100_000,
            plans: vec![
                PlanConfig {
                    days: 30,
                    price: 300,
                },
                PlanConfig {
                    days: 90,
                    price: 800,
                },
                PlanConfig {
                    days: 180,
                    price: 1500,
                },
                PlanConfig {
                    days: 365,
                    price: 2800,
                },
            ],
        }
    }
}

impl PurchasesConfig {
    pub fn plan(&self, days: i32) -> Option<&PlanConfig> {
        self.plans.iter().find(|p| p.days == days)
    }

    /// Validates the request shape and resolves `(duration_days, price)`.
    pub fn price_for(
        &self,
        kind: PurchaseKind,
        funding: PurchaseFunding,
        duration_days: Option<i32>,
        amount: Option<i64>,
    ) -> AppResult<(Option<i32>, i64)> {
        match kind {
            PurchaseKind::Entitlement => {
                let days = duration_days.ok_or_else(|| {
                    AppError::ValidationError("duration_days is required".to_string())
                })?;
                let plan = self.plan(days).ok_or_else(|| {
                    AppError::ValidationError(format!("No plan for {days} days"))
                })?;
                Ok((Some(plan.days), plan.price))
            }
            PurchaseKind::BalanceTopup => {
                if funding != PurchaseFunding::External {
                    return Err(AppError::ValidationError(
                        "Top-ups must be paid externally".to_string(),
                    ));
                }
                let amount = amount
                    .ok_or_else(|| AppError::ValidationError("amount is required".to_string()))?;
                if amount < self.topup_min || amount > self.topup_max {
                    return Err(AppError::ValidationError(format!(
                        "Top-up must be between {} and {}",
                        self.topup_min, self.topup_max
                    )));
                }
                Ok((None, amount))
            }
        }
    }
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self { reward_percent: 10 }
    }
}

impl ReferralConfig {
    pub fn reward_for(&self, price: i64) -> i64 {
        if self.reward_percent <= 0 {
            return 0;
        }
        price * self.reward_percent / 100
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            grace_secs: 120,
            batch_size: 200,
        }
    }
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            reminder_lead_hours: 72,
        }
    }
}

impl Default for AutoRenewalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lead_hours: 24,
            plan_days: 30,
        }
    }
}

impl Config {
    pub fn from_toml() -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        use std::io::ErrorKind;

        // No config file means everything comes from the environment.
        let config_result = std::fs::read_to_string(&config_path);

        let mut config: Config = match config_result {
            Ok(config_str) => {
                toml::from_str(&config_str).map_err(|e| format!("failed to parse {config_path}: {e}"))?
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fn get_env(name: &str) -> Option<String> {
                    env::var(name).ok()
                }
                fn get_env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
                    env::var(name)
                        .ok()
                        .and_then(|v| v.parse::<T>().ok())
                        .unwrap_or(default)
                }

                let database_url = get_env("DATABASE_URL")
                    .ok_or("DATABASE_URL is not set and config.toml was not found")?;

                Config {
                    server: ServerConfig {
                        host: get_env("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                        port: get_env_parse("SERVER_PORT", 8080u16),
                    },
                    database: DatabaseConfig {
                        url: database_url,
                        max_connections: get_env_parse("DB_MAX_CONNECTIONS", 10u32),
                        statement_timeout_ms: get_env_parse(
                            "DB_STATEMENT_TIMEOUT_MS",
                            default_statement_timeout_ms(),
                        ),
                    },
                    auth: AuthConfig {
                        api_token: get_env("API_TOKEN").unwrap_or_default(),
                        webhook_secret: get_env("WEBHOOK_SECRET").unwrap_or_default(),
                    },
                    provisioning: ProvisioningConfig {
                        base_url: get_env("PANEL_BASE_URL")
                            .unwrap_or_else(|| "http://127.0.0.1:2053".to_string()),
                        api_token: get_env("PANEL_API_TOKEN").unwrap_or_default(),
                        timeout_secs: get_env_parse(
                            "PANEL_TIMEOUT_SECS",
                            default_provisioning_timeout_secs(),
                        ),
                        max_attempts: get_env_parse(
                            "PANEL_MAX_ATTEMPTS",
                            default_provisioning_max_attempts(),
                        ),
                        backoff_ms: get_env_parse(
                            "PANEL_BACKOFF_MS",
                            default_provisioning_backoff_ms(),
                        ),
                    },
                    entitlement: EntitlementConfig::default(),
                    purchases: PurchasesConfig::default(),
                    referral: ReferralConfig::default(),
                    reconciliation: ReconciliationConfig::default(),
                    notifications: NotificationsConfig::default(),
                    auto_renewal: AutoRenewalConfig::default(),
                }
            }
            Err(e) => {
                return Err(format!("cannot read config file {config_path}: {e}").into());
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values.
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
            env::var(name).ok().and_then(|v| v.parse().ok())
        }

        if let Ok(v) = env::var("SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(p) = parsed("SERVER_PORT") {
            self.server.port = p;
        }
        if let Ok(v) = env::var("DATABASE_URL") {
            self.database.url = v;
        }
        if let Some(mc) = parsed("DB_MAX_CONNECTIONS") {
            self.database.max_connections = mc;
        }
        if let Some(ms) = parsed("DB_STATEMENT_TIMEOUT_MS") {
            self.database.statement_timeout_ms = ms;
        }
        if let Ok(v) = env::var("API_TOKEN") {
            self.auth.api_token = v;
        }
        if let Ok(v) = env::var("WEBHOOK_SECRET") {
            self.auth.webhook_secret = v;
        }
        if let Ok(v) = env::var("PANEL_BASE_URL") {
            self.provisioning.base_url = v;
        }
        if let Ok(v) = env::var("PANEL_API_TOKEN") {
            self.provisioning.api_token = v;
        }
        if let Some(n) = parsed("PANEL_TIMEOUT_SECS") {
            self.provisioning.timeout_secs = n;
        }
        if let Some(n) = parsed("PANEL_MAX_ATTEMPTS") {
            self.provisioning.max_attempts = n;
        }
        if let Some(n) = parsed("PANEL_BACKOFF_MS") {
            self.provisioning.backoff_ms = n;
        }
        if let Some(n) = parsed("STALE_AFTER_DAYS") {
            self.entitlement.stale_after_days = n;
        }
        if let Some(n) = parsed("REFERRAL_REWARD_PERCENT") {
            self.referral.reward_percent = n;
        }
        if let Some(n) = parsed("RECONCILE_INTERVAL_SECS") {
            self.reconciliation.interval_secs = n;
        }
        if let Some(b) = parsed("AUTO_RENEWAL_ENABLED") {
            self.auto_renewal.enabled = b;
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.auth.api_token.is_empty() {
            return Err("auth.api_token must be set".to_string());
        }
        if self.auth.webhook_secret.is_empty() {
            return Err("auth.webhook_secret must be set".to_string());
        }
        if self.entitlement.stale_after_days < 0 {
            return Err("entitlement.stale_after_days must not be negative".to_string());
        }
        if self.purchases.plans.iter().any(|p| p.days <= 0 || p.price <= 0) {
            return Err("purchases.plans entries need positive days and price".to_string());
        }
        if self.purchases.topup_min <= 0 || self.purchases.topup_min > self.purchases.topup_max {
            return Err("purchases.topup_min/topup_max are inconsistent".to_string());
        }
        if !(0..=100).contains(&self.referral.reward_percent) {
            return Err("referral.reward_percent must be within 0..=100".to_string());
        }
        if self.provisioning.max_attempts == 0 {
            return Err("provisioning.max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}
