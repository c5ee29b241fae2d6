use crate::{
    aws::broker::BrokerSettings,
    connection::{ManagerSettings, ReconnectPolicy},
    constants::{
        self, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_MAX_MS, DEFAULT_CLIENT_ID_PREFIX,
        DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_KEEP_ALIVE_SECS, DEFAULT_MAX_RECONNECT_ATTEMPTS,
        IOT_SERVICE_NAME, PASSWORD_ENV,
    },
    transport::TransportConfig,
};
use anyhow::{Context, Result, bail};
use dialoguer::{Input, theme::ColorfulTheme};
use ini::{Ini, Properties};
use std::{env, path::PathBuf, str::FromStr, time::Duration};
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub region: String,
    pub user_pool_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub identity_pool_id: String,
    pub endpoint_host: String,
    pub topic: String,
    pub policy_name: String,
    pub username: String,
    pub password: Option<String>,
    pub max_reconnect_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub keep_alive_secs: u16,
    pub connect_timeout_secs: u64,
    pub client_id_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: String::new(),
            user_pool_id: String::new(),
            client_id: String::new(),
            client_secret: None,
            identity_pool_id: String::new(),
            endpoint_host: String::new(),
            topic: String::new(),
            policy_name: String::new(),
            username: String::new(),
            password: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_max_ms: DEFAULT_BACKOFF_MAX_MS,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            client_id_prefix: DEFAULT_CLIENT_ID_PREFIX.to_string(),
        }
    }
}

impl Config {
    fn from_ini_section(section: &Properties) -> Self {
        let text = |key: &str| section.get(key).unwrap_or("").to_string();
        let optional = |key: &str| {
            section
                .get(key)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            region: text("region"),
            user_pool_id: text("user_pool_id"),
            client_id: text("client_id"),
            client_secret: optional("client_secret"),
            identity_pool_id: text("identity_pool_id"),
            endpoint_host: text("endpoint_host"),
            topic: text("topic"),
            policy_name: text("policy_name"),
            username: text("username"),
            password: optional("password"),
            max_reconnect_attempts: parse_or(
                section,
                "max_reconnect_attempts",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            backoff_base_ms: parse_or(section, "backoff_base_ms", DEFAULT_BACKOFF_BASE_MS),
            backoff_max_ms: parse_or(section, "backoff_max_ms", DEFAULT_BACKOFF_MAX_MS),
            keep_alive_secs: parse_or(section, "keep_alive_secs", DEFAULT_KEEP_ALIVE_SECS),
            connect_timeout_secs: parse_or(
                section,
                "connect_timeout_secs",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            ),
            client_id_prefix: optional("client_id_prefix")
                .unwrap_or_else(|| DEFAULT_CLIENT_ID_PREFIX.to_string()),
        }
    }

    fn save_to_ini(&self, ini: &mut Ini, profile: &str) {
        let mut section = ini.with_section(Some(section_name(profile)));
        section
            .set("region", &self.region)
            .set("user_pool_id", &self.user_pool_id)
            .set("client_id", &self.client_id)
            .set("identity_pool_id", &self.identity_pool_id)
            .set("endpoint_host", &self.endpoint_host)
            .set("topic", &self.topic)
            .set("policy_name", &self.policy_name)
            .set("username", &self.username)
            .set(
                "max_reconnect_attempts",
                self.max_reconnect_attempts.to_string(),
            )
            .set("backoff_base_ms", self.backoff_base_ms.to_string())
            .set("backoff_max_ms", self.backoff_max_ms.to_string())
            .set("keep_alive_secs", self.keep_alive_secs.to_string())
            .set("connect_timeout_secs", self.connect_timeout_secs.to_string())
            .set("client_id_prefix", &self.client_id_prefix);

        // Secrets are only written back when they were already in the file
        if let Some(secret) = &self.client_secret {
            section.set("client_secret", secret);
        }
        if let Some(password) = &self.password {
            section.set("password", password);
        }
    }

    /// Reject a profile that cannot drive a connection
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("region", &self.region),
            ("user_pool_id", &self.user_pool_id),
            ("client_id", &self.client_id),
            ("identity_pool_id", &self.identity_pool_id),
            ("endpoint_host", &self.endpoint_host),
            ("topic", &self.topic),
            ("policy_name", &self.policy_name),
            ("username", &self.username),
        ];
        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(key, _)| *key)
            .collect();
        if !missing.is_empty() {
            bail!("Missing required settings: {}", missing.join(", "));
        }

        if self.endpoint_host.contains("://") || self.endpoint_host.contains('/') {
            bail!(
                "endpoint_host must be a bare host name, got '{}'",
                self.endpoint_host
            );
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            bail!("backoff_base_ms must be positive and no greater than backoff_max_ms");
        }
        if self.keep_alive_secs == 0 {
            bail!("keep_alive_secs must be positive");
        }
        if self.connect_timeout_secs == 0 {
            bail!("connect_timeout_secs must be positive");
        }

        Ok(())
    }

    /// Password from the environment, falling back to the profile
    pub fn resolved_password(&self) -> Option<String> {
        env::var(PASSWORD_ENV)
            .ok()
            .filter(|value| !value.is_empty())
            .or_else(|| self.password.clone())
    }

    pub fn broker_settings(&self, password: String) -> BrokerSettings {
        BrokerSettings {
            region: self.region.clone(),
            user_pool_id: self.user_pool_id.clone(),
            username: self.username.clone(),
            password,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            keep_alive_secs: self.keep_alive_secs,
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            endpoint_host: self.endpoint_host.clone(),
            region: self.region.clone(),
            service_name: IOT_SERVICE_NAME.to_string(),
            topic: self.topic.clone(),
            client_id_prefix: self.client_id_prefix.clone(),
            reconnect: self.reconnect_policy(),
        }
    }
}

pub async fn load(profile: &str) -> Result<Config> {
    let path = get_config_path()?;
    let ini = Ini::load_from_file(&path)
        .context("Failed to load config file. Please run `telestream configure` first")?;

    let section = ini
        .section(Some(section_name(profile)))
        .with_context(|| format!("Profile '{profile}' not found in config"))?;

    Ok(Config::from_ini_section(section))
}

pub async fn save(profile: &str, config: &Config) -> Result<()> {
    let path = get_config_path()?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut ini = if path.exists() {
        Ini::load_from_file(&path).unwrap_or_else(|_| Ini::new())
    } else {
        Ini::new()
    };

    config.save_to_ini(&mut ini, profile);

    ini.write_to_file(&path)
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    Ok(())
}

pub async fn configure_interactive(profile: &str) -> Result<()> {
    println!("Configuring telestream for profile: {profile}");

    let existing_config = load(profile).await.ok();

    if existing_config.is_some() {
        println!("Press Enter to keep current values, or type new values.");
    }
    println!();

    let theme = ColorfulTheme::default();
    let current = existing_config.unwrap_or_default();

    let prompt_required = |prompt: &str, default: &str| -> Result<String> {
        Input::<String>::with_theme(&theme)
            .with_prompt(prompt)
            .default(default.to_string())
            .allow_empty(!default.is_empty())
            .validate_with(|input: &String| {
                if input.trim().is_empty() {
                    Err("This value is required")
                } else {
                    Ok(())
                }
            })
            .interact_text()
            .with_context(|| format!("Failed to read {prompt}"))
    };

    let region = prompt_required("AWS Region", &current.region)?;
    let user_pool_id = prompt_required("Cognito User Pool ID", &current.user_pool_id)?;
    let client_id = prompt_required("Cognito App Client ID", &current.client_id)?;
    let identity_pool_id = prompt_required("Cognito Identity Pool ID", &current.identity_pool_id)?;
    let endpoint_host = prompt_required("AWS IoT Endpoint Host", &current.endpoint_host)?;
    let topic = prompt_required("Telemetry Topic", &current.topic)?;
    let policy_name = prompt_required("AWS IoT Policy Name", &current.policy_name)?;
    let username = prompt_required("Username", &current.username)?;

    let max_reconnect_attempts = Input::<u32>::with_theme(&theme)
        .with_prompt("Max Reconnect Attempts")
        .default(current.max_reconnect_attempts)
        .interact_text()
        .context("Failed to read max reconnect attempts")?;

    let config = Config {
        region,
        user_pool_id,
        client_id,
        identity_pool_id,
        endpoint_host,
        topic,
        policy_name,
        username,
        max_reconnect_attempts,
        ..current
    };
    config.validate()?;

    save(profile, &config).await?;

    println!("\nConfiguration saved successfully.");
    println!("Set {PASSWORD_ENV} or add `password` to the profile before streaming.");
    Ok(())
}

fn section_name(profile: &str) -> String {
    if profile == "default" {
        profile.to_string()
    } else {
        format!("profile {profile}")
    }
}

fn parse_or<T: FromStr>(section: &Properties, key: &str, default: T) -> T {
    section
        .get(key)
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}

fn get_config_path() -> Result<PathBuf> {
    constants::get_config_path().context("Failed to determine config path")
}
