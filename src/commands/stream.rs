use std::sync::Arc;

use anyhow::{Context, Result, bail};
use aws_config::SdkConfig;
use clap::Args;
use dialoguer::{Password, theme::ColorfulTheme};
use tokio::signal;
use tracing::{info, warn};

use crate::{
    aws::{self, AuthorizationBinder, CognitoIdentityPool, CredentialBroker, IotPolicyStore},
    clock::SystemClock,
    config::{self, Config},
    connection::{ConnectionManager, ConnectionState, JsonObject},
    constants::PASSWORD_ENV,
    idp::CognitoUserPool,
    transport::MqttWsTransport,
};

#[derive(Debug, Clone, Default, Args)]
pub struct StreamCommand {
    #[arg(short = 't', long, help = "Topic filter to subscribe to instead of the configured one")]
    pub topic: Option<String>,

    #[arg(long, help = "Pretty-print each message instead of one JSON object per line")]
    pub pretty: bool,
}

impl StreamCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        let mut config = load_validated(profile).await?;
        if let Some(topic) = self.topic {
            config.topic = topic;
        }

        let (broker, sdk_config) = build_broker(&config).await?;
        let binder = AuthorizationBinder::new(
            Arc::new(IotPolicyStore::new(sdk_config)),
            config.policy_name.clone(),
        );
        let transport = Arc::new(MqttWsTransport::new(config.transport_config()));
        let manager = ConnectionManager::new(
            config.manager_settings(),
            broker,
            binder,
            transport,
            Arc::new(SystemClock),
        );

        let pretty = self.pretty;
        manager.register_message_handler(move |message: JsonObject| print_message(&message, pretty));

        let mut states = manager.subscribe_state();
        manager.connect();
        eprintln!(
            "Streaming '{}' from {} (Ctrl-C to stop)",
            config.topic, config.endpoint_host
        );

        loop {
            tokio::select! {
                interrupted = signal::ctrl_c() => {
                    interrupted.context("Failed to listen for Ctrl-C")?;
                    info!("Interrupted, disconnecting");
                    manager.disconnect().await;
                    return Ok(());
                }
                changed = states.changed() => {
                    changed.context("Connection manager stopped unexpectedly")?;
                    let state = *states.borrow_and_update();
                    if state == ConnectionState::Failed {
                        let reason = manager
                            .last_error()
                            .map_or_else(|| "unknown error".to_string(), |e| e.to_string());
                        manager.disconnect().await;
                        bail!("Giving up on the connection: {reason}");
                    }
                }
            }
        }
    }
}

fn print_message(message: &JsonObject, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(message)
    } else {
        serde_json::to_string(message)
    };

    match rendered {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "Failed to render message"),
    }
}

/// Load a profile and refuse to continue if it is incomplete
pub(super) async fn load_validated(profile: &str) -> Result<Config> {
    let config = config::load(profile).await.with_context(|| {
        format!(
            "Failed to load configuration for profile '{profile}'. Please run 'telestream configure' first."
        )
    })?;
    config
        .validate()
        .with_context(|| format!("Profile '{profile}' is incomplete"))?;
    Ok(config)
}

/// Wire the Cognito-backed credential broker for a profile
pub(super) async fn build_broker(config: &Config) -> Result<(Arc<CredentialBroker>, SdkConfig)> {
    let password = match config.resolved_password() {
        Some(password) => password,
        None => prompt_password(&config.username)?,
    };

    let sdk_config = aws::load_sdk_config(&config.region).await;
    let idp = CognitoUserPool::new(
        &sdk_config,
        config.client_id.clone(),
        config.client_secret.clone(),
    );
    let pool = CognitoIdentityPool::new(&sdk_config, config.identity_pool_id.clone());

    let broker = CredentialBroker::new(
        config.broker_settings(password),
        Arc::new(idp),
        Arc::new(pool),
        Arc::new(SystemClock),
    );

    Ok((Arc::new(broker), sdk_config))
}

fn prompt_password(username: &str) -> Result<String> {
    eprintln!("No password configured; set {PASSWORD_ENV} to skip this prompt.");
    Password::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Password for {username}"))
        .interact()
        .context("Failed to read password")
}
