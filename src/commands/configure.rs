use anyhow::Result;
use clap::Args;

use crate::config;

#[derive(Debug, Clone, Args)]
pub struct ConfigureCommand {
    #[arg(long, help = "Print the stored profile instead of prompting")]
    pub show: bool,
}

impl ConfigureCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        if !self.show {
            return config::configure_interactive(profile).await;
        }

        let config = config::load(profile).await?;
        println!("[{profile}]");
        println!("region               = {}", config.region);
        println!("user_pool_id         = {}", config.user_pool_id);
        println!("client_id            = {}", config.client_id);
        println!("identity_pool_id     = {}", config.identity_pool_id);
        println!("endpoint_host        = {}", config.endpoint_host);
        println!("topic                = {}", config.topic);
        println!("policy_name          = {}", config.policy_name);
        println!("username             = {}", config.username);
        println!("max_reconnect_attempts = {}", config.max_reconnect_attempts);
        println!(
            "backoff              = {}ms..{}ms",
            config.backoff_base_ms, config.backoff_max_ms
        );
        println!("client_secret        = {}", mask(config.client_secret.is_some()));
        println!("password             = {}", mask(config.resolved_password().is_some()));

        if let Err(e) = config.validate() {
            println!("\nWarning: {e}");
        }
        Ok(())
    }
}

fn mask(present: bool) -> &'static str {
    if present { "(set)" } else { "(not set)" }
}
