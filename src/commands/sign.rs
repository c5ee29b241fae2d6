use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use super::stream::{build_broker, load_validated};
use crate::{aws::RequestSigner, clock::SystemClock, constants::IOT_SERVICE_NAME};

#[derive(Debug, Clone, Args)]
pub struct SignCommand {}

impl SignCommand {
    pub async fn execute(self, profile: &str) -> Result<()> {
        let config = load_validated(profile).await?;
        let (broker, _) = build_broker(&config).await?;

        let credentials = broker
            .get_access_credentials()
            .await
            .context("Failed to obtain AWS credentials")?;
        info!(access_key_id = %credentials.access_key_id, "Obtained temporary credentials");

        let url = RequestSigner::new(Arc::new(SystemClock))
            .sign(
                &credentials,
                &config.endpoint_host,
                &config.region,
                IOT_SERVICE_NAME,
            )
            .context("Failed to sign WebSocket URL")?;

        println!("{url}");
        Ok(())
    }
}
