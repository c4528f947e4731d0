//! Org credentials and run context construction.

use std::sync::Arc;

use clap::Args;
use miette::Result;
use orgbridge_api::{OrgApi, OrgClient, OrgCredentials};
use orgbridge_pipeline::{MigrationConfig, MigrationContext};
use tracing::info;

/// Login settings for the source and target orgs.
///
/// Every value may come from the environment (or `.env`); a missing value is
/// only an error for commands that talk to that org.
#[derive(Args, Debug, Clone, Default)]
pub struct OrgArgs {
    /// Source org login host
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_LOGIN_URL")]
    pub source_login_url: Option<String>,

    /// Source org username
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_USERNAME")]
    pub source_username: Option<String>,

    /// Source org password
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_PASSWORD", hide_env_values = true)]
    pub source_password: Option<String>,

    /// Source org security token
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_SECURITY_TOKEN", hide_env_values = true)]
    pub source_security_token: Option<String>,

    /// Source connected app client id
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_CLIENT_ID")]
    pub source_client_id: Option<String>,

    /// Source connected app client secret
    #[arg(long, global = true, env = "ORGBRIDGE_SOURCE_CLIENT_SECRET", hide_env_values = true)]
    pub source_client_secret: Option<String>,

    /// Target org login host
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_LOGIN_URL")]
    pub target_login_url: Option<String>,

    /// Target org username
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_USERNAME")]
    pub target_username: Option<String>,

    /// Target org password
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_PASSWORD", hide_env_values = true)]
    pub target_password: Option<String>,

    /// Target org security token
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_SECURITY_TOKEN", hide_env_values = true)]
    pub target_security_token: Option<String>,

    /// Target connected app client id
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_CLIENT_ID")]
    pub target_client_id: Option<String>,

    /// Target connected app client secret
    #[arg(long, global = true, env = "ORGBRIDGE_TARGET_CLIENT_SECRET", hide_env_values = true)]
    pub target_client_secret: Option<String>,
}

fn required(value: &Option<String>, variable: &str) -> Result<String> {
    value
        .clone()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| miette::miette!("missing {} (set it in the environment or .env)", variable))
}

impl OrgArgs {
    pub fn source(&self) -> Result<OrgCredentials> {
        Ok(OrgCredentials {
            login_url: required(&self.source_login_url, "ORGBRIDGE_SOURCE_LOGIN_URL")?,
            username: required(&self.source_username, "ORGBRIDGE_SOURCE_USERNAME")?,
            password: required(&self.source_password, "ORGBRIDGE_SOURCE_PASSWORD")?,
            security_token: self.source_security_token.clone().unwrap_or_default(),
            client_id: required(&self.source_client_id, "ORGBRIDGE_SOURCE_CLIENT_ID")?,
            client_secret: required(&self.source_client_secret, "ORGBRIDGE_SOURCE_CLIENT_SECRET")?,
        })
    }

    pub fn target(&self) -> Result<OrgCredentials> {
        Ok(OrgCredentials {
            login_url: required(&self.target_login_url, "ORGBRIDGE_TARGET_LOGIN_URL")?,
            username: required(&self.target_username, "ORGBRIDGE_TARGET_USERNAME")?,
            password: required(&self.target_password, "ORGBRIDGE_TARGET_PASSWORD")?,
            security_token: self.target_security_token.clone().unwrap_or_default(),
            client_id: required(&self.target_client_id, "ORGBRIDGE_TARGET_CLIENT_ID")?,
            client_secret: required(&self.target_client_secret, "ORGBRIDGE_TARGET_CLIENT_SECRET")?,
        })
    }
}

async fn login(credentials: OrgCredentials, role: &str) -> Result<Arc<dyn OrgApi>> {
    let username = credentials.username.clone();
    let client = OrgClient::connect(credentials)
        .await
        .map_err(|e| miette::miette!("failed to log in to {} org: {}", role, e))?;
    info!(org = role, username = %username, "logged in");
    Ok(Arc::new(client))
}

/// Log in to both orgs and build the run context.
pub async fn both(orgs: &OrgArgs, config: MigrationConfig) -> Result<MigrationContext> {
    let source = login(orgs.source()?, "source").await?;
    let target = login(orgs.target()?, "target").await?;
    Ok(MigrationContext::new(source, target, config))
}

/// Log in to the target org only.
///
/// The source client stays unauthenticated; target-side commands never
/// query it.
pub async fn target_only(orgs: &OrgArgs, config: MigrationConfig) -> Result<MigrationContext> {
    let source: Arc<dyn OrgApi> =
        Arc::new(OrgClient::new().map_err(|e| miette::miette!("{}", e))?);
    let target = login(orgs.target()?, "target").await?;
    Ok(MigrationContext::new(source, target, config))
}
