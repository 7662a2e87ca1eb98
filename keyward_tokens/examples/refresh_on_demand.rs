use std::time::Duration;

use async_trait::async_trait;
use keyward_clock::DurationMillis;
use keyward_tokens::{
    refresh::oauth2::RefreshTokenGrant, BoxError, ClientId, ClientSecret, ExpiryPolicy,
    IssuerConfig, RefreshCoordinator, RefreshToken, Session, SessionBridge,
};
use tokio::time;

#[derive(Debug, clap::Parser)]
struct Opts {
    /// The issuer's base URL, such as https://auth.example.com/realms/app
    #[arg(short, long, env)]
    issuer_url: String,

    /// The client ID of the client
    #[arg(short, long, env)]
    client_id: ClientId,

    /// The client secret used to identify the client to the issuer
    #[arg(short = 's', long, env, hide_env_values = true)]
    client_secret: Option<ClientSecret>,

    /// The refresh token to start from
    #[arg(short, long, env, hide_env_values = true)]
    refresh_token: RefreshToken,

    /// Milliseconds before expiry at which a token is no longer used
    #[arg(long, env, default_value_t = 60_000)]
    expiry_margin_ms: u64,

    /// Seconds between token lookups
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: u64,
}

/// A session that only ever knows the refresh token it was started with
#[derive(Debug)]
struct StaticSession(RefreshToken);

#[async_trait]
impl SessionBridge for StaticSession {
    async fn fetch_session(&self) -> Result<Option<Session>, BoxError> {
        Ok(Some(Session {
            access_token: None,
            refresh_token: Some(self.0.clone()),
        }))
    }

    async fn terminate_session(&self) {
        tracing::error!("session terminated, a new login is required");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = <Opts as clap::Parser>::parse();

    let config = IssuerConfig::new(opts.issuer_url, opts.client_id, opts.client_secret);
    let grant = RefreshTokenGrant::from_config(&config)?;
    let policy = ExpiryPolicy::default().with_margin(DurationMillis(opts.expiry_margin_ms));

    let coordinator = RefreshCoordinator::builder(grant, StaticSession(opts.refresh_token))
        .with_policy(policy)
        .build();

    let mut watcher = coordinator.subscribe();
    tokio::spawn(async move {
        while let Ok(credential) = watcher.changed().await {
            tracing::info!(
                token = format_args!("{:#?}", credential.access_token()),
                expires_at = credential.expires_at().0,
                "access token refreshed"
            );
        }
    });

    let mut interval = time::interval(Duration::from_secs(opts.interval_secs));
    loop {
        interval.tick().await;

        match coordinator.get_valid_access_token().await {
            Some(credential) => tracing::debug!(
                token = format_args!("{:#?}", credential.access_token()),
                expires_at = credential.expires_at().0,
                "pulled token"
            ),
            None => tracing::warn!("no access token available"),
        }
    }
}
