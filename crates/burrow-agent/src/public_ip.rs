//! Best-effort public IP discovery
//!
//! One lookup per process: the first caller performs the fetch and the
//! outcome, success or failure, is cached for the process lifetime.

use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

const DEFAULT_ECHO_URL: &str = "http://api.ipify.org";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

static PUBLIC_IP: OnceCell<Option<IpAddr>> = OnceCell::const_new();

/// Public address of this host according to the configured IP-echo service
/// (`BURROW_IP_ECHO_URL`, defaulting to api.ipify.org), or `None` when the
/// lookup failed or timed out.
pub async fn public_ip() -> Option<IpAddr> {
    *PUBLIC_IP
        .get_or_init(|| async {
            let url = std::env::var("BURROW_IP_ECHO_URL")
                .unwrap_or_else(|_| DEFAULT_ECHO_URL.to_string());
            match tokio::time::timeout(LOOKUP_TIMEOUT, fetch(&url)).await {
                Ok(Ok(ip)) => {
                    debug!(%ip, "discovered public ip");
                    Some(ip)
                }
                Ok(Err(e)) => {
                    debug!("public ip lookup failed: {e}");
                    None
                }
                Err(_) => {
                    debug!("public ip lookup timed out");
                    None
                }
            }
        })
        .await
}

async fn fetch(url: &str) -> Result<IpAddr, Box<dyn std::error::Error + Send + Sync>> {
    let body = reqwest::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .build()?
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    Ok(body.trim().parse()?)
}
