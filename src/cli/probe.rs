use anyhow::bail;
use channel_host::io::{HttpClient, HttpRequest, ReqwestHttpClient};
use channel_host::logger::init_tracing;
use clap::Args;
use tracing::info;

use super::CliContext;

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// URL to GET
    pub url: String,

    /// Request timeout; defaults to CHANNEL_HOST_HTTP_TIMEOUT_MS
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

pub async fn execute(args: ProbeArgs, context: &CliContext) -> anyhow::Result<()> {
    let _telemetry = init_tracing(&context.config.log_config())?;
    context.config.log_env_file();
    let client = ReqwestHttpClient::new();
    let request = HttpRequest::get(args.url.clone())
        .timeout_ms(args.timeout_ms.unwrap_or(context.config.http_timeout_ms));
    let response = client.execute(request).await?;
    info!(url = %args.url, status = response.status_code, "probe finished");
    println!(
        "{} {} bytes {}",
        response.status_code,
        response.body.len(),
        response.content_type.as_deref().unwrap_or("-")
    );
    if !response.is_success() {
        bail!("{} answered with status {}", args.url, response.status_code);
    }
    Ok(())
}
