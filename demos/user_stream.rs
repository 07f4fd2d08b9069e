use std::error::Error;

use hitbtc_stream_sdk::stream::session::UserStreamSession;
use hitbtc_stream_sdk::{Credentials, StreamClient};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let credentials = Credentials::new(
        "REPLACE_WITH_API_KEY",
        SecretString::new("REPLACE_WITH_API_SECRET".to_string()),
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = StreamClient::new()
            .with_span(tracing::info_span!("user_stream"))
            .start();
        let mut reports = UserStreamSession::new(connection, credentials).spawn();

        while let Some(report) = reports.recv().await {
            println!(
                "order={} status={} type={}",
                report["clientOrderId"], report["status"], report["reportType"]
            );
        }

        Ok::<(), Box<dyn Error>>(())
    })
}
