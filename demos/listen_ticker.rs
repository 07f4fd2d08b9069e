use std::error::Error;

use futures_util::StreamExt;
use hitbtc_stream_sdk::StreamClient;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let connection = StreamClient::new().start();

        let ticker = connection.listen("ticker").await;
        connection
            .subscribe("subscribeTicker", json!({"symbol": "ETHBTC"}))
            .await?;

        let mut updates = ticker.take(5);
        while let Some(params) = updates.next().await {
            println!(
                "symbol={} bid={} ask={}",
                params["symbol"], params["bid"], params["ask"]
            );
        }

        connection.close().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}
