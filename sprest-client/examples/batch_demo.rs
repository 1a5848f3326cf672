//! Ensure a list, then add three items and read the web title in one batch.
//!
//! ```bash
//! SPREST_BASE_URL=https://contoso.sharepoint.com/sites/dev \
//! SPREST_ACCESS_TOKEN=eyJ0eXAi... \
//! cargo run --example batch_demo
//! ```

use anyhow::Context;
use serde_json::json;
use sprest_client::logging::init_logging;
use sprest_client::{Client, ClientConfig, ListSettings, Node};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging("logs", "batch_demo")?;

    let token = std::env::var("SPREST_ACCESS_TOKEN").context("SPREST_ACCESS_TOKEN is not set")?;
    let config = ClientConfig::from_env()?.with_header("Authorization", format!("Bearer {}", token));
    let client = Client::new(config)?;
    let web = client.web()?;

    let ensured = web
        .lists()
        .ensure(&ListSettings::new("Demo Tasks").description("Created by batch_demo"))
        .await?;
    info!(created = ensured.created, "List ready");

    let batch = client.create_batch();
    let items = ensured.list.items().in_batch(&batch)?;
    let adds: Vec<_> = ["Plan", "Build", "Ship"]
        .iter()
        .map(|title| items.add(json!({ "Title": title })))
        .collect();
    let title = web.clone().select(&["Title"]).in_batch(&batch)?.get();

    batch.execute().await?;

    info!(web = %title.await?["Title"], "Batch executed");
    for add in adds {
        let added = add.await?;
        info!(id = %added.data["Id"], url = %added.item.url(), "Item added");
    }
    Ok(())
}
