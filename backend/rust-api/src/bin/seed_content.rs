use anyhow::Context;
use tracing_subscriber::fmt::init;

use codetutor_api::{
    config::Config,
    models::SeedContent,
    services::store::{MongoStore, TutorStore},
};

const DEFAULT_SEED_PATH: &str = "seed/content.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SEED_CONTENT_PATH").ok())
        .unwrap_or_else(|| DEFAULT_SEED_PATH.to_string());

    let raw = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading seed file {}", path))?;
    let content: SeedContent =
        serde_json::from_str(&raw).with_context(|| format!("parsing seed file {}", path))?;

    let config = Config::load().context("loading configuration")?;
    let store = MongoStore::connect(&config).await?;
    let summary = store.seed_content(content).await?;

    tracing::info!(
        "Seeded {} topics, {} problems, {} beginner topics from {}",
        summary.topics,
        summary.problems,
        summary.beginner_topics,
        path
    );

    Ok(())
}
