use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    keel_cli::run_app().await
}
