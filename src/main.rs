use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    sql_analytics::app::run().await
}
