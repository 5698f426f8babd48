#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stratumbft::node::run_cli().await
}
