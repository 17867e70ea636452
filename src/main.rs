#[tokio::main]
async fn main() -> anyhow::Result<()> {
    planting_verifier::server::run().await
}
