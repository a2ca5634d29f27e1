#[tokio::main]
async fn main() -> eyre::Result<()> {
    credvault::run().start().await
}
