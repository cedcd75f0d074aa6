// Thin shim; all wiring lives in the library's run function.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamchat::run().await
}
