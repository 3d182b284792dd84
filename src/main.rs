// telegram-sip-bridge/src/main.rs
use telegram_sip_bridge::app::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app = App::bootstrap().await?;
    app.run().await
}
