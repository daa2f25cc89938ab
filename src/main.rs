use outboxmq::LogHandler;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    outboxmq::run().handler(LogHandler).start().await
}
