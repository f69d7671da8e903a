//! AMQP Relay Service - Entry Point
//!
//! Publishes and consumes relay messages through the assured publisher and
//! subscriber pool.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_amqp_relay::run().await
}
