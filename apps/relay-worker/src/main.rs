//! Relay Worker Service - Entry Point
//!
//! Consumes a broker queue and relays messages to another queue.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    relay_worker::run().await
}
