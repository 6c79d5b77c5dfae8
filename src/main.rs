use comms_core::db::monitoring::gather_metrics;
use comms_core::signature::SignatureEngine;
use comms_core::{CommsCore, CoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = CoreConfig::default();
    let core = CommsCore::open_in_memory(config.clone()).await?;

    // Демонстрация идемпотентной вставки: одно и то же сообщение из двух
    // источников даёт одну строку.
    let engine = SignatureEngine::from_config(&config);
    let t = comms_core::db::now_ms();
    let t = t - t.rem_euclid(config.signature_bucket_ms);
    let a = comms_core::db::message::Message::outgoing(
        &engine, "5551234567", "5559876543", "Привет", vec![], t,
    );
    let b = comms_core::db::message::Message::outgoing(
        &engine, "+15551234567", "5559876543", "Привет", vec![], t + 30_000,
    );
    println!("first insert:  {}", core.messages.insert_if_absent(a).await?);
    println!("second insert: {}", core.messages.insert_if_absent(b).await?);
    println!("{}", gather_metrics());
    Ok(())
}
