use csv_upsert::{IngestConfig, Ingestor, MemoryStore, ProgressReporter, UploadMeta};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut body = String::from("sku,name,price\n");
    for i in 0..2_500 {
        body.push_str(&format!("SKU{i:06},Item {i},{}.50\n", i % 90 + 1));
    }

    let reporter = ProgressReporter::new();
    let mut sub = reporter.subscribe();
    let listener = tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            println!(
                "{:?}: {} stored, {} rejected, {} MiB",
                event.status, event.total_processed, event.total_failed, event.memory_gauge_mb
            );
        }
    });

    let ingestor = Ingestor::new(
        IngestConfig::default(),
        Arc::new(MemoryStore::new()),
        reporter.clone(),
    )?;
    let meta = UploadMeta {
        name_hint: "inline.csv".into(),
        ..Default::default()
    };
    let summary = ingestor
        .ingest_reader(std::io::Cursor::new(body.into_bytes()), meta)
        .await?;

    reporter.shutdown();
    listener.await?;
    println!("processed={} failed={}", summary.processed, summary.failed);
    Ok(())
}
