use clap::{Arg, ArgAction, Command};
use csv_upsert::logging::init_tracing;
use csv_upsert::{IngestConfig, Ingestor, MemoryStore, ProgressReporter, SinkFailurePolicy};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = Command::new("bench")
        .about("Ingest a CSV (plain, .gz or .zst) into an in-memory store")
        .arg(Arg::new("path").long("path").required(true).value_parser(clap::value_parser!(PathBuf)))
        .arg(Arg::new("batch-size").long("batch-size").default_value("1000").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("max-record-bytes").long("max-record-bytes").default_value("1048576").value_parser(clap::value_parser!(usize)))
        .arg(Arg::new("skip-failed-batches").long("skip-failed-batches").help("Keep going when the store rejects a batch").action(ArgAction::SetTrue))
        .arg(Arg::new("progress").long("progress").help("Print every progress event as a JSON line on stdout").action(ArgAction::SetTrue))
        .arg(Arg::new("json-logs").long("json-logs").action(ArgAction::SetTrue))
        .get_matches();

    init_tracing("info", matches.get_flag("json-logs"))?;

    let path = matches.get_one::<PathBuf>("path").unwrap().clone();
    let config = IngestConfig {
        batch_size: *matches.get_one::<usize>("batch-size").unwrap(),
        max_record_bytes: *matches.get_one::<usize>("max-record-bytes").unwrap(),
        on_sink_failure: if matches.get_flag("skip-failed-batches") {
            SinkFailurePolicy::SkipBatch
        } else {
            SinkFailurePolicy::Abort
        },
        ..Default::default()
    };

    let reporter = ProgressReporter::new();
    let printer = matches.get_flag("progress").then(|| {
        let mut sub = reporter.subscribe();
        tokio::spawn(async move {
            while let Some(event) = sub.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(err) => eprintln!("progress event not serializable: {err}"),
                }
            }
            sub.missed()
        })
    });

    let store = Arc::new(MemoryStore::new());
    let ingestor = Ingestor::new(config, store.clone(), reporter.clone())?;

    let start = Instant::now();
    let outcome = ingestor.ingest_path(&path).await;
    let elapsed = start.elapsed().as_secs_f64();

    reporter.shutdown();
    if let Some(printer) = printer {
        let missed = printer.await?;
        if missed > 0 {
            eprintln!("progress printer fell behind and skipped {missed} events");
        }
    }

    let summary = outcome?;
    let rows = summary.processed + summary.failed;
    println!(
        "source={} processed={} failed={} batches={} store_calls={} stored_keys={}\nelapsed={:.1}s rows/sec={:.0}",
        path.display(),
        summary.processed,
        summary.failed,
        summary.batches,
        store.calls(),
        store.len(),
        elapsed,
        rows as f64 / elapsed
    );
    for rejected in &summary.error_samples {
        println!(
            "rejected key={} reason={}",
            rejected.key.as_deref().unwrap_or("<none>"),
            rejected.reason
        );
    }
    Ok(())
}
