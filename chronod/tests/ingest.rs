//! End-to-end ingestion: TCP bytes in, chunks on disk, registry and
//! volume state intact after a restart.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use chronod::config::{BackoffPolicy, Durability, StorageConfig};
use chronod::metrics::Metrics;
use chronod::pipeline::IngestionPipeline;
use chronod::server::tcp::{serve_listener, Dialect};
use chronod::storage::catalog::Catalog;
use chronod::storage::compression::decode_chunk;
use chronod::storage::{catalog_path, Storage};

fn test_config(dir: &std::path::Path) -> StorageConfig {
    StorageConfig {
        path: dir.to_path_buf(),
        nvolumes: 3,
        volume_capacity: 256,
        window_size: 1000,
        compression_threshold: 1,
        max_cache_size: u64::MAX,
        durability: Durability::Max,
        enable_huge_tlb: false,
    }
}

#[tokio::test]
async fn ingest_persist_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    Storage::create(&config).await.unwrap();

    let metrics = Arc::new(Metrics::new());
    let total = 100u64;
    {
        let catalog = Catalog::open(catalog_path(&config.path)).await.unwrap();
        let storage = Storage::open(&config, metrics.clone(), &catalog)
            .await
            .unwrap();
        let registry = storage.registry();
        let meta = storage.meta();
        let db = storage.handle();
        let pipeline =
            IngestionPipeline::new(4, BackoffPolicy::LinearBackoff, metrics.clone());
        pipeline.start(storage);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(serve_listener(
            listener,
            Dialect::Resp,
            pipeline.clone(),
            db,
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        for i in 0..total {
            let record = format!("+cpu host=h{}\r\n:{}\r\n+{}.5\r\n", i % 4, 1000 + i, i);
            client.write_all(record.as_bytes()).await.unwrap();
        }
        client.shutdown().await.unwrap();
        drop(client);

        tokio::time::sleep(Duration::from_millis(300)).await;
        server.abort();
        let storage = pipeline.stop().await.expect("writer exits in time");
        assert_eq!(metrics.samples_written.load(Ordering::Relaxed), total);

        // The daemon's final persistence pass.
        let names = registry.pull_new_names();
        assert_eq!(names.len(), 4);
        catalog.append_series_names(&names).await.unwrap();
        if let Some(descs) = meta.take_dirty() {
            catalog.update_volumes(&descs).await.unwrap();
        }
        catalog.close().await;
        drop(storage);
    }

    // Restart: same active volume, same ids, data readable.
    let catalog = Catalog::open(catalog_path(&config.path)).await.unwrap();
    let mut storage = Storage::open(&config, Arc::new(Metrics::new()), &catalog)
        .await
        .unwrap();
    assert_eq!(storage.active_volume_id(), 0);

    let registry = storage.registry();
    assert_eq!(registry.len(), 4);
    assert_eq!(registry.resolve("cpu host=h0").unwrap(), 1024);
    assert_eq!(registry.resolve("cpu host=h3").unwrap(), 1027);
    // Fresh names continue after the restored maximum.
    assert_eq!(registry.resolve("cpu host=new").unwrap(), 1028);

    let page = storage.page_mut(0);
    let descs = page.header.index.clone();
    let mut samples = Vec::new();
    for desc in &descs {
        let payload = page.read_chunk(desc).unwrap();
        samples.extend(decode_chunk(&payload).unwrap());
    }
    assert_eq!(samples.len(), total as usize);
    for (i, sample) in samples.iter().enumerate() {
        assert_eq!(sample.timestamp, 1000 + i as u64);
        assert_eq!(sample.value, i as f64 + 0.5);
    }
    catalog.close().await;
}
