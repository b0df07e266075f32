//! SQLite-backed catalog: volume descriptors, series names and rescue
//! points survive restarts here. All access goes through this module's
//! handful of operations; the schema is internal.

use std::path::Path;

use log::debug;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use crate::storage::series::SeriesRecord;
use crate::storage::volume::VolumeDesc;
use crate::types::SeriesId;

/// Series-name tuples are appended in groups of at most this many rows
/// per transaction.
const NAME_BATCH: usize = 500;

pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, sqlx::Error> {
        let db_url = format!("sqlite://{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&db_url)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS volumes (
                id INTEGER PRIMARY KEY,
                version INTEGER NOT NULL,
                nblocks INTEGER NOT NULL,
                capacity INTEGER NOT NULL,
                generation INTEGER NOT NULL,
                path TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS series (
                series_id INTEGER PRIMARY KEY,
                metric TEXT NOT NULL,
                tags TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rescue_points (
                series_id INTEGER PRIMARY KEY,
                points BLOB NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn load_volumes(&self) -> Result<Vec<VolumeDesc>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, version, nblocks, capacity, generation, path FROM volumes ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| VolumeDesc {
                id: row.get::<i64, _>("id") as u32,
                version: row.get::<i64, _>("version") as u32,
                nblocks: row.get::<i64, _>("nblocks") as u32,
                capacity: row.get::<i64, _>("capacity") as u32,
                generation: row.get::<i64, _>("generation") as u32,
                path: row.get("path"),
            })
            .collect())
    }

    pub async fn add_volume(&self, desc: &VolumeDesc) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO volumes (id, version, nblocks, capacity, generation, path)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(desc.id as i64)
        .bind(desc.version as i64)
        .bind(desc.nblocks as i64)
        .bind(desc.capacity as i64)
        .bind(desc.generation as i64)
        .bind(&desc.path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write back the in-memory meta-volume state.
    pub async fn update_volumes(&self, descs: &[VolumeDesc]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for desc in descs {
            sqlx::query(
                "INSERT INTO volumes (id, version, nblocks, capacity, generation, path)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     nblocks = excluded.nblocks,
                     generation = excluded.generation,
                     capacity = excluded.capacity,
                     version = excluded.version,
                     path = excluded.path",
            )
            .bind(desc.id as i64)
            .bind(desc.version as i64)
            .bind(desc.nblocks as i64)
            .bind(desc.capacity as i64)
            .bind(desc.generation as i64)
            .bind(&desc.path)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        debug!("synced {} volume descriptors", descs.len());
        Ok(())
    }

    pub async fn load_series_names(&self) -> Result<Vec<SeriesRecord>, sqlx::Error> {
        let rows = sqlx::query("SELECT series_id, metric, tags FROM series")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| SeriesRecord {
                id: row.get::<i64, _>("series_id") as SeriesId,
                metric: row.get("metric"),
                tags: row.get("tags"),
            })
            .collect())
    }

    /// Append freshly registered names, batched per transaction.
    pub async fn append_series_names(
        &self,
        records: &[SeriesRecord],
    ) -> Result<(), sqlx::Error> {
        for batch in records.chunks(NAME_BATCH) {
            let mut tx = self.pool.begin().await?;
            for record in batch {
                sqlx::query(
                    "INSERT OR IGNORE INTO series (series_id, metric, tags) VALUES (?, ?, ?)",
                )
                .bind(record.id as i64)
                .bind(&record.metric)
                .bind(&record.tags)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        if !records.is_empty() {
            debug!("persisted {} series names", records.len());
        }
        Ok(())
    }

    /// Store restart hints for one series as a little-endian u64 blob.
    pub async fn upsert_rescue_points(
        &self,
        series_id: SeriesId,
        points: &[u64],
    ) -> Result<(), sqlx::Error> {
        let mut blob = Vec::with_capacity(points.len() * 8);
        for point in points {
            blob.extend_from_slice(&point.to_le_bytes());
        }
        sqlx::query(
            "INSERT INTO rescue_points (series_id, points) VALUES (?, ?)
             ON CONFLICT(series_id) DO UPDATE SET points = excluded.points",
        )
        .bind(series_id as i64)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn volumes_roundtrip_with_upsert() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite"))
            .await
            .unwrap();
        let mut desc = VolumeDesc {
            version: 2,
            id: 0,
            nblocks: 0,
            capacity: 128,
            generation: 0,
            path: "/data/volume.0".into(),
        };
        catalog.add_volume(&desc).await.unwrap();
        desc.nblocks = 17;
        desc.generation = 3;
        catalog.update_volumes(std::slice::from_ref(&desc)).await.unwrap();

        let loaded = catalog.load_volumes().await.unwrap();
        assert_eq!(loaded, vec![desc]);
    }

    #[tokio::test]
    async fn series_names_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.sqlite");
        let records: Vec<SeriesRecord> = (0..1200)
            .map(|i| SeriesRecord {
                id: 1024 + i,
                metric: "cpu".into(),
                tags: format!("host=h{i}"),
            })
            .collect();
        {
            let catalog = Catalog::open(&path).await.unwrap();
            catalog.append_series_names(&records).await.unwrap();
            // Idempotent on replay.
            catalog.append_series_names(&records[..10]).await.unwrap();
            catalog.close().await;
        }
        let catalog = Catalog::open(&path).await.unwrap();
        let mut loaded = catalog.load_series_names().await.unwrap();
        loaded.sort_by_key(|r| r.id);
        assert_eq!(loaded, records);
    }

    #[tokio::test]
    async fn rescue_points_upsert() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path().join("catalog.sqlite"))
            .await
            .unwrap();
        catalog.upsert_rescue_points(1024, &[1, 2, 3]).await.unwrap();
        catalog.upsert_rescue_points(1024, &[9]).await.unwrap();
        let row = sqlx::query("SELECT points FROM rescue_points WHERE series_id = 1024")
            .fetch_one(&catalog.pool)
            .await
            .unwrap();
        let blob: Vec<u8> = row.get("points");
        assert_eq!(blob, 9u64.to_le_bytes().to_vec());
    }
}
