//! Snapshot-based persistence for the in-memory store.
//!
//! A snapshot is a point-in-time image of every record, every persisted
//! index blob and every geohash-keyed index point. Snapshots are written
//! synchronously and atomically replace the previous one.

use crate::error::{GeoquadError, Result};
use geoquad_types::point::DataSnapshot;
use geoquad_types::record::{FieldValue, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SNAPSHOT_MAGIC: &[u8] = b"GEOQUAD_SNAPSHOT";
const SNAPSHOT_VERSION: u8 = 1;

/// Everything a [`MemoryStore`](super::MemoryStore) holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreImage {
    pub records: BTreeMap<RecordId, BTreeMap<String, FieldValue>>,
    pub indexes: BTreeMap<u64, Vec<u8>>,
    pub index_points: Vec<(u64, String, DataSnapshot)>,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotConfig {
    /// Write a snapshot only after this many operations. `None` writes one
    /// on every commit.
    pub auto_snapshot_ops: Option<usize>,
}

pub struct SnapshotFile {
    path: PathBuf,
    config: SnapshotConfig,
    ops_since_snapshot: usize,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P, config: SnapshotConfig) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
            ops_since_snapshot: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<StoreImage> {
        if !self.exists() {
            return Ok(StoreImage::default());
        }

        let file = File::open(&self.path)?;
        let metadata = file.metadata()?;
        if metadata.len() == 0 {
            return Ok(StoreImage::default());
        }

        let mut reader = BufReader::new(file);

        let mut magic = vec![0u8; SNAPSHOT_MAGIC.len()];
        reader.read_exact(&mut magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(GeoquadError::InvalidFormat);
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != SNAPSHOT_VERSION {
            return Err(GeoquadError::InvalidFormat);
        }

        let mut timestamp_bytes = [0u8; 16];
        reader.read_exact(&mut timestamp_bytes)?;

        let body_len = read_u64(&mut reader)? as usize;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;

        let image = bincode::deserialize(&body).map_err(|e| {
            GeoquadError::SerializationErrorWithContext(format!(
                "Failed to decode snapshot {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(image)
    }

    pub fn save(&mut self, image: &StoreImage) -> Result<()> {
        let body = bincode::serialize(image)?;
        let temp_path = self.temp_path();

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);

        writer.write_all(SNAPSHOT_MAGIC)?;
        writer.write_all(&[SNAPSHOT_VERSION])?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| GeoquadError::Other("system clock is before the unix epoch".into()))?;
        let mut timestamp_buf = [0u8; 16];
        timestamp_buf[0..8].copy_from_slice(&timestamp.as_secs().to_le_bytes());
        timestamp_buf[8..12].copy_from_slice(&timestamp.subsec_nanos().to_le_bytes());
        writer.write_all(&timestamp_buf)?;

        write_u64(&mut writer, body.len() as u64)?;
        writer.write_all(&body)?;

        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        self.sync_parent_dir()?;

        self.ops_since_snapshot = 0;
        log::debug!(
            "Wrote snapshot {} ({} records)",
            self.path.display(),
            image.records.len()
        );

        Ok(())
    }

    pub fn record_operation(&mut self) {
        self.ops_since_snapshot += 1;
    }

    pub fn should_snapshot(&self) -> bool {
        match self.config.auto_snapshot_ops {
            Some(threshold) => self.ops_since_snapshot >= threshold,
            None => true,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        if let Some(name) = temp.file_name() {
            let mut new_name = name.to_string_lossy().into_owned();
            new_name.push_str(".tmp");
            temp.set_file_name(new_name);
        }
        temp
    }

    fn sync_parent_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
        Ok(())
    }
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<()> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(())
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn sample_image() -> StoreImage {
        let mut image = StoreImage::default();
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldValue::from("Blue Bottle"));
        fields.insert("lat".to_string(), FieldValue::from(37.78));
        image
            .records
            .insert(RecordId::new("Cafe", "blue-bottle"), fields);
        image.indexes.insert(7, vec![1, 2, 3]);
        image.index_points.push((
            7,
            "9q8yy".to_string(),
            DataSnapshot::new("Cafe", "blue-bottle", 37.78, -122.40),
        ));
        image
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let temp = NamedTempFile::new().unwrap();
        let mut snapshot = SnapshotFile::new(temp.path(), SnapshotConfig::default());

        let image = sample_image();
        snapshot.save(&image).unwrap();

        let loaded = snapshot.load().unwrap();
        assert_eq!(loaded, image);
        assert_eq!(loaded.index_points[0].2.latitude, 37.78);
    }

    #[test]
    fn test_auto_snapshot_threshold() {
        let temp = NamedTempFile::new().unwrap();
        let config = SnapshotConfig {
            auto_snapshot_ops: Some(3),
        };
        let mut snapshot = SnapshotFile::new(temp.path(), config);

        assert!(!snapshot.should_snapshot());
        snapshot.record_operation();
        snapshot.record_operation();
        assert!(!snapshot.should_snapshot());
        snapshot.record_operation();
        assert!(snapshot.should_snapshot());

        snapshot.save(&StoreImage::default()).unwrap();
        assert!(!snapshot.should_snapshot());
    }

    #[test]
    fn test_load_nonexistent() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path().with_extension("nonexistent");
        let snapshot = SnapshotFile::new(&path, SnapshotConfig::default());

        let loaded = snapshot.load().unwrap();
        assert!(loaded.records.is_empty());
    }

    #[test]
    fn test_invalid_magic() {
        let temp = NamedTempFile::new().unwrap();
        let path = temp.path();

        let mut file = File::create(path).unwrap();
        file.write_all(b"NOT_A_GEOQUAD_FILE").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let snapshot = SnapshotFile::new(path, SnapshotConfig::default());
        assert!(matches!(snapshot.load(), Err(GeoquadError::InvalidFormat)));
    }
}
