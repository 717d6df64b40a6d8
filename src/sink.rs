//! # Sink
//!
//! Where decoded measurements go.
//!

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use std::io;
use std::path::{Path, PathBuf};

use crate::measurement::MeasurementRecord;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("could not write records: {0}")]
    Io(#[from] io::Error),
}

/// Receives every decoded measurement, in arrival order
#[async_trait]
pub trait MeasurementSink: Send + Sync {
    async fn append(&self, record: &MeasurementRecord) -> Result<(), SinkError>;
}

/// Appends records to a CSV file, writing the header first when the file is
/// new or empty
pub struct CsvSink {
    path: PathBuf,
    /// Serializes appends so rows never interleave
    lock: Mutex<()>,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> CsvSink {
        CsvSink {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl MeasurementSink for CsvSink {
    async fn append(&self, record: &MeasurementRecord) -> Result<(), SinkError> {
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let fresh = match fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };

        let mut text = String::new();
        if fresh {
            text.push_str(&MeasurementRecord::FIELDS.join(","));
            text.push('\n');
        }
        text.push_str(&csv_row(record));

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;

        info!("Stored: {:?}", record);
        Ok(())
    }
}

fn csv_row(record: &MeasurementRecord) -> String {
    format!(
        "{},{},{},{},{}\n",
        record.timestamp,
        record.systolic,
        record.diastolic,
        record.mean_arterial_pressure,
        record
            .pulse_rate
            .map(|pulse| pulse.to_string())
            .unwrap_or_default()
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::measurement::RecordTime;

    fn record(pulse_rate: Option<u16>) -> MeasurementRecord {
        MeasurementRecord {
            timestamp: RecordTime {
                year: 2024,
                month: 5,
                day: 1,
                hour: 10,
                minute: 30,
                second: 15,
            },
            systolic: 120,
            diastolic: 80,
            mean_arterial_pressure: 93.0,
            pulse_rate,
        }
    }

    #[tokio::test]
    async fn header_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("records.csv"));

        tokio_test::assert_ok!(sink.append(&record(Some(72))).await);
        tokio_test::assert_ok!(sink.append(&record(None)).await);

        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(
            contents,
            "timestamp,systolic,diastolic,mean_arterial_pressure,pulse_rate\n\
             2024-05-01 10:30:15,120,80,93,72\n\
             2024-05-01 10:30:15,120,80,93,\n"
        );
    }

    #[tokio::test]
    async fn fresh_storage_in_new_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("records.csv");
        let sink = CsvSink::new(&path);

        tokio_test::assert_ok!(sink.append(&record(None)).await);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("timestamp,"));
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn empty_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.csv");
        std::fs::write(&path, "").unwrap();
        let sink = CsvSink::new(&path);

        tokio_test::assert_ok!(sink.append(&record(Some(60))).await);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().next(), Some("timestamp,systolic,diastolic,mean_arterial_pressure,pulse_rate"));
    }

    #[test]
    fn fractional_map_is_kept() {
        let mut record = record(None);
        record.mean_arterial_pressure = 90.01;

        assert_eq!(csv_row(&record), "2024-05-01 10:30:15,120,80,90.01,\n");
    }
}
