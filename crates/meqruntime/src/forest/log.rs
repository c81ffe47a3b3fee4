use chrono::{DateTime, Utc};
use meqcore::{MeqError, NodeResult, Request, RequestId};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// How an existing result log is treated when opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    #[default]
    Append,
    Overwrite,
}

#[derive(Serialize)]
struct LogEntry<'a> {
    name: &'a str,
    request_id: &'a RequestId,
    timestamp: DateTime<Utc>,
    request: &'a Request,
    result: &'a NodeResult,
}

/// One record read back from a result log.
#[derive(Debug, Clone, Deserialize)]
pub struct LogRecord {
    pub name: String,
    pub request_id: RequestId,
    pub timestamp: DateTime<Utc>,
    pub request: Request,
    pub result: NodeResult,
}

/// Append-only JSON-lines log of node results.
pub(crate) struct ResultLog {
    path: PathBuf,
    writer: BufWriter<File>,
    records: u64,
}

impl ResultLog {
    pub(crate) fn open(path: &Path, mode: LogMode) -> Result<Self, MeqError> {
        let file = match mode {
            LogMode::Append => OpenOptions::new().create(true).append(true).open(path)?,
            LogMode::Overwrite => File::create(path)?,
        };
        tracing::info!(path = %path.display(), ?mode, "opened result log");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            records: 0,
        })
    }

    pub(crate) fn write(
        &mut self,
        name: &str,
        request: &Request,
        result: &NodeResult,
    ) -> Result<(), MeqError> {
        let entry = LogEntry {
            name,
            request_id: &request.id,
            timestamp: Utc::now(),
            request,
            result,
        };
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.records += 1;
        Ok(())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn records(&self) -> u64 {
        self.records
    }
}

/// Reads every record of a result log.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<LogRecord>, MeqError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}
