use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use telematics_core::logger::{NullStore, RecordStore, StoreError};
use telematics_core::timestamp::TimestampToken;

/// Appends `<token>,<record>` lines to a log file.
pub struct FileStore {
    writer: BufWriter<File>,
}

impl FileStore {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl RecordStore for FileStore {
    fn append(&mut self, token: TimestampToken, record: &str) -> Result<usize, StoreError> {
        let line = format!("{token},{record}\n");
        self.writer
            .write_all(line.as_bytes())
            .map_err(|_| StoreError::WriteFailed)?;
        Ok(line.len())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        self.writer.flush().map_err(|_| StoreError::WriteFailed)
    }
}

/// Either a file-backed store or none at all.
pub enum HostStore {
    File(FileStore),
    Disabled(NullStore),
}

impl RecordStore for HostStore {
    fn append(&mut self, token: TimestampToken, record: &str) -> Result<usize, StoreError> {
        match self {
            HostStore::File(store) => store.append(token, record),
            HostStore::Disabled(store) => store.append(token, record),
        }
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        match self {
            HostStore::File(store) => store.flush(),
            HostStore::Disabled(store) => store.flush(),
        }
    }
}
