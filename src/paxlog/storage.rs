//! The crate `storage` defines the durable log contract used by a group, and
//! two implementations of it.

// Copyright 2021 The paxlog Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::constant::*;
use crate::error::Error;

/// An append-only store of decided values, indexed by sequence.
///
/// Writes must be gap-free: a write whose sequence isn't exactly one past
/// `highest_sequence()` is rejected with `Error::Inconsistent`.
pub trait PersistentLog<T> {
    fn write(&mut self, sequence: u64, value: &T) -> Result<(), Error>;

    fn get(&self, sequence: u64) -> Result<T, Error>;

    /// The highest sequence written, `INVALID_SEQUENCE` if the log is empty.
    fn highest_sequence(&self) -> u64;
}

fn check_next(highest: u64, sequence: u64) -> Result<(), Error> {
    if highest + 1 != sequence {
        return Err(Error::Inconsistent {
            expected: highest + 1,
            actual: sequence,
        });
    }
    Ok(())
}

/// A log holds everything in memory.
#[derive(Debug, Clone)]
pub struct MemLog<T> {
    values: Vec<T>,
}

impl<T> MemLog<T> {
    pub fn new() -> MemLog<T> {
        MemLog { values: Vec::new() }
    }
}

impl<T> Default for MemLog<T> {
    fn default() -> Self {
        MemLog::new()
    }
}

impl<T: Clone> PersistentLog<T> for MemLog<T> {
    fn write(&mut self, sequence: u64, value: &T) -> Result<(), Error> {
        check_next(self.highest_sequence(), sequence)?;
        self.values.push(value.clone());
        Ok(())
    }

    fn get(&self, sequence: u64) -> Result<T, Error> {
        if sequence == INVALID_SEQUENCE {
            return Err(Error::NotFound(sequence));
        }
        self.values
            .get((sequence - 1) as usize)
            .cloned()
            .ok_or(Error::NotFound(sequence))
    }

    fn highest_sequence(&self) -> u64 {
        self.values.len() as u64
    }
}

#[derive(Serialize)]
struct RecordRef<'a, T> {
    sequence: u64,
    value: &'a T,
}

#[derive(Deserialize)]
struct Record<T> {
    sequence: u64,
    value: T,
}

/// A log which appends each value as one JSON line to a file, and keeps a
/// copy of all values in memory to serve `get()`.
#[derive(Debug)]
pub struct FileLog<T> {
    path: PathBuf,
    file: File,
    values: Vec<T>,
}

impl<T> FileLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    /// Open the log at `path`, create it if not exists. A torn record at the
    /// tail, which is left by a crash during the last write, is truncated.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileLog<T>, Error> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;

        let mut values = Vec::new();
        let mut valid_len = 0;
        for line in content.split_inclusive('\n') {
            if !line.ends_with('\n') {
                warn!(
                    "log {} has a torn record at offset {}, truncate it",
                    path.display(),
                    valid_len
                );
                break;
            }
            let record: Record<T> = serde_json::from_str(line.trim_end())?;
            check_next(values.len() as u64, record.sequence)?;
            values.push(record.value);
            valid_len += line.len();
        }
        if valid_len < content.len() {
            file.set_len(valid_len as u64)?;
            file.sync_data()?;
        }

        info!(
            "open log {} with highest sequence {}",
            path.display(),
            values.len()
        );
        Ok(FileLog {
            path,
            file,
            values,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<T> PersistentLog<T> for FileLog<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    fn write(&mut self, sequence: u64, value: &T) -> Result<(), Error> {
        check_next(self.highest_sequence(), sequence)?;

        let mut line = serde_json::to_vec(&RecordRef { sequence, value })?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        self.values.push(value.clone());
        debug!("log {} append sequence {}", self.path.display(), sequence);
        Ok(())
    }

    fn get(&self, sequence: u64) -> Result<T, Error> {
        if sequence == INVALID_SEQUENCE {
            return Err(Error::NotFound(sequence));
        }
        self.values
            .get((sequence - 1) as usize)
            .cloned()
            .ok_or(Error::NotFound(sequence))
    }

    fn highest_sequence(&self) -> u64 {
        self.values.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_write_order<L: PersistentLog<String>>(log: &mut L) {
        log.write(1, &"a".to_owned()).unwrap();
        log.write(2, &"b".to_owned()).unwrap();
        assert_eq!(log.highest_sequence(), 2);

        match log.write(5, &"e".to_owned()) {
            Err(Error::Inconsistent { expected, actual }) => {
                assert_eq!(expected, 3);
                assert_eq!(actual, 5);
            }
            v => panic!("unexpected {:?}", v),
        }
        assert!(log.write(2, &"b".to_owned()).is_err());
        assert_eq!(log.highest_sequence(), 2);

        log.write(3, &"c".to_owned()).unwrap();
        assert_eq!(log.highest_sequence(), 3);
        assert_eq!(log.get(3).unwrap(), "c");
        assert!(matches!(log.get(4), Err(Error::NotFound(4))));
        assert!(matches!(log.get(0), Err(Error::NotFound(0))));
    }

    #[test]
    fn mem_log_write_order() {
        let mut log = MemLog::<String>::new();
        assert_eq!(log.highest_sequence(), INVALID_SEQUENCE);
        assert_write_order(&mut log);
    }

    #[test]
    fn file_log_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileLog::<String>::open(dir.path().join("paxlog.json")).unwrap();
        assert_write_order(&mut log);
    }

    #[test]
    fn file_log_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paxlog.json");
        {
            let mut log = FileLog::<String>::open(&path).unwrap();
            for (i, v) in ["x", "y", "z"].iter().enumerate() {
                log.write(i as u64 + 1, &v.to_string()).unwrap();
            }
        }

        let log = FileLog::<String>::open(&path).unwrap();
        assert_eq!(log.highest_sequence(), 3);
        assert_eq!(log.get(2).unwrap(), "y");
    }

    #[test]
    fn file_log_truncate_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("paxlog.json");
        {
            let mut log = FileLog::<String>::open(&path).unwrap();
            log.write(1, &"x".to_owned()).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"{\"sequence\":2,\"val").unwrap();
        }

        let mut log = FileLog::<String>::open(&path).unwrap();
        assert_eq!(log.highest_sequence(), 1);
        log.write(2, &"y".to_owned()).unwrap();
        drop(log);

        let log = FileLog::<String>::open(&path).unwrap();
        assert_eq!(log.highest_sequence(), 2);
        assert_eq!(log.get(2).unwrap(), "y");
    }
}
