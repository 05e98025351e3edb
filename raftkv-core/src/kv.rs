//! Reference key-value state machine.
//!
//! An in-memory map driven by bincode-encoded commands. Snapshots are a
//! single file under the snapshot data tree. The engine only depends on the
//! `StateMachine` trait; this implementation exists so the node binary and
//! the test suite are complete.

use crate::error::Result;
use crate::state_machine::StateMachine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

const SNAPSHOT_FILE: &str = "kv";

/// A single key-value command carried as opaque bytes in a DATA entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvCommand {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        KvCommand::Delete { key: key.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

#[derive(Default)]
pub struct KvStateMachine {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, data: &[u8]) -> Result<()> {
        let mut map = self.map.lock().unwrap();
        match KvCommand::decode(data)? {
            KvCommand::Put { key, value } => {
                map.insert(key, value);
            }
            KvCommand::Delete { key } => {
                map.remove(&key);
            }
        }
        Ok(())
    }

    fn write_snapshot(
        &self,
        _old_dir: Option<&Path>,
        new_dir: &Path,
        last_applied: u64,
    ) -> Result<()> {
        let map = self.map.lock().unwrap();
        let data = bincode::serialize(&*map)?;
        fs::write(new_dir.join("data").join(SNAPSHOT_FILE), data)?;
        debug!(
            "KV: wrote snapshot of {} keys through index {}",
            map.len(),
            last_applied
        );
        Ok(())
    }

    fn read_snapshot(&self, dir: &Path) -> Result<()> {
        let path = dir.join("data").join(SNAPSHOT_FILE);
        let restored: HashMap<Vec<u8>, Vec<u8>> = if path.exists() {
            bincode::deserialize(&fs::read(&path)?)?
        } else {
            HashMap::new()
        };
        debug!("KV: restored {} keys from snapshot", restored.len());
        *self.map.lock().unwrap() = restored;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }
}

impl std::fmt::Debug for KvStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStateMachine")
            .field("keys", &self.len())
            .finish()
    }
}
