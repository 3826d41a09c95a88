//! Durable tier: one file per key, whole-file replacement writes, fixed
//! little-endian header followed by opaque data (spec.md §4.5, §6).

use super::Account;
use crate::error::{IngressError, Result};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const HEADER_LEN: usize = 8 + 32 + 1 + 8 + 4 + 3;

pub struct DurableTier {
    dir: PathBuf,
}

impl DurableTier {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &[u8; 32]) -> PathBuf {
        self.dir.join(hex_encode(key))
    }

    pub fn read(&self, key: &[u8; 32]) -> Result<Option<Account>> {
        let path = self.path_for(key);
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(IngressError::DurableIoFailure { key: hex_encode(key), source: e });
            }
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| IngressError::DurableIoFailure { key: hex_encode(key), source: e })?;
        if buf.len() < HEADER_LEN {
            return Err(IngressError::DurableIoFailure {
                key: hex_encode(key),
                source: std::io::Error::other("durable file shorter than header"),
            });
        }
        let lamports = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let mut owner = [0u8; 32];
        owner.copy_from_slice(&buf[8..40]);
        let executable = buf[40] != 0;
        let rent_epoch = u64::from_le_bytes(buf[41..49].try_into().unwrap());
        let data_len = u32::from_le_bytes(buf[49..53].try_into().unwrap()) as usize;
        let data_start = HEADER_LEN;
        let data_end = data_start + data_len;
        if buf.len() < data_end {
            return Err(IngressError::DurableIoFailure {
                key: hex_encode(key),
                source: std::io::Error::other("durable file truncated before declared data_len"),
            });
        }
        let data = buf[data_start..data_end].to_vec();
        Ok(Some(Account { lamports, data, owner, executable, rent_epoch }))
    }

    pub fn write(&self, key: &[u8; 32], account: &Account) -> Result<()> {
        let mut buf = Vec::with_capacity(HEADER_LEN + account.data.len());
        buf.extend_from_slice(&account.lamports.to_le_bytes());
        buf.extend_from_slice(&account.owner);
        buf.push(account.executable as u8);
        buf.extend_from_slice(&account.rent_epoch.to_le_bytes());
        buf.extend_from_slice(&(account.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&account.data);

        let path = self.path_for(key);
        let tmp_path = path.with_extension("tmp");
        let mut tmp = std::fs::File::create(&tmp_path)
            .map_err(|e| IngressError::DurableIoFailure { key: hex_encode(key), source: e })?;
        tmp.write_all(&buf)
            .map_err(|e| IngressError::DurableIoFailure { key: hex_encode(key), source: e })?;
        tmp.sync_all()
            .map_err(|e| IngressError::DurableIoFailure { key: hex_encode(key), source: e })?;
        std::fs::rename(&tmp_path, &path)
            .map_err(|e| IngressError::DurableIoFailure { key: hex_encode(key), source: e })?;
        Ok(())
    }

    /// diagnostic only: recompute SHA-256 over the stored data and compare
    /// against `expected_hash`. Mismatch never triggers eviction on its own.
    pub fn verify(&self, key: &[u8; 32], expected_hash: &[u8; 32]) -> Result<bool> {
        let account = self.read(key)?.ok_or_else(|| IngressError::IntegrityMismatch { key: hex_encode(key) })?;
        let mut hasher = Sha256::new();
        hasher.update(&account.data);
        let actual: [u8; 32] = hasher.finalize().into();
        Ok(&actual == expected_hash)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn hex_encode(key: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in key {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips_fields() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DurableTier::new(dir.path()).unwrap();
        let key = [7u8; 32];
        let account = Account {
            lamports: 1000,
            data: vec![0xDE, 0xAD],
            owner: [9u8; 32],
            executable: false,
            rent_epoch: 0,
        };
        tier.write(&key, &account).unwrap();
        let read_back = tier.read(&key).unwrap().unwrap();
        assert_eq!(read_back.lamports, 1000);
        assert_eq!(read_back.data, vec![0xDE, 0xAD]);
        assert_eq!(read_back.owner, [9u8; 32]);
    }

    #[test]
    fn missing_key_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DurableTier::new(dir.path()).unwrap();
        assert!(tier.read(&[1u8; 32]).unwrap().is_none());
    }

    #[test]
    fn restart_with_same_directory_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let key = [3u8; 32];
        let account = Account { lamports: 42, data: vec![1, 2, 3], owner: [0; 32], executable: true, rent_epoch: 5 };
        {
            let tier = DurableTier::new(dir.path()).unwrap();
            tier.write(&key, &account).unwrap();
        }
        let tier = DurableTier::new(dir.path()).unwrap();
        let read_back = tier.read(&key).unwrap().unwrap();
        assert_eq!(read_back.lamports, 42);
        assert_eq!(read_back.rent_epoch, 5);
    }
}
