//! Persistent ordered range table
//!
//! An ordered map `(hash_key, range_key) -> value` with range scans,
//! persisted as a snapshot file of checksummed rows. Each row is framed as
//! u32 length + bincode payload + crc32 checksum; the snapshot is swapped
//! atomically (tmp + rename) so readers never observe a partial file.

use crate::{Result, SeriesError};
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Ordered `(H, R) -> V` table with snapshot persistence
pub struct RangeTable<H, R, V> {
    name: String,
    path: PathBuf,
    rows: RwLock<BTreeMap<H, BTreeMap<R, V>>>,
}

impl<H, R, V> RangeTable<H, R, V>
where
    H: Ord + Clone + Serialize + DeserializeOwned,
    R: Ord + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
{
    /// Open or create a table in the given directory
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.table", name));
        let rows = if path.exists() {
            Self::load(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            name: name.to_string(),
            path,
            rows: RwLock::new(rows),
        })
    }

    /// Table name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the value at (h, r)
    pub fn get(&self, h: &H, r: &R) -> Option<V> {
        self.rows.read().get(h).and_then(|m| m.get(r)).cloned()
    }

    /// Insert or replace the value at (h, r)
    pub fn put(&self, h: H, r: R, v: V) -> Result<()> {
        let mut rows = self.rows.write();
        rows.entry(h).or_default().insert(r, v);
        self.persist(&rows)
    }

    /// Delete the row at (h, r)
    pub fn delete(&self, h: &H, r: &R) -> Result<()> {
        let mut rows = self.rows.write();
        if let Some(inner) = rows.get_mut(h) {
            inner.remove(r);
            if inner.is_empty() {
                rows.remove(h);
            }
        }
        self.persist(&rows)
    }

    /// All rows under a hash key, ascending by range key
    pub fn range(&self, h: &H) -> Vec<(R, V)> {
        self.rows
            .read()
            .get(h)
            .map(|m| m.iter().map(|(r, v)| (r.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// The row with the greatest range key <= bound
    pub fn latest(&self, h: &H, bound: &R) -> Option<(R, V)> {
        self.rows
            .read()
            .get(h)
            .and_then(|m| m.range(..=bound.clone()).next_back())
            .map(|(r, v)| (r.clone(), v.clone()))
    }

    /// The first row under a hash key
    pub fn first_row(&self, h: &H) -> Option<(R, V)> {
        self.rows
            .read()
            .get(h)
            .and_then(|m| m.iter().next())
            .map(|(r, v)| (r.clone(), v.clone()))
    }

    /// The last row under a hash key
    pub fn last_row(&self, h: &H) -> Option<(R, V)> {
        self.rows
            .read()
            .get(h)
            .and_then(|m| m.iter().next_back())
            .map(|(r, v)| (r.clone(), v.clone()))
    }

    /// Delete all rows under a hash key, returning how many were removed
    pub fn delete_range(&self, h: &H) -> Result<usize> {
        let mut rows = self.rows.write();
        let removed = rows.remove(h).map(|m| m.len()).unwrap_or(0);
        if removed > 0 {
            self.persist(&rows)?;
        }
        Ok(removed)
    }

    /// Delete all rows under a hash key with range key >= bound
    pub fn delete_range_from(&self, h: &H, bound: &R) -> Result<usize> {
        let mut rows = self.rows.write();
        let mut removed = 0;
        if let Some(inner) = rows.get_mut(h) {
            let keys: Vec<R> = inner.range(bound.clone()..).map(|(r, _)| r.clone()).collect();
            removed = keys.len();
            for key in keys {
                inner.remove(&key);
            }
            if inner.is_empty() {
                rows.remove(h);
            }
        }
        if removed > 0 {
            self.persist(&rows)?;
        }
        Ok(removed)
    }

    /// Get the value at (h, r), computing and persisting it on a miss
    pub fn get_or_load(&self, h: &H, r: &R, load: impl FnOnce() -> Result<V>) -> Result<V> {
        if let Some(v) = self.get(h, r) {
            return Ok(v);
        }
        // computed outside the lock, loaders can be expensive
        let v = load()?;
        self.put(h.clone(), r.clone(), v.clone())?;
        Ok(v)
    }

    fn persist(&self, rows: &BTreeMap<H, BTreeMap<R, V>>) -> Result<()> {
        let mut buf = BytesMut::new();
        for (h, inner) in rows {
            for (r, v) in inner {
                let payload = bincode::serialize(&(h, r, v))
                    .map_err(|e| SeriesError::InvalidFormat(e.to_string()))?;
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(&payload);
                buf.put_u32_le(crc32fast::hash(&payload));
            }
        }
        let tmp = self.path.with_extension("table.tmp");
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<BTreeMap<H, BTreeMap<R, V>>> {
        let data = fs::read(path)?;
        let mut cursor = &data[..];
        let mut rows: BTreeMap<H, BTreeMap<R, V>> = BTreeMap::new();
        while cursor.has_remaining() {
            if cursor.remaining() < 4 {
                return Err(SeriesError::Corruption(format!(
                    "truncated row header in table snapshot {:?}",
                    path
                )));
            }
            let len = cursor.get_u32_le() as usize;
            if cursor.remaining() < len + 4 {
                return Err(SeriesError::Corruption(format!(
                    "truncated row in table snapshot {:?}",
                    path
                )));
            }
            let payload = &cursor[..len];
            let expected = crc32fast::hash(payload);
            let (h, r, v): (H, R, V) = bincode::deserialize(payload)
                .map_err(|e| SeriesError::Corruption(e.to_string()))?;
            cursor.advance(len);
            let actual = cursor.get_u32_le();
            if expected != actual {
                return Err(SeriesError::Corruption(format!(
                    "row checksum mismatch in table snapshot {:?}: expected {}, got {}",
                    path, expected, actual
                )));
            }
            rows.entry(h).or_default().insert(r, v);
        }
        Ok(rows)
    }
}
