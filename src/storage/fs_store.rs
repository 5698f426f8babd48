use crate::storage::traits::{BatchOp, KvIter, KvStore, WriteBatch};
use anyhow::Result;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const JOURNAL: &str = "batch.journal";

/// One file per key, named by the hex of the key. Writes go through a temp file + rename
/// so a crash never leaves a half-written value behind.
///
/// A batch is first written whole to a journal file, then applied key by key. A journal
/// still present at open belongs to a batch cut short by a crash and is applied again.
pub struct FsKvStore {
    dir: PathBuf,
    // serializes batches against single writes
    write_lock: Mutex<()>,
}

impl FsKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let store = Self { dir, write_lock: Mutex::new(()) };
        if store.finish_journal()? {
            warn!(dir = %store.dir.display(), "applied interrupted write batch");
        }
        Ok(store)
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL)
    }

    fn finish_journal(&self) -> Result<bool> {
        let path = self.journal_path();
        if !path.exists() {
            return Ok(false);
        }
        let batch: WriteBatch = bincode::deserialize(&Self::read_file(&path)?)?;
        self.apply(&batch)?;
        fs::remove_file(&path)?;
        Ok(true)
    }

    // puts and deletes are idempotent, so a journal can be applied more than once
    fn apply(&self, batch: &WriteBatch) -> Result<()> {
        for op in &batch.ops {
            match op {
                BatchOp::Put(k, v) => self.write_file(k, v)?,
                BatchOp::Delete(k) => self.remove_file(k)?,
            }
        }
        Ok(())
    }

    fn key_path(&self, key: &[u8]) -> PathBuf {
        // derive filename from hex of key
        self.dir.join(hex::encode(key))
    }

    fn write_file(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::write_atomic(&self.key_path(key), value)
    }

    fn write_atomic(p: &Path, value: &[u8]) -> Result<()> {
        let tmp = p.with_extension("tmp");
        {
            let mut f = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp)?;
            f.write_all(value)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, p)?;
        Ok(())
    }

    fn remove_file(&self, key: &[u8]) -> Result<()> {
        let p = self.key_path(key);
        if p.exists() {
            fs::remove_file(&p)?;
        }
        Ok(())
    }

    fn read_file(path: &Path) -> Result<Vec<u8>> {
        let mut f = File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl KvStore for FsKvStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write_file(key, value)
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let p = self.key_path(key);
        if !p.exists() {
            return Ok(None);
        }
        Ok(Some(Self::read_file(&p)?))
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.remove_file(key)
    }

    async fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let _guard = self.write_lock.lock();
        Self::write_atomic(&self.journal_path(), &bincode::serialize(&batch)?)?;
        self.apply(&batch)?;
        fs::remove_file(self.journal_path())?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &[u8]) -> Result<KvIter> {
        let mut items = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().into_string().unwrap_or_default();
            let key = match hex::decode(name) {
                Ok(k) => k,
                Err(_) => continue,
            };
            if key.starts_with(prefix) {
                items.push((key, Self::read_file(&entry.path())?));
            }
        }
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(KvIter { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_fs_store_batch_and_scan() {
        let dir = tempdir().unwrap();
        let store = FsKvStore::open(dir.path()).unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"a/2".to_vec(), b"two".to_vec());
        batch.put(b"a/1".to_vec(), b"one".to_vec());
        batch.put(b"b/1".to_vec(), b"other".to_vec());
        store.write_batch(batch).await.unwrap();

        let scan = store.scan_prefix(b"a/").await.unwrap();
        let keys: Vec<_> = scan.items.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);

        store.delete(b"a/1").await.unwrap();
        assert!(!store.exists(b"a/1").await.unwrap());
        assert_eq!(store.get(b"b/1").await.unwrap(), Some(b"other".to_vec()));
    }

    #[tokio::test]
    async fn test_interrupted_batch_applied_on_open() {
        let dir = tempdir().unwrap();
        {
            let store = FsKvStore::open(dir.path()).unwrap();
            store.put(b"last", b"h4").await.unwrap();
            store.put(b"hist/3", b"old").await.unwrap();

            // crash after the journal landed, before any key was touched
            let mut batch = WriteBatch::new();
            batch.put(b"hist/5".to_vec(), b"new".to_vec());
            batch.put(b"last".to_vec(), b"h5".to_vec());
            batch.delete(b"hist/3".to_vec());
            FsKvStore::write_atomic(&store.journal_path(), &bincode::serialize(&batch).unwrap()).unwrap();
            assert_eq!(store.get(b"last").await.unwrap(), Some(b"h4".to_vec()));
        }

        let store = FsKvStore::open(dir.path()).unwrap();
        assert_eq!(store.get(b"last").await.unwrap(), Some(b"h5".to_vec()));
        assert_eq!(store.get(b"hist/5").await.unwrap(), Some(b"new".to_vec()));
        assert!(!store.exists(b"hist/3").await.unwrap());
        assert!(!store.journal_path().exists());
        // the journal file never shows up as a key
        assert_eq!(store.scan_prefix(b"").await.unwrap().items.len(), 2);
    }
}
