use std::{collections::BTreeMap, io::Cursor};

use async_trait::async_trait;
use bytes::Bytes;
use miette::{IntoDiagnostic as _, Result, miette};
use tokio::{io::AsyncReadExt as _, sync::Mutex};

use super::{ByteReader, DeleteOutcome, ObjectEntry, ObjectStorage};

/// In-process object store, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	objects: Mutex<BTreeMap<String, Bytes>>,
}

impl MemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of all stored keys, for assertions.
	pub async fn keys(&self) -> Vec<String> {
		self.objects.lock().await.keys().cloned().collect()
	}

	/// Drop an object behind the engine's back, to simulate external damage.
	pub async fn corrupt_remove(&self, key: &str) -> bool {
		self.objects.lock().await.remove(key).is_some()
	}

	/// Truncate an object to zero bytes in place.
	pub async fn corrupt_truncate(&self, key: &str) -> bool {
		self.objects
			.lock()
			.await
			.get_mut(key)
			.map(|bytes| *bytes = Bytes::new())
			.is_some()
	}
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
	async fn put(&self, key: &str, mut reader: ByteReader) -> Result<u64> {
		let mut data = Vec::new();
		reader.read_to_end(&mut data).await.into_diagnostic()?;
		let size = data.len() as u64;
		self.objects
			.lock()
			.await
			.insert(key.to_string(), Bytes::from(data));
		Ok(size)
	}

	async fn get(&self, key: &str) -> Result<ByteReader> {
		let data = self
			.objects
			.lock()
			.await
			.get(key)
			.cloned()
			.ok_or_else(|| miette!("no such object: {key}"))?;
		Ok(Box::new(Cursor::new(data.to_vec())))
	}

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
		Ok(self
			.objects
			.lock()
			.await
			.range(prefix.to_string()..)
			.take_while(|(key, _)| key.starts_with(prefix))
			.map(|(key, data)| ObjectEntry {
				key: key.clone(),
				size: data.len() as u64,
			})
			.collect())
	}

	async fn delete_many(&self, keys: &[String]) -> Result<DeleteOutcome> {
		let mut objects = self.objects.lock().await;
		let mut outcome = DeleteOutcome::default();
		for key in keys {
			// deleting an absent key succeeds, as it does on S3
			objects.remove(key);
			outcome.deleted.push(key.clone());
		}
		Ok(outcome)
	}

	async fn exists(&self, key: &str) -> Result<bool> {
		Ok(self.objects.lock().await.contains_key(key))
	}

	async fn size(&self, key: &str) -> Result<Option<u64>> {
		Ok(self
			.objects
			.lock()
			.await
			.get(key)
			.map(|data| data.len() as u64))
	}
}
