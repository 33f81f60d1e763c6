use std::{future::Future, time::Duration};

use async_trait::async_trait;
use miette::Result;
use rand::Rng as _;
use tokio::io::AsyncRead;
use tracing::{debug, warn};

pub mod codec;
pub mod memory;
pub mod pipeline;
pub mod rate_limit;
pub mod s3;
pub mod tar;

/// Boxed byte stream, the currency of this layer.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
	pub key: String,
	pub size: u64,
}

/// Batch deletion reports partial success per key.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
	pub deleted: Vec<String>,
	pub failed: Vec<(String, String)>,
}

/// Raw object-store surface. The S3 implementation is production; the in-memory one backs
/// tests. Codec chains, TAR packing, and rate limiting sit above this in [`pipeline`].
#[async_trait]
pub trait ObjectStorage: Send + Sync {
	/// Upload a stream, choosing single or multipart transfer by size. Returns stored bytes.
	async fn put(&self, key: &str, reader: ByteReader) -> Result<u64>;

	async fn get(&self, key: &str) -> Result<ByteReader>;

	/// All keys under a prefix. Paginates internally; order is lexicographic by key.
	async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>>;

	async fn delete_many(&self, keys: &[String]) -> Result<DeleteOutcome>;

	async fn exists(&self, key: &str) -> Result<bool>;

	/// Size of the object, or `None` if it does not exist.
	async fn size(&self, key: &str) -> Result<Option<u64>>;
}

pub(crate) const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(10);

/// Retry an operation with exponential backoff and jitter.
///
/// Only errors the classifier deems transient are retried; the last error surfaces once
/// attempts are exhausted.
pub(crate) async fn with_retries<T, E, F, Fut>(
	what: &str,
	transient: impl Fn(&E) -> bool,
	mut op: F,
) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, E>>,
	E: std::fmt::Display,
{
	let mut attempt = 0;
	loop {
		match op().await {
			Ok(value) => return Ok(value),
			Err(err) if attempt + 1 < RETRY_ATTEMPTS && transient(&err) => {
				let backoff = RETRY_BASE
					.saturating_mul(2_u32.saturating_pow(attempt))
					.min(RETRY_CAP);
				let jitter = Duration::from_millis(
					rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2),
				);
				warn!(%err, ?backoff, "transient error in {what}, retrying");
				tokio::time::sleep(backoff + jitter).await;
				attempt += 1;
			}
			Err(err) => {
				if attempt > 0 {
					debug!(%err, attempt, "giving up on {what}");
				}
				return Err(err);
			}
		}
	}
}
