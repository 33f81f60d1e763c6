use std::sync::Arc;

use tokio::{
	io::{AsyncReadExt as _, AsyncWriteExt as _, duplex},
	sync::Mutex,
	time::{Duration, Instant},
};
use tracing::trace;

use super::ByteReader;

/// Token bucket over bytes. Rate 0 means unlimited.
///
/// The bucket holds up to one second's worth of tokens, so bursts up to the configured rate
/// are admitted without waiting.
#[derive(Debug)]
pub struct TokenBucket {
	rate: u64,
	capacity: f64,
	state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
	available: f64,
	refilled: Instant,
}

impl TokenBucket {
	pub fn new(rate: u64) -> Self {
		Self {
			rate,
			capacity: rate as f64,
			state: Mutex::new(BucketState {
				available: rate as f64,
				refilled: Instant::now(),
			}),
		}
	}

	pub fn is_unlimited(&self) -> bool {
		self.rate == 0
	}

	/// Take `bytes` tokens, waiting for refill as needed.
	pub async fn acquire(&self, bytes: u64) {
		if self.is_unlimited() {
			return;
		}

		let mut remaining = bytes as f64;
		loop {
			let wait = {
				let mut state = self.state.lock().await;
				let now = Instant::now();
				let elapsed = now.duration_since(state.refilled).as_secs_f64();
				state.available =
					(state.available + elapsed * self.rate as f64).min(self.capacity);
				state.refilled = now;

				if state.available >= remaining {
					state.available -= remaining;
					return;
				}

				// drain what's there and wait for the rest to accrue
				remaining -= state.available;
				state.available = 0.0;
				Duration::from_secs_f64(remaining / self.rate as f64)
			};
			trace!(?wait, "rate limiter pausing upload");
			tokio::time::sleep(wait).await;
		}
	}
}

const FEED_CHUNK: usize = 64 * 1024;

/// Wrap a reader so its bytes pass through the bucket on the way out.
pub fn limit_reader(mut reader: ByteReader, bucket: Arc<TokenBucket>) -> ByteReader {
	if bucket.is_unlimited() {
		return reader;
	}

	let (mut tx, rx) = duplex(FEED_CHUNK * 2);
	tokio::spawn(async move {
		let mut buffer = vec![0_u8; FEED_CHUNK];
		loop {
			match reader.read(&mut buffer).await {
				Ok(0) => break,
				Ok(n) => {
					bucket.acquire(n as u64).await;
					if tx.write_all(&buffer[..n]).await.is_err() {
						// downstream gave up; nothing to report
						break;
					}
				}
				Err(_) => break,
			}
		}
		let _ = tx.shutdown().await;
	});
	Box::new(rx)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test(start_paused = true)]
	async fn unlimited_never_waits() {
		let bucket = TokenBucket::new(0);
		let before = Instant::now();
		bucket.acquire(u64::MAX).await;
		assert_eq!(before.elapsed(), Duration::ZERO);
	}

	#[tokio::test(start_paused = true)]
	async fn burst_within_capacity_is_free() {
		let bucket = TokenBucket::new(1000);
		let before = Instant::now();
		bucket.acquire(1000).await;
		assert_eq!(before.elapsed(), Duration::ZERO);
	}

	#[tokio::test(start_paused = true)]
	async fn sustained_draw_is_paced() {
		let bucket = TokenBucket::new(1000);
		let before = Instant::now();
		// capacity covers the first 1000; the next 2000 must accrue at 1000/s
		bucket.acquire(1000).await;
		bucket.acquire(1000).await;
		bucket.acquire(1000).await;
		let elapsed = before.elapsed();
		assert!(elapsed >= Duration::from_millis(1990), "elapsed {elapsed:?}");
		assert!(elapsed <= Duration::from_millis(2100), "elapsed {elapsed:?}");
	}
}
