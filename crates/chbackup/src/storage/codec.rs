use std::iter;

use age::{Decryptor, Encryptor, secrecy::SecretString};
use async_compression::tokio::bufread::{ZstdDecoder, ZstdEncoder};
use miette::{Context as _, IntoDiagnostic as _, Result};
use tokio::{
	io::{AsyncWriteExt as _, BufReader, duplex},
	task::JoinHandle,
};
use tokio_util::compat::{
	FuturesAsyncReadCompatExt as _, FuturesAsyncWriteCompatExt as _, TokioAsyncReadCompatExt as _,
	TokioAsyncWriteCompatExt as _,
};

use crate::config::{EncryptionConfig, EncryptionKind};

use super::ByteReader;

/// Streaming transform chain applied to artifacts on the way to storage: compress, then
/// encrypt. Reading applies the inverse chain. Which codecs ran is recorded in the backup
/// document, so the reader of a backup never has to guess.
#[derive(Debug, Clone, Default)]
pub struct CodecChain {
	compress: bool,
	passphrase: Option<String>,
}

impl CodecChain {
	pub fn new(compress: bool, passphrase: Option<String>) -> Self {
		Self {
			compress,
			passphrase,
		}
	}

	/// Chain for data artifacts: encryption per config, no compression (ClickHouse parts are
	/// already compressed on disk).
	pub fn for_parts(encryption: &EncryptionConfig) -> Self {
		Self::new(false, passphrase_of(encryption))
	}

	/// Chain for the object-storage metadata envelope.
	pub fn for_cloud_envelope(
		encryption: &EncryptionConfig,
		compress: bool,
		encrypt: bool,
	) -> Self {
		Self::new(
			compress,
			if encrypt {
				passphrase_of(encryption)
			} else {
				None
			},
		)
	}

	pub fn encrypted(&self) -> bool {
		self.passphrase.is_some()
	}

	pub fn compressed(&self) -> bool {
		self.compress
	}

	/// Apply the forward chain. When encryption is on, a background task drives the
	/// encryptor; its handle must be awaited after the output has been fully consumed.
	pub fn encode(&self, reader: ByteReader) -> (ByteReader, Option<JoinHandle<Result<()>>>) {
		let reader: ByteReader = if self.compress {
			Box::new(ZstdEncoder::new(BufReader::new(reader)))
		} else {
			reader
		};

		match &self.passphrase {
			None => (reader, None),
			Some(passphrase) => {
				let (encrypted, task) = encrypt_reader(reader, passphrase.clone());
				(encrypted, Some(task))
			}
		}
	}

	/// Apply the inverse chain.
	pub async fn decode(&self, reader: ByteReader) -> Result<ByteReader> {
		let reader: ByteReader = match &self.passphrase {
			None => reader,
			Some(passphrase) => decrypt_reader(reader, passphrase.clone()).await?,
		};

		Ok(if self.compress {
			Box::new(ZstdDecoder::new(BufReader::new(reader)))
		} else {
			reader
		})
	}
}

fn passphrase_of(config: &EncryptionConfig) -> Option<String> {
	if config.is_enabled && config.kind == EncryptionKind::Age {
		config.key.clone()
	} else {
		None
	}
}

fn encrypt_reader(
	mut reader: ByteReader,
	passphrase: String,
) -> (ByteReader, JoinHandle<Result<()>>) {
	let (tx, rx) = duplex(64 * 1024);
	let task = tokio::spawn(async move {
		let recipient = age::scrypt::Recipient::new(SecretString::from(passphrase));
		let mut writer = Encryptor::with_recipients(iter::once(&recipient as _))
			.expect("BUG: a single recipient is always given")
			.wrap_async_output(tx.compat_write())
			.await
			.into_diagnostic()?
			.compat_write();

		tokio::io::copy(&mut reader, &mut writer)
			.await
			.into_diagnostic()
			.wrap_err("encrypting stream")?;

		writer
			.shutdown()
			.await
			.into_diagnostic()
			.wrap_err("closing the encrypted output")?;

		Ok(())
	});
	(Box::new(rx), task)
}

async fn decrypt_reader(reader: ByteReader, passphrase: String) -> Result<ByteReader> {
	let identity = age::scrypt::Identity::new(SecretString::from(passphrase));
	let decrypting = Decryptor::new_async(reader.compat())
		.await
		.into_diagnostic()
		.wrap_err("reading encryption header")?
		.decrypt_async(iter::once(&identity as _))
		.into_diagnostic()
		.wrap_err("unlocking stream")?;
	Ok(Box::new(decrypting.compat()))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Cursor;
	use tokio::io::AsyncReadExt as _;

	async fn roundtrip(chain: &CodecChain, data: &[u8]) -> Vec<u8> {
		let (mut encoded, task) = chain.encode(Box::new(Cursor::new(data.to_vec())));
		let mut stored = Vec::new();
		encoded.read_to_end(&mut stored).await.expect("encode");
		if let Some(task) = task {
			task.await.expect("join").expect("encrypt task");
		}
		if chain.encrypted() || chain.compressed() {
			assert_ne!(stored, data);
		}

		let mut decoded = chain
			.decode(Box::new(Cursor::new(stored)))
			.await
			.expect("decode");
		let mut out = Vec::new();
		decoded.read_to_end(&mut out).await.expect("read");
		out
	}

	#[tokio::test]
	async fn passthrough_chain_is_identity() {
		let chain = CodecChain::new(false, None);
		let data = b"plain as day".to_vec();
		assert_eq!(roundtrip(&chain, &data).await, data);
	}

	#[tokio::test]
	async fn compression_roundtrips() {
		let chain = CodecChain::new(true, None);
		let data = vec![42_u8; 100_000];
		assert_eq!(roundtrip(&chain, &data).await, data);
	}

	#[tokio::test]
	async fn encryption_roundtrips() {
		let chain = CodecChain::new(false, Some("opensesame".into()));
		let data = b"keep this quiet".to_vec();
		assert_eq!(roundtrip(&chain, &data).await, data);
	}

	#[tokio::test]
	async fn full_chain_roundtrips() {
		let chain = CodecChain::new(true, Some("opensesame".into()));
		let data = b"compressed then sealed".repeat(1000);
		assert_eq!(roundtrip(&chain, &data).await, data);
	}

	#[tokio::test]
	async fn wrong_passphrase_fails() {
		let chain = CodecChain::new(false, Some("right".into()));
		let (mut encoded, task) = chain.encode(Box::new(Cursor::new(b"secret".to_vec())));
		let mut stored = Vec::new();
		encoded.read_to_end(&mut stored).await.expect("encode");
		task.expect("task").await.expect("join").expect("encrypt");

		let wrong = CodecChain::new(false, Some("wrong".into()));
		let result = wrong.decode(Box::new(Cursor::new(stored))).await;
		assert!(result.is_err());
	}
}
