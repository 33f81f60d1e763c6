use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::{
	Client as S3Client,
	error::SdkError,
	primitives::ByteStream,
	types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier},
};
use bytes::BytesMut;
use miette::{IntoDiagnostic as _, Result, miette};
use tokio::io::AsyncReadExt as _;
use tracing::{debug, instrument, warn};

use crate::config::StorageConfig;

use super::{ByteReader, DeleteOutcome, ObjectEntry, ObjectStorage, with_retries};

/// S3 will not accept a non-final multipart part smaller than this.
const MINIMUM_MULTIPART_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Object storage over any S3-compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Storage {
	client: S3Client,
	bucket: String,
	chunk_size: u64,
	/// How long a single part upload may stall before being retried.
	part_stall: Duration,
}

impl S3Storage {
	pub async fn new(config: &StorageConfig) -> Result<Self> {
		let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
		if let Some(region) = &config.region {
			loader = loader.region(aws_config::Region::new(region.clone()));
		}
		if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
			loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
				key_id.clone(),
				secret.clone(),
				None,
				None,
				"Static",
			));
		}
		let sdk = loader.load().await;

		let mut builder = aws_sdk_s3::config::Builder::from(&sdk);
		if let Some(endpoint) = &config.endpoint {
			// non-AWS stores generally don't do virtual-host addressing
			builder = builder.endpoint_url(endpoint.clone()).force_path_style(true);
		}
		let client = S3Client::from_conf(builder.build());

		Ok(Self {
			client,
			bucket: config.bucket.clone(),
			chunk_size: config.chunk_size.max(MINIMUM_MULTIPART_PART_SIZE),
			part_stall: Duration::from_secs(config.uploading_traffic_limit_retry_time.max(1)),
		})
	}

	async fn read_chunk(reader: &mut ByteReader, size: u64) -> Result<BytesMut> {
		let mut chunk = BytesMut::with_capacity(size as usize);
		while (chunk.len() as u64) < size {
			let read = reader.read_buf(&mut chunk).await.into_diagnostic()?;
			if read == 0 {
				break;
			}
		}
		Ok(chunk)
	}

	#[instrument(skip(self, first_chunk, reader), level = "debug")]
	async fn multipart_put(
		&self,
		key: &str,
		first_chunk: BytesMut,
		reader: &mut ByteReader,
	) -> Result<u64> {
		let mp = with_retries("create multipart upload", transient_sdk, || {
			self.client
				.create_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.send()
		})
		.await
		.into_diagnostic()?;
		let Some(upload_id) = mp.upload_id else {
			return Err(miette!("no upload ID returned from the store"));
		};

		let result = self
			.multipart_put_parts(key, &upload_id, first_chunk, reader)
			.await;

		match result {
			Ok(total) => Ok(total),
			Err(err) => {
				debug!(?err, key, "aborting multipart upload");
				if let Err(abort_err) = self
					.client
					.abort_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.send()
					.await
				{
					warn!(?abort_err, key, "also failed to abort the multipart upload");
				}
				Err(err)
			}
		}
	}

	async fn multipart_put_parts(
		&self,
		key: &str,
		upload_id: &str,
		first_chunk: BytesMut,
		reader: &mut ByteReader,
	) -> Result<u64> {
		let mut parts = Vec::new();
		let mut total = 0_u64;
		let mut part_no = 1_i32;
		let mut chunk = first_chunk;

		loop {
			if chunk.is_empty() {
				break;
			}
			total += chunk.len() as u64;
			let bytes = chunk.freeze();

			let upload = with_retries("upload part", transient_or_stall, || async {
				match tokio::time::timeout(
					self.part_stall,
					self.client
						.upload_part()
						.bucket(&self.bucket)
						.key(key)
						.part_number(part_no)
						.upload_id(upload_id)
						.body(ByteStream::from(bytes.clone()))
						.send(),
				)
				.await
				{
					// a stalled part is retried as if it had failed transiently
					Err(_elapsed) => Err(PartError::Stalled),
					Ok(result) => result.map_err(PartError::Sdk),
				}
			})
			.await
			.map_err(|err| miette!("part {part_no} of {key}: {err}"))?;

			parts.push(
				CompletedPart::builder()
					.set_e_tag(upload.e_tag)
					.part_number(part_no)
					.build(),
			);
			part_no += 1;
			chunk = Self::read_chunk(reader, self.chunk_size).await?;
		}

		let completed = parts
			.into_iter()
			.fold(CompletedMultipartUpload::builder(), |b, p| b.parts(p));
		with_retries("complete multipart upload", transient_sdk, || {
			self.client
				.complete_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.upload_id(upload_id)
				.multipart_upload(completed.clone().build())
				.send()
		})
		.await
		.into_diagnostic()?;

		Ok(total)
	}
}

#[derive(Debug)]
enum PartError {
	Stalled,
	Sdk(SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>),
}

impl std::fmt::Display for PartError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Stalled => write!(f, "part upload stalled past the traffic limit window"),
			Self::Sdk(err) => write!(f, "{err}"),
		}
	}
}

fn transient_or_stall(err: &PartError) -> bool {
	match err {
		PartError::Stalled => true,
		PartError::Sdk(err) => transient_sdk(err),
	}
}

/// Network failures, timeouts, throttling, and server errors are worth retrying.
fn transient_sdk<E: std::fmt::Debug>(err: &SdkError<E>) -> bool {
	match err {
		SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => true,
		SdkError::ResponseError(_) => true,
		SdkError::ServiceError(service) => {
			let status = service.raw().status().as_u16();
			status >= 500 || status == 429
		}
		_ => false,
	}
}

#[async_trait]
impl ObjectStorage for S3Storage {
	async fn put(&self, key: &str, mut reader: ByteReader) -> Result<u64> {
		let first_chunk = Self::read_chunk(&mut reader, self.chunk_size).await?;

		if (first_chunk.len() as u64) < self.chunk_size {
			let size = first_chunk.len() as u64;
			debug!(key, size, "single-part upload");
			with_retries("put object", transient_sdk, || {
				self.client
					.put_object()
					.bucket(&self.bucket)
					.key(key)
					.body(ByteStream::from(first_chunk.clone().freeze()))
					.send()
			})
			.await
			.into_diagnostic()?;
			Ok(size)
		} else {
			debug!(key, chunk_size = self.chunk_size, "multipart upload");
			self.multipart_put(key, first_chunk, &mut reader).await
		}
	}

	async fn get(&self, key: &str) -> Result<ByteReader> {
		let object = with_retries("get object", transient_sdk, || {
			self.client
				.get_object()
				.bucket(&self.bucket)
				.key(key)
				.send()
		})
		.await
		.into_diagnostic()?;
		Ok(Box::new(object.body.into_async_read()))
	}

	async fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
		let mut entries = Vec::new();
		let mut continuation: Option<String> = None;
		loop {
			let page = with_retries("list objects", transient_sdk, || {
				self.client
					.list_objects_v2()
					.bucket(&self.bucket)
					.prefix(prefix)
					.set_continuation_token(continuation.clone())
					.send()
			})
			.await
			.into_diagnostic()?;

			for object in page.contents() {
				if let Some(key) = object.key() {
					entries.push(ObjectEntry {
						key: key.to_string(),
						size: object.size().unwrap_or(0).max(0) as u64,
					});
				}
			}

			match page.next_continuation_token() {
				Some(token) => continuation = Some(token.to_string()),
				None => break,
			}
		}
		Ok(entries)
	}

	async fn delete_many(&self, keys: &[String]) -> Result<DeleteOutcome> {
		let mut outcome = DeleteOutcome::default();
		for batch in keys.chunks(1000) {
			let objects: Vec<ObjectIdentifier> = batch
				.iter()
				.map(|key| ObjectIdentifier::builder().key(key).build())
				.collect::<Result<_, _>>()
				.into_diagnostic()?;

			let response = with_retries("delete objects", transient_sdk, || {
				self.client
					.delete_objects()
					.bucket(&self.bucket)
					.delete(
						Delete::builder()
							.set_objects(Some(objects.clone()))
							.build()
							.expect("BUG: object list is always set"),
					)
					.send()
			})
			.await
			.into_diagnostic()?;

			let errored: Vec<_> = response.errors().to_vec();
			for error in &errored {
				outcome.failed.push((
					error.key().unwrap_or_default().to_string(),
					error.message().unwrap_or("unknown error").to_string(),
				));
			}
			for key in batch {
				if !errored.iter().any(|e| e.key() == Some(key.as_str())) {
					outcome.deleted.push(key.clone());
				}
			}
		}
		Ok(outcome)
	}

	async fn exists(&self, key: &str) -> Result<bool> {
		Ok(self.size(key).await?.is_some())
	}

	async fn size(&self, key: &str) -> Result<Option<u64>> {
		let head = with_retries("head object", transient_sdk, || {
			self.client
				.head_object()
				.bucket(&self.bucket)
				.key(key)
				.send()
		})
		.await;

		match head {
			Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
			Err(SdkError::ServiceError(service)) if service.err().is_not_found() => Ok(None),
			Err(err) => Err(err).into_diagnostic(),
		}
	}
}
