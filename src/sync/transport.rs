//! Paginated change exchange with the authority.
//!
//! Download pulls pages of server changes after the highest sequence in the
//! change log and feeds them to the change agent. Upload drains the upload
//! queue head-first in bounded batches and trims it by the watermark the
//! authority reports back. Nothing here touches the log or the queues when an
//! exchange fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::observability::MetricsRegistry;
use crate::store::{Store, TableId};
use crate::sync::SyncError;
use crate::sync::change::Change;
use crate::sync::change_agent::ChangeAgent;

pub const STATUS_OK: &str = "ok";
pub const DOWNLOAD_PATH: &str = "downloadChanges";
pub const UPLOAD_PATH: &str = "uploadChanges";

#[derive(Debug, Error)]
pub enum TransportError {
	#[error("http request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("invalid authority url: {0}")]
	Url(#[from] url::ParseError),
	#[error("{endpoint} answered with http status {status}")]
	Status { endpoint: &'static str, status: u16 },
	#[error("cannot decode authority response: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("authority rejected the request ({status}): {}", .error.as_deref().unwrap_or("no reason given"))]
	Rejected {
		status: String,
		error: Option<String>,
	},
	#[error("malformed authority response: {0}")]
	Malformed(&'static str),
	#[error("download page did not advance the cursor past {cursor}")]
	StalledCursor { cursor: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
	pub instance_number: String,
	pub key: String,
	#[serde(rename = "lastChangeID")]
	pub last_change_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub change_logs: Option<Vec<Change>>,
}

/// One change in an upload batch, tagged with its upload queue row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadItem {
	#[serde(flatten)]
	pub change: Change,
	pub upload_row: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
	pub instance_number: String,
	pub key: String,
	pub changes: Vec<UploadItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_upload_row: Option<i64>,
}

/// The two authority endpoints.
#[async_trait]
pub trait SyncApi: Send + Sync {
	async fn download_changes(&self, request: &DownloadRequest)
	-> Result<DownloadResponse, TransportError>;

	async fn upload_changes(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError>;
}

/// [`SyncApi`] over HTTP/JSON.
pub struct HttpSyncApi {
	client: Client,
	base: Url,
}

impl HttpSyncApi {
	pub fn new(mut base: Url, timeout: Duration) -> Result<Self, TransportError> {
		// Url::join replaces the last path segment unless it ends in '/'.
		if !base.path().ends_with('/') {
			let path = format!("{}/", base.path());
			base.set_path(&path);
		}
		let client = Client::builder().timeout(timeout).build()?;
		Ok(Self { client, base })
	}

	async fn post<Req, Resp>(&self, endpoint: &'static str, body: &Req) -> Result<Resp, TransportError>
	where
		Req: Serialize + Sync,
		Resp: DeserializeOwned,
	{
		let url = self.base.join(endpoint)?;
		let response = self.client.post(url).json(body).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::Status {
				endpoint,
				status: status.as_u16(),
			});
		}
		let bytes = response.bytes().await?;
		Ok(serde_json::from_slice(&bytes)?)
	}
}

#[async_trait]
impl SyncApi for HttpSyncApi {
	async fn download_changes(
		&self,
		request: &DownloadRequest,
	) -> Result<DownloadResponse, TransportError> {
		self.post(DOWNLOAD_PATH, request).await
	}

	async fn upload_changes(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
		self.post(UPLOAD_PATH, request).await
	}
}

/// Identity presented to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
	pub instance_number: String,
	pub key: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
	pub pages: usize,
	/// Changes newly logged
	pub ingested: usize,
	/// Changes already present locally
	pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
	pub batches: usize,
	/// Upload queue rows acknowledged and removed
	pub acknowledged: u64,
	/// Row the authority refused, if the phase stopped on a rejection
	pub rejected_row: Option<i64>,
}

pub struct Transport {
	api: Arc<dyn SyncApi>,
	store: Arc<Store>,
	change_agent: Arc<ChangeAgent>,
	credentials: Credentials,
	batch_size: usize,
	metrics: Arc<MetricsRegistry>,
}

impl Transport {
	pub fn new(
		api: Arc<dyn SyncApi>,
		store: Arc<Store>,
		change_agent: Arc<ChangeAgent>,
		credentials: Credentials,
		batch_size: usize,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			api,
			store,
			change_agent,
			credentials,
			batch_size: batch_size.max(1),
			metrics,
		}
	}

	fn failed(&self, error: TransportError) -> SyncError {
		self.metrics.transport_failures_total.inc();
		SyncError::Transport(error)
	}

	/// Pull every page of server changes past the local cursor.
	pub async fn download(&self) -> Result<DownloadReport, SyncError> {
		let mut report = DownloadReport::default();
		loop {
			let cursor = {
				let mut conn = self.store.read().await?;
				self.store.change_log.max_server_sequence(&mut conn).await?
			};
			let request = DownloadRequest {
				instance_number: self.credentials.instance_number.clone(),
				key: self.credentials.key.clone(),
				last_change_id: cursor,
			};
			let response = self
				.api
				.download_changes(&request)
				.await
				.map_err(|e| self.failed(e))?;

			if response.status != STATUS_OK {
				return Err(self.failed(TransportError::Rejected {
					status: response.status,
					error: response.error,
				}));
			}
			let changes = response
				.change_logs
				.ok_or_else(|| self.failed(TransportError::Malformed("download response without changeLogs")))?;
			if changes.is_empty() {
				break;
			}

			// Validate the whole page before logging any of it.
			let mut page_max = cursor;
			for change in &changes {
				match change.server_sequence {
					Some(seq) => page_max = page_max.max(seq),
					None => {
						return Err(self.failed(TransportError::Malformed(
							"downloaded change without serverChangeID",
						)));
					}
				}
			}
			if page_max <= cursor {
				return Err(self.failed(TransportError::StalledCursor { cursor }));
			}

			report.pages += 1;
			let count = changes.len();
			for change in changes {
				if self.change_agent.change_from_server(change).await?.is_duplicate() {
					report.duplicates += 1;
				} else {
					report.ingested += 1;
				}
			}
			self.metrics.changes_downloaded_total.inc_by(count as u64);

			let advanced = {
				let mut conn = self.store.read().await?;
				self.store.change_log.max_server_sequence(&mut conn).await?
			};
			if advanced <= cursor {
				return Err(self.failed(TransportError::StalledCursor { cursor }));
			}
			debug!("downloaded page of {} change(s), cursor {} -> {}", count, cursor, advanced);
		}

		if report.pages > 0 {
			info!(
				"download finished: {} page(s), {} new, {} already known",
				report.pages, report.ingested, report.duplicates
			);
		}
		Ok(report)
	}

	/// Drain the upload queue in batches until it is empty, the authority
	/// rejects a row, or a batch makes no progress.
	pub async fn upload(&self) -> Result<UploadReport, SyncError> {
		let mut report = UploadReport::default();
		loop {
			let (items, last_sent) = {
				let mut conn = self.store.read().await?;
				let head = self
					.store
					.upload_queue
					.head(&mut conn, self.batch_size as i64)
					.await?;
				let Some(last) = head.last().map(|e| e.row_id) else {
					break;
				};
				let mut items = Vec::with_capacity(head.len());
				for entry in head {
					match self.store.change_log.get(&mut conn, &entry.change_id).await? {
						Some(change) => items.push(UploadItem {
							change,
							upload_row: entry.row_id,
						}),
						None => warn!("upload row {} has no logged change", entry.row_id),
					}
				}
				(items, last)
			};

			let request = UploadRequest {
				instance_number: self.credentials.instance_number.clone(),
				key: self.credentials.key.clone(),
				changes: items,
			};
			let response = self
				.api
				.upload_changes(&request)
				.await
				.map_err(|e| self.failed(e))?;
			report.batches += 1;

			let Some(watermark) = response.last_upload_row else {
				return Err(self.failed(TransportError::Malformed("upload response without lastUploadRow")));
			};
			if watermark > last_sent {
				return Err(self.failed(TransportError::Malformed(
					"lastUploadRow is past the last row sent",
				)));
			}
			let accepted = response.status == STATUS_OK;

			let mut txn = self.store.begin_write(&[TableId::UploadQueue]).await?;
			let removed = if accepted {
				self.store.upload_queue.remove_through(txn.conn(), watermark).await?
			} else {
				let removed = self.store.upload_queue.remove_before(txn.conn(), watermark).await?;
				self.store
					.upload_queue
					.increment_error_count(txn.conn(), watermark)
					.await?;
				removed
			};
			txn.commit().await?;

			report.acknowledged += removed;
			self.metrics.changes_uploaded_total.inc_by(removed);

			if !accepted {
				self.metrics.upload_rejections_total.inc();
				warn!(
					"authority rejected upload row {} ({}): {}",
					watermark,
					response.status,
					response.error.as_deref().unwrap_or("no reason given")
				);
				report.rejected_row = Some(watermark);
				break;
			}
			if removed == 0 {
				debug!("upload batch made no progress, stopping");
				break;
			}
		}

		let depth = self.store.queue_depths().await?.upload_queue;
		self.metrics.upload_queue_depth.set(depth);
		if report.batches > 0 {
			info!(
				"upload finished: {} batch(es), {} acknowledged, {} still queued",
				report.batches, report.acknowledged, depth
			);
		}
		Ok(report)
	}
}
