//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use url::Url;
use vanopticon_dialsync::authority::{self, Authority};
use vanopticon_dialsync::observability::MetricsRegistry;
use vanopticon_dialsync::store::Store;
use vanopticon_dialsync::sync::transport::{
	DownloadRequest, DownloadResponse, STATUS_OK, UploadRequest, UploadResponse,
};
use vanopticon_dialsync::sync::{
	Credentials, HttpSyncApi, ManualClock, SyncApi, SyncEngine, TransportError,
};

pub const KEY: &str = "test-key";

type DownloadFn =
	Box<dyn Fn(&DownloadRequest) -> Result<DownloadResponse, TransportError> + Send + Sync>;
type UploadFn = Box<dyn Fn(&UploadRequest) -> Result<UploadResponse, TransportError> + Send + Sync>;

/// A [`SyncApi`] answering through closures and counting calls.
pub struct FnApi {
	download: DownloadFn,
	upload: UploadFn,
	downloads: AtomicUsize,
	uploads: AtomicUsize,
}

impl FnApi {
	/// Nothing to download; every upload is acknowledged in full.
	pub fn accepting() -> Self {
		Self {
			download: Box::new(|_| {
				Ok(DownloadResponse {
					status: STATUS_OK.to_string(),
					error: None,
					change_logs: Some(Vec::new()),
				})
			}),
			upload: Box::new(|req| {
				Ok(UploadResponse {
					status: STATUS_OK.to_string(),
					error: None,
					last_upload_row: req.changes.last().map(|c| c.upload_row),
				})
			}),
			downloads: AtomicUsize::new(0),
			uploads: AtomicUsize::new(0),
		}
	}

	/// Every request fails as if the authority were unreachable.
	pub fn offline() -> Self {
		Self::accepting()
			.on_download(|_| {
				Err(TransportError::Status {
					endpoint: "downloadChanges",
					status: 503,
				})
			})
			.on_upload(|_| {
				Err(TransportError::Status {
					endpoint: "uploadChanges",
					status: 503,
				})
			})
	}

	pub fn on_download(
		mut self,
		f: impl Fn(&DownloadRequest) -> Result<DownloadResponse, TransportError> + Send + Sync + 'static,
	) -> Self {
		self.download = Box::new(f);
		self
	}

	pub fn on_upload(
		mut self,
		f: impl Fn(&UploadRequest) -> Result<UploadResponse, TransportError> + Send + Sync + 'static,
	) -> Self {
		self.upload = Box::new(f);
		self
	}

	pub fn downloads(&self) -> usize {
		self.downloads.load(Ordering::SeqCst)
	}

	pub fn uploads(&self) -> usize {
		self.uploads.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl SyncApi for FnApi {
	async fn download_changes(
		&self,
		request: &DownloadRequest,
	) -> Result<DownloadResponse, TransportError> {
		self.downloads.fetch_add(1, Ordering::SeqCst);
		(self.download)(request)
	}

	async fn upload_changes(&self, request: &UploadRequest) -> Result<UploadResponse, TransportError> {
		self.uploads.fetch_add(1, Ordering::SeqCst);
		(self.upload)(request)
	}
}

/// A replica with an in-memory store talking to `api`.
pub async fn device(instance_number: &str, api: Arc<dyn SyncApi>) -> SyncEngine {
	device_at(instance_number, api, 1_000).await
}

/// [`device`] whose clock starts at `start` milliseconds.
pub async fn device_at(instance_number: &str, api: Arc<dyn SyncApi>, start: i64) -> SyncEngine {
	let store = Arc::new(Store::open_in_memory().await.expect("in-memory store opens"));
	SyncEngine::new(
		store,
		api,
		Arc::new(ManualClock::new(start, 10)),
		Credentials {
			instance_number: instance_number.to_string(),
			key: KEY.to_string(),
		},
		200,
		Arc::new(MetricsRegistry::new()),
	)
}

/// A replica talking HTTP to the authority at `base`.
pub async fn http_device(instance_number: &str, base: &Url) -> SyncEngine {
	http_device_at(instance_number, base, 1_000).await
}

/// [`http_device`] whose clock starts at `start` milliseconds.
pub async fn http_device_at(instance_number: &str, base: &Url, start: i64) -> SyncEngine {
	let api = HttpSyncApi::new(base.clone(), std::time::Duration::from_secs(5))
		.expect("http client builds");
	device_at(instance_number, Arc::new(api), start).await
}

/// Serve `authority` on an ephemeral local port and return its base URL.
pub async fn spawn_authority(authority: Arc<Authority>) -> Url {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
		.await
		.expect("bind ephemeral port");
	let addr = listener.local_addr().expect("listener has an address");
	tokio::spawn(async move {
		let _ = authority::serve(listener, authority).await;
	});
	Url::parse(&format!("http://{}/", addr)).expect("valid base url")
}
