//! In-process development authority.
//!
//! Serves `POST /downloadChanges` and `POST /uploadChanges` over in-memory
//! state so replicas can be exercised end to end without the production
//! server. Accepted changes get increasing `serverChangeID`s; a change id is
//! accepted once; downloads never return a requester's own uploads.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use log::{debug, info, warn};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::sync::change::Change;
use crate::sync::transport::{
	DownloadRequest, DownloadResponse, STATUS_OK, UploadRequest, UploadResponse,
};

pub const DEFAULT_PAGE_SIZE: usize = 100;

struct Accepted {
	change: Change,
	uploader: String,
}

#[derive(Default)]
struct Ledger {
	keys: HashMap<String, String>,
	changes: Vec<Accepted>,
	seen: HashSet<String>,
	next_sequence: i64,
}

/// Authority state shared by the request handlers.
pub struct Authority {
	ledger: Mutex<Ledger>,
	page_size: usize,
	open_enrollment: bool,
}

impl Authority {
	/// An authority that only accepts registered instances.
	pub fn new(page_size: usize) -> Self {
		Self {
			ledger: Mutex::new(Ledger {
				next_sequence: 1,
				..Ledger::default()
			}),
			page_size: page_size.max(1),
			open_enrollment: false,
		}
	}

	/// Register an unknown instance with the first key it presents.
	pub fn with_open_enrollment(mut self) -> Self {
		self.open_enrollment = true;
		self
	}

	pub fn register(&self, instance_number: impl Into<String>, key: impl Into<String>) {
		self.ledger().keys.insert(instance_number.into(), key.into());
	}

	/// Number of changes accepted so far.
	pub fn accepted(&self) -> usize {
		self.ledger().changes.len()
	}

	fn ledger(&self) -> MutexGuard<'_, Ledger> {
		self.ledger.lock().unwrap_or_else(|e| e.into_inner())
	}

	fn authenticate(&self, ledger: &mut Ledger, instance: &str, key: &str) -> bool {
		match ledger.keys.get(instance) {
			Some(expected) => expected == key,
			None if self.open_enrollment && !key.is_empty() => {
				info!("enrolled instance {}", instance);
				ledger.keys.insert(instance.to_string(), key.to_string());
				true
			}
			None => false,
		}
	}

	pub fn download(&self, request: &DownloadRequest) -> Result<DownloadResponse, StatusCode> {
		let mut ledger = self.ledger();
		if !self.authenticate(&mut ledger, &request.instance_number, &request.key) {
			warn!("download refused for {}", request.instance_number);
			return Err(StatusCode::UNAUTHORIZED);
		}

		let page: Vec<Change> = ledger
			.changes
			.iter()
			.filter(|a| a.change.server_sequence.unwrap_or(0) > request.last_change_id)
			.filter(|a| a.uploader != request.instance_number)
			.take(self.page_size)
			.map(|a| a.change.clone())
			.collect();
		debug!(
			"serving {} change(s) after {} to {}",
			page.len(),
			request.last_change_id,
			request.instance_number
		);
		Ok(DownloadResponse {
			status: STATUS_OK.to_string(),
			error: None,
			change_logs: Some(page),
		})
	}

	pub fn upload(&self, request: &UploadRequest) -> Result<UploadResponse, StatusCode> {
		let mut ledger = self.ledger();
		if !self.authenticate(&mut ledger, &request.instance_number, &request.key) {
			warn!("upload refused for {}", request.instance_number);
			return Err(StatusCode::UNAUTHORIZED);
		}

		let mut last_row = 0;
		for item in &request.changes {
			if let Some(defect) = item.change.defect() {
				warn!(
					"rejecting upload row {} ({}) from {}: {}",
					item.upload_row, item.change.change_id, request.instance_number, defect
				);
				return Ok(UploadResponse {
					status: "error".to_string(),
					error: Some(defect),
					last_upload_row: Some(item.upload_row),
				});
			}
			last_row = item.upload_row;
			if !ledger.seen.insert(item.change.change_id.clone()) {
				continue;
			}

			let sequence = ledger.next_sequence;
			ledger.next_sequence += 1;
			let mut change = item.change.clone();
			change.server_sequence = Some(sequence);
			change.error_count = 0;
			if change.origin_instance.is_none() {
				change.origin_instance = Some(request.instance_number.clone());
			}
			ledger.changes.push(Accepted {
				change,
				uploader: request.instance_number.clone(),
			});
		}

		Ok(UploadResponse {
			status: STATUS_OK.to_string(),
			error: None,
			last_upload_row: Some(last_row),
		})
	}
}

async fn download_changes(
	State(authority): State<Arc<Authority>>,
	Json(request): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, StatusCode> {
	authority.download(&request).map(Json)
}

async fn upload_changes(
	State(authority): State<Arc<Authority>>,
	Json(request): Json<UploadRequest>,
) -> Result<Json<UploadResponse>, StatusCode> {
	authority.upload(&request).map(Json)
}

pub fn router(authority: Arc<Authority>) -> Router {
	Router::new()
		.route("/downloadChanges", post(download_changes))
		.route("/uploadChanges", post(upload_changes))
		.layer(TraceLayer::new_for_http())
		.with_state(authority)
}

/// Serve `authority` on `listener` until the task is dropped or fails.
pub async fn serve(listener: TcpListener, authority: Arc<Authority>) -> std::io::Result<()> {
	if let Ok(addr) = listener.local_addr() {
		info!("development authority listening on http://{}", addr);
	}
	axum::serve(listener, router(authority)).await
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use axum::body::{Body, to_bytes};
	use axum::http::Request;
	use tower::ServiceExt;

	use super::*;
	use crate::sync::change::{ChangeData, ChangeType};
	use crate::sync::transport::UploadItem;

	fn item(id: &str, row: i64, (change_type, data): (ChangeType, ChangeData)) -> UploadItem {
		UploadItem {
			change: Change {
				change_id: id.into(),
				origin_instance: None,
				change_time: row,
				change_type,
				data,
				server_sequence: None,
				error_count: 0,
			},
			upload_row: row,
		}
	}

	fn upload(instance: &str, changes: Vec<UploadItem>) -> UploadRequest {
		UploadRequest {
			instance_number: instance.into(),
			key: "k".into(),
			changes,
		}
	}

	fn download(instance: &str, after: i64) -> DownloadRequest {
		DownloadRequest {
			instance_number: instance.into(),
			key: "k".into(),
			last_change_id: after,
		}
	}

	fn authority() -> Authority {
		let a = Authority::new(2);
		a.register("+15550100", "k");
		a.register("+15550200", "k");
		a
	}

	#[test]
	fn upload_is_idempotent_and_sequenced() {
		let a = authority();
		let batch = upload(
			"+15550100",
			vec![
				item("a", 1, ChangeData::instance_insert("+15550100")),
				item("b", 2, ChangeData::contact_delete("X")),
			],
		);
		let resp = a.upload(&batch).unwrap();
		assert_eq!(resp.status, STATUS_OK);
		assert_eq!(resp.last_upload_row, Some(2));
		a.upload(&batch).unwrap();
		assert_eq!(a.accepted(), 2);

		let page = a.download(&download("+15550200", 0)).unwrap().change_logs.unwrap();
		let seqs: Vec<Option<i64>> = page.iter().map(|c| c.server_sequence).collect();
		assert_eq!(seqs, vec![Some(1), Some(2)]);
		assert_eq!(page[0].origin_instance.as_deref(), Some("+15550100"));
	}

	#[test]
	fn first_malformed_change_stops_the_batch() {
		let a = authority();
		let (_, empty) = ChangeData::contact_delete("X");
		let resp = a
			.upload(&upload(
				"+15550100",
				vec![
					item("a", 4, ChangeData::contact_delete("X")),
					item("b", 5, (ChangeType::ContactDelete, ChangeData { contact_id: None, ..empty })),
					item("c", 6, ChangeData::contact_delete("Y")),
				],
			))
			.unwrap();
		assert_eq!(resp.status, "error");
		assert_eq!(resp.last_upload_row, Some(5));
		assert_eq!(a.accepted(), 1);
	}

	#[test]
	fn downloads_page_and_skip_own_changes() {
		let a = authority();
		a.upload(&upload(
			"+15550100",
			vec![
				item("a", 1, ChangeData::contact_delete("A")),
				item("b", 2, ChangeData::contact_delete("B")),
				item("c", 3, ChangeData::contact_delete("C")),
			],
		))
		.unwrap();

		assert!(a.download(&download("+15550100", 0)).unwrap().change_logs.unwrap().is_empty());

		let first = a.download(&download("+15550200", 0)).unwrap().change_logs.unwrap();
		assert_eq!(first.len(), 2);
		let rest = a.download(&download("+15550200", 2)).unwrap().change_logs.unwrap();
		assert_eq!(rest.len(), 1);
		assert_eq!(rest[0].change_id, "c");
	}

	#[test]
	fn unknown_instances_need_enrollment() {
		let closed = Authority::new(10);
		assert_eq!(
			closed.download(&download("+15550300", 0)).unwrap_err(),
			StatusCode::UNAUTHORIZED
		);

		let open = Authority::new(10).with_open_enrollment();
		assert!(open.download(&download("+15550300", 0)).is_ok());
		let mut wrong = download("+15550300", 0);
		wrong.key = "other".into();
		assert_eq!(open.download(&wrong).unwrap_err(), StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn router_serves_json() {
		let app = router(Arc::new(authority()));
		let body = serde_json::to_vec(&download("+15550100", 0)).unwrap();
		let response = app
			.oneshot(
				Request::builder()
					.method("POST")
					.uri("/downloadChanges")
					.header("content-type", "application/json")
					.body(Body::from(body))
					.unwrap(),
			)
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);

		let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
		let parsed: DownloadResponse = serde_json::from_slice(&bytes).unwrap();
		assert_eq!(parsed.status, STATUS_OK);
		assert_eq!(parsed.change_logs, Some(Vec::new()));
	}
}
