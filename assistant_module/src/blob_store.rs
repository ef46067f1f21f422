//! Azure blob backend for the durable state records.
//!
//! The Azure SDK is async; the run path is synchronous and executes on
//! spawn_blocking threads, so each call blocks on the ambient tokio
//! runtime's handle (legal from a spawn_blocking thread, never from the
//! async context itself). A private runtime is built only when the store
//! is constructed outside tokio. Missing blobs read as `None`;
//! present-but-invalid JSON is a corruption error the caller treats as
//! fatal.

use std::future::Future;
use std::sync::Arc;

use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use serde_json::Value;
use tracing::{debug, info};

use crate::state_store::StateStoreError;

enum BlockOn {
    Handle(tokio::runtime::Handle),
    Owned(tokio::runtime::Runtime),
}

impl BlockOn {
    fn block_on<F: Future>(&self, future: F) -> F::Output {
        match self {
            BlockOn::Handle(handle) => handle.block_on(future),
            BlockOn::Owned(runtime) => runtime.block_on(future),
        }
    }
}

pub struct BlobStateStore {
    container_client: Arc<ContainerClient>,
    prefix: String,
    runtime: BlockOn,
}

fn parse_connection_string(connection_string: &str) -> Result<(String, String), StateStoreError> {
    let mut account_name = None;
    let mut account_key = None;
    for part in connection_string.split(';') {
        if let Some(value) = part.strip_prefix("AccountName=") {
            account_name = Some(value.to_string());
        } else if let Some(value) = part.strip_prefix("AccountKey=") {
            account_key = Some(value.to_string());
        }
    }
    match (account_name, account_key) {
        (Some(name), Some(key)) => Ok((name, key)),
        _ => Err(StateStoreError::Backend(
            "invalid connection string: missing AccountName or AccountKey".to_string(),
        )),
    }
}

impl BlobStateStore {
    /// `container` and `prefix` come from the `az://container/prefix`
    /// state root; credentials from the connection string.
    pub fn new(
        connection_string: &str,
        container: &str,
        prefix: &str,
    ) -> Result<Self, StateStoreError> {
        let (account_name, account_key) = parse_connection_string(connection_string)?;
        let credentials = StorageCredentials::access_key(&account_name, account_key);
        let container_client = Arc::new(
            BlobServiceClient::new(&account_name, credentials).container_client(container),
        );
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => BlockOn::Handle(handle),
            Err(_) => BlockOn::Owned(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|err| StateStoreError::Backend(err.to_string()))?,
            ),
        };
        Ok(Self {
            container_client,
            prefix: prefix.trim_matches('/').to_string(),
            runtime,
        })
    }

    fn blob_path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    pub fn read_json(&self, name: &str) -> Result<Option<Value>, StateStoreError> {
        let blob_path = self.blob_path(name);
        let blob_client = self.container_client.blob_client(&blob_path);

        let data = match self.runtime.block_on(blob_client.get_content()) {
            Ok(data) => data,
            Err(err) => {
                let detail = err.to_string();
                if detail.contains("BlobNotFound") || detail.contains("404") {
                    debug!("state blob {} not found", blob_path);
                    return Ok(None);
                }
                return Err(StateStoreError::Backend(detail));
            }
        };

        let content = String::from_utf8(data).map_err(|err| StateStoreError::Corrupt {
            path: blob_path.clone(),
            detail: format!("invalid UTF-8: {err}"),
        })?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| StateStoreError::Corrupt {
                path: blob_path,
                detail: err.to_string(),
            })
    }

    pub fn write_json(&self, name: &str, value: &Value) -> Result<(), StateStoreError> {
        let blob_path = self.blob_path(name);
        let blob_client = self.container_client.blob_client(&blob_path);
        let serialized =
            serde_json::to_string_pretty(value).map_err(|err| StateStoreError::Backend(err.to_string()))?;

        let bytes = serialized.clone().into_bytes();
        self.runtime
            .block_on(async {
                blob_client
                    .put_block_blob(bytes)
                    .content_type("application/json")
                    .await
            })
            .map_err(|err| StateStoreError::Backend(err.to_string()))?;
        info!("wrote state blob {} ({} bytes)", blob_path, serialized.len());
        Ok(())
    }
}
