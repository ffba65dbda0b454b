//! Remote object store abstraction.
//!
//! The sync engine only talks to [`RemoteStore`]; `client` speaks the
//! Drive v3 REST dialect and `memory` keeps everything in process for tests
//! and dry runs. Every operation is scoped by a parent container id and name
//! lookups are exact, case-sensitive and ignore trashed objects.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::retry::Retryable;

pub mod auth;
pub mod client;
pub mod memory;
pub mod model;

pub use auth::{AuthError, TokenProvider};
pub use client::{DriveClient, DriveConnector};
pub use memory::MemoryStore;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const CSV_MIME: &str = "text/csv";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient remote-store failure during {op}: {message}")]
    Transient { op: &'static str, message: String },
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("remote store rejected {op} with status {status}: {message}")]
    Rejected {
        op: &'static str,
        status: u16,
        message: String,
    },
    #[error("invalid remote-store response: {0}")]
    InvalidResponse(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        match self {
            StoreError::Transient { .. } => true,
            StoreError::Auth(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// One file or container as returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub web_view_link: Option<String>,
}

impl RemoteObject {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// Durable link that keeps working as long as the object id does.
    pub fn public_link(&self) -> String {
        match &self.web_view_link {
            Some(link) if !link.is_empty() => link.clone(),
            _ if self.is_folder() => folder_link(&self.id),
            _ => format!("https://drive.google.com/file/d/{}/view", self.id),
        }
    }
}

pub fn folder_link(id: &str) -> String {
    format!("https://drive.google.com/drive/folders/{}", id)
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Find a container by name; `parent = None` searches the whole store.
    async fn find_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError>;

    /// Find a non-container object by name under `parent`.
    async fn find_file(&self, parent: &str, name: &str)
        -> Result<Option<RemoteObject>, StoreError>;

    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteObject>, StoreError>;

    async fn create_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<RemoteObject, StoreError>;

    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<RemoteObject, StoreError>;

    async fn read_file(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Replace an existing file's bytes; the object id does not change.
    async fn update_file(&self, id: &str, mime_type: &str, content: &[u8])
        -> Result<(), StoreError>;

    async fn copy_file(
        &self,
        id: &str,
        dest_parent: &str,
        name: &str,
    ) -> Result<RemoteObject, StoreError>;

    /// Reparent an object. Cheap and atomic per object.
    async fn move_object(&self, id: &str, from_parent: &str, to_parent: &str)
        -> Result<(), StoreError>;

    /// Delete an object (and, for containers, everything below it).
    /// Deleting an id that no longer exists succeeds.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    async fn set_public(&self, id: &str) -> Result<(), StoreError>;
}

/// Hands out store handles. Parallel staging workers each ask for their own.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(mime: &str, link: Option<&str>) -> RemoteObject {
        RemoteObject {
            id: "abc".into(),
            name: "n".into(),
            mime_type: mime.into(),
            web_view_link: link.map(str::to_string),
        }
    }

    #[test]
    fn public_link_prefers_web_view_link() {
        let obj = object(FOLDER_MIME, Some("https://drive.google.com/drive/folders/abc?usp=x"));
        assert_eq!(obj.public_link(), "https://drive.google.com/drive/folders/abc?usp=x");
    }

    #[test]
    fn public_link_falls_back_by_kind() {
        assert_eq!(
            object(FOLDER_MIME, None).public_link(),
            "https://drive.google.com/drive/folders/abc"
        );
        assert_eq!(
            object("image/png", Some("")).public_link(),
            "https://drive.google.com/file/d/abc/view"
        );
    }

    #[test]
    fn transient_classification() {
        let t = StoreError::Transient {
            op: "list",
            message: "503".into(),
        };
        assert!(t.is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
        let rejected = StoreError::Rejected {
            op: "copy",
            status: 403,
            message: "forbidden".into(),
        };
        assert!(!rejected.is_transient());
        assert!(!StoreError::Auth(AuthError::Authentication("revoked".into())).is_transient());
    }
}
