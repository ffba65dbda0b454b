use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::auth::{AuthError, TokenProvider};
use super::model::{FileList, FileResource};
use super::{RemoteObject, RemoteStore, StoreConnector, StoreError, FOLDER_MIME};

const DRIVE_API_BASE: &str = "https://www.googleapis.com/";
const FILE_FIELDS: &str = "id, name, mimeType, webViewLink";
const LIST_FIELDS: &str = "nextPageToken, files(id, name, mimeType, webViewLink)";
const PAGE_SIZE: &str = "1000";

/// Drive v3 REST client.
#[derive(Clone)]
pub struct DriveClient {
    http: Client,
    base_url: Url,
    tokens: Arc<TokenProvider>,
}

impl fmt::Debug for DriveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Quote a value for a Drive search expression.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl DriveClient {
    pub fn new(tokens: Arc<TokenProvider>, timeout: Duration) -> Self {
        let base_url = Url::parse(DRIVE_API_BASE).expect("valid default Drive URL");
        Self::with_base_url(tokens, timeout, base_url)
    }

    pub fn with_base_url(tokens: Arc<TokenProvider>, timeout: Duration, base_url: Url) -> Self {
        let http = Client::builder()
            .user_agent("auction-sync/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            tokens,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, StoreError> {
        self.base_url
            .join(path)
            .map_err(|err| StoreError::InvalidResponse(format!("invalid Drive URL {}: {}", path, err)))
    }

    /// Send with the current access token. A 401 forces one token refresh
    /// and a single replay; a second 401 needs a new consent.
    async fn send(&self, op: &'static str, req: RequestBuilder) -> Result<Response, StoreError> {
        let replay = req.try_clone();
        let res = self.dispatch(op, req).await?;
        match replay {
            Some(replay) if res.status() == StatusCode::UNAUTHORIZED => {
                warn!(op, "access token rejected; forcing refresh");
                self.tokens.invalidate().await;
                let res = self.dispatch(op, replay).await?;
                check(op, res).await
            }
            _ => check(op, res).await,
        }
    }

    async fn dispatch(&self, op: &'static str, req: RequestBuilder) -> Result<Response, StoreError> {
        let token = self.tokens.access_token().await?;
        req.bearer_auth(token)
            .send()
            .await
            .map_err(|err| StoreError::Transient {
                op,
                message: err.to_string(),
            })
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        op: &'static str,
        req: RequestBuilder,
    ) -> Result<T, StoreError> {
        self.send(op, req)
            .await?
            .json::<T>()
            .await
            .map_err(|err| StoreError::InvalidResponse(format!("{}: {}", op, err)))
    }

    /// Run a search expression, following `nextPageToken` until exhausted.
    async fn search(&self, op: &'static str, q: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let url = self.endpoint("drive/v3/files")?;
        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = self.http.get(url.clone()).query(&[
                ("q", q),
                ("fields", LIST_FIELDS),
                ("pageSize", PAGE_SIZE),
            ]);
            if let Some(token) = page_token.as_deref() {
                req = req.query(&[("pageToken", token)]);
            }
            let page: FileList = self.send_json(op, req).await?;
            out.extend(page.files.into_iter().map(RemoteObject::from));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(out)
    }
}

async fn check(op: &'static str, res: Response) -> Result<Response, StoreError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    debug!(op, %status, body = %body, "Drive request failed");
    Err(classify(op, status, body))
}

fn classify(op: &'static str, status: StatusCode, message: String) -> StoreError {
    if status == StatusCode::UNAUTHORIZED {
        StoreError::Auth(AuthError::Authentication(format!(
            "{} unauthorized: {}",
            op, message
        )))
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        StoreError::Transient {
            op,
            message: format!("status {}: {}", status, message),
        }
    } else if status == StatusCode::NOT_FOUND {
        StoreError::NotFound(format!("{}: {}", op, message))
    } else {
        StoreError::Rejected {
            op,
            status: status.as_u16(),
            message,
        }
    }
}

#[async_trait]
impl RemoteStore for DriveClient {
    #[instrument(skip(self))]
    async fn find_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        let mut q = format!(
            "name = {} and mimeType = {} and trashed = false",
            quote(name),
            quote(FOLDER_MIME)
        );
        if let Some(parent) = parent {
            q.push_str(&format!(" and {} in parents", quote(parent)));
        }
        Ok(self.search("find_folder", &q).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn find_file(
        &self,
        parent: &str,
        name: &str,
    ) -> Result<Option<RemoteObject>, StoreError> {
        let q = format!(
            "name = {} and mimeType != {} and {} in parents and trashed = false",
            quote(name),
            quote(FOLDER_MIME),
            quote(parent)
        );
        Ok(self.search("find_file", &q).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn list_children(&self, parent: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let q = format!("{} in parents and trashed = false", quote(parent));
        self.search("list_children", &q).await
    }

    #[instrument(skip(self))]
    async fn create_folder(
        &self,
        parent: Option<&str>,
        name: &str,
    ) -> Result<RemoteObject, StoreError> {
        let mut meta = json!({ "name": name, "mimeType": FOLDER_MIME });
        if let Some(parent) = parent {
            meta["parents"] = json!([parent]);
        }
        let req = self
            .http
            .post(self.endpoint("drive/v3/files")?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&meta);
        let created: FileResource = self.send_json("create_folder", req).await?;
        Ok(created.into())
    }

    #[instrument(skip(self, content), fields(len = content.len()))]
    async fn create_file(
        &self,
        parent: &str,
        name: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<RemoteObject, StoreError> {
        let meta = json!({ "name": name, "mimeType": mime_type, "parents": [parent] });
        let req = self
            .http
            .post(self.endpoint("drive/v3/files")?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&meta);
        let created: FileResource = self.send_json("create_file", req).await?;
        if !content.is_empty() {
            self.update_file(&created.id, mime_type, content).await?;
        }
        Ok(created.into())
    }

    #[instrument(skip(self))]
    async fn read_file(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let req = self
            .http
            .get(self.endpoint(&format!("drive/v3/files/{}", id))?)
            .query(&[("alt", "media")]);
        let bytes = self
            .send("read_file", req)
            .await?
            .bytes()
            .await
            .map_err(|err| StoreError::Transient {
                op: "read_file",
                message: err.to_string(),
            })?;
        Ok(bytes.to_vec())
    }

    #[instrument(skip(self, content), fields(len = content.len()))]
    async fn update_file(
        &self,
        id: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<(), StoreError> {
        let req = self
            .http
            .patch(self.endpoint(&format!("upload/drive/v3/files/{}", id))?)
            .query(&[("uploadType", "media"), ("fields", "id")])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content.to_vec());
        self.send("update_file", req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy_file(
        &self,
        id: &str,
        dest_parent: &str,
        name: &str,
    ) -> Result<RemoteObject, StoreError> {
        let req = self
            .http
            .post(self.endpoint(&format!("drive/v3/files/{}/copy", id))?)
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({ "name": name, "parents": [dest_parent] }));
        let copied: FileResource = self.send_json("copy_file", req).await?;
        Ok(copied.into())
    }

    #[instrument(skip(self))]
    async fn move_object(
        &self,
        id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> Result<(), StoreError> {
        let req = self
            .http
            .patch(self.endpoint(&format!("drive/v3/files/{}", id))?)
            .query(&[
                ("addParents", to_parent),
                ("removeParents", from_parent),
                ("fields", "id"),
            ])
            .json(&Value::Object(Default::default()));
        self.send("move_object", req).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let req = self
            .http
            .delete(self.endpoint(&format!("drive/v3/files/{}", id))?);
        match self.send("delete", req).await {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip(self))]
    async fn set_public(&self, id: &str) -> Result<(), StoreError> {
        let req = self
            .http
            .post(self.endpoint(&format!("drive/v3/files/{}/permissions", id))?)
            .json(&json!({ "type": "anyone", "role": "reader" }));
        self.send("set_public", req).await?;
        Ok(())
    }
}

/// Builds an independent [`DriveClient`] (own HTTP connection pool) per
/// `connect`. Only the token provider is shared.
#[derive(Debug, Clone)]
pub struct DriveConnector {
    tokens: Arc<TokenProvider>,
    timeout: Duration,
    base_url: Option<Url>,
}

impl DriveConnector {
    pub fn new(tokens: Arc<TokenProvider>, timeout: Duration) -> Self {
        Self {
            tokens,
            timeout,
            base_url: None,
        }
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }
}

#[async_trait]
impl StoreConnector for DriveConnector {
    async fn connect(&self) -> Result<Arc<dyn RemoteStore>, StoreError> {
        let client = match &self.base_url {
            Some(base) => DriveClient::with_base_url(self.tokens.clone(), self.timeout, base.clone()),
            None => DriveClient::new(self.tokens.clone(), self.timeout),
        };
        Ok(Arc::new(client))
    }
}
