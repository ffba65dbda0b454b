use serde::Deserialize;

use super::RemoteObject;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileResource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    pub web_view_link: Option<String>,
}

impl From<FileResource> for RemoteObject {
    fn from(f: FileResource) -> Self {
        RemoteObject {
            id: f.id,
            name: f.name,
            mime_type: f.mime_type,
            web_view_link: f.web_view_link,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<FileResource>,
    pub next_page_token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: Option<i64>,
    pub refresh_token: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct TokenErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}
