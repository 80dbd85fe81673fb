//! Durable storage for finished (and checkpoint) artifacts. Everything here
//! is best-effort from the pipeline's point of view: remote unavailability
//! must never block local artifact production.

use std::path::Path;

use anyhow::Context as _;
use async_trait::async_trait;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, remote_path: &str) -> anyhow::Result<bool>;

    /// Upload a local file, overwriting any previous object. Returns a
    /// shareable download URL.
    async fn upload(&self, local_path: &Path, remote_path: &str) -> anyhow::Result<String>;

    async fn download(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()>;

    async fn list_directory(&self, remote_path: &str) -> anyhow::Result<Vec<RemoteEntry>>;
}

/// Dropbox over its HTTP API: RPC endpoints on `api.dropboxapi.com`,
/// content endpoints on `content.dropboxapi.com`, all bearer-authenticated.
pub struct DropboxStore {
    client: reqwest::Client,
    access_token: String,
}

impl DropboxStore {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            access_token: access_token.into(),
        }
    }

    async fn rpc(&self, endpoint: &str, body: serde_json::Value) -> anyhow::Result<reqwest::Response> {
        let url = format!("https://api.dropboxapi.com/2/{endpoint}");
        self.client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))
    }
}

#[async_trait]
impl BlobStore for DropboxStore {
    async fn exists(&self, remote_path: &str) -> anyhow::Result<bool> {
        let resp = self
            .rpc("files/get_metadata", json!({ "path": remote_path }))
            .await?;
        if resp.status().is_success() {
            return Ok(true);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if status.as_u16() == 409 && body.contains("not_found") {
            return Ok(false);
        }
        anyhow::bail!("dropbox get_metadata failed ({status}): {body}");
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> anyhow::Result<String> {
        let bytes = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("read local file: {}", local_path.display()))?;
        tracing::info!(
            path = %local_path.display(),
            remote = remote_path,
            size = bytes.len(),
            "uploading artifact to dropbox"
        );

        let arg = json!({ "path": remote_path, "mode": "overwrite", "mute": true });
        let resp = self
            .client
            .post("https://content.dropboxapi.com/2/files/upload")
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("dropbox upload request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("dropbox upload failed ({status}): {body}");
        }

        self.shared_link(remote_path).await
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> anyhow::Result<()> {
        let arg = json!({ "path": remote_path });
        let resp = self
            .client
            .post("https://content.dropboxapi.com/2/files/download")
            .bearer_auth(&self.access_token)
            .header("Dropbox-API-Arg", arg.to_string())
            .send()
            .await
            .context("dropbox download request")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("dropbox download failed ({status}): {body}");
        }
        let bytes = resp.bytes().await.context("read download body")?;

        if let Some(parent) = local_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create download dir: {}", parent.display()))?;
        }
        tokio::fs::write(local_path, &bytes)
            .await
            .with_context(|| format!("write downloaded file: {}", local_path.display()))?;
        Ok(())
    }

    async fn list_directory(&self, remote_path: &str) -> anyhow::Result<Vec<RemoteEntry>> {
        let resp = self
            .rpc("files/list_folder", json!({ "path": remote_path }))
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("dropbox list_folder failed ({status}): {body}");
        }
        let value: serde_json::Value = resp.json().await.context("parse list_folder json")?;

        let mut out = Vec::new();
        for entry in value
            .get("entries")
            .and_then(|e| e.as_array())
            .into_iter()
            .flatten()
        {
            let Some(name) = entry.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            let kind = match entry.get(".tag").and_then(|t| t.as_str()) {
                Some("folder") => EntryKind::Folder,
                _ => EntryKind::File,
            };
            let size = entry.get("size").and_then(|s| s.as_u64()).unwrap_or(0);
            out.push(RemoteEntry {
                name: name.to_string(),
                kind,
                size,
            });
        }
        Ok(out)
    }
}

impl DropboxStore {
    async fn shared_link(&self, remote_path: &str) -> anyhow::Result<String> {
        let resp = self
            .rpc(
                "sharing/create_shared_link_with_settings",
                json!({ "path": remote_path }),
            )
            .await?;

        let url = if resp.status().is_success() {
            let value: serde_json::Value = resp.json().await.context("parse shared link json")?;
            value
                .get("url")
                .and_then(|u| u.as_str())
                .map(str::to_string)
        } else {
            // A link may already exist for this path; look it up instead.
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            if !body.contains("shared_link_already_exists") {
                anyhow::bail!("dropbox create shared link failed ({status}): {body}");
            }
            let resp = self
                .rpc(
                    "sharing/list_shared_links",
                    json!({ "path": remote_path, "direct_only": true }),
                )
                .await?;
            let value: serde_json::Value = resp.json().await.context("parse shared links json")?;
            value
                .get("links")
                .and_then(|links| links.as_array())
                .and_then(|links| links.first())
                .and_then(|link| link.get("url"))
                .and_then(|u| u.as_str())
                .map(str::to_string)
        };

        let url = url.ok_or_else(|| anyhow::anyhow!("dropbox returned no shared link url"))?;
        Ok(direct_download_url(&url))
    }
}

/// Rewrite a Dropbox share link into a direct-download link.
pub fn direct_download_url(url: &str) -> String {
    if url.starts_with("https://www.dropbox.com") {
        url.replace("www.dropbox.com", "dl.dropboxusercontent.com")
            .replace("?dl=0", "")
    } else {
        url.to_string()
    }
}
