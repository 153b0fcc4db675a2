//! Public stream-status endpoint client.
//!
//! The streaming server publishes an Icecast-style `status-json.xsl` document;
//! its `icestats.source` entry carries the "Artist - Title" string listeners
//! actually hear, which is the ground truth the cache daemon reconciles against.

use crate::config::StreamStatusConfig;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur fetching the stream status
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Stream status request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Stream status returned HTTP {0}")]
    BadStatus(u16),
}

/// HTTP client for the stream-status endpoint.
#[derive(Debug, Clone)]
pub struct StreamStatusClient {
    client: reqwest::Client,
    url: String,
    mount: Option<String>,
}

impl StreamStatusClient {
    pub fn new(url: &str, mount: Option<String>, timeout: Duration) -> Result<Self, StatusError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            mount,
        })
    }

    /// Builds a client from config; `Ok(None)` when no URL is configured.
    pub fn from_config(config: &StreamStatusConfig) -> Result<Option<Self>, StatusError> {
        match config.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Ok(Some(Self::new(
                url,
                config.mount.clone(),
                Duration::from_millis(config.timeout_ms),
            )?)),
            None => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetch the "now playing" string.
    ///
    /// # Returns
    /// * `Ok(Some(text))` - The status document named a current title
    /// * `Ok(None)` - The document was fetched but carries no usable title
    /// * `Err(StatusError)` - Transport failure or non-200 response
    pub async fn now_playing(&self) -> Result<Option<String>, StatusError> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(StatusError::BadStatus(response.status().as_u16()));
        }

        // Some servers emit invalid JSON for odd titles; treat it as unknown.
        let body = response.text().await?;
        Ok(serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|doc| parse_icestats(&doc, self.mount.as_deref())))
    }
}

/// Extract the now-playing string from an Icecast status document.
///
/// `icestats.source` may be a single object or an array of mounts. With a
/// `mount`, only the source whose `listenurl` ends with it is considered;
/// otherwise the first source with a title wins. Sources that publish artist
/// and title separately are joined as `"Artist - Title"`.
pub fn parse_icestats(doc: &Value, mount: Option<&str>) -> Option<String> {
    let source = doc.get("icestats")?.get("source")?;
    let candidates: Vec<&Value> = match source {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![source],
        _ => return None,
    };

    candidates
        .into_iter()
        .filter(|candidate| match mount {
            Some(mount) => candidate
                .get("listenurl")
                .and_then(Value::as_str)
                .map(|url| url.ends_with(mount))
                .unwrap_or(false),
            None => true,
        })
        .find_map(source_title)
}

fn source_title(source: &Value) -> Option<String> {
    let text = |key: &str| {
        source
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    };

    match (text("artist"), text("title")) {
        (Some(artist), Some(title)) if !title.contains(" - ") => {
            Some(format!("{} - {}", artist, title))
        }
        (_, Some(title)) => Some(title.to_string()),
        _ => None,
    }
}
