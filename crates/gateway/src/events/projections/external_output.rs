//! External Output Projection (§4.7): reacts to `wf.completed` for sessions
//! bound to an external channel (e.g. a chat platform). Sends the final
//! text, then scans it for image URLs and forwards up to 3 as attachments —
//! after allow-listing the hostname, requiring `https`, `HEAD`-checking
//! `Content-Type` starts with `image/` and size ≤ 50 MB, and deduplicating.

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;

use crate::events::bus::Projection;
use crate::events::envelope::WorkflowEventEnvelope;

const MAX_IMAGE_BYTES: u64 = 50 * 1024 * 1024;
const MAX_IMAGES_PER_ANSWER: usize = 3;

/// Sends a finished turn's answer (and any allow-listed images) to whatever
/// external channel the session is bound to. The transport itself (the
/// messaging platform's send API) is out of scope (§1) — `notifier` is the
/// pluggable hook a caller supplies.
pub type Notifier = Box<dyn Fn(&str, &str, Vec<Vec<u8>>) -> anyhow::Result<()> + Send + Sync>;

pub struct ExternalOutputProjection {
    client: reqwest::Client,
    allowed_hosts: HashSet<String>,
    notifier: Notifier,
}

impl ExternalOutputProjection {
    pub fn new(allowed_hosts: HashSet<String>, notifier: Notifier) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client, allowed_hosts, notifier })
    }

    fn extract_image_urls(text: &str) -> Vec<String> {
        // Conservative: only bare https URLs ending in a common image extension.
        let re = Regex::new(r#"https://[^\s"'<>]+\.(?:png|jpe?g|gif|webp)"#).unwrap();
        re.find_iter(text).map(|m| m.as_str().to_owned()).collect()
    }

    fn is_allowed_host(&self, url: &str) -> bool {
        let Ok(parsed) = reqwest::Url::parse(url) else { return false };
        parsed.scheme() == "https"
            && parsed
                .host_str()
                .is_some_and(|h| self.allowed_hosts.contains(h))
    }

    async fn fetch_image(&self, url: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let head = self.client.head(url).send().await?;
        let content_type = head
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.starts_with("image/") {
            return Ok(None);
        }
        let len = head
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if len.is_some_and(|n| n > MAX_IMAGE_BYTES) {
            return Ok(None);
        }

        let resp = self.client.get(url).send().await?;
        let bytes = resp.bytes().await?;
        if bytes.len() as u64 > MAX_IMAGE_BYTES {
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }
}

#[async_trait::async_trait]
impl Projection for ExternalOutputProjection {
    fn name(&self) -> &'static str {
        "external_output"
    }

    async fn handle(&self, event: &WorkflowEventEnvelope) -> anyhow::Result<()> {
        if event.event_type != sa_domain::orchestration::event_types::WF_COMPLETED {
            return Ok(());
        }
        let Some(channel) = event.payload.get("channel").and_then(|v| v.as_str()) else {
            // Session not bound to an external channel; nothing to do.
            return Ok(());
        };
        let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or("");

        let mut seen = HashSet::new();
        let mut images = Vec::new();
        for url in Self::extract_image_urls(text) {
            if images.len() >= MAX_IMAGES_PER_ANSWER {
                break;
            }
            if !seen.insert(url.clone()) || !self.is_allowed_host(&url) {
                continue;
            }
            match self.fetch_image(&url).await {
                Ok(Some(bytes)) => images.push(bytes),
                Ok(None) => {}
                Err(e) => tracing::warn!(url, error = %e, "failed to fetch image attachment"),
            }
        }

        (self.notifier)(channel, text, images)
    }
}
