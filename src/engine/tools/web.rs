use anyhow::Result;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ExecContext, ToolDef, ToolExecutor, ToolOutput, ToolParam};
use crate::permission::PermissionKind;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const FETCH_CAP: usize = 100_000;

/// HTTP GET for model-requested pages. Only http/https URLs are accepted;
/// the permission engine gates which hosts get through.
pub struct WebFetchTool {
    def: ToolDef,
}

impl WebFetchTool {
    pub fn new() -> Self {
        Self {
            def: ToolDef {
                name: "webfetch".to_string(),
                description: "Fetch a URL and return its body as text".to_string(),
                kind: PermissionKind::Webfetch,
                params: vec![ToolParam::required_string("url", "URL to fetch")],
                output_cap: FETCH_CAP,
                compaction_protected: false,
            },
        }
    }
}

impl ToolExecutor for WebFetchTool {
    fn def(&self) -> &ToolDef {
        &self.def
    }

    fn execute(
        &self,
        args: JsonValue,
        _ctx: ExecContext,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<ToolOutput>> {
        async move {
            let raw = args["url"].as_str().unwrap_or_default().to_string();
            let url = match url::Url::parse(&raw) {
                Ok(u) if matches!(u.scheme(), "http" | "https") => u,
                Ok(u) => {
                    return Ok(ToolOutput::error(format!(
                        "unsupported URL scheme: {}",
                        u.scheme()
                    )))
                }
                Err(e) => return Ok(ToolOutput::error(format!("invalid URL: {e}"))),
            };

            let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
            let fetch = async {
                let response = client.get(url.clone()).send().await?;
                let status = response.status();
                let body = response.text().await?;
                Ok::<_, reqwest::Error>((status, body))
            };
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("Aborted"),
                result = fetch => match result {
                    Ok((status, body)) if status.is_success() => {
                        Ok(ToolOutput::text(body))
                    }
                    Ok((status, body)) => Ok(ToolOutput::error(format!(
                        "HTTP {status}: {}",
                        crate::util::truncate_chars(&body, 500)
                    ))),
                    Err(e) => Ok(ToolOutput::error(format!("fetch failed: {e}"))),
                },
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ExecContext {
        ExecContext {
            worktree: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_rejects_non_http_schemes() {
        let tool = WebFetchTool::new();
        let out = tool
            .execute(
                json!({ "url": "file:///etc/passwd" }),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.contains("unsupported URL scheme"));
    }

    #[tokio::test]
    async fn test_rejects_invalid_url() {
        let tool = WebFetchTool::new();
        let out = tool
            .execute(json!({ "url": "not a url" }), ctx(), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.is_error);
    }
}
