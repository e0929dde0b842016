//! HTTP implementations of the collaborator contracts

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::warn;

use super::{AstEditOutcome, AstEngine, BuildPlatform, BuildResult, ChunkStream, DeployResult,
    GenerationEngine};
use crate::error::{ForgeError, ForgeResult};

/// OpenAI-compatible streaming completion client
pub struct HttpGenerationEngine {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl HttpGenerationEngine {
    pub fn new(base_url: &str, api_key: Option<String>, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            api_key,
            model: model.to_string(),
        }
    }

    fn build_body(&self, prompt: &str, context: Option<&str>) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(ctx) = context {
            messages.push(json!({ "role": "system", "content": ctx }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));
        json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        })
    }
}

/// Pull the content delta out of one SSE data payload
fn delta_content(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value["choices"][0]["delta"]["content"]
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl GenerationEngine for HttpGenerationEngine {
    async fn generate(&self, prompt: &str, context: Option<&str>) -> ForgeResult<ChunkStream> {
        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .json(&self.build_body(prompt, context));
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ForgeError::Generation(format!(
                "engine returned {}: {}",
                status, body
            )));
        }

        let mut bytes = response.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            'read: while let Some(chunk) = bytes.next().await {
                let chunk = chunk.map_err(|e| ForgeError::Generation(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE frames are newline-delimited; keep the partial
                // tail in the buffer for the next chunk
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        break 'read;
                    }
                    if let Some(content) = delta_content(payload) {
                        yield content;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

/// HTTP client for the AST modification service
pub struct HttpAstEngine {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAstEngine {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl AstEngine for HttpAstEngine {
    async fn apply_edit(
        &self,
        prompt: &str,
        workspace_path: &std::path::Path,
        session_id: &str,
    ) -> ForgeResult<AstEditOutcome> {
        let response = self
            .client
            .post(format!("{}/edit", self.base_url))
            .json(&json!({
                "prompt": prompt,
                "workspacePath": workspace_path.to_string_lossy(),
                "sessionId": session_id,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ForgeError::AstModification(format!(
                "AST engine returned {}",
                response.status()
            )));
        }

        let outcome: AstEditOutcome = response
            .json()
            .await
            .map_err(|e| ForgeError::AstModification(e.to_string()))?;
        Ok(outcome)
    }
}

/// HTTP client for object storage, remote builds, and hosting
pub struct HttpBuildPlatform {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBuildPlatform {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_string(),
            api_key,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("Authorization", format!("Bearer {}", key)),
            None => request,
        }
    }

    async fn expect_success(response: reqwest::Response, what: &str) -> ForgeResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(what = what, status = %status, "Platform call failed");
        Err(ForgeError::Platform(format!(
            "{} returned {}: {}",
            what, status, body
        )))
    }
}

#[derive(serde::Deserialize)]
struct UploadResponse {
    url: String,
}

#[async_trait]
impl BuildPlatform for HttpBuildPlatform {
    async fn upload(&self, container: &str, blob_name: &str, bytes: Vec<u8>) -> ForgeResult<String> {
        let request = self
            .client
            .put(format!("{}/storage/{}/{}", self.base_url, container, blob_name))
            .header("Content-Type", "application/zip")
            .body(bytes);
        let response = self.authorized(request).send().await?;
        let response = Self::expect_success(response, "upload").await?;
        let parsed: UploadResponse = response
            .json()
            .await
            .map_err(|e| ForgeError::Platform(e.to_string()))?;
        Ok(parsed.url)
    }

    async fn download(&self, url: &str) -> ForgeResult<Vec<u8>> {
        let response = self.authorized(self.client.get(url)).send().await?;
        let response = Self::expect_success(response, "download").await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ForgeError::Platform(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn trigger_build(
        &self,
        source_url: &str,
        build_id: &str,
        config: &serde_json::Value,
    ) -> ForgeResult<BuildResult> {
        let request = self.client.post(format!("{}/builds", self.base_url)).json(&json!({
            "sourceUrl": source_url,
            "buildId": build_id,
            "config": config,
        }));
        let response = self.authorized(request).send().await?;
        let response = Self::expect_success(response, "trigger_build").await?;
        response
            .json()
            .await
            .map_err(|e| ForgeError::Build(e.to_string()))
    }

    async fn deploy(&self, built_url: &str, build_id: &str) -> ForgeResult<DeployResult> {
        let request = self
            .client
            .post(format!("{}/deployments", self.base_url))
            .json(&json!({
                "builtUrl": built_url,
                "buildId": build_id,
            }));
        let response = self.authorized(request).send().await?;
        let response = Self::expect_success(response, "deploy").await?;
        response
            .json()
            .await
            .map_err(|e| ForgeError::Deploy(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_content_reads_openai_chunk() {
        let payload = r#"{"choices":[{"delta":{"content":"hello"}}]}"#;
        assert_eq!(delta_content(payload).as_deref(), Some("hello"));
    }

    #[test]
    fn delta_content_ignores_role_only_chunk() {
        let payload = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(delta_content(payload), None);
    }
}
