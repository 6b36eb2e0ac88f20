//! HTTP transport to the remote thread/completion/file/vector-store service.
//!
//! Every call is bearer-authenticated with the run's credential and bounded
//! by the configured request deadline. Non-2xx responses become
//! [`ApiError::Status`]; the one exception is a 404 when listing thread
//! messages, which means "no such thread" and yields an empty list.

pub mod types;

pub use types::*;

use std::future::Future;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Credential;
use crate::error::ApiError;

/// Client for the remote service rooted at `base_url`.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    timeout: Duration,
}

impl HubClient {
    pub fn new(base_url: impl Into<String>, credential: &Credential, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: credential.secret().clone(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, operation: &str, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| ApiError::Request {
            operation: operation.to_string(),
            reason: format!("invalid base URL {}: {}", self.base_url, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| ApiError::Request {
                operation: operation.to_string(),
                reason: format!("base URL {} cannot carry a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(self.token.expose_secret())
    }

    /// Run `fut` under the request deadline.
    async fn with_deadline<T, F>(&self, operation: &str, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, ApiError>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| ApiError::Timeout {
                operation: operation.to_string(),
                timeout: self.timeout,
            })?
    }

    async fn send(operation: &str, req: RequestBuilder) -> Result<Response, ApiError> {
        req.send().await.map_err(|e| ApiError::Request {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }

    fn check(operation: &str, resp: Response) -> Result<Response, ApiError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        Err(ApiError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("").to_string(),
        })
    }

    async fn decode<T: DeserializeOwned>(operation: &str, resp: Response) -> Result<T, ApiError> {
        resp.json::<T>().await.map_err(|e| ApiError::InvalidResponse {
            operation: operation.to_string(),
            reason: e.to_string(),
        })
    }

    /// Send a request and decode a JSON body from a 2xx response.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        req: RequestBuilder,
    ) -> Result<T, ApiError> {
        self.with_deadline(operation, async {
            let resp = Self::check(operation, Self::send(operation, req).await?)?;
            Self::decode(operation, resp).await
        })
        .await
    }

    /// `GET /threads/{thread_id}/messages`. A 404 yields an empty list.
    pub async fn list_messages(
        &self,
        thread_id: &str,
        limit: Option<u32>,
        order: Order,
    ) -> Result<Vec<ThreadMessage>, ApiError> {
        const OP: &str = "list messages";
        let mut url = self.url(OP, &["threads", thread_id, "messages"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("order", order.as_str());
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
        }
        let req = self.request(Method::GET, url);

        self.with_deadline(OP, async {
            let resp = Self::send(OP, req).await?;
            if resp.status() == StatusCode::NOT_FOUND {
                tracing::debug!(thread_id, "Thread not found, treating as empty");
                return Ok(Vec::new());
            }
            let body: Value = Self::decode(OP, Self::check(OP, resp)?).await?;
            let items = match body {
                Value::Array(items) => items,
                Value::Object(mut obj) => match obj.remove("data") {
                    Some(Value::Array(items)) => items,
                    _ => {
                        return Err(ApiError::InvalidResponse {
                            operation: OP.to_string(),
                            reason: "expected a `data` array".to_string(),
                        });
                    }
                },
                _ => {
                    return Err(ApiError::InvalidResponse {
                        operation: OP.to_string(),
                        reason: "expected a list of messages".to_string(),
                    });
                }
            };
            items
                .into_iter()
                .map(|item| {
                    serde_json::from_value(item).map_err(|e| ApiError::InvalidResponse {
                        operation: OP.to_string(),
                        reason: e.to_string(),
                    })
                })
                .collect()
        })
        .await
    }

    /// `POST /threads/{thread_id}/messages`.
    pub async fn create_message(
        &self,
        thread_id: &str,
        body: &MessageCreate,
    ) -> Result<ThreadMessage, ApiError> {
        const OP: &str = "create message";
        let url = self.url(OP, &["threads", thread_id, "messages"])?;
        self.call(OP, self.request(Method::POST, url).json(body)).await
    }

    /// `POST /chat/completions`.
    pub async fn chat_completion(
        &self,
        body: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ApiError> {
        const OP: &str = "chat completion";
        let url = self.url(OP, &["chat", "completions"])?;
        self.call(OP, self.request(Method::POST, url).json(body)).await
    }

    /// `POST /files` (multipart).
    pub async fn upload_file(
        &self,
        content: Vec<u8>,
        file_name: &str,
        file_type: &str,
        purpose: &str,
    ) -> Result<FileObject, ApiError> {
        const OP: &str = "upload file";
        let url = self.url(OP, &["files"])?;
        let part = Part::bytes(content)
            .file_name(file_name.to_string())
            .mime_str(file_type)
            .map_err(|e| ApiError::Request {
                operation: OP.to_string(),
                reason: format!("invalid file type {}: {}", file_type, e),
            })?;
        let form = Form::new()
            .text("purpose", purpose.to_string())
            .part("file", part);
        self.call(OP, self.request(Method::POST, url).multipart(form))
            .await
    }

    /// `GET /files/{file_id}`.
    pub async fn retrieve_file(&self, file_id: &str) -> Result<FileObject, ApiError> {
        const OP: &str = "retrieve file";
        let url = self.url(OP, &["files", file_id])?;
        self.call(OP, self.request(Method::GET, url)).await
    }

    /// `GET /files/{file_id}/content`, as text.
    pub async fn file_content(&self, file_id: &str) -> Result<String, ApiError> {
        const OP: &str = "retrieve file content";
        let url = self.url(OP, &["files", file_id, "content"])?;
        let req = self.request(Method::GET, url);
        self.with_deadline(OP, async {
            let resp = Self::check(OP, Self::send(OP, req).await?)?;
            resp.text().await.map_err(|e| ApiError::InvalidResponse {
                operation: OP.to_string(),
                reason: e.to_string(),
            })
        })
        .await
    }

    /// `POST /vector_stores`.
    pub async fn create_vector_store(&self, body: &CreateVectorStore) -> Result<Value, ApiError> {
        const OP: &str = "create vector store";
        let url = self.url(OP, &["vector_stores"])?;
        self.call(OP, self.request(Method::POST, url).json(body)).await
    }

    /// `GET /vector_stores/{id}`.
    pub async fn get_vector_store(&self, vector_store_id: &str) -> Result<Value, ApiError> {
        const OP: &str = "fetch vector store";
        let url = self.url(OP, &["vector_stores", vector_store_id])?;
        self.call(OP, self.request(Method::GET, url)).await
    }

    /// `GET /vector_stores?name=`; the first match, if any.
    pub async fn find_vector_store_by_name(&self, name: &str) -> Result<Option<Value>, ApiError> {
        const OP: &str = "search vector store by name";
        let mut url = self.url(OP, &["vector_stores"])?;
        url.query_pairs_mut().append_pair("name", name);
        let body: Value = self.call(OP, self.request(Method::GET, url)).await?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .cloned())
    }

    /// `POST /vector_stores/{id}/search`.
    pub async fn query_vector_store(
        &self,
        vector_store_id: &str,
        query: &str,
        full_files: bool,
    ) -> Result<Value, ApiError> {
        const OP: &str = "query vector store";
        let url = self.url(OP, &["vector_stores", vector_store_id, "search"])?;
        let body = serde_json::json!({ "query": query, "full_files": full_files });
        self.call(OP, self.request(Method::POST, url).json(&body)).await
    }

    /// `POST /vector_stores/{id}/files`.
    pub async fn add_file_to_vector_store(
        &self,
        vector_store_id: &str,
        file_id: &str,
    ) -> Result<Value, ApiError> {
        const OP: &str = "add file to vector store";
        let url = self.url(OP, &["vector_stores", vector_store_id, "files"])?;
        let body = serde_json::json!({ "file_id": file_id });
        self.call(OP, self.request(Method::POST, url).json(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> HubClient {
        HubClient::new(
            format!("{}/v1", server.uri()),
            &Credential::new("tok"),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn list_messages_sends_bearer_and_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/thread_1/messages"))
            .and(query_param("order", "desc"))
            .and(query_param("limit", "5"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "m1", "role": "user", "content": "hello"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let messages = client(&server)
            .await
            .list_messages("thread_1", Some(5), Order::Desc)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "hello");
    }

    #[tokio::test]
    async fn list_messages_accepts_bare_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/t/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([{"role": "assistant", "content": "a"}])),
            )
            .mount(&server)
            .await;

        let messages = client(&server)
            .await
            .list_messages("t", None, Order::Asc)
            .await
            .unwrap();
        assert_eq!(messages[0].role, "assistant");
    }

    #[tokio::test]
    async fn list_messages_tolerates_null_role() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/t/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": [
                {"role": null, "content": "notice"},
                {"role": "user", "content": "question"}
            ]})))
            .mount(&server)
            .await;

        let messages = client(&server)
            .await
            .list_messages("t", None, Order::Asc)
            .await
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "");
        assert_eq!(messages[1].text(), "question");
    }

    #[tokio::test]
    async fn list_messages_404_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/threads/missing/messages"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let messages = client(&server)
            .await
            .list_messages("missing", None, Order::Asc)
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn list_messages_other_errors_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .list_messages("t", None, Order::Asc)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn query_vector_store_500_reports_status_and_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/vector_stores/vs_1/search"))
            .and(body_json(json!({"query": "q", "full_files": true})))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = client(&server)
            .await
            .query_vector_store("vs_1", "q", true)
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("500"), "{message}");
        assert!(message.contains("Internal Server Error"), "{message}");
    }

    #[tokio::test]
    async fn slow_response_hits_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let client = HubClient::new(
            format!("{}/v1", server.uri()),
            &Credential::new("tok"),
            Duration::from_millis(50),
        );
        let req = ChatCompletionRequest {
            model: "m".into(),
            messages: vec![],
            temperature: 0.0,
            max_tokens: 1,
            tools: None,
        };
        let err = client.chat_completion(&req).await.unwrap_err();
        assert!(matches!(err, ApiError::Timeout { .. }));
    }

    #[tokio::test]
    async fn find_vector_store_by_name_returns_first_hit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/vector_stores"))
            .and(query_param("name", "docs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"id": "vs_a", "name": "docs"}, {"id": "vs_b", "name": "docs"}]
            })))
            .mount(&server)
            .await;

        let hit = client(&server)
            .await
            .find_vector_store_by_name("docs")
            .await
            .unwrap();
        assert_eq!(hit.unwrap()["id"], "vs_a");
    }
}
