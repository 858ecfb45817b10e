use super::history::HistoryRecord;
use crate::auth::{self, AuthSession};
use crate::chat::{EventStream, StreamBackend, StreamRequest, decode_stream};
use crate::config::{AuthTransport, ClientConfig};
use crate::error::{ChatError, ChatResult};
use crate::types::{FileMeta, Message};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, COOKIE, SET_COOKIE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

const SESSION_COOKIE: &str = "access_token";

#[derive(Serialize)]
struct Credentials<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct MeResponse {
    email: String,
}

/// Client for the document chat HTTP API.
///
/// Requests carry the credential held in [`auth`]; a 401 from any endpoint
/// clears it and yields [`ChatError::AuthExpired`].
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    transport: AuthTransport,
}

impl ApiClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            http: Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            transport: config.auth_transport,
        }
    }

    pub fn from_env() -> Self {
        Self::new(&ClientConfig::from_env())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let Some(token) = auth::token() else {
            return request;
        };
        match self.transport {
            AuthTransport::Bearer => request.bearer_auth(token),
            AuthTransport::Cookie => request.header(COOKIE, format!("{SESSION_COOKIE}={token}")),
        }
    }

    async fn send(&self, request: RequestBuilder) -> ChatResult<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED {
            tracing::warn!("server rejected credential, signing out");
            auth::clear();
        }
        Err(ChatError::from_status(status, body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> ChatResult<T> {
        let body = self.send(request).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    pub async fn login(&self, email: &str, password: &str) -> ChatResult<AuthSession> {
        self.exchange_credentials("/login_user", email, password).await
    }

    pub async fn register(&self, email: &str, password: &str) -> ChatResult<AuthSession> {
        self.exchange_credentials("/register_user", email, password).await
    }

    async fn exchange_credentials(
        &self,
        path: &str,
        email: &str,
        password: &str,
    ) -> ChatResult<AuthSession> {
        let response = self
            .http
            .post(self.url(path))
            .json(&Credentials { email, password })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ChatError::InvalidCredentials);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status, body));
        }

        let cookie_token = session_cookie(&response);
        let body: LoginResponse = serde_json::from_str(&response.text().await?)?;
        let token = body
            .token
            .or(body.access_token)
            .or(cookie_token)
            .ok_or_else(|| ChatError::Decode("response carried no credential".to_string()))?;

        let session = AuthSession {
            email: body.email.unwrap_or_else(|| email.to_string()),
            token,
        };
        auth::set(session.clone());
        tracing::info!(email = %session.email, "signed in");
        Ok(session)
    }

    pub async fn me(&self) -> ChatResult<String> {
        let me: MeResponse = self.json(self.http.get(self.url("/me"))).await?;
        Ok(me.email)
    }

    /// Ends the server session. The local credential is dropped even when the
    /// server call fails.
    pub async fn logout(&self) -> ChatResult<()> {
        let result = self.send(self.http.post(self.url("/logout"))).await;
        auth::clear();
        result.map(|_| ())
    }

    pub async fn upload_files<P: AsRef<Path>>(&self, paths: &[P]) -> ChatResult<Vec<FileMeta>> {
        let mut form = Form::new();
        for path in paths {
            let path = path.as_ref();
            let bytes = tokio::fs::read(path).await?;
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document.pdf".to_string());
            let part = Part::bytes(bytes)
                .file_name(filename)
                .mime_str("application/pdf")?;
            form = form.part("files", part);
        }
        self.json(self.http.post(self.url("/files")).multipart(form))
            .await
    }

    pub async fn list_files(&self) -> ChatResult<Vec<FileMeta>> {
        self.json(self.http.get(self.url("/files"))).await
    }

    pub async fn file_bytes(&self, file_id: &str) -> ChatResult<Vec<u8>> {
        let response = self
            .send(self.http.get(self.url(&format!("/files/{file_id}"))))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Whether the document has finished indexing.
    pub async fn file_status(&self, file_id: &str) -> ChatResult<bool> {
        self.json(self.http.get(self.url(&format!("/files/{file_id}/status"))))
            .await
    }

    pub async fn delete_file(&self, file_id: &str) -> ChatResult<bool> {
        self.json(self.http.delete(self.url(&format!("/files/{file_id}"))))
            .await
    }

    /// Short-lived direct download URL, resolved against the API base.
    pub async fn signed_url(&self, file_id: &str) -> ChatResult<String> {
        let relative: String = self
            .json(self.http.get(self.url(&format!("/files/{file_id}/signed-url"))))
            .await?;
        resolve_url(&self.base_url, &relative)
    }

    pub async fn history(&self, file_id: &str) -> ChatResult<Vec<Message>> {
        let records: Vec<HistoryRecord> = self
            .json(self.http.get(self.url(&format!("/history/{file_id}"))))
            .await?;
        Ok(records.into_iter().map(Message::from).collect())
    }

    /// Registers a completion request and returns the id to stream it with.
    pub async fn prepare_stream(&self, request: &StreamRequest) -> ChatResult<String> {
        self.json(self.http.post(self.url("/prepare_stream")).json(request))
            .await
    }

    pub async fn open_event_stream(&self, stream_id: &str) -> ChatResult<EventStream> {
        let request = self
            .http
            .get(self.url("/v1/chat/completions"))
            .query(&[("stream_id", stream_id)])
            .header(ACCEPT, "text/event-stream");
        let response = self.send(request).await?;
        Ok(decode_stream(response.bytes_stream()))
    }
}

#[async_trait]
impl StreamBackend for ApiClient {
    async fn open_stream(&self, request: &StreamRequest) -> ChatResult<EventStream> {
        let stream_id = self.prepare_stream(request).await?;
        tracing::debug!(%stream_id, "stream prepared");
        self.open_event_stream(&stream_id).await
    }
}

fn session_cookie(response: &Response) -> Option<String> {
    response
        .headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(parse_session_cookie)
}

fn parse_session_cookie(raw: &str) -> Option<String> {
    let pair = raw.split(';').next()?.trim();
    let (name, value) = pair.split_once('=')?;
    if name.trim() != SESSION_COOKIE {
        return None;
    }
    let value = value.trim().trim_matches('"');
    (!value.is_empty()).then(|| value.to_string())
}

fn resolve_url(base: &str, relative: &str) -> ChatResult<String> {
    let base = Url::parse(base).map_err(|err| ChatError::Decode(format!("bad base url: {err}")))?;
    let joined = base
        .join(relative)
        .map_err(|err| ChatError::Decode(format!("bad signed url: {err}")))?;
    Ok(joined.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_session_cookie_value() {
        assert_eq!(
            parse_session_cookie("access_token=abc.def; HttpOnly; Path=/; SameSite=lax"),
            Some("abc.def".to_string())
        );
        assert_eq!(parse_session_cookie("other=1; Path=/"), None);
        assert_eq!(parse_session_cookie("access_token=\"\"; Max-Age=0"), None);
    }

    #[test]
    fn resolves_relative_signed_url() {
        assert_eq!(
            resolve_url(
                "http://localhost:8000",
                "/files/42/download?expires=1&signature=ab"
            )
            .unwrap(),
            "http://localhost:8000/files/42/download?expires=1&signature=ab"
        );
        assert_eq!(
            resolve_url("http://localhost:8000", "https://cdn.example/x").unwrap(),
            "https://cdn.example/x"
        );
    }

    #[test]
    fn stream_request_matches_wire_shape() {
        let request = StreamRequest {
            messages: vec![crate::types::ChatTurn {
                role: crate::types::Role::User,
                content: "".into(),
            }],
            file_id: "f1".into(),
            action: crate::types::Action::Explain,
            snippet: Some("entropy".into()),
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            serde_json::json!({
                "messages": [{"role": "user", "content": ""}],
                "file_id": "f1",
                "action": "explain",
                "snippet": "entropy"
            })
        );
    }

    #[test]
    fn builds_urls_from_base() {
        let client = ApiClient::new(&ClientConfig {
            api_url: "http://api.local/".into(),
            ..ClientConfig::default()
        });
        assert_eq!(client.base_url(), "http://api.local");
        assert_eq!(client.url("/files"), "http://api.local/files");
    }
}
