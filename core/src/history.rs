/// REST history collaborator
///
/// Endpoints:
///   GET  {base}/conversations
///   GET  {base}/messages/{conversation_id}   ?page=N&limit=N
use crate::error::{Result, SyncError};
use crate::messenger_types::{Conversation, MessagePage};
use crate::session::Session;
use bytes::Bytes;
use http::{header, Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Source of conversation and message history
pub trait HistorySource: Send + Sync {
    fn fetch_conversations(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<Vec<Conversation>>> + Send;

    fn fetch_messages(
        &self,
        session: &Session,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> impl Future<Output = Result<MessagePage>> + Send;
}

/// `HistorySource` over plain HTTP/1 with a bearer token
#[derive(Clone)]
pub struct HttpHistoryClient {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpHistoryClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder(TokioExecutor::new()).build_http(),
            request_timeout,
        }
    }

    fn conversations_uri(&self) -> String {
        format!("{}/conversations", self.base_url)
    }

    fn messages_uri(&self, conversation_id: &str, page: u32, page_size: u32) -> String {
        format!(
            "{}/messages/{}?page={}&limit={}",
            self.base_url,
            urlencoding::encode(conversation_id),
            page,
            page_size
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, session: &Session, uri: &str) -> Result<T> {
        let parsed: Uri = uri
            .parse()
            .map_err(|e| SyncError::Http(format!("invalid URI {}: {}", uri, e)))?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(parsed)
            .header(header::AUTHORIZATION, session.bearer())
            .header(header::ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| SyncError::Http(e.to_string()))?;

        debug!("GET {}", uri);
        let resp = timeout(self.request_timeout, self.client.request(req))
            .await
            .map_err(|_| SyncError::Timeout(format!("GET {}", uri)))?
            .map_err(|e| SyncError::Http(format!("GET {}: {}", uri, e)))?;

        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| SyncError::Http(format!("body read error: {}", e)))?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(SyncError::Http(format!(
                "GET {} returned {}: {}",
                uri,
                status,
                String::from_utf8_lossy(&body)
            )));
        }
        serde_json::from_slice(&body).map_err(SyncError::Serialization)
    }
}

impl HistorySource for HttpHistoryClient {
    async fn fetch_conversations(&self, session: &Session) -> Result<Vec<Conversation>> {
        self.get_json(session, &self.conversations_uri()).await
    }

    async fn fetch_messages(
        &self,
        session: &Session,
        conversation_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<MessagePage> {
        self.get_json(session, &self.messages_uri(conversation_id, page, page_size))
            .await
    }
}
