use bytes::Bytes;
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::StatusCode;

use super::request::ProxyRequest;
use crate::rewrite::ContentCategory;

/// An upstream response on its way back to the client.
///
/// Created once per upstream call (or synthesized), then mutated in place by
/// the response stages.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Buffered body; empty for streamed responses
    pub content: Bytes,
    pub is_redirect: bool,
    pub request: Option<ProxyRequest>,
    /// The upstream call went through the challenge solver
    pub challenge_used: bool,
    /// The body is piped to the client and never buffered
    pub streamed: bool,
    /// The rewrite engine changed the body
    pub content_rewritten: bool,
    pub category: Option<ContentCategory>,
}

impl ProxyResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, content: Bytes) -> Self {
        Self {
            is_redirect: status.is_redirection(),
            status,
            headers,
            content,
            request: None,
            challenge_used: false,
            streamed: false,
            content_rewritten: false,
            category: None,
        }
    }

    pub fn with_request(mut self, request: ProxyRequest) -> Self {
        self.request = Some(request);
        self
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Request path used by rule filters
    pub fn request_path(&self) -> &str {
        self.request
            .as_ref()
            .map(|r| r.upstream_path())
            .unwrap_or("/")
    }
}
