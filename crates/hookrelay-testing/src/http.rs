//! Wiremock helpers for scripting webhook endpoints.

use std::time::Duration;

use serde_json::Value;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// How a mocked endpoint answers.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Answers with the status and an optional JSON body.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: Option<Value>,
    },
    /// Answers with the status after a delay.
    Delayed {
        /// HTTP status code.
        status: u16,
        /// Time before the response is sent.
        delay: Duration,
    },
}

impl MockResponse {
    /// 200 with an empty body.
    pub fn ok() -> Self {
        Self::Status { status: 200, body: None }
    }

    /// Bare status response.
    pub fn status(status: u16) -> Self {
        Self::Status { status, body: None }
    }

    fn template(&self) -> ResponseTemplate {
        match self {
            Self::Status { status, body: Some(body) } => {
                ResponseTemplate::new(*status).set_body_json(body)
            },
            Self::Status { status, body: None } => ResponseTemplate::new(*status),
            Self::Delayed { status, delay } => ResponseTemplate::new(*status).set_delay(*delay),
        }
    }
}

/// A scripted `POST` endpoint on a mock server.
#[derive(Debug, Clone)]
pub struct MockEndpoint {
    path: String,
    response: MockResponse,
    expected_calls: Option<u64>,
    times: Option<u64>,
}

impl MockEndpoint {
    /// Endpoint at `path` answering 200.
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), response: MockResponse::ok(), expected_calls: None, times: None }
    }

    /// Sets the response.
    #[must_use]
    pub fn respond(mut self, response: MockResponse) -> Self {
        self.response = response;
        self
    }

    /// Fails the test on drop unless exactly `calls` requests arrive.
    #[must_use]
    pub fn expect(mut self, calls: u64) -> Self {
        self.expected_calls = Some(calls);
        self
    }

    /// Stops matching after `times` requests so a later mount can take over.
    #[must_use]
    pub fn up_to(mut self, times: u64) -> Self {
        self.times = Some(times);
        self
    }

    /// Registers the endpoint.
    pub async fn mount(self, server: &MockServer) {
        let mut mock = Mock::given(method("POST"))
            .and(path(self.path.as_str()))
            .respond_with(self.response.template());
        if let Some(times) = self.times {
            mock = mock.up_to_n_times(times);
        }
        if let Some(calls) = self.expected_calls {
            mock = mock.expect(calls);
        }
        mock.mount(server).await;
    }
}

/// Requests the server received on `path`.
pub async fn received_on(server: &MockServer, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == request_path)
        .count()
}
