//! Cross-host call transfer over plain HTTP.
//!
//! The sending side is here; the receiving side is whatever HTTP surface
//! the host application already runs. It should accept the posted JSON
//! and feed it into `Engine::receive_transfer`.

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use hopcore::channel::RequestResender;
use hopcore::FlowError;

pub struct HttpResender {
    client: reqwest::Client,
    port: u16,
    route: String,
}

impl HttpResender {
    pub fn new(port: u16) -> Self {
        HttpResender {
            client: reqwest::Client::new(),
            port,
            route: "/hopflow/call".to_string(),
        }
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }
}

#[async_trait]
impl RequestResender for HttpResender {
    async fn resend_call(
        &self,
        ip: &str,
        call_type: &str,
        trace_id: &str,
        payload: Option<String>,
    ) -> Result<(), FlowError> {
        let url = format!("http://{ip}:{}{}", self.port, self.route);
        debug!("resending {call_type} for {trace_id} to {url}");
        let body = json!({
            "callType": call_type,
            "traceId": trace_id,
            "payload": payload,
        });
        self.client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| FlowError::Channel(format!("transfer to {url} failed: {e}")))?
            .error_for_status()
            .map_err(|e| FlowError::Channel(format!("transfer to {url} rejected: {e}")))?;
        Ok(())
    }
}
