//! HTTP dispatch to component reconcilers running as separate services.

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{InvokeParams, ReconcilerInvoker};
use crate::error::InvokeError;

/// Where reconcilers report back to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallbackEndpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl CallbackEndpoint {
    pub fn url(&self, scheduling_id: &str, correlation_id: &str) -> String {
        format!(
            "{}://{}:{}/v1/operations/{}/callback/{}",
            self.scheme, self.host, self.port, scheduling_id, correlation_id
        )
    }
}

impl Default for CallbackEndpoint {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

pub struct RemoteReconcilerInvoker {
    client: reqwest::Client,
    reconciler_url: String,
    callback: CallbackEndpoint,
}

impl RemoteReconcilerInvoker {
    pub fn new(
        client: reqwest::Client,
        reconciler_url: impl Into<String>,
        callback: CallbackEndpoint,
    ) -> Self {
        Self {
            client,
            reconciler_url: reconciler_url.into(),
            callback,
        }
    }
}

#[async_trait]
impl ReconcilerInvoker for RemoteReconcilerInvoker {
    async fn invoke(&self, params: &InvokeParams) -> Result<(), InvokeError> {
        let callback_url = self
            .callback
            .url(&params.scheduling_id, &params.correlation_id);
        let request = params.to_request(callback_url);
        request.validate(true)?;

        log::debug!(
            "remote_invoke component={} url={} correlation_id={}",
            request.component,
            self.reconciler_url,
            params.correlation_id
        );
        let response = self
            .client
            .post(&self.reconciler_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| InvokeError::Transport(format!("call reconciler: {e}")))?;

        let status = response.status();
        log::debug!(
            "remote_invoke_response component={} correlation_id={} status={}",
            request.component,
            params.correlation_id,
            status
        );
        match status {
            StatusCode::OK => Ok(()),
            StatusCode::PRECONDITION_REQUIRED => {
                Err(InvokeError::PreconditionRequired(self.reconciler_url.clone()))
            }
            other => Err(InvokeError::Rejected {
                url: self.reconciler_url.clone(),
                status: other.as_u16(),
            }),
        }
    }
}
