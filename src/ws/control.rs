//! The REST control surface the streaming session depends on.
//!
//! The session only needs three operations: create a subscription, remove
//! one, and re-authorize the connection with a new token. They are behind
//! [`ControlSurface`] so the session can run against [`RestClient`] in
//! production and an in-memory fake in tests.

use std::future::Future;

use crate::client::RestClient;
use crate::error::Result;
use crate::types::subscription::{SubscriptionResponse, SubscriptionSpec};

/// Subscription and authorization calls issued by the session.
pub trait ControlSurface: Clone + Send + Sync + 'static {
    /// Create `reference_id` on `context_id` as described by `spec`.
    fn create_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        spec: &SubscriptionSpec,
    ) -> impl Future<Output = Result<SubscriptionResponse>> + Send;

    /// Remove `reference_id` from `context_id`. Removing a subscription that
    /// does not exist succeeds.
    fn remove_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        spec: &SubscriptionSpec,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Extend the open connection on `context_id` with `token`.
    fn authorize(&self, context_id: &str, token: &str) -> impl Future<Output = Result<()>> + Send;

    /// Use `token` for subsequent calls.
    fn set_access_token(&mut self, token: &str) -> Result<()>;
}

/// [`RestClient`] plus the streaming authorize endpoint.
#[derive(Debug, Clone)]
pub struct RestControl {
    client: RestClient,
    authorize_url: url::Url,
}

impl RestControl {
    /// Wrap `client`, re-authorizing against `authorize_url`.
    pub fn new(client: RestClient, authorize_url: &str) -> Result<Self> {
        Ok(Self {
            client,
            authorize_url: url::Url::parse(authorize_url)?,
        })
    }

    /// The wrapped REST client.
    pub fn client(&self) -> &RestClient {
        &self.client
    }
}

impl ControlSurface for RestControl {
    async fn create_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        spec: &SubscriptionSpec,
    ) -> Result<SubscriptionResponse> {
        self.client
            .create_subscription(&spec.service_path, &spec.to_request(context_id, reference_id))
            .await
    }

    async fn remove_subscription(
        &self,
        context_id: &str,
        reference_id: &str,
        spec: &SubscriptionSpec,
    ) -> Result<()> {
        match self
            .client
            .remove_subscription(&spec.service_path, context_id, reference_id)
            .await
        {
            Err(e) if e.is_not_found() => {
                tracing::debug!(reference_id, "Subscription already gone");
                Ok(())
            }
            other => other,
        }
    }

    async fn authorize(&self, context_id: &str, token: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.set_access_token(token)?;
        client
            .authorize_streaming(&self.authorize_url, context_id)
            .await
    }

    fn set_access_token(&mut self, token: &str) -> Result<()> {
        self.client.set_access_token(token)
    }
}
