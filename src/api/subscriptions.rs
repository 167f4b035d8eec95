//! Subscription endpoints.
//!
//! Every streaming service exposes the same resource shape under its own
//! path, e.g. `/trade/v1/infoprices/subscriptions` or
//! `/chart/v1/charts/subscriptions`.

use crate::client::RestClient;
use crate::error::Result;
use crate::types::subscription::{CreateSubscriptionRequest, SubscriptionResponse};

impl RestClient {
    /// Create a streaming subscription.
    ///
    /// **Endpoint:** `POST {service_path}`
    pub async fn create_subscription(
        &self,
        service_path: &str,
        req: &CreateSubscriptionRequest,
    ) -> Result<SubscriptionResponse> {
        self.post(service_path, req).await
    }

    /// Remove a single streaming subscription.
    ///
    /// **Endpoint:** `DELETE {service_path}/{context-id}/{reference-id}`
    pub async fn remove_subscription(
        &self,
        service_path: &str,
        context_id: &str,
        reference_id: &str,
    ) -> Result<()> {
        self.delete_no_content(&format!("{service_path}/{context_id}/{reference_id}"))
            .await
    }

    /// Remove every subscription of a context on one service.
    ///
    /// **Endpoint:** `DELETE {service_path}/{context-id}`
    pub async fn remove_all_subscriptions(&self, service_path: &str, context_id: &str) -> Result<()> {
        self.delete_no_content(&format!("{service_path}/{context_id}"))
            .await
    }
}
