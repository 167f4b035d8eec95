//! Streaming connection endpoints.

use crate::client::RestClient;
use crate::error::Result;

impl RestClient {
    /// Re-authorize an open streaming connection with this client's token.
    ///
    /// The connection keeps running; only its authorization is extended.
    ///
    /// **Endpoint:** `PUT {authorize_url}?contextid={context-id}`
    pub async fn authorize_streaming(&self, authorize_url: &url::Url, context_id: &str) -> Result<()> {
        let mut url = authorize_url.clone();
        url.query_pairs_mut().append_pair("contextid", context_id);
        self.put_absolute_no_content(&url).await
    }
}
