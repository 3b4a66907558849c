use async_trait::async_trait;
use quota_common::ServiceId;
use quota_engine::{BillingError, BillingProvider, SubscriptionRecord};
use reqwest::{Client, StatusCode};
use tracing::debug;
use uuid::Uuid;

/// Billing collaborator reached over HTTP.
///
/// `GET {base}/subscriptions/{user_id}?service={service}` answers with a
/// subscription record, or 404 when the user has none.
pub struct HttpBillingProvider {
    client: Client,
    base_url: String,
}

impl HttpBillingProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn subscription_url(&self, user_id: Uuid) -> String {
        format!("{}/subscriptions/{}", self.base_url, user_id)
    }
}

#[async_trait]
impl BillingProvider for HttpBillingProvider {
    async fn subscription(
        &self,
        user_id: Uuid,
        service: ServiceId,
    ) -> Result<Option<SubscriptionRecord>, BillingError> {
        let response = self
            .client
            .get(self.subscription_url(user_id))
            .query(&[("service", service.as_str())])
            .send()
            .await
            .map_err(|e| BillingError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(user_id = %user_id, service = %service, "No subscription on record");
                Ok(None)
            }
            status if status.is_success() => response
                .json::<SubscriptionRecord>()
                .await
                .map(Some)
                .map_err(|e| BillingError::InvalidResponse(e.to_string())),
            status => Err(BillingError::Unavailable(format!(
                "billing answered {status}"
            ))),
        }
    }
}
