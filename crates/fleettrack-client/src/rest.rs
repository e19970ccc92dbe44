//! REST persistence backstop.
//!
//! Independently of the realtime channel, the latest accepted location is
//! periodically written through this client so the backend retains a
//! durable record even when the event stream is lossy. The endpoint is
//! idempotent from the client's view: resending the same reading is safe.

use std::sync::RwLock;

use tracing::debug;

use fleettrack_protocol::LocationReport;

use crate::error::TrackerError;

/// HTTP client for the tracking persistence endpoint.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    auth_token: RwLock<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            auth_token: RwLock::new(auth_token.into()),
        }
    }

    /// Swap in a refreshed bearer token without rebuilding the client.
    pub fn set_token(&self, token: impl Into<String>) {
        *self.auth_token.write().unwrap() = token.into();
    }

    /// Persist a location reading: `POST /tracking/vehicle/{id}/location`.
    pub async fn persist_location(&self, report: &LocationReport) -> Result<(), TrackerError> {
        let url = location_url(&self.base_url, &report.vehicle_id);
        let token = self.auth_token.read().unwrap().clone();

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(report)
            .send()
            .await?;
        response.error_for_status()?;

        debug!(vehicle_id = %report.vehicle_id, "location persisted over REST");
        Ok(())
    }
}

fn location_url(base_url: &str, vehicle_id: &str) -> String {
    format!(
        "{}/tracking/vehicle/{}/location",
        base_url.trim_end_matches('/'),
        vehicle_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_url() {
        assert_eq!(
            location_url("https://api.example.com", "vehicle-7"),
            "https://api.example.com/tracking/vehicle/vehicle-7/location"
        );
        // Trailing slashes do not double up.
        assert_eq!(
            location_url("https://api.example.com/", "v"),
            "https://api.example.com/tracking/vehicle/v/location"
        );
    }
}
