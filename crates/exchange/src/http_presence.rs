//! Presence answered by the relay server's `GET /presence/{user_id}`.

use std::time::Duration;

use async_trait::async_trait;
use chatkey_shared::api::relay::PresenceResponse;
use chatkey_shared::ids::UserId;
use chrono::{DateTime, Utc};

use crate::presence::Presence;

pub struct HttpPresence {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPresence {
    /// `base_url` is the relay's HTTP address, e.g. `http://127.0.0.1:3100`.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch(&self, user: UserId) -> Result<PresenceResponse, reqwest::Error> {
        self.client
            .get(format!("{}/presence/{user}", self.base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

fn seen_within(presence: &PresenceResponse, window: Duration, now: DateTime<Utc>) -> bool {
    if presence.online {
        return true;
    }
    let Some(seen) = presence.last_seen else {
        return false;
    };
    match chrono::Duration::from_std(window) {
        Ok(window) => now - seen <= window,
        Err(_) => true,
    }
}

#[async_trait]
impl Presence for HttpPresence {
    async fn is_recently_online(&self, user: UserId, window: Duration) -> bool {
        match self.fetch(user).await {
            Ok(presence) => seen_within(&presence, window, Utc::now()),
            Err(e) => {
                tracing::warn!(user_id = %user, error = %e, "presence lookup failed");
                false
            }
        }
    }

    async fn record_seen(&self, _user: UserId) {
        // The relay records its own connections.
    }
}
