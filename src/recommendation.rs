//! Shard count recommendation (`GET /gateway/bot`).

use crate::error::Error;
use serde::Deserialize;
use std::future::Future;

/// Response of the gateway recommendation endpoint.
///
/// Only `url`, `shards` and `session_start_limit.max_concurrency` are
/// consumed by the shard manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GatewayRecommendation {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// Something that can report the recommended shard layout.
///
/// [`crate::RequestDispatcher`] implements this with a REST call; use
/// [`StaticRecommendation`] for fixed values.
pub trait RecommendationSource: Send + Sync {
    fn recommend(&self) -> impl Future<Output = Result<GatewayRecommendation, Error>> + Send;
}

/// A recommendation known up front.
#[derive(Debug, Clone)]
pub struct StaticRecommendation(pub GatewayRecommendation);

impl StaticRecommendation {
    pub fn new(url: impl Into<String>, shards: u32, max_concurrency: u32) -> Self {
        Self(GatewayRecommendation {
            url: url.into(),
            shards,
            session_start_limit: SessionStartLimit {
                total: 1000,
                remaining: 1000,
                reset_after: 0,
                max_concurrency,
            },
        })
    }
}

impl RecommendationSource for StaticRecommendation {
    async fn recommend(&self) -> Result<GatewayRecommendation, Error> {
        Ok(self.0.clone())
    }
}
