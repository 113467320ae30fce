use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use anyhow::Context;
use futures::future::join_all;

use super::feeds::parse_feed_price;
use crate::{config::PriceFeedConfig, db::Database, metrics::Metrics};

/// Polls the configured external feeds and appends one tick per successful
/// response. A failed source is logged and retried on the next cycle.
pub struct PriceIngestor {
    http: reqwest::Client,
    db: Database,
    metrics: Metrics,
    feeds: Vec<PriceFeedConfig>,
    last_fetch: HashMap<String, Instant>,
}

impl PriceIngestor {
    pub fn new(
        db: Database,
        metrics: Metrics,
        feeds: Vec<PriceFeedConfig>,
        http_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .context("building feed http client")?;
        Ok(Self {
            http,
            db,
            metrics,
            feeds,
            last_fetch: HashMap::new(),
        })
    }

    pub async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.poll_once().await;
        }
    }

    pub async fn poll_once(&mut self) {
        let now = Instant::now();
        let due: Vec<PriceFeedConfig> = self
            .feeds
            .iter()
            .filter(|feed| {
                self.last_fetch
                    .get(&feed.source)
                    .map_or(true, |last| now.duration_since(*last) >= feed.min_interval)
            })
            .cloned()
            .collect();

        let fetches = due.iter().map(|feed| self.fetch_one(feed));
        let results = join_all(fetches).await;

        for (feed, result) in due.iter().zip(results) {
            self.last_fetch.insert(feed.source.clone(), now);
            match result {
                Ok(price) => {
                    if let Err(err) = self
                        .db
                        .insert_price_tick(&feed.source, price, feed.weight)
                        .await
                    {
                        tracing::error!(source = %feed.source, "tick insert failed: {err:#}");
                        self.metrics.observe_tick(&feed.source, "store_error");
                        continue;
                    }
                    self.metrics.observe_tick(&feed.source, "ok");
                    tracing::debug!(source = %feed.source, price, "tick ingested");
                }
                Err(err) => {
                    self.metrics.observe_tick(&feed.source, "fetch_error");
                    tracing::warn!(source = %feed.source, "feed fetch failed: {err:#}");
                }
            }
        }
    }

    async fn fetch_one(&self, feed: &PriceFeedConfig) -> anyhow::Result<f64> {
        let body: serde_json::Value = self
            .http
            .get(&feed.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_feed_price(&feed.source, &body)
    }
}
