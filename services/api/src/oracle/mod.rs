pub mod aggregator;
pub mod feeds;
pub mod ingestor;
pub mod submitter;
pub mod volatility;
