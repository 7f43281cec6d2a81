pub mod client;
pub mod kline_stream;
pub mod rate_limit;

pub use client::BinanceClient;
pub use kline_stream::{BinanceKlineFeed, LiveCandle};
