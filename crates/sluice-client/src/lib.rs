#![doc = include_str!("../README.md")]

mod error;
mod store;
mod subscriber;

pub use error::{BoxError, Error, Result};
pub use store::{Keyed, KeyedStore};
pub use subscriber::{
    ParseFailurePolicy, Parser, SubscribeOptions, Subscription, stream_url, submit,
    subscribe, subscribe_parsed, subscribe_with,
};
