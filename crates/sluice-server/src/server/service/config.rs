use crate::server::streaming::transform::{EchoTransform, Positioned};
use serde_json::Value;

/// Work item handed to a transform: a submitted JSON value and its index.
pub type Item = Positioned<Value>;

/// Transform the binary serves with.
pub type DefaultTransform = EchoTransform;
