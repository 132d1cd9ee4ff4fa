//! Client for IBM Cloud App Configuration.
//!
//! Features, properties and segments are downloaded once and evaluated
//! locally. Every evaluation is counted and the counts are posted to the
//! service in the background.
//!
//! To change the default request timeout set the APP_CONFIG_TIMEOUT_MS
//! environment variable to the desired timeout value.
mod client;
mod evaluator;
mod http;
mod store;

pub mod metering;
pub mod models;
pub mod persistence;

pub use crate::client::{Client, Evaluation, FeatureHandle, PropertyHandle};
pub use crate::evaluator::{eval_operator, segment_matches};
