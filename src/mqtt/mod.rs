//! MQTT topic routing engine.
//!
//! A concurrent, wildcard-aware subscription index. The packet layer hands
//! in topic strings, QoS levels, and client ids; publishes come back as a
//! client-id -> effective-QoS mapping. The engine is purely in-memory and
//! independent of the cluster layer.

pub mod topic;

pub use topic::{Qos, TopicError, TopicManager, TopicResult};
