//! External system connectors implementing `readiness_core::Connector`.

pub mod connectors;
