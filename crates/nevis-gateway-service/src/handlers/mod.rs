//! API handlers.

pub mod admin;
pub mod credits;
pub mod generate;
pub mod health;
pub mod quota;
pub mod webhooks;
