//! Webhook delivery: client (single attempt + retry), queue (worker pool),
//! and payload factory (state -> wire DTO).

pub mod client;
pub mod payload;
pub mod queue;

pub use client::{WebhookClient, WebhookClientConfig};
pub use queue::{EnqueueError, WebhookQueue, WebhookQueueConfig};
