//! Core SMTP types.

mod extension;
mod reply;

pub use extension::Extension;
pub use reply::{Reply, ReplyBuilder, ReplyCode, ReplyLine};
