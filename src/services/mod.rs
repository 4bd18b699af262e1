pub mod outbound;

pub use outbound::{OutboundMessage, OutboundService};
