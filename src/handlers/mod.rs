pub mod messages;
pub mod stats;
pub mod ws;
