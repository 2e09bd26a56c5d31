pub mod decoders;
pub mod fetcher;
pub mod imap_client;
pub mod planner;
pub mod session;
pub mod utf7;
