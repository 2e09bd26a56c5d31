pub mod credentials;
pub mod oauth;
pub mod token_file;
pub mod token_store;
