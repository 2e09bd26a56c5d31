pub mod email;
pub mod request;
