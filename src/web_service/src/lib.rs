pub mod admin;
pub mod http_handler;
