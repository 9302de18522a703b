#![feature(stmt_expr_attributes)]
#![feature(io_error_more)]

pub mod censor;
pub mod config;
pub mod decryptor;
pub mod error;
pub mod keystore;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod transport;
