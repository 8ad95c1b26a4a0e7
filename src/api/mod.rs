pub mod error;
pub mod handler_utils;
pub mod operator;
pub mod runs;
pub mod server;
