//! MongoDB driver backed by the official `mongodb` crate

mod commands;
mod connection;
mod cursor;

pub use connection::{MongoDialer, MongoDriver};
