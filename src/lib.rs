pub mod cache;
pub mod control;
pub mod entry;
pub mod error;
pub mod fs;
pub mod http;
pub mod key;
pub mod policy;
pub mod store;
pub mod time;
pub type Result<T> = anyhow::Result<T>;
pub type Error = anyhow::Error;
pub mod logging;

#[macro_use]
extern crate log;

#[macro_use]
extern crate lazy_static;

#[macro_use]
extern crate derive_builder;
