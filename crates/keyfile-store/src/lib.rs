pub mod bridge;
pub mod config;
pub mod errors;
mod fsutil;
pub mod filename;
pub mod keyfile;
pub mod nmmeta;
pub mod permissions;
pub mod profile;
pub mod schema;
pub mod serialize;
pub mod verify;
pub mod writer;
