pub mod client;
pub mod codec;
pub mod config;
pub mod constants;
pub mod net;
pub mod reconciler;
pub mod registry;
pub mod store;
