//! virtsync command-line front end: registry transport and notifications

pub mod notify;
pub mod registry_rpc;

pub use notify::{NotifyError, Notifier};
pub use registry_rpc::JsonRpcRegistry;
