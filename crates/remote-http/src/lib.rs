//! HTTP implementation of the remote CRUD contract plus connectivity
//! monitoring.

pub mod client;
pub mod connectivity;

pub use client::{HttpRemoteStore, RemoteHttpConfig};
pub use connectivity::{spawn_http_probe, ConnectivityMonitor};
