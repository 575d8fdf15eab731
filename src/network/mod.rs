//! Outer adapters: the gRPC remote executor and the admin HTTP surface.

mod error;

pub mod client;
pub mod http_admin;

pub use client::{status_to_raw, GrpcRemoteExecutor};
pub use error::NetworkError;
pub use http_admin::{run_http_admin, AdminAuth};

pub mod proto {
    tonic::include_proto!("remote");
}
