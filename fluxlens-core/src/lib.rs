pub mod errors;

pub type Result<T> = std::result::Result<T, errors::FluxLensError>;

pub mod aggregator;
pub mod events;
pub mod flux_resource;
pub mod flux_state;
pub mod helm;
pub mod inventory;
pub mod kube_client;
pub mod logs;
pub mod reconcile;
pub mod selector;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod watch;

pub mod prelude {
    pub use super::errors::FluxLensError;
    pub use super::Result;
}
