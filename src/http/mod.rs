//! Request/response records and the network fetch primitive.

mod network;
mod types;

pub use network::{HttpNetwork, Network, NetworkError};
pub use types::{Destination, RequestRecord, ResponseType, StoredResponse};
