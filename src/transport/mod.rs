//! Consuming side: the HTTP client and the demand side channel.

pub mod client;
pub mod demand;

pub use client::{BodyReader, Client};
pub use demand::{HttpRequester, Requester};
