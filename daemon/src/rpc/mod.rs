mod client;
mod endpoints;

pub use client::*;
pub use endpoints::*;
