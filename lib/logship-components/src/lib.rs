//! Log shipping components.
//!
//! Every component implements [`LogClient`][logship_core::LogClient], so they compose into per-destination chains:
//! [`pack::PackClient`] in front, an optional [`buffer::BufferedClient`], and a [`batch::BatchingClient`] pushing
//! through a [`push::PushClient`]. The [`controller::Controller`] owns one chain per destination and decides, based on
//! the lifecycle state of each destination, whether entries are forwarded at all.
#![deny(missing_docs)]

use logship_error::GenericError;
use snafu::Snafu;

pub mod batch;
pub mod buffer;
pub mod controller;
pub mod pack;
pub mod push;

mod telemetry;

/// A client error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ClientError {
    /// The client no longer accepts entries.
    #[snafu(display("Client for destination '{}' has been stopped.", destination))]
    Stopped {
        /// Destination the client delivers to.
        destination: String,
    },

    /// The entry could not be written to the on-disk queue.
    #[snafu(display("Failed to queue entry for destination '{}'.", destination))]
    Queue {
        /// Destination the client delivers to.
        destination: String,

        /// Error source.
        source: GenericError,
    },
}
