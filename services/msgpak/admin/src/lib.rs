//! HTTP admin endpoint for msgpak servers.
//!
//! A side channel for operators and local tooling: queue a task for every
//! connected client, or list the current peers. Requests never wait for
//! delivery; tasks go into the broker's queues and leave with the next
//! broadcast.
//!
//! | Route           | Method     | Result                                  |
//! |-----------------|------------|-----------------------------------------|
//! | `/msgsend`      | POST, GET  | 202 with `{"accepted": n, "full": [..]}` |
//! | `/peers`        | GET        | 200 with the connected peers            |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod routes;
pub mod server;

pub use error::AdminError;
pub use routes::{handle_request, AdminState};
pub use server::{serve, AdminConfig};
