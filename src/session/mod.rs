//! Session layer: the connection to the remote tutoring agent and the
//! turn structure of the conversation carried over it.

pub mod connector;
pub mod context;
pub mod controller;
pub mod frame;
pub mod transport;
pub mod turn;
