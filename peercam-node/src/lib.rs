//! # peercam-node
//!
//! Command-line runner for one peercam node.
//!
//! ## Modes
//!
//! - **advertise**: announce this node and accept invitations; every
//!   payload received is logged and optionally written to a file.
//! - **browse**: discover advertisers, contact one and stream an image
//!   file to it at a fixed interval.

pub mod capture;
pub mod config;
pub mod service;
