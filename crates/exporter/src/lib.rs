//! not-my-board exporter
//!
//! Publishes a place on the hub and exposes its TCP endpoints and USB
//! devices to authorized peers through an HTTP-CONNECT gateway.

pub mod config;
pub mod exporter;
pub mod gateway;
pub mod usbip;
