//! Warden operator
//!
//! Process wiring around the sensor controllers: configuration, the HTTP
//! catalog client, CRD installation and the controller futures.

pub mod catalog;
pub mod config;
pub mod controllers;
pub mod crds;
