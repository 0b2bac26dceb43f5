//! Image Pipeline
//!
//! Asynchronous image transformation: uploads are validated and stored, a
//! delayed task resizes and filters each image in a worker pool, and a
//! scheduler deletes records and files once their retention window passes.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
