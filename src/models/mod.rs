pub mod job;
pub mod registration;
pub mod upload;
