pub mod admission;
pub mod expiry;
pub mod queue;
pub mod retrieval;
pub mod secret;
pub mod storage;
pub mod transform;
pub mod validation;
pub mod worker;
