pub mod accounts;
pub mod attendance;
pub mod core;
pub mod dashboard;
pub mod sessions;
pub mod stats;
pub mod subjects;
