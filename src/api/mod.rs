pub mod ai;
pub mod analytics;
pub mod conversation;
pub mod employee;
pub mod hr;
pub mod manager;
pub mod policy;
