pub mod analytics;
pub mod conversation;
pub mod embedding;
pub mod intent;
pub mod leave_service;
pub mod llm;
pub mod policy_processor;
pub mod policy_rag;
pub mod responder;
pub mod team;
