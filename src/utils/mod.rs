pub mod identity;
pub mod identity_cache;
pub mod identity_filter;
