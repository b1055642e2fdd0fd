pub mod company_policy;
pub mod leave;
pub mod leave_balance;
pub mod policy_chunk;
pub mod role;
pub mod user;
