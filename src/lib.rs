// src/lib.rs
// Verifying paymaster service for ERC-4337 user operations.
//
// Accounts request a daily gas allowance; sponsored operations are deducted
// from it and receive a time-bounded `paymasterAndData` signature.

pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod paymaster;
pub mod rpc;
pub mod server;
pub mod store;
pub mod types;

pub use crate::error::PaymasterError;
pub use crate::paymaster::Paymaster;
