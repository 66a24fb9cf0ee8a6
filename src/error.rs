// src/error.rs
use jsonrpsee_types::error::{
    ErrorObject, ErrorObjectOwned, INTERNAL_ERROR_CODE, INTERNAL_ERROR_MSG, INVALID_PARAMS_CODE,
    INVALID_PARAMS_MSG,
};
use thiserror::Error;

use crate::chain::ChainError;
use crate::dispatch::MethodError;
use crate::store::StoreError;

pub const INSUFFICIENT_GAS_CODE: i32 = -32001;
pub const ACCOUNT_DISABLED_CODE: i32 = -32002;
pub const FREQUENT_REQUEST_CODE: i32 = -32003;

#[derive(Error, Debug)]
pub enum PaymasterError {
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("insufficient gas")]
    InsufficientGas,

    #[error("account disabled")]
    AccountDisabled,

    #[error("frequent requests")]
    FrequentRequest,

    #[error("account lookup failed: {0}")]
    AccountLookupFailed(StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Ethereum provider error: {0}")]
    Chain(#[from] ChainError),

    #[error("{0} timed out")]
    Timeout(&'static str),
}

impl PaymasterError {
    /// Business refusals the client is expected to branch on.
    pub fn is_refusal(&self) -> bool {
        matches!(
            self,
            Self::InsufficientGas | Self::AccountDisabled | Self::FrequentRequest
        )
    }

    /// Maps the error onto the JSON-RPC error object returned to the caller.
    ///
    /// Collaborator failures are reported without detail.
    pub fn into_rpc_error(self) -> ErrorObjectOwned {
        match self {
            Self::InvalidParams(reason) => {
                ErrorObject::owned(INVALID_PARAMS_CODE, INVALID_PARAMS_MSG, Some(reason))
            }
            Self::InsufficientGas => refusal(INSUFFICIENT_GAS_CODE, "insufficient gas"),
            Self::AccountDisabled => refusal(ACCOUNT_DISABLED_CODE, "account disabled"),
            Self::FrequentRequest => refusal(FREQUENT_REQUEST_CODE, "frequent requests"),
            Self::AccountLookupFailed(_) => ErrorObject::owned(
                INTERNAL_ERROR_CODE,
                "account lookup failed",
                None::<()>,
            ),
            Self::Store(_) | Self::Chain(_) | Self::Timeout(_) => {
                ErrorObject::owned(INTERNAL_ERROR_CODE, INTERNAL_ERROR_MSG, None::<()>)
            }
        }
    }
}

impl From<PaymasterError> for MethodError {
    fn from(err: PaymasterError) -> Self {
        MethodError::Domain(err.into_rpc_error())
    }
}

fn refusal(code: i32, message: &str) -> ErrorObjectOwned {
    ErrorObject::owned(code, message, Some(message))
}
