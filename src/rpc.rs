// src/rpc.rs
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::{Dispatcher, MethodError, ParamShape, RegisterError};
use crate::error::PaymasterError;
use crate::paymaster::Paymaster;

/// Builds the dispatcher serving the `pm_*` namespace.
pub fn paymaster_dispatcher(paymaster: Arc<Paymaster>) -> Result<Dispatcher<Paymaster>, RegisterError> {
    let mut module = Dispatcher::new(paymaster);
    register_methods(&mut module)?;
    Ok(module)
}

pub fn register_methods(module: &mut Dispatcher<Paymaster>) -> Result<(), RegisterError> {
    module.register(
        "pm_sponsorUserOperation",
        &[ParamShape::Mapping, ParamShape::String],
        |paymaster, mut params| async move {
            let user_op = params.map(0)?;
            let entry_point = params.string(1)?;
            debug!("Received sponsor request for sender: {:?}", user_op.get("sender"));

            match paymaster.sponsor_user_operation(user_op, &entry_point).await {
                Ok(response) => Ok(response),
                Err(e) => Err(log_refusal("pm_sponsorUserOperation", e)),
            }
        },
    )?;

    module.register(
        "pm_gasRemain",
        &[ParamShape::String],
        |paymaster, mut params| async move {
            let address = params.string(0)?;
            paymaster
                .gas_remain(&address)
                .await
                .map_err(|e| log_refusal("pm_gasRemain", e))
        },
    )?;

    module.register("pm_config", &[], |paymaster, _| async move {
        Ok::<_, MethodError>(paymaster.tier_config())
    })?;

    module.register(
        "pm_requestGas",
        &[ParamShape::String],
        |paymaster, mut params| async move {
            let address = params.string(0)?;
            match paymaster.request_gas(&address).await {
                Ok(granted) => {
                    info!("Allowance granted for {}", address);
                    Ok(granted)
                }
                Err(e) => Err(log_refusal("pm_requestGas", e)),
            }
        },
    )?;

    Ok(())
}

fn log_refusal(method: &str, err: PaymasterError) -> MethodError {
    if err.is_refusal() {
        info!("{} refused: {}", method, err);
    } else {
        warn!("{} failed: {}", method, err);
    }
    err.into()
}
