// src/dispatch.rs
// Name-based JSON-RPC dispatch.
//
// Operations are registered with a declared parameter list. Incoming
// positional parameters are coerced into those shapes before the handler
// runs, and handler outcomes are mapped back onto the JSON-RPC envelope.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use jsonrpsee_types::error::{
    ErrorObject, ErrorObjectOwned, INTERNAL_ERROR_CODE, INTERNAL_ERROR_MSG, INVALID_PARAMS_CODE,
    INVALID_PARAMS_MSG, INVALID_REQUEST_CODE, INVALID_REQUEST_MSG, METHOD_NOT_FOUND_CODE,
    METHOD_NOT_FOUND_MSG, PARSE_ERROR_CODE, PARSE_ERROR_MSG,
};
use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use tracing::{debug, error};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type Handler<S> = Arc<dyn Fn(Arc<S>, Params) -> BoxFuture<Result<Value, MethodError>> + Send + Sync>;

/// Declared shape of one positional parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    /// Integer of the given bit width. Only 8, 16, 32 and 64 are coercible.
    Int { bits: u8, signed: bool },
    Float,
    String,
    /// Any JSON value, passed through untouched.
    Any,
    Sequence,
    Mapping,
}

impl ParamShape {
    pub const U64: ParamShape = ParamShape::Int { bits: 64, signed: false };

    fn is_coercible(&self) -> bool {
        match self {
            Self::Int { bits, .. } => matches!(bits, 8 | 16 | 32 | 64),
            _ => true,
        }
    }
}

impl fmt::Display for ParamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int { bits, signed: true } => write!(f, "int{bits}"),
            Self::Int { bits, signed: false } => write!(f, "uint{bits}"),
            Self::Float => f.write_str("float64"),
            Self::String => f.write_str("string"),
            Self::Any => f.write_str("interface"),
            Self::Sequence => f.write_str("array"),
            Self::Mapping => f.write_str("map"),
        }
    }
}

/// A parameter after coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Str(String),
    Any(Value),
    Seq(Vec<Value>),
    Map(Map<String, Value>),
}

/// Converts a wire value into `shape`.
///
/// Integers are accepted only when the wire number is integral and fits the
/// declared width.
pub fn coerce(index: usize, value: Value, shape: ParamShape) -> Result<Arg, ErrorObjectOwned> {
    let arg = match (shape, value) {
        (ParamShape::Int { bits, signed }, Value::Number(n)) => coerce_int(&n, bits, signed),
        (ParamShape::Float, Value::Number(n)) => n.as_f64().map(Arg::Float),
        (ParamShape::String, Value::String(s)) => Some(Arg::Str(s)),
        (ParamShape::Any, value) => Some(Arg::Any(value)),
        (ParamShape::Sequence, Value::Array(items)) => Some(Arg::Seq(items)),
        (ParamShape::Mapping, Value::Object(map)) => Some(Arg::Map(map)),
        _ => None,
    };

    arg.ok_or_else(|| {
        invalid_params(format!("Param [{index}] can't be converted to {shape}"))
    })
}

fn coerce_int(n: &Number, bits: u8, signed: bool) -> Option<Arg> {
    let value: i128 = if let Some(i) = n.as_i64() {
        i128::from(i)
    } else if let Some(u) = n.as_u64() {
        i128::from(u)
    } else {
        let f = n.as_f64()?;
        // 2^64 bounds every supported width.
        if !f.is_finite() || f.fract() != 0.0 || f.abs() >= 18_446_744_073_709_551_616.0 {
            return None;
        }
        f as i128
    };

    if signed {
        let max = (1i128 << (bits - 1)) - 1;
        let min = -(1i128 << (bits - 1));
        (min..=max).contains(&value).then(|| Arg::Signed(value as i64))
    } else {
        let max = (1i128 << bits) - 1;
        (0..=max).contains(&value).then(|| Arg::Unsigned(value as u64))
    }
}

/// Coerced parameters handed to a handler.
#[derive(Debug, Default)]
pub struct Params {
    args: Vec<Option<Arg>>,
}

impl Params {
    pub fn new(args: Vec<Arg>) -> Self {
        Self {
            args: args.into_iter().map(Some).collect(),
        }
    }

    /// Takes the parameter at `index`. Missing parameters are an invalid-params error.
    pub fn take(&mut self, index: usize) -> Result<Arg, MethodError> {
        self.args
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| MethodError::Domain(invalid_params(format!("Missing param [{index}]"))))
    }

    pub fn string(&mut self, index: usize) -> Result<String, MethodError> {
        match self.take(index)? {
            Arg::Str(s) => Ok(s),
            other => Err(shape_mismatch(index, &other)),
        }
    }

    pub fn map(&mut self, index: usize) -> Result<Map<String, Value>, MethodError> {
        match self.take(index)? {
            Arg::Map(map) => Ok(map),
            other => Err(shape_mismatch(index, &other)),
        }
    }

    pub fn unsigned(&mut self, index: usize) -> Result<u64, MethodError> {
        match self.take(index)? {
            Arg::Unsigned(v) => Ok(v),
            other => Err(shape_mismatch(index, &other)),
        }
    }
}

// A handler reading a shape other than the one it declared.
fn shape_mismatch(index: usize, arg: &Arg) -> MethodError {
    error!("Handler read param [{}] with the wrong shape: {:?}", index, arg);
    MethodError::Domain(internal_error("Invalid method definition"))
}

/// Outcome of a failed handler.
#[derive(Debug)]
pub enum MethodError {
    /// An error with its own code, message and data, forwarded verbatim.
    Domain(ErrorObjectOwned),
    /// Anything else. Reported with its message as both message and data.
    Failure(String),
}

impl MethodError {
    pub fn into_error_object(self) -> ErrorObjectOwned {
        match self {
            Self::Domain(err) => err,
            Self::Failure(message) => {
                ErrorObject::owned(METHOD_NOT_FOUND_CODE, message.clone(), Some(message))
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum RegisterError {
    #[error("method {0} is already registered")]
    AlreadyRegistered(String),
}

struct Method<S> {
    params: Vec<ParamShape>,
    handler: Handler<S>,
}

/// Routes JSON-RPC calls to the operations registered for a service.
pub struct Dispatcher<S> {
    service: Arc<S>,
    methods: HashMap<String, Method<S>>,
}

impl<S: Send + Sync + 'static> Dispatcher<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            methods: HashMap::new(),
        }
    }

    /// Registers `name` (matched case-insensitively) with its parameter shapes.
    pub fn register<F, Fut, R>(
        &mut self,
        name: &str,
        params: &[ParamShape],
        handler: F,
    ) -> Result<(), RegisterError>
    where
        F: Fn(Arc<S>, Params) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let key = name.to_ascii_lowercase();
        if self.methods.contains_key(&key) {
            return Err(RegisterError::AlreadyRegistered(name.to_string()));
        }

        let handler: Handler<S> =
            Arc::new(move |service, params| -> BoxFuture<Result<Value, MethodError>> {
                let fut = handler(service, params);
                Box::pin(async move {
                    let result = fut.await?;
                    serde_json::to_value(result).map_err(|e| MethodError::Failure(e.to_string()))
                })
            });

        self.methods.insert(
            key,
            Method {
                params: params.to_vec(),
                handler,
            },
        );
        Ok(())
    }

    /// Resolves `method`, coerces `params` and invokes the handler.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ErrorObjectOwned> {
        let Some(registered) = self.methods.get(&method.to_ascii_lowercase()) else {
            return Err(ErrorObject::owned(
                METHOD_NOT_FOUND_CODE,
                METHOD_NOT_FOUND_MSG,
                Some(METHOD_NOT_FOUND_MSG),
            ));
        };

        if let Some(shape) = registered.params.iter().find(|shape| !shape.is_coercible()) {
            error!("Method {} declares a parameter of unsupported shape {}", method, shape);
            return Err(internal_error("Invalid method definition"));
        }

        if params.len() > registered.params.len() {
            debug!(
                "Ignoring {} extra params for {}",
                params.len() - registered.params.len(),
                method
            );
        }

        let args = params
            .into_iter()
            .zip(registered.params.iter())
            .enumerate()
            .map(|(index, (value, shape))| coerce(index, value, *shape))
            .collect::<Result<Vec<_>, _>>()?;

        (registered.handler)(self.service.clone(), Params::new(args))
            .await
            .map_err(MethodError::into_error_object)
    }

    /// Processes one raw JSON-RPC request body into a response.
    pub async fn handle(&self, body: &[u8]) -> Response {
        let request: Map<String, Value> = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(_) => {
                return Response::error(
                    Value::Null,
                    ErrorObject::owned(
                        PARSE_ERROR_CODE,
                        PARSE_ERROR_MSG,
                        Some("Error parsing json request"),
                    ),
                )
            }
        };

        let id = match request.get("id") {
            Some(id @ Value::Number(_)) => id.clone(),
            _ => {
                return Response::error(
                    Value::Null,
                    invalid_request("No or invalid 'id' in request"),
                )
            }
        };

        if request.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Response::error(id, invalid_request("Version of jsonrpc is not 2.0"));
        }

        let Some(method) = request.get("method").and_then(Value::as_str) else {
            return Response::error(id, invalid_request("No or invalid 'method' in request"));
        };

        let Some(params) = request.get("params").and_then(Value::as_array) else {
            return Response::error(id, invalid_params("No or invalid 'params' in request"));
        };

        debug!("Dispatching {} with {} params", method, params.len());
        match self.call(method, params.clone()).await {
            Ok(result) => Response::result(id, result),
            Err(err) => Response::error(id, err),
        }
    }
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Serialize)]
pub struct Response {
    jsonrpc: &'static str,
    #[serde(flatten)]
    pub payload: Payload,
    pub id: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Payload {
    Result(Value),
    Error(ErrorObjectOwned),
}

impl Response {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            payload: Payload::Result(result),
            id,
        }
    }

    pub fn error(id: Value, error: ErrorObjectOwned) -> Self {
        Self {
            jsonrpc: "2.0",
            payload: Payload::Error(error),
            id,
        }
    }
}

pub fn invalid_params(data: impl Into<String>) -> ErrorObjectOwned {
    ErrorObject::owned(INVALID_PARAMS_CODE, INVALID_PARAMS_MSG, Some(data.into()))
}

fn invalid_request(data: &str) -> ErrorObjectOwned {
    ErrorObject::owned(INVALID_REQUEST_CODE, INVALID_REQUEST_MSG, Some(data))
}

fn internal_error(data: &str) -> ErrorObjectOwned {
    ErrorObject::owned(INTERNAL_ERROR_CODE, INTERNAL_ERROR_MSG, Some(data))
}
