//! # Binding Module
//!
//! Binds a request's `cb_kwargs` against a callback's declared parameters.
//!
//! ## Overview
//!
//! Every callback is registered with a [`Signature`]: its name, the keyword
//! parameters it declares (each either required or carrying a default), and
//! whether it accepts arbitrary extra keywords. The response is always the
//! leading positional argument and is never bound from the bag.
//!
//! Binding happens at dispatch time, not when the request is built, so a
//! bag may be incomplete or carry extra keys right up to the moment its
//! callback runs.
//!
//! ## Example
//!
//! ```rust
//! use spider_flow::binding::Signature;
//! use spider_flow::request::CbKwargs;
//!
//! let signature = Signature::new("parse_default")
//!     .required("key")
//!     .optional("number", serde_json::Value::Null)
//!     .optional("default", 99);
//!
//! let args = signature
//!     .bind(CbKwargs::new().with("key", "value").with("number", 123))
//!     .unwrap();
//! assert_eq!(args.get_as::<i64>("default").unwrap(), 99);
//! ```

use crate::error::{BindingError, SpiderError};
use crate::request::CbKwargs;
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// The name of the leading positional parameter every callback receives.
pub const RESPONSE_PARAM: &str = "response";

/// A declared keyword parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Value>,
}

impl Parameter {
    pub fn is_required(&self) -> bool {
        self.default.is_none()
    }
}

/// The declared parameters of a callback, built once at registration time.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    name: String,
    params: Vec<Parameter>,
    var_keyword: bool,
}

impl Signature {
    /// A signature taking only the response.
    pub fn new(name: impl Into<String>) -> Self {
        Signature {
            name: name.into(),
            params: Vec::new(),
            var_keyword: false,
        }
    }

    /// Declares a parameter without a default.
    pub fn required(self, name: impl Into<String>) -> Self {
        self.param(name.into(), None)
    }

    /// Declares a parameter with a default.
    pub fn optional(self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.param(name.into(), Some(default.into()))
    }

    /// Accepts arbitrary extra keyword arguments.
    pub fn var_keyword(mut self) -> Self {
        self.var_keyword = true;
        self
    }

    fn param(mut self, name: String, default: Option<Value>) -> Self {
        // redeclaring a name replaces it in place
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.default = default,
            None => self.params.push(Parameter { name, default }),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    pub fn accepts_var_keyword(&self) -> bool {
        self.var_keyword
    }

    fn declares(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name)
    }

    /// Binds `cb_kwargs` against this signature.
    ///
    /// Keys are checked in the bag's insertion order and the first one the
    /// callback cannot take is reported. Missing required parameters are only
    /// reported once every key has been accepted.
    pub fn bind(&self, cb_kwargs: CbKwargs) -> Result<BoundArgs, BindingError> {
        let mut named = IndexMap::with_capacity(self.params.len());
        let mut extra = CbKwargs::new();

        for (key, value) in cb_kwargs {
            if key == RESPONSE_PARAM {
                return Err(BindingError::MultipleValues {
                    callback: self.name.clone(),
                    name: key,
                });
            }
            if self.declares(&key) {
                named.insert(key, value);
            } else if self.var_keyword {
                extra.insert(key, value);
            } else {
                return Err(BindingError::UnexpectedArgument {
                    callback: self.name.clone(),
                    key,
                });
            }
        }

        let missing: Vec<String> = self
            .params
            .iter()
            .filter(|p| p.is_required() && !named.contains_key(&p.name))
            .map(|p| p.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(BindingError::MissingArgument {
                callback: self.name.clone(),
                missing,
            });
        }

        // declaration order, defaults filled in
        let mut ordered = IndexMap::with_capacity(self.params.len());
        for param in &self.params {
            let value = match named.shift_remove(&param.name) {
                Some(v) => v,
                None => param.default.clone().unwrap_or(Value::Null),
            };
            ordered.insert(param.name.clone(), value);
        }

        Ok(BoundArgs {
            callback: self.name.clone(),
            named: ordered,
            kwargs: extra,
        })
    }
}

/// Arguments ready to be handed to a callback.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundArgs {
    callback: String,
    named: IndexMap<String, Value>,
    kwargs: CbKwargs,
}

impl BoundArgs {
    pub fn callback(&self) -> &str {
        &self.callback
    }

    /// A declared parameter's bound value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// A declared parameter's bound value, deserialized.
    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, SpiderError> {
        let value = self.named.get(name).ok_or_else(|| {
            SpiderError::callback(
                &self.callback,
                format!("no parameter named '{}' is declared", name),
            )
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }

    /// Declared parameters in declaration order.
    pub fn named(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.named.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Extra keywords collected by a var-keyword callback; empty otherwise.
    pub fn kwargs(&self) -> &CbKwargs {
        &self.kwargs
    }

    pub fn into_kwargs(self) -> CbKwargs {
        self.kwargs
    }
}
