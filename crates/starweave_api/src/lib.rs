//! # Starweave API
//!
//! The REST facade shared by the arbiter and the compute nodes, kept
//! transport-agnostic: an HTTP front end (owned by the embedding process)
//! turns requests into [`ApiRequest`] values and renders [`ApiResponse`]
//! values back out.
//!
//! Routes are registered statically in a [`RouteTable`]: each entry names
//! the route, declares its parameter schema, and points at a handler
//! function. Parameters are validated (presence and JSON type) before the
//! handler runs; a failed validation rejects the whole request with an
//! error body and no side effects.

use futures::future::BoxFuture;
use serde_json::{Map, Value};

/// A parsed request body.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub json: Value,
}

impl ApiRequest {
    pub fn new(json: Value) -> Self {
        Self { json }
    }

    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.json.get(name)?.as_str()
    }

    pub fn f64_param(&self, name: &str) -> Option<f64> {
        self.json.get(name)?.as_f64()
    }

    pub fn i64_param(&self, name: &str) -> Option<i64> {
        self.json.get(name)?.as_i64()
    }

    pub fn bool_param(&self, name: &str) -> Option<bool> {
        self.json.get(name)?.as_bool()
    }
}

/// A response value, rendered by the transport layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Map<String, Value>,
    /// When set, the transport should redirect the caller instead of
    /// rendering `body` (token-routed forwarding on the arbiter).
    pub redirect: Option<String>,
}

impl ApiResponse {
    pub fn ok(body: Map<String, Value>) -> Self {
        Self {
            status: 200,
            body,
            redirect: None,
        }
    }

    pub fn empty() -> Self {
        Self::ok(Map::new())
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        let mut body = Map::new();
        body.insert("error".into(), Value::String(message.into()));
        Self {
            status,
            body,
            redirect: None,
        }
    }

    pub fn redirect(url: impl Into<String>) -> Self {
        Self {
            status: 307,
            body: Map::new(),
            redirect: Some(url.into()),
        }
    }
}

/// Expected JSON type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Str,
    Float,
    Int,
    Bool,
}

impl ParamKind {
    fn matches(self, v: &Value) -> bool {
        match self {
            ParamKind::Str => v.is_string(),
            ParamKind::Float => v.is_number(),
            ParamKind::Int => v.is_i64() || v.is_u64(),
            ParamKind::Bool => v.is_boolean(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            ParamKind::Str => "string",
            ParamKind::Float => "number",
            ParamKind::Int => "integer",
            ParamKind::Bool => "boolean",
        }
    }
}

/// One declared parameter of a route.
#[derive(Debug, Clone, Copy)]
pub struct ParamDef {
    pub name: &'static str,
    pub kind: ParamKind,
    pub optional: bool,
}

impl ParamDef {
    pub const fn required(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            optional: false,
        }
    }

    pub const fn optional(name: &'static str, kind: ParamKind) -> Self {
        Self {
            name,
            kind,
            optional: true,
        }
    }
}

/// Validates a request body against a parameter schema.
pub fn check_params(defs: &[ParamDef], json: &Value) -> Result<(), String> {
    for def in defs {
        match json.get(def.name) {
            None | Some(Value::Null) => {
                if !def.optional {
                    return Err(format!("missing required parameter '{}'", def.name));
                }
            }
            Some(v) => {
                if !def.kind.matches(v) {
                    return Err(format!(
                        "parameter '{}' must be a {}",
                        def.name,
                        def.kind.name()
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Handler signature: borrows the service state for the duration of the
/// request.
pub type Handler<S> = for<'a> fn(&'a mut S, ApiRequest) -> BoxFuture<'a, ApiResponse>;

/// One statically registered route.
pub struct RouteDef<S> {
    pub name: &'static str,
    pub params: &'static [ParamDef],
    pub handler: Handler<S>,
}

/// The route table of a service.
pub struct RouteTable<S: 'static> {
    routes: &'static [RouteDef<S>],
}

impl<S> RouteTable<S> {
    pub const fn new(routes: &'static [RouteDef<S>]) -> Self {
        Self { routes }
    }

    pub fn route_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.iter().map(|r| r.name)
    }

    /// Looks up the route, validates parameters, then invokes the handler.
    pub async fn dispatch(&self, state: &mut S, route: &str, json: Value) -> ApiResponse {
        let Some(def) = self.routes.iter().find(|r| r.name == route) else {
            return ApiResponse::error(404, format!("unknown route '{route}'"));
        };
        if let Err(reason) = check_params(def.params, &json) {
            return ApiResponse::error(500, reason);
        }
        (def.handler)(state, ApiRequest::new(json)).await
    }
}
