//! The arbiter's REST surface.
//!
//! `connect` and `disconnect` are handled here; everything that acts on a
//! live ship is forwarded to the owning compute node as a redirect, looked
//! up by token. Unknown tokens reject the whole request with a 500 body.

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use starweave_api::{ApiRequest, ApiResponse, ParamDef, ParamKind, RouteDef, RouteTable};

use crate::arbiter::Arbiter;

const TOKEN: ParamDef = ParamDef::required("token", ParamKind::Str);

fn connect<'a>(arb: &'a mut Arbiter, _req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        match arb.connect_ship().await {
            Ok(token) => {
                let mut body = Map::new();
                body.insert("token".into(), Value::String(token));
                ApiResponse::ok(body)
            }
            Err(e) => ApiResponse::error(500, e.to_string()),
        }
    })
}

fn disconnect<'a>(arb: &'a mut Arbiter, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let token = req.str_param("token").unwrap_or_default().to_string();
        match arb.disconnect_ship(&token).await {
            Ok(()) => ApiResponse::empty(),
            Err(e) => ApiResponse::error(500, e.to_string()),
        }
    })
}

fn forward(arb: &mut Arbiter, req: &ApiRequest, route: &'static str) -> ApiResponse {
    let token = req.str_param("token").unwrap_or_default();
    match arb.forward_url(token, route) {
        Ok(url) => ApiResponse::redirect(url),
        Err(e) => ApiResponse::error(500, e.to_string()),
    }
}

macro_rules! forwarded {
    ($name:ident) => {
        fn $name<'a>(arb: &'a mut Arbiter, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
            Box::pin(async move { forward(arb, &req, stringify!($name)) })
        }
    };
}

forwarded!(accelerate);
forwarded!(scan);
forwarded!(shoot);
forwarded!(shield);

fn get_ship_info<'a>(arb: &'a mut Arbiter, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move { forward(arb, &req, "getShipInfo") })
}

static ROUTES: &[RouteDef<Arbiter>] = &[
    RouteDef {
        name: "connect",
        params: &[],
        handler: connect,
    },
    RouteDef {
        name: "disconnect",
        params: &[TOKEN],
        handler: disconnect,
    },
    RouteDef {
        name: "accelerate",
        params: &[
            TOKEN,
            ParamDef::required("x", ParamKind::Float),
            ParamDef::required("y", ParamKind::Float),
        ],
        handler: accelerate,
    },
    RouteDef {
        name: "getShipInfo",
        params: &[TOKEN],
        handler: get_ship_info,
    },
    RouteDef {
        name: "scan",
        params: &[TOKEN],
        handler: scan,
    },
    RouteDef {
        name: "shoot",
        params: &[TOKEN],
        handler: shoot,
    },
    RouteDef {
        name: "shield",
        params: &[TOKEN],
        handler: shield,
    },
];

pub static TABLE: RouteTable<Arbiter> = RouteTable::new(ROUTES);
