//! The compute node's REST surface.
//!
//! Every route acts on the ship named by `token`. Angles cross this
//! boundary in degrees and are converted to radians on the way in (and
//! back on the way out for `getShipInfo`).

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use starweave_api::{ApiRequest, ApiResponse, ParamDef, ParamKind, RouteDef, RouteTable};
use starweave_bus::messages::ScanShoot;
use starweave_spatial::geom::{deg2rad, rad2deg, scan_shoot_radius};

use crate::game::GameNode;

const TOKEN: ParamDef = ParamDef::required("token", ParamKind::Str);

/// Shared validation for the cone-shaped requests.
fn check_cone_params(width: f64, energy: i64) -> Option<ApiResponse> {
    if width <= 0.0 || width >= 90.0 {
        return Some(ApiResponse::error(500, "Width not in interval (0,90) degrees"));
    }
    if energy <= 0 {
        return Some(ApiResponse::error(500, "Energy spent must be positive"));
    }
    None
}

fn accelerate<'a>(node: &'a mut GameNode, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let token = req.str_param("token").unwrap_or_default();
        let x = req.f64_param("x").unwrap_or_default();
        let y = req.f64_param("y").unwrap_or_default();
        match node.live_ship_mut(token) {
            Ok(ship) => {
                ship.accelerate(x, y);
                ApiResponse::empty()
            }
            Err(e) => ApiResponse::error(500, e.to_string()),
        }
    })
}

fn get_ship_info<'a>(node: &'a mut GameNode, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let token = req.str_param("token").unwrap_or_default();
        match node.live_ship_mut(token) {
            Ok(ship) => {
                let mut body = Map::new();
                body.insert("id".into(), json!(ship.ship.public_id()));
                body.insert("area".into(), json!(ship.ship.area));
                body.insert("energy".into(), json!(ship.ship.energy));
                body.insert("posX".into(), json!(ship.ship.pos.x));
                body.insert("posY".into(), json!(ship.ship.pos.y));
                body.insert("velX".into(), json!(ship.velocity.x));
                body.insert("velY".into(), json!(ship.velocity.y));
                body.insert("shieldDir".into(), json!(rad2deg(ship.ship.shield_dir)));
                body.insert("shieldWidth".into(), json!(rad2deg(ship.ship.shield_width)));
                ApiResponse::ok(body)
            }
            Err(e) => ApiResponse::error(500, e.to_string()),
        }
    })
}

fn scan<'a>(node: &'a mut GameNode, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let direction = req.f64_param("direction").unwrap_or_default();
        let width = req.f64_param("width").unwrap_or_default();
        let energy = req.i64_param("energy").unwrap_or_default();
        if let Some(rejection) = check_cone_params(width, energy) {
            return rejection;
        }
        let token = req.str_param("token").unwrap_or_default().to_string();

        let msg = {
            let ship = match node.live_ship_mut(&token) {
                Ok(ship) => ship,
                Err(e) => return ApiResponse::error(500, e.to_string()),
            };
            let spent = (energy as f64).min(ship.ship.energy.floor());
            ship.ship.energy -= spent;
            let width = deg2rad(width);
            ScanShoot {
                originator: token,
                origin: ship.ship.pos,
                direction: deg2rad(direction),
                width,
                radius: scan_shoot_radius(width, spent),
                scaled_energy: 0.0,
            }
        };

        let results = node.scan_shoot(msg).await;
        let scanned: Vec<Value> = results
            .struck
            .iter()
            .map(|s| {
                json!({
                    "id": s.ship.public_id(),
                    "area": s.ship.area,
                    "posX": s.ship.pos.x,
                    "posY": s.ship.pos.y,
                })
            })
            .collect();
        let mut body = Map::new();
        body.insert("scanned".into(), Value::Array(scanned));
        ApiResponse::ok(body)
    })
}

fn shoot<'a>(node: &'a mut GameNode, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let direction = req.f64_param("direction").unwrap_or_default();
        let width = req.f64_param("width").unwrap_or_default();
        let energy = req.i64_param("energy").unwrap_or_default();
        let scaling = req.f64_param("damage").unwrap_or_default();
        if let Some(rejection) = check_cone_params(width, energy) {
            return rejection;
        }
        if scaling <= 0.0 {
            return ApiResponse::error(500, "Damage scaling must be positive");
        }
        let token = req.str_param("token").unwrap_or_default().to_string();

        let msg = {
            let ship = match node.live_ship_mut(&token) {
                Ok(ship) => ship,
                Err(e) => return ApiResponse::error(500, e.to_string()),
            };
            // Whole shots only: each unit of energy costs `scaling`.
            let spent = (energy as f64)
                .min((ship.ship.energy / scaling).floor())
                .max(0.0);
            ship.ship.energy -= spent * scaling;
            let width = deg2rad(width);
            ScanShoot {
                originator: token.clone(),
                origin: ship.ship.pos,
                direction: deg2rad(direction),
                width,
                radius: scan_shoot_radius(width, spent),
                scaled_energy: spent * scaling,
            }
        };

        let results = node.scan_shoot(msg).await;

        // Credit fatal hits and mark the combat action.
        let now = node.now_ms();
        if let Ok(ship) = node.live_ship_mut(&token) {
            ship.ship.area += results.area_gain;
            ship.note_combat(now);
        }

        let struck: Vec<Value> = results
            .struck
            .iter()
            .map(|s| {
                // For fatal hits the snapshot is zeroed; adding the gain
                // back reports what the shot was worth.
                json!({
                    "id": s.ship.public_id(),
                    "area": s.ship.area + s.area_gain.abs(),
                    "posX": s.ship.pos.x,
                    "posY": s.ship.pos.y,
                })
            })
            .collect();
        let mut body = Map::new();
        body.insert("struck".into(), Value::Array(struck));
        ApiResponse::ok(body)
    })
}

fn shield<'a>(node: &'a mut GameNode, req: ApiRequest) -> BoxFuture<'a, ApiResponse> {
    Box::pin(async move {
        let direction = req.f64_param("direction").unwrap_or_default();
        let width = req.f64_param("width").unwrap_or_default();
        if !(0.0..=180.0).contains(&width) {
            return ApiResponse::error(500, "Invalid angle passed (range: [0..180])");
        }
        let token = req.str_param("token").unwrap_or_default();
        match node.live_ship_mut(token) {
            Ok(ship) => {
                ship.ship.set_shield_dir(deg2rad(direction));
                ship.ship.shield_width = deg2rad(width);
                ApiResponse::empty()
            }
            Err(e) => ApiResponse::error(500, e.to_string()),
        }
    })
}

static ROUTES: &[RouteDef<GameNode>] = &[
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
        params: &[
            TOKEN,
            ParamDef::required("direction", ParamKind::Float),
            ParamDef::required("width", ParamKind::Float),
            ParamDef::required("energy", ParamKind::Int),
        ],
        handler: scan,
    },
    RouteDef {
        name: "shoot",
        params: &[
            TOKEN,
            ParamDef::required("direction", ParamKind::Float),
            ParamDef::required("width", ParamKind::Float),
            ParamDef::required("energy", ParamKind::Int),
            ParamDef::required("damage", ParamKind::Float),
        ],
        handler: shoot,
    },
    RouteDef {
        name: "shield",
        params: &[
            TOKEN,
            ParamDef::required("direction", ParamKind::Float),
            ParamDef::required("width", ParamKind::Float),
        ],
        handler: shield,
    },
];

pub static TABLE: RouteTable<GameNode> = RouteTable::new(ROUTES);
