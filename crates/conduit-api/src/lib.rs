//! conduit-api: admin REST API for Conduit.
//!
//! Provides axum route handlers for managing connectors. Every workload
//! kind gets the same route set, nested under `/admin/v3/{kind}s`.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/{tenant}/{namespace}/{name}` | Register a connector |
//! | PUT | `/{tenant}/{namespace}/{name}` | Update a connector |
//! | DELETE | `/{tenant}/{namespace}/{name}` | Deregister a connector |
//! | GET | `/{tenant}/{namespace}/{name}` | Get connector info |
//! | GET | `/{tenant}/{namespace}/{name}/status` | Aggregate instance status |
//! | GET | `/{tenant}/{namespace}/{name}/{instance_id}/status` | One instance's status |
//! | POST | `/{tenant}/{namespace}/{name}/restart` | Restart all instances |
//! | POST | `/{tenant}/{namespace}/{name}/{instance_id}/restart` | Restart one instance |
//! | POST | `/{tenant}/{namespace}/{name}/stop` | Stop all instances |
//! | POST | `/{tenant}/{namespace}/{name}/{instance_id}/stop` | Stop one instance |
//! | GET | `/{tenant}/{namespace}` | List connector names |
//! | GET | `/builtins` | List builtin connectors for the kind |
//! | GET | `/builtin{kind}s` | Same list, e.g. `/admin/v3/sources/builtinsources` |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use conduit_lifecycle::LifecycleManager;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<LifecycleManager>,
}

/// Routes for one workload kind, relative to its `/admin/v3/{kind}s` prefix.
pub fn kind_router(manager: Arc<LifecycleManager>) -> Router {
    let legacy_builtins = format!("/builtin{}", manager.kind().plural());
    let state = ApiState { manager };

    Router::new()
        .route("/builtins", get(handlers::list_builtins))
        .route(&legacy_builtins, get(handlers::list_builtins))
        .route("/{tenant}/{namespace}", get(handlers::list_connectors))
        .route(
            "/{tenant}/{namespace}/{name}",
            get(handlers::get_info)
                .post(handlers::register)
                .put(handlers::update)
                .delete(handlers::deregister),
        )
        .route("/{tenant}/{namespace}/{name}/status", get(handlers::get_status))
        .route("/{tenant}/{namespace}/{name}/restart", post(handlers::restart_all))
        .route("/{tenant}/{namespace}/{name}/stop", post(handlers::stop_all))
        .route(
            "/{tenant}/{namespace}/{name}/{instance_id}/status",
            get(handlers::get_instance_status),
        )
        .route(
            "/{tenant}/{namespace}/{name}/{instance_id}/restart",
            post(handlers::restart_instance),
        )
        .route(
            "/{tenant}/{namespace}/{name}/{instance_id}/stop",
            post(handlers::stop_instance),
        )
        .with_state(state)
}

/// Build the complete admin router, one nested route set per manager.
pub fn build_router(managers: Vec<Arc<LifecycleManager>>) -> Router {
    managers.into_iter().fold(Router::new(), |router, manager| {
        let prefix = format!("/admin/v3/{}", manager.kind().plural());
        router.nest(&prefix, kind_router(manager))
    })
}
