use axum::{
    routing::{delete, get, patch, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Token lifecycle
    let auth_routes = Router::new()
        .route("/auth/login", post(handlers::login))
        .route("/auth/refresh", post(handlers::refresh))
        .route("/auth/logout", post(handlers::logout))
        .route("/auth/logout-all", post(handlers::logout_all))
        .route("/auth/me", get(handlers::me));

    // Administration -- role checks happen in the registry and store
    let admin_routes = Router::new()
        .route("/admin/sessions", get(handlers::list_sessions))
        .route("/admin/sessions/:id", delete(handlers::revoke_session))
        .route(
            "/admin/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/admin/users/:id/sessions",
            delete(handlers::revoke_user_sessions),
        )
        .route(
            "/admin/users/:id/deactivate",
            patch(handlers::deactivate_user),
        )
        .route("/admin/reset-password", post(handlers::reset_password))
        .route("/admin/audit-logs", get(handlers::audit_logs))
        .route("/admin/audit-logs/verify", get(handlers::verify_audit_chain));

    let internal_routes = Router::new().route("/_internal/health", get(handlers::health));

    Router::new()
        .merge(auth_routes)
        .merge(admin_routes)
        .merge(internal_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
