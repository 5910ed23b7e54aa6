//! Route Gate
//!
//! Decides whether a screen renders, redirects or waits for the auth state.

use serde::Serialize;

use crate::auth::AuthState;

/// Screens of the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Home,
    CarDetail(String),
    Login,
    Register,
    Dashboard,
    NewListing,
}

/// Who may see a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAccess {
    Public,
    /// Only while signed out
    PublicOnly,
    /// Only while signed in
    Protected,
}

impl Route {
    /// Resolve a path; unknown paths fall back to `Home`
    pub fn parse(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        match segments.as_slice() {
            ["car", id] => Route::CarDetail((*id).to_string()),
            ["login"] => Route::Login,
            ["register"] => Route::Register,
            ["dashboard"] => Route::Dashboard,
            ["dashboard", "new"] => Route::NewListing,
            _ => Route::Home,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Route::Home => "/".into(),
            Route::CarDetail(id) => format!("/car/{id}"),
            Route::Login => "/login".into(),
            Route::Register => "/register".into(),
            Route::Dashboard => "/dashboard".into(),
            Route::NewListing => "/dashboard/new".into(),
        }
    }

    pub fn access(&self) -> RouteAccess {
        match self {
            Route::Home | Route::CarDetail(_) => RouteAccess::Public,
            Route::Login | Route::Register => RouteAccess::PublicOnly,
            Route::Dashboard | Route::NewListing => RouteAccess::Protected,
        }
    }
}

/// What the shell should do with a navigation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "camelCase")]
pub enum GateDecision {
    Render,
    Redirect { to: String },
    /// Auth state not known yet; show a placeholder
    Defer,
}

/// Gate `route` on the current auth state
pub fn decide(state: &AuthState, route: &Route) -> GateDecision {
    if state.is_loading() {
        return GateDecision::Defer;
    }

    match (route.access(), state.is_signed_in()) {
        (RouteAccess::Protected, false) => GateDecision::Redirect {
            to: Route::Login.path(),
        },
        (RouteAccess::PublicOnly, true) => GateDecision::Redirect {
            to: Route::Dashboard.path(),
        },
        _ => GateDecision::Render,
    }
}
