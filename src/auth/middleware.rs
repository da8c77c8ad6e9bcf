//! Authentication middleware.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::auth::AuthError;
use crate::http::server::AppState;

/// Run the filter chain and attach the resulting [`Authentication`] to the
/// request extensions.
///
/// [`Authentication`]: crate::auth::Authentication
pub async fn authentication_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let inner = state.inner.load_full();

    let outcome = inner.auth.authenticate(request.headers()).await;
    match outcome {
        Ok(Some(authentication)) => {
            request.extensions_mut().insert(authentication);
        }
        Ok(None) if inner.config.auth.allow_anonymous => {}
        Ok(None) => {
            return AuthError::Required {
                realm: inner.config.auth.realm.clone(),
            }
            .into_response();
        }
        Err(e) => return e.into_response(),
    }

    next.run(request).await
}
