//! Flow control middleware.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;

use crate::flow::keys::{self, RequestContext, UserKey};
use crate::flow::ows::OwsRequest;
use crate::http::server::AppState;

/// Admit OWS requests through the flow gate.
///
/// The admission travels with the response body and is released when the
/// body is fully sent or dropped.
pub async fn flow_control_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let inner = state.inner.load_full();
    let (parts, body) = request.into_parts();

    let ows = OwsRequest::from_parts(&parts);
    if !ows.is_ows() || inner.flow.is_empty() {
        return next.run(Request::from_parts(parts, body)).await;
    }

    let config = &inner.config.flow;
    let user_key = keys::user_key(&parts, &config.user_cookie);
    let ctx = RequestContext::new(ows, keys::client_ip(&parts), user_key.value())
        .with_priority(keys::priority(&parts.headers, config.priority.as_ref()));
    let request = Request::from_parts(parts, body);

    let admission = match inner.flow.admit(&ctx).await {
        Ok(admission) => admission,
        Err(rejection) => {
            tracing::info!(
                ows = %ctx.ows,
                client_ip = %ctx.client_ip,
                user = %ctx.user_key,
                reason = rejection.reason(),
                "Request rejected by flow control"
            );
            let mut response = rejection.into_response();
            issue_cookie(&mut response, &user_key, &config.user_cookie);
            return response;
        }
    };

    tracing::debug!(
        ows = %ctx.ows,
        client_ip = %ctx.client_ip,
        user = %ctx.user_key,
        priority = ctx.priority,
        slots = admission.slots(),
        "Request admitted"
    );

    let mut response = next.run(request).await;
    if let Some(rate) = admission.rate_headers() {
        rate.apply(response.headers_mut());
    }
    issue_cookie(&mut response, &user_key, &config.user_cookie);

    let (parts, body) = response.into_parts();
    let body = Body::from_stream(body.into_data_stream().map(move |chunk| {
        let _held = &admission;
        chunk
    }));
    Response::from_parts(parts, body)
}

fn issue_cookie(response: &mut Response, user_key: &UserKey, cookie_name: &str) {
    let UserKey::Issued(value) = user_key else {
        return;
    };
    if let Ok(cookie) = HeaderValue::from_str(&format!("{}={}; Path=/; HttpOnly", cookie_name, value)) {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
}
