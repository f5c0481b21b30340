use crate::auth::AuthDecision;
use crate::destination::Destination;
use crate::error::{ProxyError, Result};
use crate::metering::{Direction, Meter, MeteredBody};
use crate::session::SessionContext;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::body::Incoming;
use hyper::header::{HOST, HeaderValue, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::http::uri::PathAndQuery;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const HTTP_DEFAULT_PORT: u16 = 80;
const PROXY_CONNECTION: &str = "proxy-connection";

/// Serves one plain (non-CONNECT) client connection. Keep-alive is off, so
/// the connection carries exactly one request.
pub async fn serve<S>(io: S, context: SessionContext) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .keep_alive(false)
        .serve_connection(
            TokioIo::new(io),
            service_fn(move |req| {
                let context = context.clone();
                async move { handle_request(req, context).await }
            }),
        )
        .await?;
    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: SessionContext,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    debug!("HTTP request: {} {}", req.method(), req.uri());

    let credentials = req
        .headers()
        .get(PROXY_AUTHORIZATION)
        .map(HeaderValue::as_bytes);
    match context.gate.decide(credentials) {
        AuthDecision::Missing => {
            let mut response = text_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "Proxy Authentication Required",
            );
            response
                .headers_mut()
                .insert(PROXY_AUTHENTICATE, context.gate.challenge().clone());
            return Ok(response);
        }
        AuthDecision::Rejected => {
            return Ok(text_response(
                StatusCode::FORBIDDEN,
                "Forbidden: Invalid Proxy Credentials",
            ));
        }
        AuthDecision::Granted => {}
    }

    match forward(req, &context).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("Error proxying request: {}", e);
            Ok(error_response(&e))
        }
    }
}

#[instrument(skip_all, fields(method = %req.method(), uri = %req.uri()))]
async fn forward(req: Request<Incoming>, context: &SessionContext) -> Result<Response<ProxyBody>> {
    let target = resolve_target(&req)?;
    let destination = target_destination(&target)?;
    info!("Proxying request to: {}", target);

    let stream = destination.connect(context.connect_timeout).await?;
    let (mut sender, connection) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{}: {}", destination, e)))?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection closed with error: {}", e);
        }
    });

    let upstream_request = into_upstream_request(req, &target, &destination)?;
    let response = sender
        .send_request(upstream_request)
        .await
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{}: {}", destination, e)))?;

    info!(
        "Proxying response from: {} ({})",
        destination.ledger_key(),
        response.status()
    );
    context.ledger.record_request(destination.ledger_key());

    let meter = Meter::new(
        context.ledger.clone(),
        destination.ledger_key(),
        Direction::Received,
    );
    Ok(response.map(|body| MeteredBody::new(body, meter).boxed()))
}

/// Absolute-form targets are used as given; origin-form targets are
/// completed from the `Host` header. Only plain `http` is forwarded.
pub fn resolve_target<B>(req: &Request<B>) -> Result<Uri> {
    let uri = req.uri();
    if let Some(scheme) = uri.scheme_str() {
        if !scheme.eq_ignore_ascii_case("http") {
            return Err(ProxyError::UnsupportedScheme(scheme.to_string()));
        }
        return Ok(uri.clone());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProxyError::InvalidRequest("missing Host header".to_string()))?;
    let path = uri.path_and_query().map(PathAndQuery::as_str).unwrap_or("/");

    format!("http://{}{}", host, path)
        .parse()
        .map_err(|e| ProxyError::InvalidRequest(format!("bad target http://{}{}: {}", host, path, e)))
}

fn target_destination(target: &Uri) -> Result<Destination> {
    let authority = target
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest(format!("target without authority: {}", target)))?;
    Destination::from_authority(authority, HTTP_DEFAULT_PORT)
}

/// Rewrites the request line to origin-form and drops the headers that are
/// meant for this proxy only.
fn into_upstream_request<B>(
    req: Request<B>,
    target: &Uri,
    destination: &Destination,
) -> Result<Request<B>> {
    let (mut parts, body) = req.into_parts();

    parts.uri = target
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"))
        .into();
    parts.headers.remove(PROXY_AUTHORIZATION);
    parts.headers.remove(PROXY_CONNECTION);

    let host = HeaderValue::from_str(&destination.host_header(HTTP_DEFAULT_PORT))
        .map_err(|e| ProxyError::InvalidRequest(format!("bad host {}: {}", destination, e)))?;
    parts.headers.insert(HOST, host);

    Ok(Request::from_parts(parts, body))
}

fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status = match error {
        ProxyError::InvalidRequest(_) | ProxyError::UnsupportedScheme(_) => StatusCode::BAD_REQUEST,
        ProxyError::ConnectTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    text_response(status, format!("Error proxying request: {}", error))
}

fn text_response<T: Into<Bytes>>(status: StatusCode, body: T) -> Response<ProxyBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}
