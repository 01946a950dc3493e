use axum::{body::Body, http::Request};
use std::time::Duration;
use tower_http::classify::{ServerErrorsAsFailures, ServerErrorsFailureClass, SharedClassifier};
use tower_http::trace::{DefaultOnBodyChunk, DefaultOnEos, DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{Level, Span, debug, error};

use crate::middleware::request_context::RequestContext;

type HuddleTraceLayer = TraceLayer<
    SharedClassifier<ServerErrorsAsFailures>,
    HttpMakeSpan,
    fn(&Request<Body>, &Span),
    DefaultOnResponse,
    DefaultOnBodyChunk,
    DefaultOnEos,
    fn(ServerErrorsFailureClass, Duration, &Span),
>;

/// Opens one span per request, tagged with the request id and subject.
#[derive(Clone, Debug, Default)]
pub struct HttpMakeSpan;

impl<B> MakeSpan<B> for HttpMakeSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        let context = request.extensions().get::<RequestContext>();
        let request_id = context.map_or("n/a", |ctx| ctx.request_id.as_str());
        let subject = context
            .and_then(|ctx| ctx.subject)
            .map_or_else(|| "anonymous".to_string(), |id| id.to_string());

        tracing::info_span!(
            "http_request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
            subject = %subject,
            status_code = tracing::field::Empty
        )
    }
}

fn on_request(request: &Request<Body>, span: &Span) {
    span.in_scope(|| {
        debug!(
            method = %request.method(),
            uri = %request.uri(),
            version = ?request.version(),
            "started processing request"
        );
    });
}

fn on_failure(error: ServerErrorsFailureClass, latency: Duration, span: &Span) {
    span.in_scope(|| {
        error!(error = %error, latency = ?latency, "error processing request");
    });
}

pub fn create_trace_layer() -> HuddleTraceLayer {
    TraceLayer::new_for_http()
        .make_span_with(HttpMakeSpan)
        .on_request(on_request as fn(&Request<Body>, &Span))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(on_failure as fn(ServerErrorsFailureClass, Duration, &Span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn span_is_named_http_request() {
        let mut request = Request::builder()
            .uri("/api/unreads")
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(RequestContext {
            request_id: "req-1".into(),
            subject: Some(Uuid::new_v4()),
        });

        let span = HttpMakeSpan.make_span(&request);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "http_request");
        }
    }
}
