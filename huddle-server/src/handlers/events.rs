use std::{collections::HashSet, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures_util::{Stream, StreamExt};
use serde::Deserialize;
use shared::models::{EventEnvelope, Topic};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::{debug, warn};
use utoipa::IntoParams;

use crate::{
    app_state::AppState,
    http::{
        error::{ApiError, AppResult},
        problem::ProblemDetails,
    },
};

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TopicsQuery {
    /// Comma-separated topic names; all topics when absent or empty.
    #[serde(default)]
    pub topics: Option<String>,
}

/// Parses the `topics` filter. `None` means every topic.
pub fn parse_topics(raw: Option<&str>) -> AppResult<Option<HashSet<Topic>>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(None);
    };
    raw.split(',')
        .filter(|name| !name.trim().is_empty())
        .map(|name| {
            Topic::try_from(name)
                .map_err(|_| ApiError::bad_request(format!("unknown topic '{}'", name.trim())))
        })
        .collect::<AppResult<HashSet<_>>>()
        .map(Some)
}

fn to_sse(envelope: &EventEnvelope) -> Event {
    Event::default()
        .event(envelope.topic.as_str())
        .data(envelope.payload.to_string())
}

/// Live stream of engine events. Delivery is best-effort: a subscriber that
/// falls behind the channel receives a `lagged` event and continues.
#[utoipa::path(
    get,
    path = "/api/events",
    params(TopicsQuery),
    responses(
        (status = 200, description = "Server-sent event stream", content_type = "text/event-stream"),
        (status = 400, description = "Unknown topic", body = ProblemDetails)
    ),
    tag = "Events"
)]
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopicsQuery>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let topics = parse_topics(query.topics.as_deref())?;
    debug!(topics = ?topics, "event stream subscribed");

    let stream = BroadcastStream::new(state.events.subscribe()).filter_map(move |item| {
        let event = match item {
            Ok(envelope) => topics
                .as_ref()
                .is_none_or(|wanted| wanted.contains(&envelope.topic))
                .then(|| to_sse(&envelope)),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "event subscriber lagged");
                metrics::counter!("huddle_events_lagged_total").increment(skipped);
                Some(Event::default().event("lagged").data(skipped.to_string()))
            }
        };
        std::future::ready(event.map(Ok))
    });

    let keepalive = KeepAlive::new()
        .interval(Duration::from_secs(state.config.events.heartbeat_seconds.max(1)))
        .text("keep-alive");

    Ok(Sse::new(stream).keep_alive(keepalive))
}
