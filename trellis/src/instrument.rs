//! Tracing middleware.

use crate::{Context, Endpoint, Middleware};
use tokio::time::Instant;
use tracing_futures::Instrument;

/// Run every call in an `endpoint` span carrying `operation` and the request id.
///
/// Successful calls are logged at debug level with their latency, failed
/// calls at warn level with the error. Responses and errors pass through untouched.
pub fn instrument<Req, Resp>(operation: &'static str) -> Middleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Middleware::new(move |next: Endpoint<Req, Resp>| {
        Endpoint::new(move |ctx: Context, req| {
            let span = tracing::info_span!("endpoint", operation, request_id = ctx.request_id());
            let call = next.call(ctx, req);
            async move {
                let start = Instant::now();
                let result = call.await;
                let elapsed = start.elapsed();
                match &result {
                    Ok(_) => tracing::debug!(?elapsed, "call succeeded"),
                    Err(err) => tracing::warn!(?elapsed, error = %err, "call failed"),
                }
                result
            }
            .instrument(span)
        })
    })
}
