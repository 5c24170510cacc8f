use std::time::Duration;

use posthog_rs::Event;
use tracing::warn;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

fn capture_async(event: Event) {
    // Outside a runtime (e.g. sync unit tests) there is nowhere to send from.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        match tokio::time::timeout(CAPTURE_TIMEOUT, posthog_rs::capture(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Failed to capture analytics event: {e}"),
            Err(_) => warn!("Analytics event capture timed out"),
        }
    });
}

pub fn track_order_created(product: &str) {
    let mut event = Event::new_anon("billing_order_created");
    event.insert_prop("product", product).ok();
    capture_async(event);
}

pub fn track_order_creation_failed(product: &str, error_kind: &str) {
    let mut event = Event::new_anon("billing_order_creation_failed");
    event.insert_prop("product", product).ok();
    event.insert_prop("error_kind", error_kind).ok();
    capture_async(event);
}

pub fn track_callback_resolved(kind: &str, succeeded: bool) {
    let mut event = Event::new_anon("billing_callback_resolved");
    event.insert_prop("kind", kind).ok();
    event.insert_prop("succeeded", succeeded).ok();
    capture_async(event);
}
