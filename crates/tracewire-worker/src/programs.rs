//! Demo programs producing nested spans.
//!
//! Each program is a small tree of timed spans so traces have a recognizable
//! shape: a parent, a short probe, and a delayed child.

use std::time::Duration;

use tracewire_rpc::{BackgroundTasks, spawn_transaction};
use tracewire_tracing::{SpanOptions, current_span_id, in_span};

use crate::error::ProgramError;

/// Delay before the forked program starts its work.
pub const DEFAULT_FORK_DELAY: Duration = Duration::from_secs(1);

pub const CHILD_ERROR_NAME: &str = "ChildEffectError";
pub const CHILD_ERROR_MESSAGE: &str =
    "Intentional error from child Effect for testing error propagation";

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

async fn child() -> Result<(), ProgramError> {
    in_span(
        "childEffect",
        SpanOptions::new().attribute("span.level", 2),
        async {
            sleep_ms(100).await;
            sleep_ms(10).await;
            Ok(())
        },
    )
    .await
}

/// Parent span with a probe span and a delayed child span.
pub async fn run_program() -> Result<(), ProgramError> {
    in_span(
        "parentEffect",
        SpanOptions::new().attribute("span.level", 1),
        async {
            in_span("probe-span", SpanOptions::new(), async {
                tracing::info!("Inside probe span");
                Ok::<_, ProgramError>(())
            })
            .await?;

            sleep_ms(20).await;
            child().await?;
            sleep_ms(10).await;
            Ok(())
        },
    )
    .await
}

async fn child_with_error() -> Result<(), ProgramError> {
    in_span(
        "child-with-error",
        SpanOptions::new()
            .attribute("span.type", "child")
            .attribute("span.level", 2)
            .attribute("test.error", true),
        async {
            tracing::warn!(test.logprop = true, "Child span executing before error");
            sleep_ms(50).await;
            Err(ProgramError::new(CHILD_ERROR_NAME, CHILD_ERROR_MESSAGE))
        },
    )
    .await
}

/// Like [`run_program`], but the child fails with [`CHILD_ERROR_NAME`].
///
/// Every span on the way up reports the same error; the reporting client
/// keeps one event per trace.
pub async fn run_program_with_error() -> Result<(), ProgramError> {
    in_span(
        "parent-with-error",
        SpanOptions::new()
            .attribute("span.type", "parent")
            .attribute("span.level", 1)
            .attribute("test.error", true),
        async {
            sleep_ms(20).await;
            child_with_error().await?;
            sleep_ms(10).await;
            Ok(())
        },
    )
    .await
}

/// Start [`run_program`] in the background after `delay` and return at once.
///
/// The background work runs as its own transaction in the caller's trace,
/// registered on `tasks` so it completes after the caller has responded.
pub async fn run_forked_program(
    tasks: &dyn BackgroundTasks,
    delay: Duration,
) -> Result<(), ProgramError> {
    in_span("forkedEffect", SpanOptions::new(), async {
        tracing::debug!(span_id = ?current_span_id(), "Outside background task");

        spawn_transaction(
            tasks,
            "effectWithBackgroundFork",
            SpanOptions::new().op("task"),
            async move {
                tracing::debug!(span_id = ?current_span_id(), "Inside background task");
                tokio::time::sleep(delay).await;
                run_program().await?;
                tracing::debug!("Background task finished");
                Ok::<_, ProgramError>(())
            },
        );
        Ok(())
    })
    .await
}
