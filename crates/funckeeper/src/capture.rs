use std::any::{type_name, Any};
use std::backtrace::Backtrace;
use std::fmt::{Debug, Display};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use funckeeper_core::{
    serialize, split_tags, CallArgs, CallFailure, CallOutcome, FunctionMeta, Introspection,
    Introspector, NewCallRecord, RecordStore, ToCallArgs, ToCallValue,
};

/// Wraps functions so that every invocation writes one call record.
#[derive(Clone)]
pub struct Recorder {
    store: Arc<dyn RecordStore>,
    introspector: Arc<dyn Introspector>,
}

impl Recorder {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, introspector: Arc<dyn Introspector>) -> Self {
        Self {
            store,
            introspector,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Wraps `f`. The wrapper takes the same argument value and hands back
    /// exactly what `f` returned.
    ///
    /// Tags are stored comma-separated, so they are normalized up front: a
    /// tag containing `,` becomes several tags, whitespace around each tag is
    /// trimmed and empty tags are dropped.
    #[must_use]
    pub fn wrap<F>(&self, meta: FunctionMeta, tags: &[&str], f: F) -> Instrumented<F> {
        Instrumented {
            recorder: self.clone(),
            meta,
            tags: split_tags(&tags.join(",")),
            f,
        }
    }

    fn introspect(&self, meta: &FunctionMeta) -> Introspection {
        match self.introspector.inspect(meta) {
            Ok(introspection) => introspection,
            Err(err) => {
                tracing::warn!(function = %meta, error = %err, "recording call without source metadata");
                Introspection::default()
            }
        }
    }

    fn write(&self, record: &NewCallRecord) -> Result<i64> {
        let id = self
            .store
            .insert(record)
            .with_context(|| format!("failed to record call to {}", record.func_name))?;
        tracing::debug!(
            record_id = id,
            function = %record.func_name,
            status = %record.outcome.status(),
            execution_time = record.execution_time,
            "recorded call"
        );
        Ok(id)
    }
}

impl Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder").finish_non_exhaustive()
    }
}

/// A function wrapped by [`Recorder::wrap`].
///
/// Calls through [`Instrumented::call`] (fallible functions) or
/// [`Instrumented::invoke`] (infallible ones). The outer `anyhow::Result`
/// only fails when the call record could not be written.
pub struct Instrumented<F> {
    recorder: Recorder,
    meta: FunctionMeta,
    tags: Vec<String>,
    f: F,
}

impl<F> Instrumented<F> {
    #[must_use]
    pub fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Calls a fallible function. `Err` values are recorded as failures and
    /// returned unchanged in the inner `Result`.
    ///
    /// # Errors
    /// Returns an error when the call record cannot be written.
    ///
    /// # Panics
    /// Re-raises any panic from the wrapped function after recording it.
    pub fn call<A, T, E>(&self, args: A) -> Result<Result<T, E>>
    where
        F: Fn(A) -> Result<T, E>,
        A: ToCallArgs,
        T: ToCallValue,
        E: Display + Debug,
    {
        let introspection = self.recorder.introspect(&self.meta);
        let captured = args.to_call_args();

        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.f)(args)));
        let elapsed = started.elapsed();

        match result {
            Ok(Ok(value)) => {
                let outcome = CallOutcome::Success {
                    return_value: serialize(&value.to_call_value()),
                };
                self.recorder
                    .write(&self.record(introspection, &captured, outcome, elapsed))?;
                Ok(Ok(value))
            }
            Ok(Err(err)) => {
                let outcome = CallOutcome::Failure(failure_from_error(&err, &captured));
                self.recorder
                    .write(&self.record(introspection, &captured, outcome, elapsed))?;
                Ok(Err(err))
            }
            Err(payload) => self.record_panic(introspection, &captured, elapsed, payload),
        }
    }

    /// Calls an infallible function and returns its value unchanged.
    ///
    /// # Errors
    /// Returns an error when the call record cannot be written.
    ///
    /// # Panics
    /// Re-raises any panic from the wrapped function after recording it.
    pub fn invoke<A, T>(&self, args: A) -> Result<T>
    where
        F: Fn(A) -> T,
        A: ToCallArgs,
        T: ToCallValue,
    {
        let introspection = self.recorder.introspect(&self.meta);
        let captured = args.to_call_args();

        let started = Instant::now();
        let result = catch_unwind(AssertUnwindSafe(|| (self.f)(args)));
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                let outcome = CallOutcome::Success {
                    return_value: serialize(&value.to_call_value()),
                };
                self.recorder
                    .write(&self.record(introspection, &captured, outcome, elapsed))?;
                Ok(value)
            }
            Err(payload) => self.record_panic(introspection, &captured, elapsed, payload),
        }
    }

    fn record_panic(
        &self,
        introspection: Introspection,
        captured: &CallArgs,
        elapsed: Duration,
        payload: Box<dyn Any + Send>,
    ) -> ! {
        let message = panic_message(payload.as_ref());
        let failure = CallFailure {
            error_type: "panic".to_string(),
            traceback: format!(
                "panic: {message}\n\nstack backtrace:\n{}",
                Backtrace::force_capture()
            ),
            message,
            state: captured.snapshot(),
        };
        let record = self.record(
            introspection,
            captured,
            CallOutcome::Failure(failure),
            elapsed,
        );
        if let Err(err) = self.recorder.write(&record) {
            tracing::error!(function = %self.meta, error = %format!("{err:#}"), "failed to record panicking call");
        }
        resume_unwind(payload)
    }

    fn record(
        &self,
        introspection: Introspection,
        captured: &CallArgs,
        outcome: CallOutcome,
        elapsed: Duration,
    ) -> NewCallRecord {
        NewCallRecord {
            func_name: self.meta.name.clone(),
            module_path: introspection
                .module_path
                .unwrap_or_else(|| self.meta.module_path.clone()),
            source_code: introspection.source,
            doc_string: introspection.doc,
            dependencies: introspection.dependencies,
            args: captured.args_json(),
            kwargs: captured.kwargs_json(),
            outcome,
            execution_time: elapsed.as_secs_f64(),
            tags: self.tags.clone(),
        }
    }
}

impl<F> Debug for Instrumented<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrumented")
            .field("meta", &self.meta)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

fn failure_from_error<E: Display + Debug>(err: &E, captured: &CallArgs) -> CallFailure {
    let error_type = short_type_name(type_name::<E>());
    CallFailure {
        traceback: format!(
            "{error_type}: {err}\n\n{err:?}\n\nstack backtrace:\n{}",
            Backtrace::force_capture()
        ),
        message: err.to_string(),
        error_type,
        state: captured.snapshot(),
    }
}

/// `core::num::error::ParseIntError` becomes `ParseIntError`, and
/// `alloc::boxed::Box<dyn core::error::Error>` becomes `Box<dyn Error>`.
pub(crate) fn short_type_name(full: &str) -> String {
    let mut short = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == ':' && chars.peek() == Some(&':') {
            chars.next();
            segment.clear();
        } else if ch.is_alphanumeric() || ch == '_' {
            segment.push(ch);
        } else {
            short.push_str(&segment);
            segment.clear();
            short.push(ch);
        }
    }
    short.push_str(&segment);
    short
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}
