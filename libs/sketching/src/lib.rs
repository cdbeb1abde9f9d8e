#![deny(warnings)]
#![warn(unused_extern_crates)]
#![allow(non_snake_case)]
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing_forest::printer::TestCapturePrinter;
use tracing_forest::tag::NoTag;
use tracing_forest::util::*;
use tracing_subscriber::prelude::*;

pub mod macros;

pub use {tracing, tracing_forest, tracing_subscriber};

/// Start up the logging for test mode.
pub fn test_init() {
    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::TRACE.into())
        // tokio's runtime internals are noisy at trace and tell us nothing about task state.
        .add_directive(
            "tokio=INFO"
                .parse()
                .expect("failed to generate log filter"),
        );

    // start the logging!
    let _ = tracing_subscriber::Registry::default()
        .with(ForestLayer::new(TestCapturePrinter::new(), NoTag).with_filter(filter))
        .try_init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum EventTag {
    AdminDebug,
    AdminError,
    AdminWarn,
    AdminInfo,
    RequestError,
    RequestWarn,
    RequestInfo,
    RequestTrace,
    TaskError,
    TaskWarn,
    TaskInfo,
    TaskTrace,
    PerfTrace,
}

impl EventTag {
    pub fn pretty(self) -> &'static str {
        match self {
            EventTag::AdminDebug => "admin.debug",
            EventTag::AdminError => "admin.error",
            EventTag::AdminWarn => "admin.warn",
            EventTag::AdminInfo => "admin.info",
            EventTag::RequestError => "request.error",
            EventTag::RequestWarn => "request.warn",
            EventTag::RequestInfo => "request.info",
            EventTag::RequestTrace => "request.trace",
            EventTag::TaskError => "task.error",
            EventTag::TaskWarn => "task.warn",
            EventTag::TaskInfo => "task.info",
            EventTag::TaskTrace => "task.trace",
            EventTag::PerfTrace => "perf.trace",
        }
    }

    pub fn emoji(self) -> &'static str {
        use EventTag::*;
        match self {
            AdminDebug => "🐛",
            AdminError | RequestError | TaskError => "🚨",
            AdminWarn | RequestWarn | TaskWarn => "⚠️",
            AdminInfo | RequestInfo | TaskInfo => "ℹ️",
            RequestTrace | TaskTrace | PerfTrace => "📍",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EventTag;

    #[test]
    fn test_event_tag_roundtrip_id() {
        let id: u64 = EventTag::TaskWarn.into();
        assert_eq!(EventTag::try_from(id).ok(), Some(EventTag::TaskWarn));
        assert_eq!(EventTag::TaskWarn.pretty(), "task.warn");
        assert!(EventTag::try_from(u64::MAX).is_err());
    }
}
