//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable holding the log filter. `RUST_LOG` is consulted when it is unset.
const LOG_ENV: &str = "HYCACHE_LOG";

/// Filter used when neither variable is set. fuser logs every unimplemented callback at info.
const DEFAULT_FILTER: &str = "info,fuser=warn";

enum TrcMode {
    /// Compact output interleaved with progress spinners.
    Pretty,
    /// Plain, verbose output with span enter/exit events and thread names, so the session thread
    /// and the mirror worker can be told apart.
    Ugly,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        let explicit =
            EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env());

        // An explicit filter means someone is debugging.
        let (mode, env_filter) = match explicit {
            Ok(filter) => (TrcMode::Ugly, filter),
            Err(_) => (TrcMode::Pretty, EnvFilter::new(DEFAULT_FILTER)),
        };
        Self { mode, env_filter }
    }
}

impl Trc {
    pub fn init(self) -> Result<(), TryInitError> {
        let Self { mode, env_filter } = self;
        match mode {
            TrcMode::Ugly => tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
                .with_thread_names(true)
                .finish()
                .try_init(),
            TrcMode::Pretty => {
                let spinners = IndicatifLayer::new();
                let compact = tracing_subscriber::fmt::layer()
                    .with_writer(spinners.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact();
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(compact)
                    .with(spinners)
                    .try_init()
            }
        }
    }
}
