use std::io::IsTerminal;

use anyhow::Result;
use serde::Deserialize;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::__tracing_subscriber_SubscriberExt,
    EnvFilter, Layer,
};

#[derive(Deserialize, Debug)]
pub struct Config {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

struct LocalTimer;
impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        )
    }
}

static ADDITION_DERECTIVE: &[&str] = &["hyper=warn", "reqwest=warn", "mio=warn"];

pub fn init(config: &Config) -> Result<()> {
    let std_out = {
        let mut filter = EnvFilter::from_default_env().add_directive(config.level.parse()?);
        for d in ADDITION_DERECTIVE {
            filter = filter.add_directive(d.parse().unwrap());
        }
        fmt::Layer::new()
            .with_ansi(std::io::stdout().is_terminal())
            .with_timer(LocalTimer)
            .with_target(true)
            .with_writer(std::io::stdout)
            .with_file(false)
            .with_filter(filter)
    };

    let collector_std = tracing_subscriber::registry().with(std_out);
    tracing::subscriber::set_global_default(collector_std).expect("failed to init logger");
    Ok(())
}

/// Run an expression returning a Result; if it is an Err, emit one error log.
/// For fallible side effects that are recorded but never handled.
#[macro_export]
macro_rules! log_if_err {
    ($run:expr) => {
        $crate::log_if_err!($run, stringify!($run))
    };

    // $msg is passed as a format argument, never spliced into the format
    // string: a stringified expression may contain `{...}` of its own.
    ($run:expr, $msg:expr $(,)?) => {
        if let Err(err) = $run {
            ::tracing::error!(?err, "FAILED: {}", $msg)
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn log_if_err_tolerates_braces_in_the_expression() {
        let failing: Result<(), String> = Err("boom".into());
        let detail = "x";
        log_if_err!(failing.clone().map_err(|e| format!("{e}: {detail}")));
        log_if_err!(failing, "with an explicit message");
    }
}
