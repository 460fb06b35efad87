//! Configuration for the installer
//!
//! The best way to configure the installer is by using [`Config::default`]
//! or by turning on the "cli" feature and using [`Config::new_from_flags`].

use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::backoff::RateLimiterConfig;
use crate::reconciler::ReconcilerConfig;
#[cfg(feature = "cli")]
use crate::reconciler::{DEFAULT_FIELD_OWNER, DEFAULT_FINALIZER};
use crate::render::ReleaseOptions;
#[cfg(feature = "cli")]
use crate::render::{DEFAULT_RELEASE_NAME, DEFAULT_RELEASE_NAMESPACE};
use crate::resource::State;
use crate::store::DEFAULT_REQUEST_TIMEOUT;

/// The configuration needed for the operator to run properly.
///
/// This can be configured manually in your code or if you are exposing a CLI, use the
/// [`Config::new_from_flags`] (this requires the "cli" feature to
/// be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// Global and per-object requeue limits.
    pub rate_limiter: RateLimiterConfig,
    /// Settings shared by the reconcilers of every kind.
    pub reconciler: ReconcilerConfig,
    /// Namespace to watch. `None` watches all namespaces.
    pub namespace: Option<String>,
    /// Upper bound of a single API request.
    pub request_timeout: Duration,
    /// Release the chart renderer renders into.
    pub release: ReleaseOptions,
    /// Resolve rendered charts against the API server with dry-run applies.
    pub chart_server_dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rate_limiter: RateLimiterConfig::default(),
            reconciler: ReconcilerConfig::default(),
            namespace: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            release: ReleaseOptions::default(),
            chart_server_dry_run: false,
        }
    }
}

impl Config {
    /// Parses all command line flags and sets the proper defaults. The version
    /// of your application should be passed to set the proper version for the CLI
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Self::from_opts(opts)
    }

    #[cfg(any(feature = "cli", feature = "docs"))]
    fn from_opts(opts: Opts) -> Self {
        let defaults = ReleaseOptions::default();
        Config {
            rate_limiter: RateLimiterConfig {
                burst: opts.rate_limiter_burst,
                frequency: opts.rate_limiter_frequency,
                base_delay: opts.failure_base_delay,
                max_delay: opts.failure_max_delay,
            },
            reconciler: ReconcilerConfig {
                final_state: opts.final_state,
                finalizer: opts.finalizer,
                field_owner: opts.field_owner,
                requeue_interval: opts.requeue_interval,
                apply_concurrency: opts.apply_concurrency.max(1),
            },
            namespace: opts.namespace.filter(|ns| !ns.is_empty()),
            request_timeout: opts.request_timeout,
            release: ReleaseOptions {
                name: opts.chart_release_name,
                namespace: opts.chart_namespace,
                values: defaults.values,
            },
            chart_server_dry_run: opts.chart_server_dry_run,
        }
    }
}

/// CLI options that can be configured for the operator
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "template-operator",
    about = "Installs rendered manifests for Sample and SampleHelm resources"
)]
pub struct Opts {
    #[structopt(
        long = "rate-limiter-burst",
        default_value = "200",
        env = "RATE_LIMITER_BURST",
        help = "Requeues allowed at once before the global limit applies"
    )]
    rate_limiter_burst: u32,

    #[structopt(
        long = "rate-limiter-frequency",
        default_value = "30",
        env = "RATE_LIMITER_FREQUENCY",
        help = "Sustained requeues per second across all objects. 0 disables the global limit"
    )]
    rate_limiter_frequency: u32,

    #[structopt(
        long = "failure-base-delay",
        default_value = "1s",
        env = "FAILURE_BASE_DELAY",
        parse(try_from_str = parse_duration),
        help = "Delay before the first retry of a failed object"
    )]
    failure_base_delay: Duration,

    #[structopt(
        long = "failure-max-delay",
        default_value = "1000s",
        env = "FAILURE_MAX_DELAY",
        parse(try_from_str = parse_duration),
        help = "Upper bound of the retry delay of a failing object"
    )]
    failure_max_delay: Duration,

    #[structopt(
        long = "requeue-interval",
        default_value = "3s",
        env = "REQUEUE_INTERVAL",
        parse(try_from_str = parse_duration),
        help = "Delay between passes over an installed object"
    )]
    requeue_interval: Duration,

    #[structopt(
        long = "final-state",
        default_value = "Ready",
        env = "FINAL_STATE",
        parse(try_from_str = parse_final_state),
        help = "State written after a successful installation: Processing, Ready, Warning or Error"
    )]
    final_state: State,

    #[structopt(
        long = "finalizer",
        default_value = DEFAULT_FINALIZER,
        env = "FINALIZER",
        help = "Finalizer guarding deletion of installed objects"
    )]
    finalizer: String,

    #[structopt(
        long = "field-owner",
        default_value = DEFAULT_FIELD_OWNER,
        env = "FIELD_OWNER",
        help = "Field manager used for every write"
    )]
    field_owner: String,

    #[structopt(
        short = "n",
        long = "namespace",
        env = "WATCH_NAMESPACE",
        help = "Only watch resources in this namespace. Defaults to all namespaces"
    )]
    namespace: Option<String>,

    #[structopt(
        long = "request-timeout",
        default_value = "30s",
        env = "REQUEST_TIMEOUT",
        parse(try_from_str = parse_duration),
        help = "Upper bound of a single API request"
    )]
    request_timeout: Duration,

    #[structopt(
        long = "apply-concurrency",
        default_value = "1",
        env = "APPLY_CONCURRENCY",
        help = "Rendered objects applied at once. 1 applies them in order"
    )]
    apply_concurrency: usize,

    #[structopt(
        long = "chart-release-name",
        default_value = DEFAULT_RELEASE_NAME,
        env = "CHART_RELEASE_NAME",
        help = "Release name available to chart templates"
    )]
    chart_release_name: String,

    #[structopt(
        long = "chart-namespace",
        default_value = DEFAULT_RELEASE_NAMESPACE,
        env = "CHART_NAMESPACE",
        help = "Release namespace available to chart templates"
    )]
    chart_namespace: String,

    #[structopt(
        long = "chart-server-dry-run",
        help = "Resolve rendered charts with dry-run applies against the API server"
    )]
    chart_server_dry_run: bool,
}

/// Parse a duration such as `250ms`, `3s`, `5m` or `1h`.
///
/// A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (amount, unit) = input.split_at(split);
    let amount: u64 = amount
        .parse()
        .map_err(|_| format!("invalid duration {:?}", input))?;
    let seconds = |factor: u64| {
        amount
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration {:?} is too large", input))
    };
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "" | "s" => seconds(1),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        other => Err(format!("unknown duration unit {:?} in {:?}", other, input)),
    }
}

/// Parse the state written after a successful installation.
pub fn parse_final_state(input: &str) -> Result<State, String> {
    match input.parse::<State>().map_err(|e| e.to_string())? {
        State::Initial | State::Deleting => Err(format!(
            "{:?} cannot be used as the final state",
            input
        )),
        state => Ok(state),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn durations_accept_units() {
        assert_eq!(parse_duration("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse_duration("3s"), Ok(Duration::from_secs(3)));
        assert_eq!(parse_duration("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Ok(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1000"), Ok(Duration::from_secs(1000)));
    }

    #[test]
    fn durations_reject_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let hours = format!("{}h", u64::MAX);
        assert_eq!(
            parse_duration(&hours),
            Err(format!("duration {:?} is too large", hours))
        );
        assert!(parse_duration(&format!("{}m", u64::MAX / 2)).is_err());
        assert_eq!(
            parse_duration(&format!("{}s", u64::MAX)),
            Ok(Duration::from_secs(u64::MAX))
        );
    }

    #[test]
    fn final_state_must_be_terminal() {
        assert_eq!(parse_final_state("Warning"), Ok(State::Warning));
        assert_eq!(parse_final_state("Ready"), Ok(State::Ready));
        assert!(parse_final_state("Deleting").is_err());
        assert!(parse_final_state("").is_err());
        assert!(parse_final_state("Done").is_err());
    }

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert!(config.reconciler.validate().is_ok());
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.rate_limiter.burst, 200);
        assert!(config.namespace.is_none());
    }

    #[cfg(feature = "cli")]
    #[test]
    fn flags_override_defaults() {
        let opts = Opts::from_iter_safe(&[
            "template-operator",
            "--final-state",
            "Warning",
            "--requeue-interval",
            "500ms",
            "--namespace",
            "kyma-system",
            "--apply-concurrency",
            "0",
        ])
        .unwrap();
        let config = Config::from_opts(opts);
        assert_eq!(config.reconciler.final_state, State::Warning);
        assert_eq!(
            config.reconciler.requeue_interval,
            Duration::from_millis(500)
        );
        assert_eq!(config.reconciler.apply_concurrency, 1);
        assert_eq!(config.namespace.as_deref(), Some("kyma-system"));
        assert_eq!(config.release.name, "sample-release-name");
    }

    #[cfg(feature = "cli")]
    #[test]
    fn deleting_is_rejected_as_final_state() {
        assert!(Opts::from_iter_safe(&["template-operator", "--final-state", "Deleting"]).is_err());
    }
}
