/// Development helper: initialize tracing for the trellis crates.
///
/// Honors `TRELLIS_LOG` first, then `RUST_LOG`. A bare `TRELLIS_LOG=`
/// (set but empty) selects the debug stream of the three trellis crates
/// without touching dependencies; any other value is parsed as a normal
/// env-filter directive. With neither variable set this is a no-op, as
/// it is when a global subscriber is already installed.
pub fn init_tracing() {
    use std::env;
    use tracing_subscriber::EnvFilter;

    let Ok(directive) = env::var("TRELLIS_LOG").or_else(|_| env::var("RUST_LOG")) else {
        return;
    };
    let filter = if directive.is_empty() {
        EnvFilter::new("trellis=debug,trellis_peering=debug,trellis_core=debug")
    } else {
        EnvFilter::new(directive)
    };
    // Best-effort: a subscriber installed by the host application wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
