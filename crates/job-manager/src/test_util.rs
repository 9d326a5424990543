use once_cell::sync::Lazy;

/// Log test output when `TEST_LOG` is set. Its value, if not empty, is used as the filter,
/// e.g. `TEST_LOG=crucible_job_manager=trace`.
static TRACING: Lazy<()> = Lazy::new(|| {
    if let Ok(filter) = std::env::var("TEST_LOG") {
        configure_tracing(&filter);
    }
});

fn configure_tracing(filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

    let filter = if filter.is_empty() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new(filter)
    };

    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(filter)
        .with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}

pub fn setup_test_tracing() {
    Lazy::force(&TRACING);
}
