//! Minimize `x1^2` over a 201-point grid with four replicas.
//!
//! ```text
//! RUST_LOG=info cargo run -p hf-engine --example quadratic
//! ```

use hf_engine::{DistributionConfig, Hyperflow, SearchRegistration};
use hf_optimizer::{score_fn, CompositeStrategy, HillClimbing, RandomSearch};
use hf_types::{Evaluation, ParameterSpace, Parameters};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let space = ParameterSpace::new().add_int_range("x1", -100, 100, 1);
    let objective = score_fn(|p: &Parameters| {
        let x = p.float("x1").unwrap_or_default();
        Evaluation::new(-(x * x)).with_metric("abs_x", x.abs())
    });
    let strategy = CompositeStrategy::new()
        .with_optimizer(RandomSearch::new(), 1.0)?
        .with_optimizer(HillClimbing::new(0.05, 3), 2.0)?;

    let mut hyper = Hyperflow::new(DistributionConfig::from_env()?)?;
    let id = hyper.add_search(
        SearchRegistration::new("quadratic", objective, space)
            .with_strategy(strategy)
            .with_n_iter(15)
            .with_n_jobs(4),
    )?;

    let summary = hyper.run()?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    for result in hyper.results(id)? {
        println!(
            "replica {} (seed {}): best {:?} at {:?}",
            result.replica,
            result.seed,
            result.best_score(),
            result.best_parameters,
        );
    }
    println!("search data:\n{:?}", hyper.search_data(id)?.column_names());

    Ok(())
}
