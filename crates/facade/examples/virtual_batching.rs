use dpsgd::{BatchingConfig, DpTrainingConfig, DpTrainingSetup, PrivacyBudget, Tensor};
use ndarray::Array1;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let batching = BatchingConfig::new(64, 16, 2).with_schedule(vec![(50, 128)]);
    let mut config = DpTrainingConfig::new(
        PrivacyBudget::new(3.0, 1e-5).expect("budget"),
        batching,
        10_000,
        100,
        1.0,
    );
    config.noise_seed = 42;
    let setup = DpTrainingSetup::from_config(&config).expect("setup");
    println!(
        "noise multiplier {:.4}, planned epsilon {:.4}",
        setup.noise_multiplier(),
        setup.planned_epsilon()
    );

    let batching = setup.batching();
    let mut rng = setup.rng();
    for step in [0u64, 49, 50, 99] {
        let micro_steps = batching.apply_update_every(step);
        let micro_batches: Vec<Vec<Tensor>> = (0..micro_steps)
            .map(|_| {
                (0..batching.batch_size_per_step())
                    .map(|i| Array1::from_vec(vec![i as f64, 1.0]).into_dyn())
                    .collect()
            })
            .collect();
        let update = setup
            .apply_update(step, &micro_batches, &mut rng)
            .expect("update");
        let eps = setup.epsilon_spent(step + 1).expect("epsilon");
        println!(
            "step {step}: batch {} over {micro_steps} micro-steps, update {:?}, epsilon {eps:.4}",
            batching.batch_size(step),
            update.as_slice().unwrap_or_default()
        );
    }
}
