use dpsgd::{
    calibrate_noise_multiplier, CalibrationConfig, DpParams, DpTrainingAccountant,
    DpsgdTrainingAccountant, PldAccountantConfig, RdpAccountantConfig,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let target_eps = 1.0;
    let delta = 1e-5;
    let batch_size = 256usize;
    let num_updates = 3906u64;
    let num_samples = 10_000usize;

    let accountants = [
        (
            "rdp",
            DpsgdTrainingAccountant::with_rdp(RdpAccountantConfig::default()).expect("rdp"),
        ),
        (
            "pld",
            DpsgdTrainingAccountant::with_pld(PldAccountantConfig::default()).expect("pld"),
        ),
    ];

    for (name, accountant) in &accountants {
        let sigma = calibrate_noise_multiplier(
            target_eps,
            delta,
            accountant,
            batch_size,
            num_updates,
            num_samples,
            &CalibrationConfig::default(),
        )
        .expect("calibrated sigma");
        let params = DpParams::new(sigma, num_samples, batch_size, delta).expect("params");
        let eps = accountant
            .compute_epsilon(num_updates, &params)
            .expect("epsilon");
        println!("{name}: noise multiplier {sigma:.4}, epsilon @ delta={delta}: {eps:.4}");
    }
}
