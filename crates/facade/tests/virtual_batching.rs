use dpsgd::{BatchSchedule, BatchingConfig, DpError, VirtualBatching};
use proptest::prelude::*;

#[test]
fn constant_batching_across_two_devices() {
    let batching = VirtualBatching::new(128, 32, 2).expect("batching");
    assert_eq!(batching.batch_size_per_step(), 64);
    for step in [0, 1, 7, 1_000_000] {
        assert_eq!(batching.apply_update_every(step), 2);
        assert_eq!(batching.batch_size(step), 128);
    }
    assert_eq!(batching.data_seen(10), 640);
}

#[test]
fn indivisible_batch_size_is_rejected() {
    let err = VirtualBatching::new(100, 32, 2).unwrap_err();
    assert!(matches!(err, DpError::InvalidParameter { .. }));
}

#[test]
fn scheduled_batching_changes_accumulation() {
    let schedule = BatchSchedule::new(64, vec![(100, 128), (300, 256)]).expect("schedule");
    let batching = VirtualBatching::with_schedule(schedule, 16, 4).expect("batching");
    assert_eq!(batching.apply_update_every(0), 1);
    assert_eq!(batching.apply_update_every(99), 1);
    assert_eq!(batching.apply_update_every(100), 2);
    assert_eq!(batching.apply_update_every(299), 2);
    assert_eq!(batching.apply_update_every(300), 4);
    assert_eq!(batching.batch_size(10_000), 256);
}

#[test]
fn every_scheduled_size_must_be_divisible() {
    let schedule = BatchSchedule::new(64, vec![(10, 96)]).expect("schedule");
    assert!(VirtualBatching::with_schedule(schedule, 16, 4)
        .unwrap_err()
        .is_invalid_parameter());
}

#[test]
fn batching_config_from_json() {
    let config: BatchingConfig = serde_json::from_str(
        r#"{"batch_size_init": 128, "batch_size_per_device_per_step": 32,
            "num_devices": 2, "schedule": [[50, 256]]}"#,
    )
    .expect("config");
    let batching = config.build().expect("batching");
    assert_eq!(batching.apply_update_every(49), 2);
    assert_eq!(batching.apply_update_every(50), 4);
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 8, .. ProptestConfig::default() })]

    #[test]
    fn accumulation_covers_the_batch(
        per_device in 1usize..64,
        devices in 1usize..8,
        multiple in 1usize..16,
        step in 0u64..10_000,
    ) {
        let per_step = per_device * devices;
        let batching = VirtualBatching::new(per_step * multiple, per_device, devices)
            .expect("batching");
        prop_assert_eq!(batching.apply_update_every(step), multiple);
        prop_assert_eq!(
            batching.apply_update_every(step) * batching.batch_size_per_step(),
            batching.batch_size(step)
        );
        prop_assert_eq!(batching.data_seen(step), step * per_step as u64);
    }
}
