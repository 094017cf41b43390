use rollsync_core::{
    offline::{OfflineConfig, collect_random_trajectories},
    test_utils::{CountdownEnv, countdown_builder},
};

#[test]
fn collects_every_trajectory_in_order() {
    let config = OfflineConfig {
        n_trajectories: 10,
        n_workers: 3,
        max_steps: 100,
        n_neg_samples: 2,
        seed: Some(9),
        ..Default::default()
    };
    let trajectories = collect_random_trajectories(&config, &countdown_builder(4, |_| {})).unwrap();
    assert_eq!(trajectories.len(), 10);
    for (index, trajectory) in trajectories.iter().enumerate() {
        assert_eq!(trajectory.index, index);
        assert_eq!(trajectory.transitions.len(), 4);
        assert_eq!(trajectory.record.length, 4);
        assert_eq!(trajectory.record.ret, 4.);
        for (t, transition) in trajectory.transitions.iter().enumerate() {
            // restoring the snapshot keeps the positive rollout on track
            assert_eq!(transition.observation[1], t as f32);
            assert_eq!(transition.done, t == 3);
            assert_eq!(transition.negatives.len(), 2);
            for negative in &transition.negatives {
                assert_eq!(negative.observation[1], (t + 1) as f32);
            }
        }
    }
}

#[test]
fn episodes_are_cut_at_max_steps() {
    let config = OfflineConfig {
        n_trajectories: 2,
        n_workers: 8,
        max_steps: 5,
        seed: Some(1),
        ..Default::default()
    };
    let trajectories = collect_random_trajectories(&config, &countdown_builder(50, |_| {})).unwrap();
    assert_eq!(trajectories.len(), 2);
    assert!(trajectories.iter().all(|t| t.transitions.len() == 5 && !t.transitions[4].done));
}

#[test]
fn failing_builder_is_reported() {
    let config = OfflineConfig {
        n_trajectories: 3,
        n_workers: 2,
        ..Default::default()
    };
    let builder = || -> anyhow::Result<CountdownEnv> { anyhow::bail!("no environment") };
    assert!(collect_random_trajectories(&config, &builder).is_err());
    let empty = OfflineConfig {
        n_trajectories: 0,
        ..config
    };
    assert!(collect_random_trajectories(&empty, &builder).unwrap().is_empty());
}
