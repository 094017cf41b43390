use rollsync_core::{
    ParallelSampler, SamplerConfig, SamplerError, SamplerMode,
    buffers::BatchStore,
    test_utils::{EchoPolicy, countdown_builder},
};
use std::time::{Duration, Instant};

fn config(mode: SamplerMode) -> SamplerConfig {
    SamplerConfig {
        batch_t: 5,
        batch_b: 8,
        n_workers: 4,
        mode,
        max_decorrelation_steps: 0,
        seed: Some(1),
        ..Default::default()
    }
}

fn snapshot(batch: &BatchStore) -> Vec<f32> {
    let shape = batch.shape();
    (0..shape.t)
        .flat_map(|t| (0..shape.b).flat_map(move |b| batch.observation(t, b).to_vec()))
        .collect()
}

// Every cell of the batch was written by the environment owning its column this round.
fn assert_filled(batch: &BatchStore) {
    let shape = batch.shape();
    for t in 0..shape.t {
        for b in 0..shape.b {
            assert_eq!(batch.observation(t, b)[0], (b + 1) as f32, "cell ({t}, {b})");
            assert_eq!(batch.reward(t, b), 1., "cell ({t}, {b})");
            assert_eq!(batch.action(t, b), &[1.]);
            assert_eq!(batch.agent_info(t, b), &[(b + 1) as f32]);
            assert_eq!(batch.env_info(t, b), &[b as f32]);
        }
    }
}

fn concrete_scenario(mode: SamplerMode) {
    let (mut sampler, example) = ParallelSampler::initialize(
        config(mode),
        countdown_builder(3, |_| {}),
        EchoPolicy::default(),
    )
    .unwrap();
    assert_eq!(example.observation.len(), 2);

    let samples = sampler.obtain_samples(0).unwrap();
    assert_eq!(samples.buffer_index, 0);
    let batch = sampler.batch(samples.buffer_index);
    assert_filled(&batch);
    for b in 0..8 {
        let done: Vec<_> = (0..5).map(|t| batch.done(t, b)).collect();
        assert_eq!(done, vec![false, false, true, false, false]);
        let steps: Vec<_> = (0..5).map(|t| batch.observation(t, b)[1]).collect();
        assert_eq!(steps, vec![0., 1., 2., 0., 1.]);
    }
    assert!(samples.traj_infos.len() >= 8 * (5 / 3));
    assert!(samples.traj_infos.iter().all(|r| r.length == 3 && !r.eval));
    assert!(samples.traj_infos.iter().all(|r| r.custom["period"] == 3.));

    // episodes carry over into the next round
    let samples = sampler.obtain_samples(1).unwrap();
    assert_eq!(samples.buffer_index, 1);
    let batch = sampler.batch(1);
    assert_filled(&batch);
    assert_eq!(batch.observation(0, 5)[1], 2.);
    assert!(batch.done(0, 5));
    assert_eq!(samples.traj_infos.len(), 16);
    sampler.shutdown().unwrap();
}

#[test]
fn concrete_scenario_cpu() {
    concrete_scenario(SamplerMode::Cpu);
}

#[test]
fn concrete_scenario_action_server() {
    concrete_scenario(SamplerMode::ActionServer);
}

#[test]
fn bootstrap_value_of_trailing_observation() {
    for mode in [SamplerMode::Cpu, SamplerMode::ActionServer] {
        let config = SamplerConfig {
            bootstrap_value: true,
            ..config(mode)
        };
        let (mut sampler, _) =
            ParallelSampler::initialize(config, countdown_builder(3, |_| {}), EchoPolicy::default())
                .unwrap();
        let samples = sampler.obtain_samples(0).unwrap();
        let batch = sampler.batch(samples.buffer_index);
        // five steps into a period of three leave every environment at step two
        for b in 0..8 {
            assert_eq!(batch.bootstrap_value(b), Some(2.), "{mode:?} column {b}");
        }
    }
}

#[test]
fn obtain_samples_waits_for_the_slowest_worker() {
    let config = SamplerConfig {
        batch_t: 3,
        batch_b: 2,
        n_workers: 2,
        max_decorrelation_steps: 0,
        ..Default::default()
    };
    let builder = countdown_builder(100, |env| {
        if env.id == 0 {
            env.delay = Duration::from_millis(20);
        }
    });
    let (mut sampler, _) = ParallelSampler::initialize(config, builder, EchoPolicy::default()).unwrap();
    let started = Instant::now();
    let samples = sampler.obtain_samples(0).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(60));
    let batch = sampler.batch(samples.buffer_index);
    assert_eq!(batch.observation(2, 0), &[1., 2.]);
    assert_eq!(batch.observation(2, 1), &[2., 2.]);
}

#[test]
fn double_buffer_stores_do_not_overlap() {
    let (mut sampler, _) = ParallelSampler::initialize(
        config(SamplerMode::Cpu),
        countdown_builder(4, |_| {}),
        EchoPolicy::default(),
    )
    .unwrap();
    let mut previous: Option<(usize, Vec<f32>)> = None;
    for itr in 0..6 {
        let samples = sampler.obtain_samples(itr).unwrap();
        assert_eq!(samples.buffer_index, itr % 2);
        if let Some((index, content)) = &previous {
            assert_ne!(*index, samples.buffer_index);
            // the store handed out last round was left alone
            assert_eq!(&snapshot(&sampler.batch(*index)), content);
        }
        previous = Some((
            samples.buffer_index,
            snapshot(&sampler.batch(samples.buffer_index)),
        ));
    }
}

#[test]
fn shutdown_is_final() {
    let (mut sampler, _) = ParallelSampler::initialize(
        config(SamplerMode::ActionServer),
        countdown_builder(3, |_| {}),
        EchoPolicy::default(),
    )
    .unwrap();
    sampler.obtain_samples(0).unwrap();
    let started = Instant::now();
    sampler.shutdown().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    let before = [snapshot(&sampler.batch(0)), snapshot(&sampler.batch(1))];
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(before, [snapshot(&sampler.batch(0)), snapshot(&sampler.batch(1))]);
    assert!(matches!(
        sampler.obtain_samples(1),
        Err(SamplerError::Protocol(_))
    ));
    // a second shutdown is a no-op
    sampler.shutdown().unwrap();
}

#[test]
fn failing_environment_is_contained() {
    for panic in [false, true] {
        let builder = countdown_builder(3, move |env| {
            if env.id == 0 {
                env.fail_every = Some(4);
                env.panic = panic;
            }
        });
        let (mut sampler, _) =
            ParallelSampler::initialize(config(SamplerMode::Cpu), builder, EchoPolicy::default())
                .unwrap();
        let samples = sampler.obtain_samples(0).unwrap();
        let batch = sampler.batch(samples.buffer_index);
        assert!(batch.done(3, 0));
        assert_eq!(batch.reward(3, 0), 0.);
        assert_eq!(batch.env_info(3, 0), &[0.]);
        // the column keeps stepping after the forced reset
        assert_eq!(batch.observation(4, 0), &[1., 0.]);
        let aborted: Vec<_> = samples.traj_infos.iter().filter(|r| r.aborted).collect();
        assert_eq!(aborted.len(), 1);
        assert_eq!(aborted[0].env_rank, 0);
        // other columns are unaffected
        assert!(!batch.done(3, 1));
        assert_eq!(batch.reward(3, 1), 1.);
    }
}

#[test]
fn policy_failure_surfaces_after_the_round() {
    for mode in [SamplerMode::Cpu, SamplerMode::ActionServer] {
        for panic in [false, true] {
            let (mut sampler, _) = ParallelSampler::initialize(
                config(mode),
                countdown_builder(3, |_| {}),
                EchoPolicy::default(),
            )
            .unwrap();
            sampler.publish_policy(EchoPolicy {
                observation_size: 2,
                fail: true,
                panic,
                ..Default::default()
            });
            let err = sampler.obtain_samples(0).unwrap_err();
            let SamplerError::Worker {
                buffer_index,
                traj_infos,
                ..
            } = &err
            else {
                panic!("{mode:?}: expected a worker fault, got {err}");
            };
            // the round ran to completion, its output is handed over with the fault
            assert_eq!(*buffer_index, Some(0), "{mode:?}");
            assert_eq!(traj_infos.len(), 8, "{mode:?}");
            assert!(traj_infos.iter().all(|r| r.length == 3 && !r.eval));
            let batch = sampler.batch(0);
            assert_eq!(batch.action(0, 0), &[0.]);
            assert_eq!(batch.observation(4, 7)[0], 8.);

            sampler.publish_policy(EchoPolicy {
                observation_size: 2,
                ..Default::default()
            });
            let samples = sampler.obtain_samples(1).unwrap();
            assert_eq!(samples.buffer_index, 1);
            assert_eq!(sampler.batch(samples.buffer_index).action(0, 0), &[1.]);
            sampler.shutdown().unwrap();
        }
    }
}

#[test]
fn policy_panic_during_evaluation_is_reported() {
    for mode in [SamplerMode::Cpu, SamplerMode::ActionServer] {
        let config = SamplerConfig {
            eval_n_envs: 4,
            eval_max_steps: 16,
            ..config(mode)
        };
        let (mut sampler, _) =
            ParallelSampler::initialize(config, countdown_builder(3, |_| {}), EchoPolicy::default())
                .unwrap();
        sampler.publish_policy(EchoPolicy {
            observation_size: 2,
            fail: true,
            panic: true,
            ..Default::default()
        });
        let err = sampler.evaluate(0).unwrap_err();
        let SamplerError::Worker {
            buffer_index,
            traj_infos,
            ..
        } = &err
        else {
            panic!("{mode:?}: expected a worker fault, got {err}");
        };
        assert_eq!(*buffer_index, None);
        assert!(traj_infos.iter().all(|r| r.eval));
        sampler.shutdown().unwrap();
    }
}

#[test]
fn setup_failures_start_nothing() {
    let builder = || -> anyhow::Result<rollsync_core::test_utils::CountdownEnv> {
        anyhow::bail!("no simulator available")
    };
    let result = ParallelSampler::initialize(config(SamplerMode::Cpu), builder, EchoPolicy::default());
    assert!(matches!(result, Err(SamplerError::Setup(_))));

    let failing = EchoPolicy {
        fail: true,
        ..Default::default()
    };
    let result =
        ParallelSampler::initialize(config(SamplerMode::Cpu), countdown_builder(3, |_| {}), failing);
    assert!(matches!(result, Err(SamplerError::Schema(_))));

    let too_many_workers = SamplerConfig {
        n_workers: 9,
        ..config(SamplerMode::Cpu)
    };
    let result = ParallelSampler::initialize(
        too_many_workers,
        countdown_builder(3, |_| {}),
        EchoPolicy::default(),
    );
    assert!(matches!(result, Err(SamplerError::Setup(_))));
}

#[test]
fn decorrelation_spreads_episode_phases() {
    let config = SamplerConfig {
        batch_t: 1,
        batch_b: 16,
        n_workers: 2,
        max_decorrelation_steps: 50,
        seed: Some(3),
        ..Default::default()
    };
    let (mut sampler, _) =
        ParallelSampler::initialize(config, countdown_builder(7, |_| {}), EchoPolicy::default()).unwrap();
    let samples = sampler.obtain_samples(0).unwrap();
    let batch = sampler.batch(samples.buffer_index);
    let mut phases: Vec<_> = (0..16).map(|b| batch.observation(0, b)[1] as usize).collect();
    assert!(phases.iter().all(|phase| *phase < 7));
    phases.sort_unstable();
    phases.dedup();
    assert!(phases.len() > 1, "all environments start in phase {phases:?}");
}
