use rollsync_core::{
    ParallelSampler, SamplerConfig, SamplerError, SamplerMode,
    test_utils::{EchoPolicy, countdown_builder},
};
use std::time::{Duration, Instant};

fn eval_config(mode: SamplerMode) -> SamplerConfig {
    SamplerConfig {
        batch_t: 4,
        batch_b: 4,
        n_workers: 2,
        mode,
        max_decorrelation_steps: 0,
        seed: Some(11),
        eval_n_envs: 4,
        eval_max_steps: 20,
        eval_poll_interval_ms: 10,
        ..Default::default()
    }
}

fn full_budget(mode: SamplerMode) {
    let (mut sampler, _) = ParallelSampler::initialize(
        eval_config(mode),
        countdown_builder(3, |_| {}),
        EchoPolicy::default(),
    )
    .unwrap();
    // two environments per worker, 1 + 20 / 4 steps each
    assert_eq!(sampler.plan().eval.as_ref().unwrap().max_t, 6);
    let records = sampler.evaluate(0).unwrap();
    assert_eq!(records.len(), 8);
    assert!(records.iter().all(|r| r.eval && r.length == 3 && !r.aborted));
    let mut ranks: Vec<_> = records.iter().map(|r| r.env_rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, vec![0, 0, 1, 1, 2, 2, 3, 3]);

    // sampling rounds keep working and never see evaluation records
    let samples = sampler.obtain_samples(1).unwrap();
    assert!(samples.traj_infos.iter().all(|r| !r.eval));
    assert!(!sampler.control().round().do_eval);
}

#[test]
fn evaluation_runs_the_full_budget_cpu() {
    full_budget(SamplerMode::Cpu);
}

#[test]
fn evaluation_runs_the_full_budget_action_server() {
    full_budget(SamplerMode::ActionServer);
}

fn early_stop(mode: SamplerMode) {
    let config = SamplerConfig {
        // far more steps than the test could ever run
        eval_max_steps: 4_000_000,
        eval_max_trajectories: Some(10),
        ..eval_config(mode)
    };
    let builder = countdown_builder(2, |env| env.delay = Duration::from_millis(1));
    let (mut sampler, _) = ParallelSampler::initialize(config, builder, EchoPolicy::default()).unwrap();
    let started = Instant::now();
    let records = sampler.evaluate(0).unwrap();
    assert!(records.len() >= 10);
    assert!(records.iter().all(|r| r.eval));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!sampler.control().stop_eval());

    // the next evaluation starts from scratch
    let records = sampler.evaluate(1).unwrap();
    assert!(records.len() >= 10);
    let samples = sampler.obtain_samples(2).unwrap();
    assert!(samples.traj_infos.iter().all(|r| !r.eval));
}

#[test]
fn evaluation_stops_early_cpu() {
    early_stop(SamplerMode::Cpu);
}

#[test]
fn evaluation_stops_early_action_server() {
    early_stop(SamplerMode::ActionServer);
}

#[test]
fn evaluation_requires_eval_envs() {
    let config = SamplerConfig {
        eval_n_envs: 0,
        ..eval_config(SamplerMode::Cpu)
    };
    let (mut sampler, _) =
        ParallelSampler::initialize(config, countdown_builder(3, |_| {}), EchoPolicy::default())
            .unwrap();
    assert!(matches!(sampler.evaluate(0), Err(SamplerError::Setup(_))));
    sampler.obtain_samples(0).unwrap();
}
