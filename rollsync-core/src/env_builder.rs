use crate::env::Env;
use anyhow::Result;

pub trait EnvBuilderTrait: Sync + Send + 'static {
    type Env: Env;

    fn build_env(&self) -> Result<Self::Env>;
}

impl<E: Env, F: Sync + Send + 'static> EnvBuilderTrait for F
where
    F: Fn() -> Result<E>,
{
    type Env = E;

    fn build_env(&self) -> Result<Self::Env> {
        (self)()
    }
}

pub fn build_envs<EB: EnvBuilderTrait>(builder: &EB, n_envs: usize) -> Result<Vec<EB::Env>> {
    (0..n_envs).map(|_| builder.build_env()).collect()
}
