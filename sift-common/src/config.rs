//! Env-config building blocks shared by every worker binary.

use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

use crate::retry::RetryPolicy;

/// A duration expressed in milliseconds in the environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(default = "1000")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(default = "100000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.backoff_coefficient,
            chrono::Duration::milliseconds(self.initial_interval.0.as_millis() as i64),
            Some(chrono::Duration::milliseconds(
                self.maximum_interval.0.as_millis() as i64,
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_ms_duration() {
        let parsed = EnvMsDuration::from_str("1500").unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));

        assert!(EnvMsDuration::from_str("not-a-number").is_err());
    }
}
